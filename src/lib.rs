#[macro_use]
pub mod util;

pub mod cli;
pub mod config;
pub mod driver;
pub mod encoder;
pub mod error;
pub mod formula;
pub mod graph;
pub mod ir;
pub mod smt;
