#![allow(dead_code)]

use llvm2smt::ir::{parse_module, Module};
use log::info;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Once},
    time::Instant,
};
use tempfile::{tempdir, TempDir};

static INIT_LOGGER: Once = Once::new();

pub fn init() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn fixture<P: AsRef<Path>>(name: P) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("ir")
        .join(name)
}

pub fn load<P: AsRef<Path>>(name: P) -> Module {
    let path = fixture(name);
    let text = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("can not read fixture {}: {}", path.display(), e));
    parse_module(&text).unwrap_or_else(|e| panic!("fixture {} does not parse: {}", path.display(), e))
}

pub fn time<F, R>(s: &str, mut f: F) -> R
where
    F: FnMut() -> R,
{
    let start = Instant::now();
    let result = f();
    let end = Instant::now();

    info!("{}: {:?}", s, end.duration_since(start));

    result
}

pub fn with_temp_dir<F, R>(f: F) -> R
where
    F: FnOnce(Arc<TempDir>) -> R,
{
    let temp_dir = Arc::new(tempdir().unwrap());

    f(temp_dir)
}
