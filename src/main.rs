use anyhow::Result;
use env_logger::Env;
use llvm2smt::{
    cli::{self, expect_arg},
    driver,
    error::{Error, Stage},
    smt::{solver::SolverError, ExprPool},
};
use log::info;
use std::{fs, path::Path, process};

fn main() {
    let matches = cli::args().get_matches();

    let log_level = expect_arg(&matches, "verbose");
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let result = match matches.subcommand() {
        Some(("translate", args)) => translate(args),
        Some(("check", args)) => check(args),
        _ => unreachable!(),
    };

    if let Err(e) = result {
        eprintln!("{} failed: {}", stage_of(&e), e);
        process::exit(1);
    }
}

fn translate(args: &clap::ArgMatches) -> Result<()> {
    let input = Path::new(expect_arg(args, "input-file"));
    let config = cli::config(args)?;
    let goal = cli::goal(args)?;

    let module = driver::load_module(input)?;
    let pool = ExprPool::new();
    let only = args.get_one::<String>("function").map(String::as_str);
    let outcomes = driver::translate_module(&module, &config, &goal, only, &pool)?;
    let script = driver::render(&outcomes);

    match args.get_one::<String>("output-file") {
        Some(output) => {
            fs::write(output, script)?;
            info!("wrote SMT-LIB2 script to {}", output);
        }
        None => print!("{}", script),
    }
    first_failure(&outcomes)
}

fn check(args: &clap::ArgMatches) -> Result<()> {
    let input = Path::new(expect_arg(args, "input-file"));
    let config = cli::config(args)?;
    let goal = cli::goal(args)?;
    let solver = cli::solver(args)?;

    let module = driver::load_module(input)?;
    let pool = ExprPool::new();
    let only = args.get_one::<String>("function").map(String::as_str);
    let outcomes = driver::translate_module(&module, &config, &goal, only, &pool)?;

    for outcome in &outcomes {
        if let Err(e) = &outcome.result {
            println!("@{}: error: {}", outcome.function, e);
        }
    }
    for report in driver::check(&outcomes, &pool, solver, config.solver_timeout_ms)? {
        println!("@{}: {}", report.function, report.verdict);
        if let Some(model) = report.verdict.model() {
            for (name, value) in &model.values {
                println!("  {} = {}", name, value);
            }
            println!("  trace: {}", report.trace.join(" -> "));
        }
    }
    first_failure(&outcomes)
}

/// Fails with the first per-function error once every outcome has been
/// reported.
fn first_failure(outcomes: &[driver::Outcome]) -> Result<()> {
    match outcomes.iter().find_map(|o| o.result.as_ref().err()) {
        Some(e) => Err(e.clone().into()),
        None => Ok(()),
    }
}

fn stage_of(e: &anyhow::Error) -> String {
    if let Some(error) = e.downcast_ref::<Error>() {
        error.stage().to_string()
    } else if e.downcast_ref::<SolverError>().is_some() {
        Stage::Solve.to_string()
    } else {
        "run".to_string()
    }
}
