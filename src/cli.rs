use crate::config::{CallPolicy, Config};
use crate::formula::Goal;
use crate::smt::solver::SolverKind;
use anyhow::{Context, Result};
use clap::{command, Arg, ArgAction, ArgMatches, Command};
use std::str::FromStr;

pub const LOGGING_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
pub const SOLVERS: [&str; 3] = ["enumerate", "external", "z3"];
pub const CALL_POLICIES: [&str; 2] = ["uninterpreted", "inline"];

pub fn expect_arg<'a>(m: &'a ArgMatches, arg: &str) -> &'a str {
    m.get_one::<String>(arg)
        .map(String::as_str)
        .unwrap_or_else(|| panic!("argument \"{}\" has to be set in CLI at all times", arg))
}

fn is_u64(v: &str) -> Result<u64, String> {
    v.parse::<u64>().map_err(|e| e.to_string())
}

fn is_u32(v: &str) -> Result<u32, String> {
    v.parse::<u32>().map_err(|e| e.to_string())
}

fn is_goal(v: &str) -> Result<String, String> {
    Goal::from_str(v).map(|_| v.to_string()).map_err(|e| e.to_string())
}

pub fn args() -> Command {
    command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("configure logging level to use")
                .value_name("LEVEL")
                .value_parser(LOGGING_LEVELS)
                .default_value(LOGGING_LEVELS[2])
                .global(true),
        )
        .subcommand(
            with_translation_args(
                Command::new("translate")
                    .about("Translate LLVM IR functions into an SMT-LIB2 script"),
            )
            .arg(
                Arg::new("output-file")
                    .help("Output file to write the script to, standard output if omitted")
                    .short('o')
                    .long("output-file")
                    .value_name("FILE"),
            ),
        )
        .subcommand(
            with_translation_args(
                Command::new("check").about("Translate LLVM IR functions and solve their formulas"),
            )
            .arg(
                Arg::new("solver")
                    .help("SMT solver")
                    .short('s')
                    .long("solver")
                    .value_name("SOLVER")
                    .value_parser(SOLVERS)
                    .default_value(SOLVERS[0]),
            ),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
}

/// Options shared by all subcommands that translate a module.
fn with_translation_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("input-file")
                .help("LLVM IR (.ll) or C (.c) file to be translated")
                .value_name("FILE")
                .required(true),
        )
        .arg(
            Arg::new("unroll")
                .help("Number of times each loop body is unrolled, 0 rejects loops")
                .short('u')
                .long("unroll")
                .value_name("NUMBER")
                .default_value("0")
                .value_parser(is_u32),
        )
        .arg(
            Arg::new("bounds-checking")
                .help("Check that memory accesses stay inside their allocation")
                .short('b')
                .long("bounds-checking")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("call-policy")
                .help("Treatment of calls to functions defined in the module")
                .long("call-policy")
                .value_name("POLICY")
                .value_parser(CALL_POLICIES)
                .default_value(CALL_POLICIES[0]),
        )
        .arg(
            Arg::new("inline-depth")
                .help("Nesting depth up to which calls are inlined")
                .long("inline-depth")
                .value_name("NUMBER")
                .default_value("8")
                .value_parser(is_u32),
        )
        .arg(
            Arg::new("timeout")
                .help("Solver timeout in milliseconds")
                .short('t')
                .long("timeout")
                .value_name("MS")
                .default_value("10000")
                .value_parser(is_u64),
        )
        .arg(
            Arg::new("pure")
                .help("External function that does not write memory (repeatable)")
                .long("pure")
                .value_name("NAME")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("function")
                .help("Only translate this function")
                .short('f')
                .long("function")
                .value_name("NAME"),
        )
        .arg(
            Arg::new("goal")
                .help("Property to look for: assert, memory or reach:LABEL[,LABEL]")
                .short('g')
                .long("goal")
                .value_name("GOAL")
                .default_value("assert")
                .value_parser(is_goal),
        )
        .arg(
            Arg::new("atomic")
                .help("Fail the whole module when one function cannot be translated")
                .long("atomic")
                .action(ArgAction::SetTrue),
        )
}

/// Builds the translation configuration from parsed arguments.
pub fn config(m: &ArgMatches) -> Result<Config> {
    let call_policy = CallPolicy::from_str(expect_arg(m, "call-policy"))
        .context("invalid call policy")?;
    let mut config = Config {
        unroll_bound: m.get_one::<u32>("unroll").copied().unwrap_or_default(),
        bounds_checking: m.get_flag("bounds-checking"),
        call_policy,
        solver_timeout_ms: m.get_one::<u64>("timeout").copied().unwrap_or(10_000),
        atomic: m.get_flag("atomic"),
        inline_depth: m.get_one::<u32>("inline-depth").copied().unwrap_or(8),
        ..Config::default()
    };
    if let Some(names) = m.get_many::<String>("pure") {
        for name in names {
            config = config.with_pure_function(name.trim_start_matches('@'));
        }
    }
    Ok(config)
}

pub fn goal(m: &ArgMatches) -> Result<Goal> {
    Goal::from_str(expect_arg(m, "goal")).map_err(|e| anyhow::anyhow!("invalid goal: {}", e))
}

pub fn solver(m: &ArgMatches) -> Result<SolverKind> {
    SolverKind::from_str(expect_arg(m, "solver")).context("invalid solver")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_arguments_map_onto_config() {
        let matches = args()
            .try_get_matches_from([
                "llvm2smt", "check", "x.ll", "--unroll", "3", "-b", "--pure", "@hash", "--pure",
                "len", "--goal", "reach:exit", "--solver", "external",
            ])
            .unwrap();
        let (name, m) = matches.subcommand().unwrap();
        assert_eq!(name, "check");

        let config = config(m).unwrap();
        assert_eq!(config.unroll_bound, 3);
        assert!(config.bounds_checking);
        assert!(config.pure_functions.contains("hash"));
        assert!(config.pure_functions.contains("len"));
        assert_eq!(goal(m).unwrap(), Goal::Reachable(vec!["exit".to_string()]));
        assert_eq!(solver(m).unwrap(), SolverKind::External);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let result = args().try_get_matches_from(["llvm2smt", "translate", "x.ll", "--unroll", "-1"]);
        assert!(result.is_err());
    }
}
