//! Orchestration of loading, per-function translation and solving.

use crate::config::{CallPolicy, Config};
use crate::encoder::encode;
use crate::error::{Error, Result};
use crate::formula::{Formula, Goal};
use crate::ir::{inline::inline_calls, parse_module, Module};
use crate::smt::solver::{make_solver, SolverError, SolverKind, Verdict};
use crate::smt::ExprPool;
use crate::util::human_size;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::fmt::Write;
use std::fs;
use std::path::Path;
use std::process::Command;

//
// Public Interface
//

/// Translation result of one function.
#[derive(Debug)]
pub struct Outcome {
    pub function: String,
    pub result: Result<Formula>,
}

/// Verdict of one function, with the executed blocks for `sat`.
#[derive(Debug)]
pub struct Report {
    pub function: String,
    pub verdict: Verdict,
    pub trace: Vec<String>,
}

/// Reads textual IR, compiling C sources with clang first.
pub fn load_module(path: &Path) -> Result<Module> {
    let text = time_info!(format!("loaded {}", path.display()), {
        match path.extension().and_then(|e| e.to_str()) {
            Some("c") => compile_c(path)?,
            _ => fs::read_to_string(path)?,
        }
    });
    debug!("IR text of {} has {}", path.display(), human_size(text.len()));
    time_debug!("parsed module", { parse_module(&text) })
}

/// Translates every defined function, or only `only`, in module order.
///
/// A failing function yields an `Err` outcome and the others carry on,
/// unless the configuration is atomic or the error is fatal.
pub fn translate_module(
    module: &Module,
    config: &Config,
    goal: &Goal,
    only: Option<&str>,
    pool: &ExprPool,
) -> Result<Vec<Outcome>> {
    let functions: Vec<_> = module
        .definitions()
        .filter(|f| only.map_or(true, |name| f.name == name))
        .collect();
    if let (Some(name), true) = (only, functions.is_empty()) {
        return Err(Error::Config(format!("module defines no function @{}", name)));
    }

    let outcomes: Vec<Outcome> = time_info!("translated module", {
        functions
            .par_iter()
            .map(|function| {
                let result = match config.call_policy {
                    CallPolicy::Inline => {
                        let inlined = inline_calls(module, function, config.inline_depth, is_builtin);
                        encode(module, &inlined, config, goal, pool)
                    }
                    CallPolicy::Uninterpreted => encode(module, function, config, goal, pool),
                };
                Outcome {
                    function: function.name.clone(),
                    result,
                }
            })
            .collect()
    });

    for outcome in &outcomes {
        if let Err(e) = &outcome.result {
            if config.atomic || e.is_fatal() {
                return Err(e.clone());
            }
            warn!("skipping @{}: {}", outcome.function, e);
        }
    }
    info!("{} terms in pool", pool.len());
    Ok(outcomes)
}

/// One SMT-LIB2 script for the whole module, one scope per function.
pub fn render(outcomes: &[Outcome]) -> String {
    let formulas: Vec<&Formula> = outcomes.iter().filter_map(|o| o.result.as_ref().ok()).collect();
    let mut out = String::new();
    let _ = writeln!(out, "(set-option :produce-models true)");
    let _ = writeln!(out, "(set-logic {})", widest_logic(formulas.iter().map(|f| f.logic())));
    for outcome in outcomes {
        match &outcome.result {
            Ok(formula) => formula.write_scoped(&mut out),
            Err(e) => {
                let _ = writeln!(out, "; @{} skipped: {}", outcome.function, e);
            }
        }
    }
    debug!("rendered script of {}", human_size(out.len()));
    out
}

/// Solves every translated function with a fresh solver of `kind`.
pub fn check(
    outcomes: &[Outcome],
    pool: &ExprPool,
    kind: SolverKind,
    timeout_ms: u64,
) -> std::result::Result<Vec<Report>, SolverError> {
    let mut reports = Vec::new();
    for outcome in outcomes {
        let formula = match &outcome.result {
            Ok(formula) => formula,
            Err(_) => continue,
        };
        let mut solver = make_solver(kind)?;
        let verdict = time_info!(format!("solved @{}", outcome.function), {
            formula.solve(pool, solver.as_mut(), timeout_ms)?
        });
        let trace = verdict.model().map(|m| formula.trace(m)).unwrap_or_default();
        reports.push(Report {
            function: outcome.function.clone(),
            verdict,
            trace,
        });
    }
    Ok(reports)
}

/// Combination of SMT-LIB logics that covers all of `logics`.
pub fn widest_logic<'a, I>(logics: I) -> &'static str
where
    I: IntoIterator<Item = &'a str>,
{
    let (mut arrays, mut functions) = (false, false);
    for logic in logics {
        arrays |= logic.contains('A');
        functions |= logic.contains("UF");
    }
    match (arrays, functions) {
        (false, false) => "QF_BV",
        (true, false) => "QF_ABV",
        (false, true) => "QF_UFBV",
        (true, true) => "QF_AUFBV",
    }
}

//
// Private Implementation
//

/// Callees the encoder models itself and which must not be inlined.
fn is_builtin(name: &str) -> bool {
    name.starts_with("llvm.")
        || name.starts_with("__VERIFIER_")
        || name.ends_with("assert")
        || matches!(
            name,
            "__assert_fail" | "reach_error" | "malloc" | "free" | "memset" | "memcpy" | "memmove"
        )
}

fn compile_c(path: &Path) -> Result<String> {
    let output = Command::new("clang")
        .args(["-emit-llvm", "-S", "-O0", "-g0", "-Xclang", "-disable-O0-optnone", "-o", "-"])
        .arg(path)
        .output()
        .map_err(|e| Error::Compile(format!("cannot run clang: {}", e)))?;
    if !output.status.success() {
        return Err(Error::Compile(format!(
            "clang exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    String::from_utf8(output.stdout).map_err(|e| Error::Compile(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO: &str = r#"
define i32 @id(i32 %x) {
entry:
  ret i32 %x
}

define i32 @spin(i32 %n) {
entry:
  br label %loop
loop:
  %i = phi i32 [ 0, %entry ], [ %j, %loop ]
  %j = add i32 %i, 1
  %c = icmp slt i32 %j, %n
  br i1 %c, label %loop, label %done
done:
  ret i32 %j
}
"#;

    #[test]
    fn failing_functions_do_not_stop_the_others() {
        let module = parse_module(TWO).unwrap();
        let pool = ExprPool::new();
        let outcomes = translate_module(&module, &Config::default(), &Goal::default(), None, &pool).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(Error::LoopNotSupported { .. })));

        let script = render(&outcomes);
        assert!(script.starts_with("(set-option :produce-models true)\n(set-logic "));
        assert!(script.contains("; @spin skipped: "));
        assert_eq!(script.matches("(push 1)").count(), 1);
    }

    #[test]
    fn atomic_mode_fails_the_module() {
        let module = parse_module(TWO).unwrap();
        let pool = ExprPool::new();
        let config = Config {
            atomic: true,
            ..Config::default()
        };
        let result = translate_module(&module, &config, &Goal::default(), None, &pool);
        assert!(matches!(result, Err(Error::LoopNotSupported { .. })));
    }

    #[test]
    fn function_filter_selects_and_validates() {
        let module = parse_module(TWO).unwrap();
        let pool = ExprPool::new();
        let outcomes = translate_module(&module, &Config::default(), &Goal::default(), Some("id"), &pool).unwrap();
        assert_eq!(outcomes.len(), 1);
        let missing = translate_module(&module, &Config::default(), &Goal::default(), Some("nope"), &pool);
        assert!(matches!(missing, Err(Error::Config(_))));
    }

    #[test]
    fn logics_combine_to_the_widest() {
        assert_eq!(widest_logic(vec![]), "QF_BV");
        assert_eq!(widest_logic(vec!["QF_BV", "QF_ABV"]), "QF_ABV");
        assert_eq!(widest_logic(vec!["QF_UFBV", "QF_ABV"]), "QF_AUFBV");
    }
}
