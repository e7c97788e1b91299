use llvm2smt::{
    config::Config,
    driver::{load_module, render, translate_module},
    encoder::encode,
    error::Error,
    formula::Goal,
    smt::ExprPool,
};

use std::fs;
use which::which;

mod utils;

use utils::{init, load, with_temp_dir};

fn script_of(name: &str, config: &Config) -> String {
    let module = load(name);
    let pool = ExprPool::new();
    let outcomes = translate_module(&module, config, &Goal::default(), None, &pool).unwrap();
    render(&outcomes)
}

#[test]
fn serialization_is_deterministic() {
    init();

    let config = Config::default().with_unroll_bound(2).with_bounds_checking(true);
    for name in &["branch.ll", "memory.ll", "loop.ll", "calls.ll"] {
        let first = script_of(name, &config);
        let second = script_of(name, &config);
        assert_eq!(first, second, "script of {} differs between runs", name);
    }
}

#[test]
fn script_declares_inputs_and_checks_once_per_function() {
    init();

    let script = script_of("branch.ll", &Config::default());

    assert!(script.starts_with("(set-option :produce-models true)\n(set-logic QF_ABV)\n"));
    assert!(script.contains("(declare-fun f.%x () (_ BitVec 32))"));
    assert!(script.contains("; function @f, goal assert\n"));
    assert_eq!(script.matches("(push 1)").count(), 1);
    assert_eq!(script.matches("(pop 1)").count(), 1);
    assert_eq!(script.matches("(check-sat)").count(), 1);
}

#[test]
fn stored_value_is_read_back_unchanged() {
    init();

    let module = load("memory.ll");
    let pool = ExprPool::new();
    let function = module.function("roundtrip").unwrap();
    let formula = encode(&module, function, &Config::default(), &Goal::default(), &pool).unwrap();

    assert!(formula.term_of("r").is_some());
    assert_eq!(formula.term_of("r"), formula.term_of("v"));
    assert_eq!(formula.term_of("f.%r"), None);
    assert_eq!(formula.term_of("roundtrip.%r"), formula.term_of("v"));
}

#[test]
fn unsupported_constructs_only_fail_their_function() {
    init();

    let module = load("vectors.ll");
    let pool = ExprPool::new();
    let outcomes = translate_module(&module, &Config::default(), &Goal::default(), None, &pool).unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].result.is_ok());
    match &outcomes[1].result {
        Err(Error::UnsupportedConstruct { construct, location }) => {
            assert!(construct.contains("vector"), "unexpected construct {}", construct);
            assert_eq!(location.function.as_deref(), Some("nested"));
            assert!(location.line.is_some());
        }
        other => panic!("expected unsupported construct, got {:?}", other),
    }
}

#[test]
fn loops_are_rejected_by_default() {
    init();

    let module = load("loop.ll");
    let pool = ExprPool::new();
    let function = module.function("count").unwrap();
    let result = encode(&module, function, &Config::default(), &Goal::default(), &pool);

    match result {
        Err(Error::LoopNotSupported {
            function,
            header,
            latch,
        }) => {
            assert_eq!(function, "count");
            assert_eq!(header, "header");
            assert_eq!(latch, "body");
        }
        other => panic!("expected loop rejection, got {:?}", other.map(|f| f.function)),
    }
}

#[test]
fn unrolled_loops_copy_the_body_and_report_cut_edges() {
    init();

    let module = load("loop.ll");
    let pool = ExprPool::new();
    let function = module.function("count").unwrap();
    let config = Config::default().with_unroll_bound(3);
    let formula = encode(&module, function, &config, &Goal::default(), &pool).unwrap();

    let bodies: Vec<&Vec<u32>> = formula
        .blocks
        .iter()
        .filter(|b| b.label == "body")
        .map(|b| &b.iteration)
        .collect();
    assert_eq!(bodies, vec![&vec![0], &vec![1], &vec![2]]);
    assert_eq!(formula.cut_edges, vec![("body".to_string(), "header".to_string())]);
    assert_eq!(formula.blocks.iter().filter(|b| b.label == "exit").count(), 1);
}

#[test]
fn c_sources_are_compiled_before_translation() {
    init();

    if which("clang").is_err() {
        return;
    }

    with_temp_dir(|dir| {
        let source = dir.path().join("add.c");
        fs::write(&source, "int add(int a, int b) { return a + b; }\n").unwrap();

        let module = load_module(&source).unwrap();
        let function = module.function("add").expect("add is defined");
        assert_eq!(function.params.len(), 2);

        let pool = ExprPool::new();
        let formula = encode(&module, function, &Config::default(), &Goal::default(), &pool).unwrap();
        assert!(formula.to_smtlib().contains("(check-sat)"));
    });
}
