use llvm2smt::{
    config::{CallPolicy, Config},
    driver::{check, translate_module},
    encoder::encode,
    formula::{Formula, Goal},
    ir::Module,
    smt::{
        eval::{assemble, Model, Observation, Value},
        solver::{EnumerationSolver, ExternalSolver, SolverKind, Verdict},
        ExprPool,
    },
};
use which::which;

mod utils;

use utils::{init, load, time};

fn formula_of(module: &Module, name: &str, config: &Config, goal: Goal, pool: &ExprPool) -> Formula {
    let function = module.function(name).unwrap();
    encode(module, function, config, &goal, pool).unwrap()
}

fn enumerate(formula: &Formula, pool: &ExprPool) -> Verdict {
    time(&format!("enumerate @{}", formula.function), || {
        formula
            .solve(pool, &mut EnumerationSolver::default(), 10_000)
            .unwrap()
    })
}

fn reach(labels: &[&str]) -> Goal {
    Goal::Reachable(labels.iter().map(|l| l.to_string()).collect())
}

fn signed(value: Value) -> i32 {
    value.as_u128() as u32 as i32
}

#[test]
fn true_branch_is_reachable_with_positive_input() {
    init();

    let module = load("branch.ll");
    let pool = ExprPool::new();
    let formula = formula_of(&module, "f", &Config::default(), reach(&["if.then"]), &pool);

    let verdict = enumerate(&formula, &pool);
    let model = verdict.model().expect("if.then is reachable");
    let x = formula.value_of(model, "x").unwrap();
    assert!(signed(x) > 0);
    assert_eq!(formula.trace(model), vec!["entry", "if.then", "if.end"]);
}

#[test]
fn both_branches_on_one_path_are_unsatisfiable() {
    init();

    let module = load("branch.ll");
    let pool = ExprPool::new();
    let formula = formula_of(&module, "f", &Config::default(), reach(&["if.then", "if.else"]), &pool);

    assert_eq!(enumerate(&formula, &pool), Verdict::Unsat);
}

#[test]
fn path_conditions_agree_with_concrete_execution() {
    init();

    let module = load("branch.ll");
    let pool = ExprPool::new();
    let formula = formula_of(&module, "f", &Config::default(), Goal::default(), &pool);

    for &x in &[i32::MIN, -7, -1, 0, 1, 2, 1000, i32::MAX] {
        let mut model = Model::default();
        model.values.insert(
            "f.%x".to_string(),
            Value::BitVec {
                value: x as u32 as u128,
                width: 32,
            },
        );

        let expected = if x > 0 {
            vec!["entry", "if.then", "if.end"]
        } else {
            vec!["entry", "if.else", "if.end"]
        };
        assert_eq!(formula.trace(&model), expected, "trace for x = {}", x);

        let r = signed(formula.value_of(&model, "r").unwrap());
        let concrete = if x > 0 { x.wrapping_add(1) } else { 0i32.wrapping_sub(x) };
        assert_eq!(r, concrete, "return value for x = {}", x);
    }
}

#[test]
fn eight_bit_addition_wraps_around() {
    init();

    let module = load("memory.ll");
    let pool = ExprPool::new();
    let formula = formula_of(&module, "overflow", &Config::default(), Goal::default(), &pool);

    let verdict = enumerate(&formula, &pool);
    let model = verdict.model().expect("error block is reachable");
    assert_eq!(
        formula.value_of(model, "a"),
        Some(Value::BitVec { value: 200, width: 8 })
    );
    assert_eq!(
        formula.value_of(model, "s"),
        Some(Value::BitVec { value: 44, width: 8 })
    );
}

#[test]
fn symbolic_index_can_leave_its_buffer() {
    init();

    let module = load("memory.ll");
    let pool = ExprPool::new();
    let config = Config::default().with_bounds_checking(true);
    let formula = formula_of(&module, "scribble", &config, Goal::MemorySafety, &pool);

    let verdict = enumerate(&formula, &pool);
    let model = verdict.model().expect("index 8 and beyond is out of bounds");
    let i = formula.value_of(model, "i").unwrap().as_u128();
    assert!(i >= 8);
}

#[test]
fn allocations_constrain_only_their_own_branch() {
    init();

    let module = load("alloc.ll");
    let pool = ExprPool::new();
    let formula = formula_of(&module, "guarded", &Config::default(), Goal::default(), &pool);

    let verdict = enumerate(&formula, &pool);
    let model = verdict.model().expect("n = -1 reaches the error block");
    assert_eq!(
        formula.value_of(model, "n"),
        Some(Value::BitVec {
            value: u64::MAX as u128,
            width: 64
        })
    );
    assert_eq!(formula.trace(model), vec!["entry", "error"]);
}

#[test]
fn models_replay_bytes_read_from_initial_memory() {
    init();

    let module = load("alloc.ll");
    let pool = ExprPool::new();
    let formula = formula_of(&module, "peek", &Config::default(), Goal::default(), &pool);

    let observations = formula.observations();
    assert!(observations
        .iter()
        .any(|o| matches!(o, Observation::Read { .. })));

    let answer = |byte: u128| -> Vec<Value> {
        let address = Value::BitVec {
            value: 0x1000,
            width: 64,
        };
        observations
            .iter()
            .flat_map(|o| match o {
                Observation::Read { .. } => vec![address.clone(), Value::BitVec { value: byte, width: 8 }],
                _ => vec![address.clone()],
            })
            .collect()
    };

    let hit = assemble(&observations, &answer(7));
    assert_eq!(formula.trace(&hit), vec!["entry", "error"]);
    assert_eq!(formula.value_of(&hit, "b").map(|v| v.as_u128()), Some(7));
    assert!(hit.eval(&formula.query(&pool, 1_000).constraint).as_bool());

    let miss = assemble(&observations, &answer(0));
    assert_eq!(formula.trace(&miss), vec!["entry", "exit"]);

    if which("z3").is_ok() {
        let verdict = formula.solve(&pool, &mut ExternalSolver::default(), 10_000).unwrap();
        let model = verdict.model().expect("a byte of 7 reaches the error block");
        assert_eq!(formula.trace(model), vec!["entry", "error"]);
    }
}

#[test]
fn clamped_values_never_fail_the_assertion() {
    init();

    let module = load("calls.ll");
    let pool = ExprPool::new();
    let formula = formula_of(&module, "clamp", &Config::default(), Goal::default(), &pool);

    assert!(!enumerate(&formula, &pool).is_sat());

    if which("z3").is_ok() {
        let verdict = formula.solve(&pool, &mut ExternalSolver::default(), 10_000).unwrap();
        assert_eq!(verdict, Verdict::Unsat);
    }
}

#[test]
fn inlined_calls_compute_equal_results() {
    init();

    let module = load("calls.ll");
    let pool = ExprPool::new();
    let config = Config::default().with_call_policy(CallPolicy::Inline);
    let outcomes = translate_module(&module, &config, &Goal::default(), Some("caller"), &pool).unwrap();
    let formula = outcomes[0].result.as_ref().unwrap();

    assert!(formula.functions.is_empty());
    assert_eq!(enumerate(formula, &pool), Verdict::Unsat);
}

#[test]
fn uninterpreted_calls_are_declared_as_functions() {
    init();

    let module = load("calls.ll");
    let pool = ExprPool::new();
    let formula = formula_of(&module, "caller", &Config::default(), Goal::default(), &pool);

    assert_eq!(formula.functions.len(), 1);
    assert_eq!(formula.functions[0].name, "fn.square");
    assert!(formula.logic().contains("UF"));
}

#[test]
fn external_solver_agrees_with_enumeration() {
    init();

    if which("z3").is_err() {
        return;
    }

    let module = load("memory.ll");
    let pool = ExprPool::new();
    let outcomes = translate_module(&module, &Config::default(), &Goal::default(), None, &pool).unwrap();
    let reports = check(&outcomes, &pool, SolverKind::External, 10_000).unwrap();

    let verdicts: Vec<(&str, bool)> = reports
        .iter()
        .map(|r| (r.function.as_str(), r.verdict.is_sat()))
        .collect();
    assert_eq!(
        verdicts,
        vec![("roundtrip", false), ("overflow", true), ("scribble", false)]
    );
    let overflow = &reports[1];
    assert_eq!(overflow.trace, vec!["entry", "error"]);
}

#[cfg(feature = "z3")]
#[test]
fn z3_finds_the_overflowing_input() {
    init();

    let module = load("memory.ll");
    let pool = ExprPool::new();
    let outcomes = translate_module(&module, &Config::default(), &Goal::default(), Some("overflow"), &pool).unwrap();
    let reports = check(&outcomes, &pool, SolverKind::Z3, 10_000).unwrap();

    let model = reports[0].verdict.model().expect("sat");
    let formula = outcomes[0].result.as_ref().unwrap();
    assert_eq!(
        formula.value_of(model, "a"),
        Some(Value::BitVec { value: 200, width: 8 })
    );
}
