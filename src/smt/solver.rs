use super::eval::{self, mask, Evaluator, MemoryValue, Model, Observation, Value};
use super::{Expr, ExprRef, Sort};
use log::{debug, trace, warn};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use strum::{Display, EnumString};
use thiserror::Error;

//
// Public Interface
//

/// One satisfiability question, both as terms and as SMT-LIB2 text.
#[derive(Clone, Debug)]
pub struct Query {
    /// Conjunction that has to be satisfied.
    pub constraint: ExprRef,
    /// Free variables reported in a model.
    pub inputs: Vec<ExprRef>,
    /// Values a model consists of, answered by the script's `get-value`.
    pub observations: Vec<Observation>,
    pub script: String,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Sat(Model),
    Unsat,
    /// The solver gave up, carrying the budget it was given.
    Unknown { reason: String, timeout_ms: u64 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SolverError {
    #[error("solver failed with IO error: {0}")]
    IoError(String),

    #[error("malformed solver output: {0}")]
    MalformedOutput(String),

    #[error("solver '{0}' is not available in this build")]
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum SolverKind {
    Enumerate,
    External,
    Z3,
}

pub trait Solver {
    fn name(&self) -> &'static str;

    fn solve(&mut self, query: &Query) -> Result<Verdict, SolverError> {
        debug!("try to solve with {} solver", self.name());

        time_debug!("finished solving formula", { self.solve_impl(query) })
    }

    fn solve_impl(&mut self, query: &Query) -> Result<Verdict, SolverError>;
}

impl From<io::Error> for SolverError {
    fn from(err: io::Error) -> Self {
        SolverError::IoError(err.to_string())
    }
}

impl Verdict {
    pub fn is_sat(&self) -> bool {
        matches!(self, Verdict::Sat(_))
    }

    pub fn is_unsat(&self) -> bool {
        matches!(self, Verdict::Unsat)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Verdict::Unknown { .. })
    }

    pub fn model(&self) -> Option<&Model> {
        match self {
            Verdict::Sat(model) => Some(model),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Verdict::Sat(_) => write!(f, "sat"),
            Verdict::Unsat => write!(f, "unsat"),
            Verdict::Unknown { reason, timeout_ms } => {
                write!(f, "unknown ({}, timeout {} ms)", reason, timeout_ms)
            }
        }
    }
}

pub fn make_solver(kind: SolverKind) -> Result<Box<dyn Solver>, SolverError> {
    match kind {
        SolverKind::Enumerate => Ok(Box::new(EnumerationSolver::default())),
        SolverKind::External => Ok(Box::new(ExternalSolver::default())),
        #[cfg(feature = "z3")]
        SolverKind::Z3 => Ok(Box::new(super::z3_impl::Z3SolverWrapper::new())),
        #[cfg(not(feature = "z3"))]
        SolverKind::Z3 => Err(SolverError::Unavailable(kind.to_string())),
    }
}

/// Built-in search over assignments of the free variables.
///
/// Independent conjuncts are solved separately. A group whose variables
/// are plain bit-vectors or booleans with few enough bits is enumerated
/// completely and may prove unsatisfiability. Larger groups, or groups
/// reading memory or uninterpreted functions, are probed with boundary
/// values and the constants occurring in the formula; failing that the
/// verdict is `Unknown`.
pub struct EnumerationSolver {
    exhaustive_bits: u32,
    budget: u64,
}

impl Default for EnumerationSolver {
    fn default() -> Self {
        Self {
            exhaustive_bits: 20,
            budget: 1 << 20,
        }
    }
}

impl Solver for EnumerationSolver {
    fn name(&self) -> &'static str {
        "Enumerate"
    }

    fn solve_impl(&mut self, query: &Query) -> Result<Verdict, SolverError> {
        let deadline = Instant::now() + Duration::from_millis(query.timeout_ms);
        if query.constraint.is_false() {
            return Ok(Verdict::Unsat);
        }

        let mut model = Model::default();
        let mut undecided: Option<String> = None;

        for group in components(&query.constraint) {
            match self.solve_group(&group, deadline) {
                Search::Found(values) => model.values.extend(values),
                Search::Exhausted => {
                    debug!("group of {} conjuncts has no solution", group.conjuncts.len());
                    return Ok(Verdict::Unsat);
                }
                Search::GaveUp(reason) => {
                    undecided.get_or_insert(reason);
                }
            }
        }

        if let Some(reason) = undecided {
            return Ok(Verdict::Unknown {
                reason,
                timeout_ms: query.timeout_ms,
            });
        }

        for input in &query.inputs {
            if let Expr::Var { name, sort } = input.expr() {
                model
                    .values
                    .entry(name.clone())
                    .or_insert_with(|| Value::default_of(*sort));
            }
        }
        if !model.eval(&query.constraint).as_bool() {
            warn!("combined assignment does not satisfy the query");
            return Ok(Verdict::Unknown {
                reason: "inconsistent partial assignments".to_string(),
                timeout_ms: query.timeout_ms,
            });
        }
        Ok(Verdict::Sat(model))
    }
}

/// Runs an SMT-LIB2 solver process on the query script.
pub struct ExternalSolver {
    program: String,
    args: Vec<String>,
}

impl Default for ExternalSolver {
    fn default() -> Self {
        Self::new("z3", &["-in", "-smt2"])
    }
}

impl ExternalSolver {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl Solver for ExternalSolver {
    fn name(&self) -> &'static str {
        "External"
    }

    fn solve_impl(&mut self, query: &Query) -> Result<Verdict, SolverError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(query.script.as_bytes())?;
            stdin.write_all(b"(exit)\n")?;
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SolverError::IoError("solver stdout is not captured".to_string()))?;
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let mut output = String::new();
            let result = stdout.read_to_string(&mut output).map(|_| output);
            let _ = sender.send(result);
        });

        match receiver.recv_timeout(Duration::from_millis(query.timeout_ms)) {
            Ok(output) => {
                let output = output?;
                let _ = child.wait();
                trace!("{} solver output:\n{}", self.program, output);
                parse_output(&output, query)
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                Ok(Verdict::Unknown {
                    reason: format!("{} did not answer in time", self.program),
                    timeout_ms: query.timeout_ms,
                })
            }
        }
    }
}

//
// Private Implementation
//

enum Search {
    Found(BTreeMap<String, Value>),
    Exhausted,
    GaveUp(String),
}

/// Conjuncts sharing free variables.
struct Group {
    conjuncts: Vec<ExprRef>,
    variables: Vec<(String, Sort)>,
    constants: BTreeSet<u128>,
    opaque: bool,
}

impl EnumerationSolver {
    fn solve_group(&self, group: &Group, deadline: Instant) -> Search {
        let conjunction = |values: &BTreeMap<String, Value>| {
            let model = Model {
                values: values.clone(),
                functions: BTreeMap::new(),
            };
            let mut evaluator = Evaluator::new(&model);
            group.conjuncts.iter().all(|c| evaluator.eval(c).as_bool())
        };

        let bits: u32 = group
            .variables
            .iter()
            .map(|(_, sort)| match sort {
                Sort::Bool => 1,
                Sort::BitVec(width) => *width,
                Sort::Memory => u32::MAX,
            })
            .fold(0u32, |acc, b| acc.saturating_add(b));
        let exhaustive = !group.opaque && bits <= self.exhaustive_bits;

        let candidates: Vec<Vec<Value>> = if exhaustive {
            group
                .variables
                .iter()
                .map(|(_, sort)| all_values(*sort))
                .collect()
        } else {
            group
                .variables
                .iter()
                .enumerate()
                .map(|(i, (_, sort))| probe_values(*sort, i, &group.constants))
                .collect()
        };

        let mut counter = vec![0usize; candidates.len()];
        let mut tried: u64 = 0;
        loop {
            let values: BTreeMap<String, Value> = group
                .variables
                .iter()
                .zip(&counter)
                .zip(&candidates)
                .map(|(((name, _), &i), options)| (name.clone(), options[i].clone()))
                .collect();
            if conjunction(&values) {
                return Search::Found(values);
            }

            tried += 1;
            if tried % 1024 == 0 && Instant::now() >= deadline {
                return Search::GaveUp("enumeration ran out of time".to_string());
            }
            if !exhaustive && tried >= self.budget {
                break;
            }
            if !advance(&mut counter, &candidates) {
                break;
            }
        }

        if exhaustive {
            Search::Exhausted
        } else {
            Search::GaveUp(format!(
                "no witness among {} candidate assignments over {} variables",
                tried,
                group.variables.len()
            ))
        }
    }
}

/// Mixed-radix increment, returns false after the last combination.
fn advance(counter: &mut [usize], candidates: &[Vec<Value>]) -> bool {
    for (digit, options) in counter.iter_mut().zip(candidates).rev() {
        *digit += 1;
        if *digit < options.len() {
            return true;
        }
        *digit = 0;
    }
    false
}

fn all_values(sort: Sort) -> Vec<Value> {
    match sort {
        Sort::Bool => vec![Value::Bool(false), Value::Bool(true)],
        Sort::BitVec(width) => (0..(1u128 << width))
            .map(|value| Value::BitVec { value, width })
            .collect(),
        Sort::Memory => vec![Value::default_of(sort)],
    }
}

fn probe_values(sort: Sort, position: usize, constants: &BTreeSet<u128>) -> Vec<Value> {
    let width = match sort {
        Sort::Bool => return all_values(sort),
        Sort::Memory => {
            return [0u8, 1, 0xff]
                .iter()
                .map(|&default| {
                    Value::Memory(MemoryValue {
                        default,
                        bytes: BTreeMap::new(),
                    })
                })
                .collect()
        }
        Sort::BitVec(width) => width,
    };

    let m = mask(width);
    let sign = if width == 0 { 0 } else { 1u128 << (width - 1) };
    let mut values: Vec<u128> = Vec::new();
    if width == 64 {
        // pointer-sized values get distinct, aligned, non-wrapping addresses
        values.push(0x1000_0000 + 0x100_0000 * position as u128);
    }
    values.extend([0, 1, 2, m, sign, sign.wrapping_sub(1) & m, sign + 1]);
    for &c in constants {
        values.extend([c, c.wrapping_add(1), c.wrapping_sub(1)]);
    }
    values.extend((2..width.min(16)).map(|shift| 1u128 << shift));

    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|v| v & m)
        .filter(|v| seen.insert(*v))
        .map(|value| Value::BitVec { value, width })
        .collect()
}

/// Splits the top-level conjunction into groups with disjoint variables.
fn components(constraint: &ExprRef) -> Vec<Group> {
    let conjuncts: Vec<ExprRef> = match constraint.expr() {
        Expr::And(items) => items.clone(),
        _ => vec![constraint.clone()],
    };

    struct Facts {
        variables: BTreeMap<String, Sort>,
        constants: BTreeSet<u128>,
        opaque: bool,
    }
    let facts: Vec<Facts> = conjuncts
        .iter()
        .map(|c| {
            let mut facts = Facts {
                variables: BTreeMap::new(),
                constants: BTreeSet::new(),
                opaque: false,
            };
            let mut seen: HashSet<ExprRef> = HashSet::new();
            let mut stack = vec![c.clone()];
            while let Some(term) = stack.pop() {
                if !seen.insert(term.clone()) {
                    continue;
                }
                match term.expr() {
                    Expr::Var { name, sort } => {
                        facts.opaque |= *sort == Sort::Memory;
                        facts.variables.insert(name.clone(), *sort);
                    }
                    Expr::Const { value, .. } => {
                        facts.constants.insert(*value);
                    }
                    Expr::Apply { .. } => facts.opaque = true,
                    _ => {}
                }
                stack.extend(term.children().into_iter().cloned());
            }
            facts
        })
        .collect();

    // union-find over conjunct indices
    let mut parent: Vec<usize> = (0..conjuncts.len()).collect();
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    let mut owner: HashMap<&str, usize> = HashMap::new();
    for (i, f) in facts.iter().enumerate() {
        for name in f.variables.keys() {
            match owner.get(name.as_str()) {
                Some(&j) => {
                    let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                    parent[a] = b;
                }
                None => {
                    owner.insert(name, i);
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, Group> = BTreeMap::new();
    for (i, conjunct) in conjuncts.into_iter().enumerate() {
        let root = find(&mut parent, i);
        let group = groups.entry(root).or_insert_with(|| Group {
            conjuncts: Vec::new(),
            variables: Vec::new(),
            constants: BTreeSet::new(),
            opaque: false,
        });
        group.conjuncts.push(conjunct);
        for (name, sort) in &facts[i].variables {
            if !group.variables.iter().any(|(n, _)| n == name) {
                group.variables.push((name.clone(), *sort));
            }
        }
        group.constants.extend(facts[i].constants.iter().copied());
        group.opaque |= facts[i].opaque;
    }
    groups.into_values().collect()
}

fn parse_output(output: &str, query: &Query) -> Result<Verdict, SolverError> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next().unwrap_or("");
    match first {
        "unsat" => Ok(Verdict::Unsat),
        "unknown" | "timeout" => Ok(Verdict::Unknown {
            reason: "solver returned unknown".to_string(),
            timeout_ms: query.timeout_ms,
        }),
        "sat" => {
            let rest: String = lines.collect::<Vec<_>>().join(" ");
            parse_values(&rest, query).map(Verdict::Sat)
        }
        other => Err(SolverError::MalformedOutput(other.to_string())),
    }
}

/// Reads the `get-value` answer, one `(term value)` pair per queried term
/// in the order of the query's observations.
fn parse_values(text: &str, query: &Query) -> Result<Model, SolverError> {
    if query.observations.is_empty() {
        return Ok(Model::default());
    }
    let token = Regex::new(r"\(|\)|\|[^|]*\||[^\s()|]+")
        .map_err(|e| SolverError::MalformedOutput(e.to_string()))?;
    let tokens: Vec<&str> = token.find_iter(text).map(|m| m.as_str()).collect();
    let answers = match parse_sexp(&tokens, &mut 0)? {
        Sexp::List(pairs) => pairs,
        Sexp::Atom(atom) => return Err(SolverError::MalformedOutput(atom.to_string())),
    };

    let sorts: Vec<Sort> = query.observations.iter().flat_map(Observation::sorts).collect();
    if answers.len() != sorts.len() {
        return Err(SolverError::MalformedOutput(format!(
            "expected {} values, found {}",
            sorts.len(),
            answers.len()
        )));
    }
    let mut values = Vec::with_capacity(sorts.len());
    for (answer, sort) in answers.iter().zip(sorts) {
        let value = match answer {
            Sexp::List(pair) if pair.len() == 2 => literal(&pair[1], sort)?,
            _ => return Err(SolverError::MalformedOutput("expected a (term value) pair".to_string())),
        };
        values.push(value);
    }
    Ok(eval::assemble(&query.observations, &values))
}

enum Sexp<'a> {
    Atom(&'a str),
    List(Vec<Sexp<'a>>),
}

fn parse_sexp<'a>(tokens: &[&'a str], position: &mut usize) -> Result<Sexp<'a>, SolverError> {
    let token = *tokens
        .get(*position)
        .ok_or_else(|| SolverError::MalformedOutput("unexpected end of output".to_string()))?;
    *position += 1;
    match token {
        "(" => {
            let mut items = Vec::new();
            while tokens.get(*position) != Some(&")") {
                items.push(parse_sexp(tokens, position)?);
            }
            *position += 1;
            Ok(Sexp::List(items))
        }
        ")" => Err(SolverError::MalformedOutput("unbalanced parenthesis".to_string())),
        atom => Ok(Sexp::Atom(atom)),
    }
}

/// Value of a constant literal: `true`, `#x..`, `#b..` or `(_ bvN w)`.
fn literal(sexp: &Sexp, sort: Sort) -> Result<Value, SolverError> {
    let malformed = |text: &str| SolverError::MalformedOutput(format!("unexpected value {}", text));
    let number = match sexp {
        Sexp::Atom("true") => 1,
        Sexp::Atom("false") => 0,
        Sexp::Atom(atom) => {
            let parsed = if let Some(hex) = atom.strip_prefix("#x") {
                u128::from_str_radix(hex, 16)
            } else if let Some(bin) = atom.strip_prefix("#b") {
                u128::from_str_radix(bin, 2)
            } else {
                return Err(malformed(atom));
            };
            parsed.map_err(|_| malformed(atom))?
        }
        Sexp::List(items) => match items.as_slice() {
            [Sexp::Atom("_"), Sexp::Atom(bv), Sexp::Atom(_)] => bv
                .strip_prefix("bv")
                .and_then(|n| n.parse::<u128>().ok())
                .ok_or_else(|| malformed(bv))?,
            _ => return Err(malformed("list")),
        },
    };
    match sort {
        Sort::Bool => Ok(Value::Bool(number != 0)),
        Sort::BitVec(width) => Ok(Value::BitVec {
            value: number & mask(width),
            width,
        }),
        Sort::Memory => Err(malformed("array")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::{BvCmp, BvOp, ExprPool};
    use std::str::FromStr;

    fn query(constraint: ExprRef, inputs: Vec<ExprRef>) -> Query {
        let observations = eval::observations(&inputs, [&constraint]);
        Query {
            constraint,
            inputs,
            observations,
            script: String::new(),
            timeout_ms: 5_000,
        }
    }

    #[test]
    fn finds_wrapping_addition() {
        let pool = ExprPool::new();
        let a = pool.var("a", Sort::BitVec(8));
        let b = pool.var("b", Sort::BitVec(8));
        let sum = pool.binary(BvOp::Add, &a, &b);
        let constraint = pool.and(&[
            pool.eq(&a, &pool.bv(200, 8)),
            pool.eq(&b, &pool.bv(100, 8)),
            pool.eq(&sum, &pool.bv(44, 8)),
        ]);
        let verdict = EnumerationSolver::default()
            .solve(&query(constraint, vec![a, b]))
            .unwrap();
        let model = verdict.model().expect("sat");
        assert_eq!(model.get("a").map(Value::as_u128), Some(200));
    }

    #[test]
    fn small_contradiction_is_unsat() {
        let pool = ExprPool::new();
        let x = pool.var("x", Sort::BitVec(8));
        let constraint = pool.and(&[
            pool.compare(BvCmp::Ugt, &x, &pool.bv(10, 8)),
            pool.compare(BvCmp::Ult, &x, &pool.bv(5, 8)),
        ]);
        let verdict = EnumerationSolver::default()
            .solve(&query(constraint, vec![x]))
            .unwrap();
        assert_eq!(verdict, Verdict::Unsat);
    }

    #[test]
    fn wide_inputs_are_probed_with_boundary_values() {
        let pool = ExprPool::new();
        let x = pool.var("x", Sort::BitVec(32));
        let constraint = pool.compare(BvCmp::Sgt, &x, &pool.bv(0, 32));
        let verdict = EnumerationSolver::default()
            .solve(&query(constraint, vec![x]))
            .unwrap();
        let value = verdict.model().and_then(|m| m.get("x")).unwrap().as_u128();
        assert!(value > 0 && value < 0x8000_0000);
    }

    #[test]
    fn parses_get_value_output() {
        let pool = ExprPool::new();
        let x = pool.var("f.%x", Sort::BitVec(32));
        let c = pool.var("c", Sort::Bool);
        let q = query(pool.tt(), vec![x, c]);
        let verdict = parse_output("sat\n((f.%x #x00000001)\n (c true))\n", &q).unwrap();
        let model = verdict.model().unwrap();
        assert_eq!(model.get("f.%x").map(Value::as_u128), Some(1));
        assert_eq!(model.get("c"), Some(&Value::Bool(true)));
        assert!(parse_output("unknown\n", &q).unwrap().is_unknown());
        assert!(parse_output("(error \"x\")", &q).is_err());
    }

    #[test]
    fn memory_reads_and_calls_are_reassembled() {
        let pool = ExprPool::new();
        let memory = pool.var("f.mem.init", Sort::Memory);
        let p = pool.var("f.%p", Sort::BitVec(64));
        let byte = pool.select(&memory, &p);
        let call = pool.apply("fn.hash", &[byte.clone()], Sort::BitVec(8));
        let constraint = pool.and(&[
            pool.eq(&byte, &pool.bv(7, 8)),
            pool.eq(&call, &pool.bv(3, 8)),
        ]);
        let q = query(constraint.clone(), vec![p.clone(), memory]);
        assert_eq!(q.observations.len(), 3);

        let output = "sat\n((f.%p #x0000000000001000)\n (f.%p #x0000000000001000)\n \
                      ((select f.mem.init f.%p) #x07)\n ((fn.hash (select f.mem.init f.%p)) (_ bv3 8)))\n";
        let verdict = parse_output(output, &q).unwrap();
        let model = verdict.model().unwrap();

        assert_eq!(model.eval(&byte).as_u128(), 7);
        assert_eq!(model.eval(&call).as_u128(), 3);
        assert!(model.eval(&constraint).as_bool());
        assert!(parse_output("sat\n((f.%p #x01))\n", &q).is_err());
    }

    #[test]
    fn solver_kinds_parse_from_cli_spelling() {
        assert_eq!(SolverKind::from_str("enumerate"), Ok(SolverKind::Enumerate));
        assert_eq!(SolverKind::External.to_string(), "external");
    }
}
