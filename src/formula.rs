//! Translated functions as named assertions, and their SMT-LIB2 form.
//!
//! A [`Formula`] keeps every equation the encoder produced, in creation
//! order, so that serializing it is deterministic. Definitions name shared
//! subterms (`name = term`) and are only needed for the textual form; the
//! direct query conjoins assumptions, obligations and the goal over the
//! unnamed terms, which is equisatisfiable.

use crate::smt::eval::{self, Model, Observation, Value};
use crate::smt::printer::{self, symbol, Names};
use crate::smt::solver::{Query, Solver, SolverError, Verdict};
use crate::smt::{Expr, ExprPool, ExprRef, Sort};
use std::fmt::{self, Write};
use std::str::FromStr;
use strum::Display;

//
// Public Interface
//

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Goal {
    /// Some assertion site fails or an error block is reached.
    AssertionFailure,
    /// All listed blocks are reached on one execution.
    Reachable(Vec<String>),
    /// Some memory access leaves its allocation.
    MemorySafety,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum AssertionKind {
    Definition,
    Assumption,
    Obligation,
    Goal,
}

#[derive(Clone, Debug)]
pub struct Assertion {
    pub name: String,
    pub kind: AssertionKind,
    pub term: ExprRef,
    pub comment: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionDecl {
    pub name: String,
    pub args: Vec<Sort>,
    pub ret: Sort,
}

/// Reachability of one unrolled copy of a block.
#[derive(Clone, Debug)]
pub struct BlockInstance {
    pub label: String,
    /// Loop iteration counters, empty outside of loops.
    pub iteration: Vec<u32>,
    pub path_condition: ExprRef,
}

#[derive(Clone, Debug)]
pub struct Formula {
    pub function: String,
    pub goal: Goal,
    /// Free variables in creation order.
    pub inputs: Vec<ExprRef>,
    pub functions: Vec<FunctionDecl>,
    pub assertions: Vec<Assertion>,
    pub blocks: Vec<BlockInstance>,
    /// IR values by qualified name, including those without a definition.
    pub values: Vec<(String, ExprRef)>,
    /// Back edges whose continuation past the unroll bound was
    /// over-approximated, as `(latch, header)` labels.
    pub cut_edges: Vec<(String, String)>,
    pub goal_term: ExprRef,
}

impl Default for Goal {
    fn default() -> Self {
        Goal::AssertionFailure
    }
}

impl FromStr for Goal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assert" => Ok(Goal::AssertionFailure),
            "memory" => Ok(Goal::MemorySafety),
            _ => match s.strip_prefix("reach:") {
                Some(labels) => {
                    let labels: Vec<String> = labels
                        .split(',')
                        .map(|l| l.trim().trim_start_matches('%').to_string())
                        .filter(|l| !l.is_empty())
                        .collect();
                    if labels.is_empty() {
                        Err("reach goal needs at least one block label".to_string())
                    } else {
                        Ok(Goal::Reachable(labels))
                    }
                }
                None => Err(format!(
                    "unknown goal '{}', expected assert, memory or reach:LABEL[,LABEL]",
                    s
                )),
            },
        }
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Goal::AssertionFailure => write!(f, "assert"),
            Goal::MemorySafety => write!(f, "memory"),
            Goal::Reachable(labels) => write!(f, "reach:{}", labels.join(",")),
        }
    }
}

impl Formula {
    pub fn new(function: &str, goal: Goal, pool: &ExprPool) -> Self {
        Self {
            function: function.to_string(),
            goal,
            inputs: Vec::new(),
            functions: Vec::new(),
            assertions: Vec::new(),
            blocks: Vec::new(),
            values: Vec::new(),
            cut_edges: Vec::new(),
            goal_term: pool.ff(),
        }
    }

    pub fn push(&mut self, name: String, kind: AssertionKind, term: ExprRef, comment: String) {
        self.assertions.push(Assertion {
            name,
            kind,
            term,
            comment,
        });
    }

    /// Terms that must hold, excluding definitions.
    pub fn constraints(&self) -> impl Iterator<Item = &ExprRef> {
        self.assertions
            .iter()
            .filter(|a| a.kind != AssertionKind::Definition)
            .map(|a| &a.term)
            .chain(std::iter::once(&self.goal_term))
    }

    /// Logic of the textual form, which also declares every input and
    /// asserts every definition.
    pub fn logic(&self) -> &'static str {
        let terms = self
            .assertions
            .iter()
            .map(|a| &a.term)
            .chain(&self.inputs)
            .chain(std::iter::once(&self.goal_term));
        match printer::logic(terms) {
            "QF_BV" if !self.functions.is_empty() => "QF_UFBV",
            "QF_ABV" if !self.functions.is_empty() => "QF_AUFBV",
            logic => logic,
        }
    }

    /// Standalone SMT-LIB2 script for this function.
    pub fn to_smtlib(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "(set-option :produce-models true)");
        let _ = writeln!(out, "(set-logic {})", self.logic());
        self.write_body(&mut out);
        out
    }

    /// Script fragment bracketed by `(push 1)`/`(pop 1)`, for modules.
    pub fn write_scoped(&self, out: &mut String) {
        let _ = writeln!(out, "(push 1)");
        self.write_body(out);
        let _ = writeln!(out, "(pop 1)");
    }

    pub fn query(&self, pool: &ExprPool, timeout_ms: u64) -> Query {
        let constraints: Vec<ExprRef> = self.constraints().cloned().collect();
        Query {
            constraint: pool.and(&constraints),
            inputs: self.reported_inputs().cloned().collect(),
            observations: self.observations(),
            script: self.to_smtlib(),
            timeout_ms,
        }
    }

    pub fn solve(
        &self,
        pool: &ExprPool,
        solver: &mut dyn Solver,
        timeout_ms: u64,
    ) -> Result<Verdict, SolverError> {
        solver.solve(&self.query(pool, timeout_ms))
    }

    /// Blocks executed under a model, in encoding order.
    pub fn trace(&self, model: &Model) -> Vec<String> {
        let mut evaluator = crate::smt::eval::Evaluator::new(model);
        self.blocks
            .iter()
            .filter(|b| evaluator.eval(&b.path_condition).as_bool())
            .map(|b| {
                if b.iteration.iter().all(|&i| i == 0) {
                    b.label.clone()
                } else {
                    format!("{}#{}", b.label, join(&b.iteration, "."))
                }
            })
            .collect()
    }

    /// Term of an IR value, by qualified name (`f.%x`) or bare local name.
    pub fn term_of(&self, name: &str) -> Option<&ExprRef> {
        let local = name.trim_start_matches('%');
        let qualified = format!("{}.%{}", self.function, local);
        self.values
            .iter()
            .rev()
            .find(|(n, _)| n == name || *n == qualified)
            .map(|(_, term)| term)
    }

    pub fn value_of(&self, model: &Model, name: &str) -> Option<Value> {
        self.term_of(name).map(|term| model.eval(term))
    }

    /// What a solver has to report for a model to replay this formula.
    pub fn observations(&self) -> Vec<Observation> {
        let inputs: Vec<ExprRef> = self.reported_inputs().cloned().collect();
        eval::observations(&inputs, self.constraints())
    }

    //
    // Private Implementation
    //

    fn reported_inputs(&self) -> impl Iterator<Item = &ExprRef> {
        self.inputs
            .iter()
            .filter(|i| matches!(i.sort(), Sort::Bool | Sort::BitVec(_)))
    }

    fn write_body(&self, out: &mut String) {
        let _ = writeln!(out, "; function @{}, goal {}", self.function, self.goal);
        for input in &self.inputs {
            if let Expr::Var { name, sort } = input.expr() {
                let _ = writeln!(
                    out,
                    "(declare-fun {} () {})",
                    symbol(name),
                    printer::sort_to_string(*sort)
                );
            }
        }
        for function in &self.functions {
            let args: Vec<String> = function
                .args
                .iter()
                .map(|s| printer::sort_to_string(*s))
                .collect();
            let _ = writeln!(
                out,
                "(declare-fun {} ({}) {})",
                symbol(&function.name),
                args.join(" "),
                printer::sort_to_string(function.ret)
            );
        }

        // names become visible only once defined
        let mut names = Names::new();
        for assertion in &self.assertions {
            if !assertion.comment.is_empty() {
                let _ = writeln!(out, "; {}", assertion.comment);
            }
            match assertion.kind {
                AssertionKind::Definition => {
                    let _ = writeln!(
                        out,
                        "(declare-fun {} () {})",
                        symbol(&assertion.name),
                        printer::sort_to_string(assertion.term.sort())
                    );
                    out.push_str("(assert (= ");
                    out.push_str(&symbol(&assertion.name));
                    out.push(' ');
                    match names.get(&assertion.term) {
                        Some(existing) => out.push_str(&symbol(existing)),
                        None => printer::write_term(out, &assertion.term, &names),
                    }
                    out.push_str("))\n");
                    if !assertion.term.is_atom() && !names.contains_key(&assertion.term) {
                        names.insert(assertion.term.clone(), assertion.name.clone());
                    }
                }
                _ => {
                    out.push_str("(assert ");
                    write_named(out, &assertion.term, &names);
                    out.push_str(")\n");
                }
            }
        }

        let _ = writeln!(out, "; goal");
        out.push_str("(assert ");
        write_named(out, &self.goal_term, &names);
        out.push_str(")\n(check-sat)\n");

        let observations = self.observations();
        if !observations.is_empty() {
            out.push_str("(get-value (");
            for (i, observation) in observations.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                match observation {
                    Observation::Input(term) | Observation::Call(term) => write_named(out, term, &names),
                    Observation::Read { array, index } => {
                        write_named(out, index, &names);
                        out.push_str(" (select ");
                        write_named(out, array, &names);
                        out.push(' ');
                        write_named(out, index, &names);
                        out.push(')');
                    }
                }
            }
            out.push_str("))\n");
        }
    }
}

/// Writes a term, using a registered name even at the root.
fn write_named(out: &mut String, term: &ExprRef, names: &Names) {
    match names.get(term) {
        Some(name) => out.push_str(&symbol(name)),
        None => printer::write_term(out, term, names),
    }
}

fn join(items: &[u32], separator: &str) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::{BvCmp, BvOp};

    fn sample(pool: &ExprPool) -> Formula {
        let x = pool.var("f.%x", Sort::BitVec(32));
        let y = pool.binary(BvOp::Add, &x, &pool.bv(1, 32));
        let positive = pool.compare(BvCmp::Sgt, &y, &pool.bv(0, 32));

        let mut formula = Formula::new("f", Goal::AssertionFailure, pool);
        formula.inputs.push(x);
        formula.push(
            "f.%y".to_string(),
            AssertionKind::Definition,
            y.clone(),
            "%y (line 2)".to_string(),
        );
        formula.values.push(("f.%y".to_string(), y));
        formula.goal_term = positive;
        formula
    }

    #[test]
    fn goal_spellings_parse() {
        assert_eq!("assert".parse::<Goal>(), Ok(Goal::AssertionFailure));
        assert_eq!(
            "reach:%then,exit".parse::<Goal>(),
            Ok(Goal::Reachable(vec!["then".to_string(), "exit".to_string()]))
        );
        assert!("reach:".parse::<Goal>().is_err());
        assert!("everything".parse::<Goal>().is_err());
    }

    #[test]
    fn definitions_are_referenced_by_name_after_declaration() {
        let pool = ExprPool::new();
        let script = sample(&pool).to_smtlib();
        let expected = "\
(set-option :produce-models true)
(set-logic QF_BV)
; function @f, goal assert
(declare-fun f.%x () (_ BitVec 32))
; %y (line 2)
(declare-fun f.%y () (_ BitVec 32))
(assert (= f.%y (bvadd f.%x #x00000001)))
; goal
(assert (bvsgt f.%y #x00000000))
(check-sat)
(get-value (f.%x))
";
        assert_eq!(script, expected);
    }

    #[test]
    fn values_resolve_by_bare_or_qualified_name() {
        let pool = ExprPool::new();
        let formula = sample(&pool);
        let mut model = Model::default();
        model.values.insert(
            "f.%x".to_string(),
            Value::BitVec {
                value: 41,
                width: 32,
            },
        );
        assert_eq!(formula.value_of(&model, "%y").map(|v| v.as_u128()), Some(42));
        assert_eq!(formula.value_of(&model, "f.%y").map(|v| v.as_u128()), Some(42));
        assert!(formula.value_of(&model, "z").is_none());
    }
}
