use super::eval::{self, Value};
use super::solver::{Query, Solver, SolverError, Verdict};
use super::{BvCmp, BvOp, Expr, ExprRef, Sort as TermSort, ADDRESS_BITS};
use std::collections::HashMap;
use z3_solver::{
    ast::{Array, Ast, Bool, Dynamic, BV},
    Config, Context, FuncDecl, Model as Z3Model, Params, SatResult, Solver as Z3Solver, Sort,
};

/// In-process Z3. Every query gets its own context, dropped once the
/// model has been read back.
#[derive(Default)]
pub struct Z3SolverWrapper;

impl Z3SolverWrapper {
    pub fn new() -> Self {
        Self
    }
}

impl Solver for Z3SolverWrapper {
    fn name(&self) -> &'static str {
        "Z3"
    }

    fn solve_impl(&mut self, query: &Query) -> Result<Verdict, SolverError> {
        let config = Config::new();
        let context = Context::new(&config);
        let mut session = Z3Session::new(&context);
        session.check(query)
    }
}

/// Translation of one query into a Z3 context.
struct Z3Session<'ctx> {
    context: &'ctx Context,
    solver: Z3Solver<'ctx>,
    mapping: HashMap<ExprRef, Dynamic<'ctx>>,
    functions: HashMap<String, FuncDecl<'ctx>>,
}

impl<'ctx> Z3Session<'ctx> {
    fn new(context: &'ctx Context) -> Self {
        Self {
            context,
            solver: Z3Solver::new(context),
            mapping: HashMap::new(),
            functions: HashMap::new(),
        }
    }

    fn check(&mut self, query: &Query) -> Result<Verdict, SolverError> {
        let mut params = Params::new(self.context);
        params.set_u32("timeout", query.timeout_ms.min(u32::MAX as u64) as u32);
        self.solver.set_params(&params);

        let z3_bool = self.boolean(&query.constraint);
        self.solver.assert(&z3_bool);
        let verdict = match self.solver.check() {
            SatResult::Sat => {
                let z3_model = self
                    .solver
                    .get_model()
                    .ok_or_else(|| SolverError::MalformedOutput("sat without a model".to_string()))?;
                Verdict::Sat(self.extract_model(query, &z3_model)?)
            }
            SatResult::Unsat => Verdict::Unsat,
            SatResult::Unknown => Verdict::Unknown {
                reason: self
                    .solver
                    .get_reason_unknown()
                    .unwrap_or_else(|| "unknown".to_string()),
                timeout_ms: query.timeout_ms,
            },
        };
        Ok(verdict)
    }

    /// Evaluates the queried terms of every observation in the model.
    fn extract_model(&mut self, query: &Query, z3_model: &Z3Model<'ctx>) -> Result<eval::Model, SolverError> {
        let mut values = Vec::new();
        for observation in &query.observations {
            let queried: Vec<Dynamic<'ctx>> = match observation {
                eval::Observation::Input(term) | eval::Observation::Call(term) => vec![self.visit(term)],
                eval::Observation::Read { array, index } => {
                    let z3_array = self.array(array);
                    let z3_index = self.bv(index);
                    let byte = z3_array.select(&z3_index);
                    vec![z3_index.into(), byte]
                }
            };
            for (z3_value, sort) in queried.iter().zip(observation.sorts()) {
                values.push(read_value(z3_model, z3_value, sort)?);
            }
        }
        Ok(eval::assemble(&query.observations, &values))
    }

    fn visit(&mut self, term: &ExprRef) -> Dynamic<'ctx> {
        if let Some(value) = self.mapping.get(term) {
            return value.clone();
        }
        let value = self.translate(term);
        self.mapping.insert(term.clone(), value.clone());
        value
    }

    fn bv(&mut self, term: &ExprRef) -> BV<'ctx> {
        self.visit(term).as_bv().expect("bv")
    }

    fn boolean(&mut self, term: &ExprRef) -> Bool<'ctx> {
        self.visit(term).as_bool().expect("bool")
    }

    fn array(&mut self, term: &ExprRef) -> Array<'ctx> {
        self.visit(term).as_array().expect("array")
    }

    fn sort(&self, sort: TermSort) -> Sort<'ctx> {
        match sort {
            TermSort::Bool => Sort::bool(self.context),
            TermSort::BitVec(width) => Sort::bitvector(self.context, width),
            TermSort::Memory => Sort::array(
                self.context,
                &Sort::bitvector(self.context, ADDRESS_BITS),
                &Sort::bitvector(self.context, 8),
            ),
        }
    }

    fn constant(&self, value: u128, width: u32) -> BV<'ctx> {
        if width <= 64 {
            return BV::from_u64(self.context, value as u64, width);
        }
        let high = BV::from_u64(self.context, (value >> 64) as u64, width - 64);
        let low = BV::from_u64(self.context, value as u64, 64);
        high.concat(&low)
    }

    #[rustfmt::skip]
    fn translate(&mut self, term: &ExprRef) -> Dynamic<'ctx> {
        match term.expr() {
            Expr::Bool(b) => Bool::from_bool(self.context, *b).into(),
            Expr::Const { value, width } => self.constant(*value, *width).into(),
            Expr::Var { name, sort: TermSort::Bool } => Bool::new_const(self.context, name.as_str()).into(),
            Expr::Var { name, sort: TermSort::BitVec(width) } => BV::new_const(self.context, name.as_str(), *width).into(),
            Expr::Var { name, sort: TermSort::Memory } => {
                let domain = Sort::bitvector(self.context, ADDRESS_BITS);
                let range = Sort::bitvector(self.context, 8);
                Array::new_const(self.context, name.as_str(), &domain, &range).into()
            }
            Expr::Not(value) => self.boolean(value).not().into(),
            Expr::And(items) => {
                let z3_items: Vec<Bool> = items.iter().map(|i| self.boolean(i)).collect();
                let refs: Vec<&Bool> = z3_items.iter().collect();
                Bool::and(self.context, &refs).into()
            }
            Expr::Or(items) => {
                let z3_items: Vec<Bool> = items.iter().map(|i| self.boolean(i)).collect();
                let refs: Vec<&Bool> = z3_items.iter().collect();
                Bool::or(self.context, &refs).into()
            }
            Expr::Ite { cond, then, otherwise } => {
                let z3_cond = self.boolean(cond);
                let z3_then = self.visit(then);
                let z3_otherwise = self.visit(otherwise);
                z3_cond.ite(&z3_then, &z3_otherwise)
            }
            Expr::Eq(left, right) => {
                let z3_left = self.visit(left);
                let z3_right = self.visit(right);
                z3_left._eq(&z3_right).into()
            }
            Expr::Binary { op, left, right } => {
                let l = self.bv(left);
                let r = self.bv(right);
                match op {
                    BvOp::Add => l.bvadd(&r),
                    BvOp::Sub => l.bvsub(&r),
                    BvOp::Mul => l.bvmul(&r),
                    BvOp::UDiv => l.bvudiv(&r),
                    BvOp::SDiv => l.bvsdiv(&r),
                    BvOp::URem => l.bvurem(&r),
                    BvOp::SRem => l.bvsrem(&r),
                    BvOp::Shl => l.bvshl(&r),
                    BvOp::LShr => l.bvlshr(&r),
                    BvOp::AShr => l.bvashr(&r),
                    BvOp::And => l.bvand(&r),
                    BvOp::Or => l.bvor(&r),
                    BvOp::Xor => l.bvxor(&r),
                }.into()
            }
            Expr::Compare { op, left, right } => {
                let l = self.bv(left);
                let r = self.bv(right);
                match op {
                    BvCmp::Ult => l.bvult(&r),
                    BvCmp::Ule => l.bvule(&r),
                    BvCmp::Ugt => l.bvugt(&r),
                    BvCmp::Uge => l.bvuge(&r),
                    BvCmp::Slt => l.bvslt(&r),
                    BvCmp::Sle => l.bvsle(&r),
                    BvCmp::Sgt => l.bvsgt(&r),
                    BvCmp::Sge => l.bvsge(&r),
                }.into()
            }
            Expr::Extract { high, low, value } => self.bv(value).extract(*high, *low).into(),
            Expr::Concat(upper, lower) => {
                let z3_upper = self.bv(upper);
                let z3_lower = self.bv(lower);
                z3_upper.concat(&z3_lower).into()
            }
            Expr::ZeroExt { by, value } => self.bv(value).zero_ext(*by).into(),
            Expr::SignExt { by, value } => self.bv(value).sign_ext(*by).into(),
            Expr::Select { array, index } => {
                let z3_array = self.visit(array).as_array().expect("array");
                let z3_index = self.bv(index);
                z3_array.select(&z3_index)
            }
            Expr::Store { array, index, value } => {
                let z3_array = self.visit(array).as_array().expect("array");
                let z3_index = self.bv(index);
                let z3_value = self.bv(value);
                z3_array.store(&z3_index, &z3_value).into()
            }
            Expr::Apply { function, args, sort } => {
                let z3_args: Vec<Dynamic> = args.iter().map(|a| self.visit(a)).collect();
                if !self.functions.contains_key(function) {
                    let domain: Vec<Sort> = args.iter().map(|a| self.sort(a.sort())).collect();
                    let domain_refs: Vec<&Sort> = domain.iter().collect();
                    let decl = FuncDecl::new(self.context, function.as_str(), &domain_refs, &self.sort(*sort));
                    self.functions.insert(function.clone(), decl);
                }
                let arg_refs: Vec<&dyn Ast<'ctx>> = z3_args.iter().map(|a| a as &dyn Ast<'ctx>).collect();
                self.functions[function].apply(&arg_refs)
            }
        }
    }
}

fn read_value<'ctx>(z3_model: &Z3Model<'ctx>, z3_value: &Dynamic<'ctx>, sort: TermSort) -> Result<Value, SolverError> {
    let value = match sort {
        TermSort::Bool => z3_value
            .as_bool()
            .and_then(|b| z3_model.eval(&b, true))
            .and_then(|b| b.as_bool())
            .map(Value::Bool),
        TermSort::BitVec(width) => z3_value
            .as_bv()
            .and_then(|bv| z3_model.eval(&bv, true))
            .and_then(|bv| bv_to_u128(&bv, width))
            .map(|value| Value::BitVec { value, width }),
        TermSort::Memory => None,
    };
    value.ok_or_else(|| SolverError::MalformedOutput(format!("no {:?} value for {}", sort, z3_value)))
}

fn bv_to_u128(bv: &BV, width: u32) -> Option<u128> {
    if width <= 64 {
        return bv.as_u64().map(u128::from);
    }
    let text = bv.to_string();
    if let Some(hex) = text.strip_prefix("#x") {
        u128::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = text.strip_prefix("#b") {
        u128::from_str_radix(bin, 2).ok()
    } else {
        text.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::ExprPool;

    #[test]
    fn z3_decides_wrapping_addition() {
        let pool = ExprPool::new();
        let x = pool.var("x", TermSort::BitVec(8));
        let sum = pool.binary(BvOp::Add, &x, &pool.bv(100, 8));
        let constraint = pool.eq(&sum, &pool.bv(44, 8));
        let inputs = vec![x];
        let query = Query {
            observations: eval::observations(&inputs, [&constraint]),
            constraint,
            inputs,
            script: String::new(),
            timeout_ms: 10_000,
        };
        let verdict = Z3SolverWrapper::new().solve(&query).unwrap();
        assert_eq!(
            verdict.model().and_then(|m| m.get("x")).map(Value::as_u128),
            Some(200)
        );
    }
}
