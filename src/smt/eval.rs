//! Concrete evaluation of terms, used to replay solver models.

use super::{BvCmp, BvOp, Expr, ExprRef, Sort, ADDRESS_BITS};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

//
// Public Interface
//

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    BitVec { value: u128, width: u32 },
    Memory(MemoryValue),
}

/// Finite description of an array: a default byte plus explicit cells.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryValue {
    pub default: u8,
    pub bytes: BTreeMap<u64, u8>,
}

/// Assignment to free variables and uninterpreted functions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Model {
    pub values: BTreeMap<String, Value>,
    /// Function name to argument tuples and results.
    pub functions: BTreeMap<String, Vec<(Vec<Value>, Value)>>,
}

/// Part of a solver model a replay depends on. Each observation is
/// answered by the values of its [`Observation::queried`] terms, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// Free variable of a scalar sort.
    Input(ExprRef),
    /// Byte of an unconstrained array at an address: the address, then
    /// the byte.
    Read { array: ExprRef, index: ExprRef },
    /// Result of an uninterpreted function application.
    Call(ExprRef),
}

pub struct Evaluator<'a> {
    model: &'a Model,
    cache: HashMap<ExprRef, Value>,
}

impl Value {
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::BitVec { value, .. } => *value != 0,
            Value::Memory(_) => false,
        }
    }

    pub fn as_u128(&self) -> u128 {
        match self {
            Value::Bool(b) => *b as u128,
            Value::BitVec { value, .. } => *value,
            Value::Memory(_) => 0,
        }
    }

    /// Zero value of a sort, used for unassigned variables.
    pub fn default_of(sort: Sort) -> Value {
        match sort {
            Sort::Bool => Value::Bool(false),
            Sort::BitVec(width) => Value::BitVec { value: 0, width },
            Sort::Memory => Value::Memory(MemoryValue::default()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::BitVec { value, width } => {
                write!(f, "{} (i{} {})", value, width, to_signed(*value, *width))
            }
            Value::Memory(memory) => {
                write!(f, "[default {:#04x}", memory.default)?;
                for (address, byte) in &memory.bytes {
                    write!(f, ", {:#x}: {:#04x}", address, byte)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl MemoryValue {
    pub fn read(&self, address: u64) -> u8 {
        self.bytes.get(&address).copied().unwrap_or(self.default)
    }
}

impl Model {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn eval(&self, term: &ExprRef) -> Value {
        Evaluator::new(self).eval(term)
    }
}

impl Observation {
    /// Sorts of the values answering this observation.
    pub fn sorts(&self) -> Vec<Sort> {
        match self {
            Observation::Input(term) | Observation::Call(term) => vec![term.sort()],
            Observation::Read { .. } => vec![Sort::BitVec(ADDRESS_BITS), Sort::BitVec(8)],
        }
    }
}

/// Observations covering the scalar `inputs` and every array read and
/// function application within `terms`. Array reads come before
/// applications, and applications appear inner first.
pub fn observations<'a, I>(inputs: &[ExprRef], terms: I) -> Vec<Observation>
where
    I: IntoIterator<Item = &'a ExprRef>,
{
    let mut reads = Vec::new();
    let mut calls = Vec::new();
    let mut seen: HashSet<ExprRef> = HashSet::new();
    let mut read_seen: HashSet<(ExprRef, ExprRef)> = HashSet::new();

    for term in terms {
        let mut stack: Vec<(ExprRef, bool)> = vec![(term.clone(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if !expanded {
                if !seen.insert(node.clone()) {
                    continue;
                }
                stack.push((node.clone(), true));
                for child in node.children().into_iter().rev() {
                    stack.push((child.clone(), false));
                }
                continue;
            }
            match node.expr() {
                Expr::Select { array, index } => {
                    for leaf in array_leaves(array) {
                        if read_seen.insert((leaf.clone(), index.clone())) {
                            reads.push(Observation::Read {
                                array: leaf,
                                index: index.clone(),
                            });
                        }
                    }
                }
                Expr::Apply { .. } => calls.push(Observation::Call(node.clone())),
                _ => {}
            }
        }
    }

    inputs
        .iter()
        .filter(|i| matches!(i.expr(), Expr::Var { sort: Sort::Bool | Sort::BitVec(_), .. }))
        .cloned()
        .map(Observation::Input)
        .chain(reads)
        .chain(calls)
        .collect()
}

/// Rebuilds a model from the values a solver gave for the queried terms
/// of `observations`, in order.
pub fn assemble(observations: &[Observation], values: &[Value]) -> Model {
    let mut model = Model::default();
    let mut values = values.iter();

    for observation in observations {
        match observation {
            Observation::Input(term) => {
                if let (Expr::Var { name, .. }, Some(value)) = (term.expr(), values.next()) {
                    model.values.insert(name.clone(), value.clone());
                }
            }
            Observation::Read { array, .. } => {
                let (address, byte) = match (values.next(), values.next()) {
                    (Some(address), Some(byte)) => (address.as_u128() as u64, byte.as_u128() as u8),
                    _ => break,
                };
                if let Expr::Var { name, .. } = array.expr() {
                    let entry = model
                        .values
                        .entry(name.clone())
                        .or_insert_with(|| Value::Memory(MemoryValue::default()));
                    if let Value::Memory(memory) = entry {
                        memory.bytes.insert(address, byte);
                    }
                }
            }
            Observation::Call(term) => {
                let result = match values.next() {
                    Some(result) => result.clone(),
                    None => break,
                };
                if let Expr::Apply { function, args, .. } = term.expr() {
                    let mut evaluator = Evaluator::new(&model);
                    let key: Vec<Value> = args.iter().map(|a| evaluator.eval(a)).collect();
                    model
                        .functions
                        .entry(function.clone())
                        .or_default()
                        .push((key, result));
                }
            }
        }
    }
    model
}

impl<'a> Evaluator<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self {
            model,
            cache: HashMap::new(),
        }
    }

    pub fn eval(&mut self, term: &ExprRef) -> Value {
        if let Some(value) = self.cache.get(term) {
            return value.clone();
        }
        // post-order over the DAG to keep deep terms off the call stack
        let mut stack: Vec<(ExprRef, bool)> = vec![(term.clone(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if self.cache.contains_key(&node) {
                continue;
            }
            if !expanded {
                stack.push((node.clone(), true));
                for child in node.children() {
                    if !self.cache.contains_key(child) {
                        stack.push((child.clone(), false));
                    }
                }
                continue;
            }
            let value = self.compute(&node);
            self.cache.insert(node, value);
        }
        self.cache
            .get(term)
            .cloned()
            .unwrap_or_else(|| Value::default_of(term.sort()))
    }

    //
    // Private Implementation
    //

    fn value(&self, term: &ExprRef) -> Value {
        self.cache
            .get(term)
            .cloned()
            .unwrap_or_else(|| Value::default_of(term.sort()))
    }

    fn bits(&self, term: &ExprRef) -> u128 {
        self.value(term).as_u128()
    }

    fn flag(&self, term: &ExprRef) -> bool {
        self.value(term).as_bool()
    }

    fn compute(&self, term: &ExprRef) -> Value {
        let width = term.width();
        let bv = |value: u128| Value::BitVec {
            value: value & mask(width),
            width,
        };
        match term.expr() {
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Const { value, width } => Value::BitVec {
                value: *value,
                width: *width,
            },
            Expr::Var { name, sort } => self
                .model
                .values
                .get(name)
                .cloned()
                .unwrap_or_else(|| Value::default_of(*sort)),
            Expr::Not(value) => Value::Bool(!self.flag(value)),
            Expr::And(items) => Value::Bool(items.iter().all(|i| self.flag(i))),
            Expr::Or(items) => Value::Bool(items.iter().any(|i| self.flag(i))),
            Expr::Ite {
                cond,
                then,
                otherwise,
            } => {
                if self.flag(cond) {
                    self.value(then)
                } else {
                    self.value(otherwise)
                }
            }
            Expr::Eq(left, right) => Value::Bool(self.value(left) == self.value(right)),
            Expr::Binary { op, left, right } => {
                bv(fold_binary(*op, self.bits(left), self.bits(right), width))
            }
            Expr::Compare { op, left, right } => Value::Bool(fold_compare(
                *op,
                self.bits(left),
                self.bits(right),
                left.width(),
            )),
            Expr::Extract { low, value, .. } => bv(self.bits(value) >> low),
            Expr::Concat(upper, lower) => {
                bv((self.bits(upper) << lower.width()) | self.bits(lower))
            }
            Expr::ZeroExt { value, .. } => bv(self.bits(value)),
            Expr::SignExt { value, .. } => bv(to_signed(self.bits(value), value.width()) as u128),
            Expr::Select { array, index } => match self.value(array) {
                Value::Memory(memory) => bv(memory.read(self.bits(index) as u64) as u128),
                _ => bv(0),
            },
            Expr::Store {
                array,
                index,
                value,
            } => {
                let mut memory = match self.value(array) {
                    Value::Memory(memory) => memory,
                    _ => MemoryValue::default(),
                };
                memory
                    .bytes
                    .insert(self.bits(index) as u64, self.bits(value) as u8);
                Value::Memory(memory)
            }
            Expr::Apply {
                function,
                args,
                sort,
            } => {
                let args: Vec<Value> = args.iter().map(|a| self.value(a)).collect();
                self.model
                    .functions
                    .get(function)
                    .and_then(|table| table.iter().find(|(key, _)| *key == args))
                    .map(|(_, result)| result.clone())
                    .unwrap_or_else(|| Value::default_of(*sort))
            }
        }
    }
}

pub fn mask(width: u32) -> u128 {
    if width >= 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}

/// Sign-extends the low `width` bits of `value`.
pub fn to_signed(value: u128, width: u32) -> i128 {
    if width == 0 || width >= 128 {
        return value as i128;
    }
    let shift = 128 - width;
    ((value << shift) as i128) >> shift
}

/// Array variables an array term is built on.
fn array_leaves(array: &ExprRef) -> Vec<ExprRef> {
    let mut leaves = Vec::new();
    let mut stack = vec![array.clone()];
    while let Some(term) = stack.pop() {
        match term.expr() {
            Expr::Var { .. } => {
                if !leaves.contains(&term) {
                    leaves.push(term);
                }
            }
            Expr::Store { array, .. } => stack.push(array.clone()),
            Expr::Ite { then, otherwise, .. } => {
                stack.push(otherwise.clone());
                stack.push(then.clone());
            }
            _ => {}
        }
    }
    leaves
}

/// Bit-vector operator semantics, including SMT-LIB division by zero.
#[rustfmt::skip]
pub fn fold_binary(op: BvOp, left: u128, right: u128, width: u32) -> u128 {
    let m = mask(width);
    let (l, r) = (left & m, right & m);
    let (sl, sr) = (to_signed(l, width), to_signed(r, width));
    let result = match op {
        BvOp::Add => l.wrapping_add(r),
        BvOp::Sub => l.wrapping_sub(r),
        BvOp::Mul => l.wrapping_mul(r),
        BvOp::UDiv => if r == 0 { m } else { l / r },
        BvOp::URem => if r == 0 { l } else { l % r },
        BvOp::SDiv => if r == 0 { if sl < 0 { 1 } else { m } } else { sl.wrapping_div(sr) as u128 },
        BvOp::SRem => if r == 0 { l } else { sl.wrapping_rem(sr) as u128 },
        BvOp::Shl => if r >= width as u128 { 0 } else { l << r },
        BvOp::LShr => if r >= width as u128 { 0 } else { l >> r },
        BvOp::AShr => if r >= width as u128 { if sl < 0 { m } else { 0 } } else { (sl >> r) as u128 },
        BvOp::And => l & r,
        BvOp::Or => l | r,
        BvOp::Xor => l ^ r,
    };
    result & m
}

#[rustfmt::skip]
pub fn fold_compare(op: BvCmp, left: u128, right: u128, width: u32) -> bool {
    let m = mask(width);
    let (l, r) = (left & m, right & m);
    let (sl, sr) = (to_signed(l, width), to_signed(r, width));
    match op {
        BvCmp::Ult => l < r,
        BvCmp::Ule => l <= r,
        BvCmp::Ugt => l > r,
        BvCmp::Uge => l >= r,
        BvCmp::Slt => sl < sr,
        BvCmp::Sle => sl <= sr,
        BvCmp::Sgt => sl > sr,
        BvCmp::Sge => sl >= sr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::ExprPool;

    #[test]
    fn division_by_zero_follows_smtlib() {
        assert_eq!(fold_binary(BvOp::UDiv, 7, 0, 8), 0xff);
        assert_eq!(fold_binary(BvOp::URem, 7, 0, 8), 7);
        assert_eq!(fold_binary(BvOp::SDiv, 0x80, 0, 8), 1);
        assert_eq!(fold_binary(BvOp::SDiv, 5, 0, 8), 0xff);
        assert_eq!(fold_binary(BvOp::SDiv, 0x80, 0xff, 8), 0x80);
        assert_eq!(fold_binary(BvOp::AShr, 0x80, 9, 8), 0xff);
    }

    #[test]
    fn signed_comparisons_use_twos_complement() {
        assert!(fold_compare(BvCmp::Slt, 0xff, 0, 8));
        assert!(!fold_compare(BvCmp::Ult, 0xff, 0, 8));
        assert_eq!(to_signed(0x80, 8), -128);
    }

    #[test]
    fn replays_symbolic_terms_under_an_assignment() {
        let pool = ExprPool::new();
        let x = pool.var("x", Sort::BitVec(8));
        let memory = pool.var("m", Sort::Memory);
        let address = pool.bv(16, 64);
        let stored = pool.store(&memory, &address, &x);
        let loaded = pool.select(&stored, &address);
        let sum = pool.binary(BvOp::Add, &loaded, &pool.bv(100, 8));
        let loaded_elsewhere = pool.select(&stored, &pool.var("q", Sort::BitVec(64)));

        let mut model = Model::default();
        model
            .values
            .insert("x".to_string(), Value::BitVec { value: 200, width: 8 });
        model.values.insert(
            "q".to_string(),
            Value::BitVec {
                value: 16,
                width: 64,
            },
        );

        let mut evaluator = Evaluator::new(&model);
        assert_eq!(evaluator.eval(&sum).as_u128(), 44);
        assert_eq!(evaluator.eval(&loaded_elsewhere).as_u128(), 200);
    }

    #[test]
    fn observations_list_reads_before_calls_inner_first() {
        let pool = ExprPool::new();
        let x = pool.var("x", Sort::BitVec(8));
        let memory = pool.var("m", Sort::Memory);
        let p = pool.var("p", Sort::BitVec(64));
        let written = pool.store(&memory, &pool.bv(0, 64), &x);
        let read = pool.select(&written, &p);
        let inner = pool.apply("g", &[x.clone()], Sort::BitVec(8));
        let outer = pool.apply("h", &[inner.clone(), read.clone()], Sort::BitVec(8));
        let goal = pool.eq(&outer, &pool.bv(1, 8));

        let found = observations(&[x.clone(), memory.clone()], [&goal]);
        assert_eq!(
            found,
            vec![
                Observation::Input(x),
                Observation::Read {
                    array: memory,
                    index: p,
                },
                Observation::Call(inner.clone()),
                Observation::Call(outer.clone()),
            ]
        );

        let byte = |value| Value::BitVec { value, width: 8 };
        let values = [
            byte(5),
            Value::BitVec {
                value: 32,
                width: 64,
            },
            byte(9),
            byte(2),
            byte(1),
        ];
        let model = assemble(&found, &values);
        assert_eq!(model.eval(&read).as_u128(), 9);
        assert_eq!(model.eval(&inner).as_u128(), 2);
        assert!(model.eval(&goal).as_bool());
    }
}
