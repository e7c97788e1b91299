//! Hash-consed SMT terms over booleans, bit-vectors and byte arrays.
//!
//! Every term is created through an [`ExprPool`], which deduplicates
//! structurally equal terms. Children are compared by identity, so two
//! [`ExprRef`]s are equal iff they are the same node. Builders apply cheap
//! local simplifications (constant folding, store-to-load forwarding,
//! extract/concat merging) before interning.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use strum::Display;

pub mod eval;
pub mod printer;
pub mod solver;
#[cfg(feature = "z3")]
pub mod z3_impl;

use eval::{fold_binary, fold_compare, mask, to_signed};

//
// Public Interface
//

/// Width of memory addresses, matching the IR pointer width.
pub const ADDRESS_BITS: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sort {
    Bool,
    BitVec(u32),
    /// Byte-addressed memory, `(Array (_ BitVec 64) (_ BitVec 8))`.
    Memory,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum BvOp {
    #[strum(serialize = "bvadd")]
    Add,
    #[strum(serialize = "bvsub")]
    Sub,
    #[strum(serialize = "bvmul")]
    Mul,
    #[strum(serialize = "bvudiv")]
    UDiv,
    #[strum(serialize = "bvsdiv")]
    SDiv,
    #[strum(serialize = "bvurem")]
    URem,
    #[strum(serialize = "bvsrem")]
    SRem,
    #[strum(serialize = "bvshl")]
    Shl,
    #[strum(serialize = "bvlshr")]
    LShr,
    #[strum(serialize = "bvashr")]
    AShr,
    #[strum(serialize = "bvand")]
    And,
    #[strum(serialize = "bvor")]
    Or,
    #[strum(serialize = "bvxor")]
    Xor,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum BvCmp {
    #[strum(serialize = "bvult")]
    Ult,
    #[strum(serialize = "bvule")]
    Ule,
    #[strum(serialize = "bvugt")]
    Ugt,
    #[strum(serialize = "bvuge")]
    Uge,
    #[strum(serialize = "bvslt")]
    Slt,
    #[strum(serialize = "bvsle")]
    Sle,
    #[strum(serialize = "bvsgt")]
    Sgt,
    #[strum(serialize = "bvsge")]
    Sge,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Bool(bool),
    Const {
        value: u128,
        width: u32,
    },
    Var {
        name: String,
        sort: Sort,
    },
    Not(ExprRef),
    And(Vec<ExprRef>),
    Or(Vec<ExprRef>),
    Ite {
        cond: ExprRef,
        then: ExprRef,
        otherwise: ExprRef,
    },
    Eq(ExprRef, ExprRef),
    Binary {
        op: BvOp,
        left: ExprRef,
        right: ExprRef,
    },
    Compare {
        op: BvCmp,
        left: ExprRef,
        right: ExprRef,
    },
    Extract {
        high: u32,
        low: u32,
        value: ExprRef,
    },
    Concat(ExprRef, ExprRef),
    ZeroExt {
        by: u32,
        value: ExprRef,
    },
    SignExt {
        by: u32,
        value: ExprRef,
    },
    Select {
        array: ExprRef,
        index: ExprRef,
    },
    Store {
        array: ExprRef,
        index: ExprRef,
        value: ExprRef,
    },
    /// Application of an uninterpreted function.
    Apply {
        function: String,
        args: Vec<ExprRef>,
        sort: Sort,
    },
}

#[derive(Debug)]
pub struct Node {
    expr: Expr,
    sort: Sort,
}

/// Shared handle to an interned term, hashed and compared by identity.
#[derive(Clone)]
pub struct ExprRef(Arc<Node>);

/// Structural deduplication cache, shared by all translation workers.
#[derive(Default)]
pub struct ExprPool {
    table: Mutex<HashMap<Expr, ExprRef>>,
}

impl Sort {
    pub fn width(&self) -> Option<u32> {
        match self {
            Sort::BitVec(width) => Some(*width),
            _ => None,
        }
    }
}

impl ExprRef {
    pub fn expr(&self) -> &Expr {
        &self.0.expr
    }

    pub fn sort(&self) -> Sort {
        self.0.sort
    }

    /// Bit width, booleans count as one bit and memory as zero.
    pub fn width(&self) -> u32 {
        match self.0.sort {
            Sort::Bool => 1,
            Sort::BitVec(width) => width,
            Sort::Memory => 0,
        }
    }

    pub fn as_const(&self) -> Option<u128> {
        match self.expr() {
            Expr::Const { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.expr() {
            Expr::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.as_bool() == Some(true)
    }

    pub fn is_false(&self) -> bool {
        self.as_bool() == Some(false)
    }

    /// Constants and variables, which need no name of their own.
    pub fn is_atom(&self) -> bool {
        matches!(
            self.expr(),
            Expr::Bool(_) | Expr::Const { .. } | Expr::Var { .. }
        )
    }

    pub fn children(&self) -> Vec<&ExprRef> {
        match self.expr() {
            Expr::Bool(_) | Expr::Const { .. } | Expr::Var { .. } => vec![],
            Expr::Not(value) => vec![value],
            Expr::And(items) | Expr::Or(items) => items.iter().collect(),
            Expr::Ite {
                cond,
                then,
                otherwise,
            } => vec![cond, then, otherwise],
            Expr::Eq(left, right) | Expr::Concat(left, right) => vec![left, right],
            Expr::Binary { left, right, .. } | Expr::Compare { left, right, .. } => {
                vec![left, right]
            }
            Expr::Extract { value, .. }
            | Expr::ZeroExt { value, .. }
            | Expr::SignExt { value, .. } => vec![value],
            Expr::Select { array, index } => vec![array, index],
            Expr::Store {
                array,
                index,
                value,
            } => vec![array, index, value],
            Expr::Apply { args, .. } => args.iter().collect(),
        }
    }
}

impl Hash for ExprRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl PartialEq for ExprRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ExprRef {}

impl fmt::Debug for ExprRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", printer::term_to_string(self))
    }
}

impl fmt::Display for ExprRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", printer::term_to_string(self))
    }
}

impl ExprPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct terms created so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bool(&self, value: bool) -> ExprRef {
        self.intern(Expr::Bool(value))
    }

    pub fn tt(&self) -> ExprRef {
        self.bool(true)
    }

    pub fn ff(&self) -> ExprRef {
        self.bool(false)
    }

    pub fn bv(&self, value: u128, width: u32) -> ExprRef {
        self.intern(Expr::Const {
            value: value & mask(width),
            width,
        })
    }

    pub fn var(&self, name: &str, sort: Sort) -> ExprRef {
        self.intern(Expr::Var {
            name: name.to_string(),
            sort,
        })
    }

    pub fn not(&self, value: &ExprRef) -> ExprRef {
        match value.expr() {
            Expr::Bool(b) => self.bool(!b),
            Expr::Not(inner) => inner.clone(),
            _ => self.intern(Expr::Not(value.clone())),
        }
    }

    pub fn and(&self, items: &[ExprRef]) -> ExprRef {
        match self.flatten(items, true) {
            Some(items) => self.connective(items, true),
            None => self.ff(),
        }
    }

    pub fn or(&self, items: &[ExprRef]) -> ExprRef {
        match self.flatten(items, false) {
            Some(items) => self.connective(items, false),
            None => self.tt(),
        }
    }

    pub fn and2(&self, left: &ExprRef, right: &ExprRef) -> ExprRef {
        self.and(&[left.clone(), right.clone()])
    }

    pub fn or2(&self, left: &ExprRef, right: &ExprRef) -> ExprRef {
        self.or(&[left.clone(), right.clone()])
    }

    pub fn implies(&self, premise: &ExprRef, conclusion: &ExprRef) -> ExprRef {
        self.or(&[self.not(premise), conclusion.clone()])
    }

    pub fn ite(&self, cond: &ExprRef, then: &ExprRef, otherwise: &ExprRef) -> ExprRef {
        debug_assert_eq!(then.sort(), otherwise.sort());
        if let Some(b) = cond.as_bool() {
            return if b { then.clone() } else { otherwise.clone() };
        }
        if then == otherwise {
            return then.clone();
        }
        if then.sort() == Sort::Bool {
            match (then.as_bool(), otherwise.as_bool()) {
                (Some(true), Some(false)) => return cond.clone(),
                (Some(false), Some(true)) => return self.not(cond),
                (Some(true), None) => return self.or2(cond, otherwise),
                (Some(false), None) => return self.and2(&self.not(cond), otherwise),
                (None, Some(true)) => return self.or2(&self.not(cond), then),
                (None, Some(false)) => return self.and2(cond, then),
                _ => {}
            }
        }
        if let Expr::Not(inner) = cond.expr() {
            return self.ite(inner, otherwise, then);
        }
        self.intern(Expr::Ite {
            cond: cond.clone(),
            then: then.clone(),
            otherwise: otherwise.clone(),
        })
    }

    pub fn eq(&self, left: &ExprRef, right: &ExprRef) -> ExprRef {
        debug_assert_eq!(left.sort(), right.sort());
        if left == right {
            return self.tt();
        }
        match (left.expr(), right.expr()) {
            (Expr::Const { .. }, Expr::Const { .. }) | (Expr::Bool(_), Expr::Bool(_)) => {
                return self.ff()
            }
            (Expr::Bool(b), _) => return if *b { right.clone() } else { self.not(right) },
            (_, Expr::Bool(b)) => return if *b { left.clone() } else { self.not(left) },
            _ => {}
        }
        // ite with constant arms against a constant
        if let (Expr::Ite { cond, then, otherwise }, Some(_)) = (left.expr(), right.as_const()) {
            if then.as_const().is_some() && otherwise.as_const().is_some() {
                let then = self.eq(then, right);
                let otherwise = self.eq(otherwise, right);
                return self.ite(cond, &then, &otherwise);
            }
        }
        let (left, right) = ordered(left, right);
        self.intern(Expr::Eq(left, right))
    }

    pub fn ne(&self, left: &ExprRef, right: &ExprRef) -> ExprRef {
        self.not(&self.eq(left, right))
    }

    pub fn binary(&self, op: BvOp, left: &ExprRef, right: &ExprRef) -> ExprRef {
        debug_assert_eq!(left.sort(), right.sort());
        let width = left.width();
        if let (Some(l), Some(r)) = (left.as_const(), right.as_const()) {
            return self.bv(fold_binary(op, l, r, width), width);
        }

        let commutative = matches!(
            op,
            BvOp::Add | BvOp::Mul | BvOp::And | BvOp::Or | BvOp::Xor
        );
        let (left, right) = if commutative && left.as_const().is_some() {
            (right.clone(), left.clone())
        } else {
            (left.clone(), right.clone())
        };
        let zero = right.as_const() == Some(0);
        let ones = right.as_const() == Some(mask(width));

        match op {
            BvOp::Add | BvOp::Or | BvOp::Xor | BvOp::Shl | BvOp::LShr | BvOp::AShr if zero => {
                return left
            }
            BvOp::Sub if zero => return left,
            BvOp::Sub if left == right => return self.bv(0, width),
            BvOp::Sub => {
                if let Some(r) = right.as_const() {
                    let negated = r.wrapping_neg() & mask(width);
                    return self.binary(BvOp::Add, &left, &self.bv(negated, width));
                }
            }
            BvOp::Mul | BvOp::And if zero => return self.bv(0, width),
            BvOp::Mul | BvOp::UDiv | BvOp::SDiv if right.as_const() == Some(1) => return left,
            BvOp::And if ones => return left,
            BvOp::Or if ones => return right,
            BvOp::And | BvOp::Or if left == right => return left,
            BvOp::Xor if left == right => return self.bv(0, width),
            _ => {}
        }

        // reassociate constant offsets, (x + c1) + c2 = x + (c1 + c2)
        if op == BvOp::Add {
            if let (Expr::Binary { op: BvOp::Add, left: inner, right: c1 }, Some(c2)) =
                (left.expr(), right.as_const())
            {
                if let Some(c1) = c1.as_const() {
                    let sum = self.bv(c1.wrapping_add(c2), width);
                    return self.binary(BvOp::Add, inner, &sum);
                }
            }
        }

        self.intern(Expr::Binary { op, left, right })
    }

    pub fn compare(&self, op: BvCmp, left: &ExprRef, right: &ExprRef) -> ExprRef {
        debug_assert_eq!(left.sort(), right.sort());
        if let (Some(l), Some(r)) = (left.as_const(), right.as_const()) {
            return self.bool(fold_compare(op, l, r, left.width()));
        }
        if left == right {
            return self.bool(matches!(
                op,
                BvCmp::Ule | BvCmp::Uge | BvCmp::Sle | BvCmp::Sge
            ));
        }
        self.intern(Expr::Compare {
            op,
            left: left.clone(),
            right: right.clone(),
        })
    }

    pub fn extract(&self, high: u32, low: u32, value: &ExprRef) -> ExprRef {
        let width = value.width();
        debug_assert!(low <= high && high < width);
        if low == 0 && high + 1 == width {
            return value.clone();
        }
        let result_width = high - low + 1;
        match value.expr() {
            Expr::Const { value: v, .. } => return self.bv(v >> low, result_width),
            Expr::Extract {
                low: inner_low,
                value: inner,
                ..
            } => return self.extract(high + inner_low, low + inner_low, inner),
            Expr::Concat(upper, lower) => {
                let lower_width = lower.width();
                if high < lower_width {
                    return self.extract(high, low, lower);
                }
                if low >= lower_width {
                    return self.extract(high - lower_width, low - lower_width, upper);
                }
            }
            Expr::ZeroExt { value: inner, .. } => {
                let inner_width = inner.width();
                if high < inner_width {
                    return self.extract(high, low, inner);
                }
                if low >= inner_width {
                    return self.bv(0, result_width);
                }
            }
            Expr::SignExt { value: inner, .. } if high < inner.width() => {
                return self.extract(high, low, inner)
            }
            Expr::Ite {
                cond,
                then,
                otherwise,
            } if then.as_const().is_some() || otherwise.as_const().is_some() => {
                let then = self.extract(high, low, then);
                let otherwise = self.extract(high, low, otherwise);
                return self.ite(cond, &then, &otherwise);
            }
            _ => {}
        }
        self.intern(Expr::Extract {
            high,
            low,
            value: value.clone(),
        })
    }

    pub fn concat(&self, upper: &ExprRef, lower: &ExprRef) -> ExprRef {
        let lower_width = lower.width();
        let width = upper.width() + lower_width;
        if let (Some(u), Some(l)) = (upper.as_const(), lower.as_const()) {
            if width <= 128 {
                return self.bv((u << lower_width) | l, width);
            }
        }
        if let (
            Expr::Extract {
                high: h1,
                low: l1,
                value: v1,
            },
            Expr::Extract {
                high: h2,
                low: l2,
                value: v2,
            },
        ) = (upper.expr(), lower.expr())
        {
            if v1 == v2 && *l1 == h2 + 1 {
                return self.extract(*h1, *l2, v1);
            }
        }
        // regroup (a ++ (b ++ c)) so adjacent extracts can merge
        if let Expr::Concat(middle, rest) = lower.expr() {
            if let (Expr::Extract { .. }, Expr::Extract { .. }) = (upper.expr(), middle.expr()) {
                let merged = self.concat(upper, middle);
                if !matches!(merged.expr(), Expr::Concat(..)) {
                    return self.concat(&merged, rest);
                }
            }
        }
        self.intern(Expr::Concat(upper.clone(), lower.clone()))
    }

    pub fn zero_ext(&self, by: u32, value: &ExprRef) -> ExprRef {
        if by == 0 {
            return value.clone();
        }
        if let Some(v) = value.as_const() {
            return self.bv(v, value.width() + by);
        }
        self.intern(Expr::ZeroExt {
            by,
            value: value.clone(),
        })
    }

    pub fn sign_ext(&self, by: u32, value: &ExprRef) -> ExprRef {
        if by == 0 {
            return value.clone();
        }
        if let Some(v) = value.as_const() {
            let signed = to_signed(v, value.width());
            return self.bv(signed as u128, value.width() + by);
        }
        self.intern(Expr::SignExt {
            by,
            value: value.clone(),
        })
    }

    /// Reads one byte, forwarding through stores to provably equal or
    /// provably distinct addresses.
    pub fn select(&self, array: &ExprRef, index: &ExprRef) -> ExprRef {
        let mut current = array.clone();
        loop {
            let next = match current.expr() {
                Expr::Store {
                    array: inner,
                    index: stored,
                    value,
                } => {
                    if stored == index {
                        return value.clone();
                    }
                    if !provably_distinct(stored, index) {
                        break;
                    }
                    inner.clone()
                }
                Expr::Ite {
                    cond,
                    then,
                    otherwise,
                } => {
                    let then = self.select(then, index);
                    let otherwise = self.select(otherwise, index);
                    return self.ite(cond, &then, &otherwise);
                }
                _ => break,
            };
            current = next;
        }
        self.intern(Expr::Select {
            array: current,
            index: index.clone(),
        })
    }

    pub fn store(&self, array: &ExprRef, index: &ExprRef, value: &ExprRef) -> ExprRef {
        let base = match array.expr() {
            Expr::Store {
                array: inner,
                index: stored,
                ..
            } if stored == index => inner.clone(),
            _ => array.clone(),
        };
        self.intern(Expr::Store {
            array: base,
            index: index.clone(),
            value: value.clone(),
        })
    }

    pub fn apply(&self, function: &str, args: &[ExprRef], sort: Sort) -> ExprRef {
        self.intern(Expr::Apply {
            function: function.to_string(),
            args: args.to_vec(),
            sort,
        })
    }

    pub fn bool_to_bv(&self, value: &ExprRef) -> ExprRef {
        if value.sort() != Sort::Bool {
            return value.clone();
        }
        self.ite(value, &self.bv(1, 1), &self.bv(0, 1))
    }

    pub fn bv_to_bool(&self, value: &ExprRef) -> ExprRef {
        if value.sort() == Sort::Bool {
            return value.clone();
        }
        self.eq(value, &self.bv(1, 1))
    }

    //
    // Private Implementation
    //

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Expr, ExprRef>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn intern(&self, expr: Expr) -> ExprRef {
        let mut table = self.lock();
        if let Some(existing) = table.get(&expr) {
            return existing.clone();
        }
        let sort = sort_of(&expr);
        let node = ExprRef(Arc::new(Node {
            expr: expr.clone(),
            sort,
        }));
        table.insert(expr, node.clone());
        node
    }

    /// Flattens nested connectives and drops neutral elements. Returns
    /// `None` when an absorbing element makes the result constant.
    fn flatten(&self, items: &[ExprRef], conjunction: bool) -> Option<Vec<ExprRef>> {
        let mut result: Vec<ExprRef> = Vec::with_capacity(items.len());
        let mut stack: Vec<&ExprRef> = items.iter().rev().collect();
        while let Some(item) = stack.pop() {
            match (item.expr(), conjunction) {
                (Expr::Bool(b), _) if *b == conjunction => continue,
                (Expr::Bool(_), _) => return None,
                (Expr::And(inner), true) | (Expr::Or(inner), false) => {
                    stack.extend(inner.iter().rev());
                    continue;
                }
                _ => {}
            }
            if !result.contains(item) {
                result.push(item.clone());
            }
        }
        // x and (not x)
        let complementary = result.iter().any(|item| match item.expr() {
            Expr::Not(inner) => result.contains(inner),
            _ => false,
        });
        if complementary {
            return None;
        }
        Some(result)
    }

    fn connective(&self, mut items: Vec<ExprRef>, conjunction: bool) -> ExprRef {
        match items.len() {
            0 => self.bool(conjunction),
            1 => items.remove(0),
            _ if conjunction => self.intern(Expr::And(items)),
            _ => self.intern(Expr::Or(items)),
        }
    }
}

/// Splits an address into a symbolic base and a constant offset.
pub fn split_offset(address: &ExprRef) -> (Option<&ExprRef>, u128) {
    match address.expr() {
        Expr::Const { value, .. } => (None, *value),
        Expr::Binary {
            op: BvOp::Add,
            left,
            right,
        } => match right.as_const() {
            Some(offset) => (Some(left), offset),
            None => (Some(address), 0),
        },
        _ => (Some(address), 0),
    }
}

//
// Private Implementation
//

fn provably_distinct(a: &ExprRef, b: &ExprRef) -> bool {
    let (base_a, offset_a) = split_offset(a);
    let (base_b, offset_b) = split_offset(b);
    base_a == base_b && offset_a != offset_b
}

/// Canonical operand order for symmetric terms: constants to the right.
fn ordered(left: &ExprRef, right: &ExprRef) -> (ExprRef, ExprRef) {
    if left.is_atom() && !right.is_atom() {
        (right.clone(), left.clone())
    } else {
        (left.clone(), right.clone())
    }
}

fn sort_of(expr: &Expr) -> Sort {
    match expr {
        Expr::Bool(_)
        | Expr::Not(_)
        | Expr::And(_)
        | Expr::Or(_)
        | Expr::Eq(..)
        | Expr::Compare { .. } => Sort::Bool,
        Expr::Const { width, .. } => Sort::BitVec(*width),
        Expr::Var { sort, .. } | Expr::Apply { sort, .. } => *sort,
        Expr::Ite { then, .. } => then.sort(),
        Expr::Binary { left, .. } => left.sort(),
        Expr::Extract { high, low, .. } => Sort::BitVec(high - low + 1),
        Expr::Concat(upper, lower) => Sort::BitVec(upper.width() + lower.width()),
        Expr::ZeroExt { by, value } | Expr::SignExt { by, value } => {
            Sort::BitVec(value.width() + by)
        }
        Expr::Select { .. } => Sort::BitVec(8),
        Expr::Store { .. } => Sort::Memory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structurally_equal_terms_are_shared() {
        let pool = ExprPool::new();
        let x = pool.var("x", Sort::BitVec(32));
        let a = pool.binary(BvOp::Add, &x, &pool.bv(1, 32));
        let b = pool.binary(BvOp::Add, &pool.bv(1, 32), &x);
        assert_eq!(a, b);
        assert_eq!(pool.var("x", Sort::BitVec(32)), x);
    }

    #[test]
    fn eight_bit_addition_wraps() {
        let pool = ExprPool::new();
        let sum = pool.binary(BvOp::Add, &pool.bv(200, 8), &pool.bv(100, 8));
        assert_eq!(sum.as_const(), Some(44));
    }

    #[test]
    fn contradiction_folds_to_false() {
        let pool = ExprPool::new();
        let x = pool.var("x", Sort::BitVec(32));
        let positive = pool.compare(BvCmp::Sgt, &x, &pool.bv(0, 32));
        let both = pool.and(&[positive.clone(), pool.not(&positive)]);
        assert!(both.is_false());
        let either = pool.or(&[positive.clone(), pool.not(&positive)]);
        assert!(either.is_true());
    }

    #[test]
    fn store_then_load_forwards_value() {
        let pool = ExprPool::new();
        let memory = pool.var("mem", Sort::Memory);
        let base = pool.var("p", Sort::BitVec(ADDRESS_BITS));
        let value = pool.var("v", Sort::BitVec(16));

        let mut written = memory.clone();
        for i in 0..2 {
            let address = pool.binary(BvOp::Add, &base, &pool.bv(i, ADDRESS_BITS));
            let byte = pool.extract(8 * i as u32 + 7, 8 * i as u32, &value);
            written = pool.store(&written, &address, &byte);
        }

        let mut loaded = pool.select(&written, &base);
        let address = pool.binary(BvOp::Add, &base, &pool.bv(1, ADDRESS_BITS));
        loaded = pool.concat(&pool.select(&written, &address), &loaded);
        assert_eq!(loaded, value);
    }

    #[test]
    fn select_through_unrelated_base_stays_symbolic() {
        let pool = ExprPool::new();
        let memory = pool.var("mem", Sort::Memory);
        let p = pool.var("p", Sort::BitVec(ADDRESS_BITS));
        let q = pool.var("q", Sort::BitVec(ADDRESS_BITS));
        let written = pool.store(&memory, &p, &pool.bv(7, 8));
        let read = pool.select(&written, &q);
        assert!(matches!(read.expr(), Expr::Select { .. }));
        assert_eq!(pool.select(&written, &p).as_const(), Some(7));
    }

    #[test]
    fn nested_offsets_reassociate() {
        let pool = ExprPool::new();
        let p = pool.var("p", Sort::BitVec(ADDRESS_BITS));
        let four = pool.binary(BvOp::Add, &p, &pool.bv(4, ADDRESS_BITS));
        let six = pool.binary(BvOp::Add, &four, &pool.bv(2, ADDRESS_BITS));
        assert_eq!(split_offset(&six), (Some(&p), 6));
        let back = pool.binary(BvOp::Sub, &six, &pool.bv(6, ADDRESS_BITS));
        assert_eq!(back, p);
    }
}
