//! Flat byte-addressed memory with tracked allocations.
//!
//! Memory is one array from 64-bit addresses to bytes; every store yields a
//! new array term and loads read the version live on the current path.
//! Multi-byte values are little-endian. Each allocation site gets a fresh
//! symbolic base address. Whenever the site executes, the base is assumed
//! non-null, non-wrapping and disjoint from every allocation that executes
//! on the same path.

use crate::ir::{Initializer, Module, Type};
use crate::smt::{BvCmp, BvOp, Expr, ExprPool, ExprRef, Sort, ADDRESS_BITS};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;

//
// Public Interface
//

/// Largest constant length expanded into byte-wise updates.
pub const MAX_EXPANDED_BYTES: u64 = 4096;

#[derive(Clone, Debug)]
pub struct Allocation {
    pub name: String,
    pub base: ExprRef,
    pub size: ExprRef,
    /// Path condition of the allocation site.
    pub guard: ExprRef,
}

#[derive(Default)]
pub struct MemoryModel {
    allocations: Vec<Allocation>,
    by_base: HashMap<ExprRef, usize>,
}

/// Initial contents of an object, as bytes relative to its base.
pub type InitialBytes = Vec<(u64, ExprRef)>;

impl MemoryModel {
    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    /// Registers a new object of `size` bytes, allocated whenever `guard`
    /// holds, and returns its base address together with the facts assumed
    /// about it. Every fact is conditional on the allocations it mentions
    /// having executed.
    pub fn allocate(
        &mut self,
        pool: &ExprPool,
        name: &str,
        size: ExprRef,
        guard: &ExprRef,
    ) -> (ExprRef, Vec<ExprRef>) {
        let base = pool.var(name, Sort::BitVec(ADDRESS_BITS));
        let end = pool.binary(BvOp::Add, &base, &size);

        let mut facts = vec![
            pool.implies(guard, &pool.ne(&base, &address_of(pool, 0))),
            pool.implies(guard, &pool.compare(BvCmp::Ule, &base, &end)),
        ];
        for other in &self.allocations {
            let both = pool.and2(guard, &other.guard);
            if both.is_false() {
                continue;
            }
            let other_end = pool.binary(BvOp::Add, &other.base, &other.size);
            facts.push(pool.implies(
                &both,
                &pool.or2(
                    &pool.compare(BvCmp::Ule, &end, &other.base),
                    &pool.compare(BvCmp::Ule, &other_end, &base),
                ),
            ));
        }

        self.by_base.insert(base.clone(), self.allocations.len());
        self.allocations.push(Allocation {
            name: name.to_string(),
            base: base.clone(),
            size,
            guard: guard.clone(),
        });
        (base, facts)
    }

    /// Condition under which `bytes` bytes at `address` stay inside the
    /// allocation the address is derived from. `None` when the address has
    /// no known provenance.
    pub fn in_bounds(&self, pool: &ExprPool, address: &ExprRef, bytes: u64) -> Option<ExprRef> {
        match address.expr() {
            Expr::Ite {
                cond,
                then,
                otherwise,
            } => {
                let then = self.in_bounds(pool, then, bytes)?;
                let otherwise = self.in_bounds(pool, otherwise, bytes)?;
                Some(pool.ite(cond, &then, &otherwise))
            }
            Expr::Const { value: 0, .. } => Some(pool.ff()),
            _ => {
                let (allocation, offset) = self.provenance(pool, address)?;
                let size = &allocation.size;
                let length = address_of(pool, bytes);
                let room = pool.binary(BvOp::Sub, size, &length);
                Some(pool.and2(
                    &pool.compare(BvCmp::Ule, &length, size),
                    &pool.compare(BvCmp::Ule, &offset, &room),
                ))
            }
        }
    }

    //
    // Private Implementation
    //

    /// Splits an address of the form `base + o1 + o2 + ...` into its
    /// allocation and the summed offset.
    fn provenance(&self, pool: &ExprPool, address: &ExprRef) -> Option<(&Allocation, ExprRef)> {
        let mut leaves = Vec::new();
        let mut stack = vec![address.clone()];
        while let Some(term) = stack.pop() {
            match term.expr() {
                Expr::Binary {
                    op: BvOp::Add,
                    left,
                    right,
                } => {
                    stack.push(right.clone());
                    stack.push(left.clone());
                }
                _ => leaves.push(term),
            }
        }

        let mut found: Option<usize> = None;
        let mut offset = address_of(pool, 0);
        for leaf in leaves {
            match self.by_base.get(&leaf) {
                Some(&index) if found.is_none() => found = Some(index),
                Some(_) => return None,
                None => offset = pool.binary(BvOp::Add, &offset, &leaf),
            }
        }
        found.map(|index| (&self.allocations[index], offset))
    }
}

pub fn address_of(pool: &ExprPool, value: u64) -> ExprRef {
    pool.bv(value as u128, ADDRESS_BITS)
}

/// Address `offset` bytes past `base`.
pub fn offset(pool: &ExprPool, base: &ExprRef, offset: u64) -> ExprRef {
    pool.binary(BvOp::Add, base, &address_of(pool, offset))
}

/// Reads `bytes` bytes at `address` as a value of `sort`.
pub fn load(pool: &ExprPool, memory: &ExprRef, address: &ExprRef, bytes: u64, sort: Sort) -> ExprRef {
    let mut value = pool.select(memory, address);
    for i in 1..bytes {
        let byte = pool.select(memory, &offset(pool, address, i));
        value = pool.concat(&byte, &value);
    }
    match sort {
        Sort::Bool => pool.bv_to_bool(&pool.extract(0, 0, &value)),
        Sort::BitVec(width) if width < value.width() => pool.extract(width - 1, 0, &value),
        _ => value,
    }
}

/// Writes `value` as `bytes` bytes at `address`, returning the new memory.
pub fn store(pool: &ExprPool, memory: &ExprRef, address: &ExprRef, value: &ExprRef, bytes: u64) -> ExprRef {
    let mut value = pool.bool_to_bv(value);
    let bits = (bytes * 8) as u32;
    if value.width() < bits {
        value = pool.zero_ext(bits - value.width(), &value);
    }
    let mut memory = memory.clone();
    for i in 0..bytes {
        let low = (i * 8) as u32;
        let byte = pool.extract(low + 7, low, &value);
        memory = pool.store(&memory, &offset(pool, address, i), &byte);
    }
    memory
}

pub fn fill(pool: &ExprPool, memory: &ExprRef, address: &ExprRef, byte: &ExprRef, length: u64) -> ExprRef {
    (0..length).fold(memory.clone(), |memory, i| {
        pool.store(&memory, &offset(pool, address, i), byte)
    })
}

/// Copies `length` bytes, reading all of the source before writing so that
/// overlapping ranges behave like `memmove`.
pub fn copy(pool: &ExprPool, memory: &ExprRef, target: &ExprRef, source: &ExprRef, length: u64) -> ExprRef {
    let bytes: Vec<ExprRef> = (0..length)
        .map(|i| pool.select(memory, &offset(pool, source, i)))
        .collect();
    bytes
        .iter()
        .enumerate()
        .fold(memory.clone(), |memory, (i, byte)| {
            pool.store(&memory, &offset(pool, target, i as u64), byte)
        })
}

/// Lays out a global initializer. Symbols resolve to base addresses
/// through `symbol`; unknown contents yield `None` for that range.
pub fn initial_bytes<F>(
    pool: &ExprPool,
    module: &Module,
    ty: &Type,
    init: &Initializer,
    symbol: &mut F,
) -> Option<InitialBytes>
where
    F: FnMut(&str) -> Option<ExprRef>,
{
    let mut bytes = InitialBytes::new();
    lay_out(pool, module, ty, init, 0, symbol, &mut bytes)?;
    Some(bytes)
}

pub fn apply_initial_bytes(pool: &ExprPool, memory: &ExprRef, base: &ExprRef, bytes: &[(u64, ExprRef)]) -> ExprRef {
    bytes.iter().fold(memory.clone(), |memory, (at, byte)| {
        pool.store(&memory, &offset(pool, base, *at), byte)
    })
}

//
// Private Implementation
//

fn lay_out<F>(
    pool: &ExprPool,
    module: &Module,
    ty: &Type,
    init: &Initializer,
    at: u64,
    symbol: &mut F,
    out: &mut InitialBytes,
) -> Option<()>
where
    F: FnMut(&str) -> Option<ExprRef>,
{
    match init {
        Initializer::Zero => {
            let size = module.size_of(ty)?;
            out.extend((0..size).map(|i| (at + i, pool.bv(0, 8))));
        }
        Initializer::Int(value) => {
            let size = module.store_size_of(ty)?.min(16) as usize;
            let mut buffer = [0u8; 16];
            LittleEndian::write_u128(&mut buffer, *value as u128);
            out.extend(
                buffer[..size]
                    .iter()
                    .enumerate()
                    .map(|(i, b)| (at + i as u64, pool.bv(*b as u128, 8))),
            );
        }
        Initializer::Null => {
            out.extend((0..8).map(|i| (at + i, pool.bv(0, 8))));
        }
        Initializer::Bytes(data) => {
            out.extend(
                data.iter()
                    .enumerate()
                    .map(|(i, b)| (at + i as u64, pool.bv(*b as u128, 8))),
            );
        }
        Initializer::Symbol(name) => {
            let base = symbol(name)?;
            for i in 0..8u32 {
                out.push((at + i as u64, pool.extract(8 * i + 7, 8 * i, &base)));
            }
        }
        Initializer::Aggregate(elements) => {
            let resolved = module.resolve(ty).clone();
            for (index, (element_ty, element)) in elements.iter().enumerate() {
                let position = match &resolved {
                    Type::Struct(_) => module.field_offset(&resolved, index)?,
                    Type::Array(_, inner) => index as u64 * module.size_of(inner)?,
                    _ => return None,
                };
                lay_out(pool, module, element_ty, element, at + position, symbol, out)?;
            }
        }
        Initializer::Opaque => return None,
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::eval::{Model, Value};

    #[test]
    fn loads_reassemble_little_endian_stores() {
        let pool = ExprPool::new();
        let memory = pool.var("m", Sort::Memory);
        let p = pool.var("p", Sort::BitVec(ADDRESS_BITS));
        let v = pool.var("v", Sort::BitVec(32));

        let written = store(&pool, &memory, &p, &v, 4);
        assert_eq!(load(&pool, &written, &p, 4, Sort::BitVec(32)), v);

        let low = load(&pool, &written, &p, 2, Sort::BitVec(16));
        assert_eq!(low, pool.extract(15, 0, &v));
    }

    #[test]
    fn booleans_occupy_one_byte() {
        let pool = ExprPool::new();
        let memory = pool.var("m", Sort::Memory);
        let p = pool.var("p", Sort::BitVec(ADDRESS_BITS));
        let flag = pool.var("c", Sort::Bool);
        let written = store(&pool, &memory, &p, &flag, 1);
        assert_eq!(load(&pool, &written, &p, 1, Sort::Bool), flag);
    }

    #[test]
    fn bounds_follow_allocation_provenance() {
        let pool = ExprPool::new();
        let mut model = MemoryModel::default();
        let (a, facts) = model.allocate(&pool, "a", address_of(&pool, 8), &pool.tt());
        assert_eq!(facts.len(), 2);
        let (_, facts) = model.allocate(&pool, "b", address_of(&pool, 4), &pool.tt());
        assert_eq!(facts.len(), 3);

        assert!(model.in_bounds(&pool, &a, 8).unwrap().is_true());
        assert!(model.in_bounds(&pool, &offset(&pool, &a, 4), 4).unwrap().is_true());
        assert!(model.in_bounds(&pool, &offset(&pool, &a, 6), 4).unwrap().is_false());
        assert!(model.in_bounds(&pool, &address_of(&pool, 0), 1).unwrap().is_false());

        let unknown = pool.var("q", Sort::BitVec(ADDRESS_BITS));
        assert!(model.in_bounds(&pool, &unknown, 1).is_none());
    }

    #[test]
    fn allocation_facts_hold_only_where_the_site_executes() {
        let pool = ExprPool::new();
        let mut model = MemoryModel::default();
        let c = pool.var("c", Sort::Bool);
        let n = pool.var("n", Sort::BitVec(ADDRESS_BITS));
        let (a, facts) = model.allocate(&pool, "a", n, &c);

        // a null base wrapping around the address space, on a path that skips the site
        let mut skipped = Model::default();
        skipped.values.insert("c".to_string(), Value::Bool(false));
        skipped.values.insert("a".to_string(), Value::BitVec { value: 0, width: ADDRESS_BITS });
        skipped.values.insert(
            "n".to_string(),
            Value::BitVec {
                value: u64::MAX as u128,
                width: ADDRESS_BITS,
            },
        );
        for fact in &facts {
            assert_eq!(skipped.eval(fact), Value::Bool(true));
        }

        let mut taken = skipped.clone();
        taken.values.insert("c".to_string(), Value::Bool(true));
        assert!(facts.iter().any(|fact| taken.eval(fact) == Value::Bool(false)));

        // sites on exclusive paths need not be disjoint
        let (_, facts) = model.allocate(&pool, "b", address_of(&pool, 4), &pool.not(&c));
        assert_eq!(facts.len(), 2);
        assert!(model.in_bounds(&pool, &a, 1).is_some());
    }

    #[test]
    fn initializers_lay_out_struct_fields() {
        let pool = ExprPool::new();
        let mut module = Module::default();
        let pair = Type::Struct(vec![Type::Int(8), Type::Int(32)]);
        module.types.insert("pair".to_string(), pair);
        let init = Initializer::Aggregate(vec![
            (Type::Int(8), Initializer::Int(1)),
            (Type::Int(32), Initializer::Int(-1)),
        ]);
        let bytes = initial_bytes(
            &pool,
            &module,
            &Type::Named("pair".to_string()),
            &init,
            &mut |_| None,
        )
        .unwrap();
        let offsets: Vec<u64> = bytes.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![0, 4, 5, 6, 7]);
        assert_eq!(bytes[1].1.as_const(), Some(0xff));
    }
}
