use super::memory::{self, address_of, MAX_EXPANDED_BYTES};
use super::{Encoder, Env, Point};
use crate::config::CallEffect;
use crate::error::{Error, Location, Result};
use crate::formula::{AssertionKind, FunctionDecl, Goal};
use crate::ir::{
    BinaryOp, CastOp, ConstExpr, Function, Initializer, Instruction, InstructionKind, IntPredicate,
    Operand, Type, TypedOperand,
};
use crate::smt::{BvCmp, BvOp, ExprRef, Sort, ADDRESS_BITS};
use log::{debug, trace, warn};
use std::collections::BTreeSet;

/// Intrinsics without an effect on values or memory.
const IGNORED_INTRINSICS: &[&str] = &[
    "llvm.dbg.",
    "llvm.lifetime.",
    "llvm.experimental.noalias.scope.decl",
    "llvm.var.annotation",
    "llvm.donothing",
    "llvm.sideeffect",
];

/// Calls that mark their block as an error block.
const ERROR_FUNCTIONS: &[&str] = &["__assert_fail", "__VERIFIER_error", "reach_error"];

impl<'a> Encoder<'a> {
    /// Gives every global and function the body refers to an address and
    /// lays out the initializers that are known to hold on entry.
    pub(super) fn allocate_globals(&mut self, memory: ExprRef) -> Result<ExprRef> {
        let module = self.module;
        let mut referenced = BTreeSet::new();
        for block in &self.function.blocks {
            for instruction in &block.instructions {
                for operand in instruction.kind.operands() {
                    collect_symbols(operand, &mut referenced);
                }
                if let InstructionKind::Alloca { count: Some(count), .. } = &instruction.kind {
                    collect_symbols(&count.operand, &mut referenced);
                }
            }
            if let Some(operand) = block.terminator.operand() {
                collect_symbols(operand, &mut referenced);
            }
        }
        // pointers stored in initializers need addresses as well
        let mut pending: Vec<String> = referenced.iter().cloned().collect();
        while let Some(name) = pending.pop() {
            if let Some(init) = module.global(&name).and_then(|g| g.init.as_ref()) {
                let mut nested = BTreeSet::new();
                initializer_symbols(init, &mut nested);
                for symbol in nested {
                    if referenced.insert(symbol.clone()) {
                        pending.push(symbol);
                    }
                }
            }
        }

        for name in &referenced {
            let size = match (module.global(name), module.function(name)) {
                (Some(global), _) => module.size_of(&global.ty).unwrap_or(1).max(1),
                (None, Some(_)) => 1,
                (None, None) => {
                    warn!("@{} refers to unknown symbol @{}", self.function.name, name);
                    1
                }
            };
            let (base, facts) = self.memory.allocate(
                self.pool,
                &format!("{}.@{}", self.function.name, name),
                address_of(self.pool, size),
                &self.pool.tt(),
            );
            self.formula.inputs.push(base.clone());
            for fact in facts {
                self.assume(fact, format!("address of @{}", name));
            }
            self.globals.insert(name.clone(), base);
        }

        let entry_point = self.function.name == "main";
        let mut memory = memory;
        for name in &referenced {
            let global = match module.global(name) {
                Some(global) if global.constant || entry_point => global,
                _ => continue,
            };
            let init = match &global.init {
                Some(init) => init,
                None => continue,
            };
            let globals = &self.globals;
            let bytes = memory::initial_bytes(self.pool, module, &global.ty, init, &mut |s| {
                globals.get(s).cloned()
            });
            match bytes {
                Some(bytes) if bytes.len() as u64 <= MAX_EXPANDED_BYTES => {
                    memory = memory::apply_initial_bytes(self.pool, &memory, &self.globals[name], &bytes);
                }
                Some(bytes) => debug!("initializer of @{} spans {} bytes, left unconstrained", name, bytes.len()),
                None => trace!("initializer of @{} is not modelled", name),
            }
        }
        Ok(self.define(
            format!("{}.mem!0", self.function.name),
            memory,
            "initial memory".to_string(),
        ))
    }

    /// Term of an operand read as a value of type `ty`.
    pub(super) fn value(&mut self, env: &Env, operand: &Operand, ty: &Type, at: &Location) -> Result<ExprRef> {
        let sort = self.sort_of(ty, at)?;
        let term = match operand {
            Operand::Local(name) => env
                .values
                .get(name)
                .cloned()
                .ok_or_else(|| Error::ssa(format!("use of undefined value %{}", name), at.clone()))?,
            Operand::Global(name) => self.global_address(name, at)?,
            Operand::Int(value) => match sort {
                Sort::Bool => self.pool.bool(*value & 1 != 0),
                _ => self.pool.bv(*value as u128, sort.width().unwrap_or(ADDRESS_BITS)),
            },
            Operand::Null => match sort {
                Sort::Bool => self.pool.ff(),
                _ => self.pool.bv(0, sort.width().unwrap_or(ADDRESS_BITS)),
            },
            Operand::Undef => self.fresh_var("undef", sort),
            Operand::ConstExpr(expr) => match expr.as_ref() {
                ConstExpr::Gep { source, base, indices } => self.gep(env, source, &base.operand, indices, at)?,
                ConstExpr::Cast { op, value, to } => self.cast(env, *op, value, to, at)?,
            },
        };
        if term.sort() != sort {
            return Err(Error::type_error(
                format!("{} has sort {:?} but {} was expected", operand, term.sort(), ty),
                at.clone(),
            ));
        }
        Ok(term)
    }

    /// Translates one non-phi instruction, binding its result in `env`.
    pub(super) fn translate(
        &mut self,
        env: &mut Env,
        point: &Point,
        index: usize,
        instruction: &Instruction,
    ) -> Result<()> {
        let at = self.location(point, index, instruction.line);
        let pool = self.pool;

        #[rustfmt::skip]
        let (term, opcode) = match &instruction.kind {
            InstructionKind::Binary { op, ty, left, right } => {
                (Some(self.binary(env, *op, ty, left, right, &at)?), opcode_name(op))
            }
            InstructionKind::ICmp { predicate, ty, left, right } => {
                (Some(self.icmp(env, *predicate, ty, left, right, &at)?), "icmp".to_string())
            }
            InstructionKind::Select { cond, ty, then, otherwise } => {
                let c = self.value(env, cond, &Type::Int(1), &at)?;
                let t = self.value(env, then, ty, &at)?;
                let o = self.value(env, otherwise, ty, &at)?;
                (Some(pool.ite(&c, &t, &o)), "select".to_string())
            }
            InstructionKind::Cast { op, value, to } => {
                (Some(self.cast(env, *op, value, to, &at)?), opcode_name(op))
            }
            InstructionKind::Freeze { value } => {
                let term = match value.operand {
                    Operand::Undef => {
                        let sort = self.sort_of(&value.ty, &at)?;
                        self.fresh_var("freeze", sort)
                    }
                    _ => self.value(env, &value.operand, &value.ty, &at)?,
                };
                (Some(term), "freeze".to_string())
            }
            InstructionKind::Alloca { ty, count } => {
                let base = self.alloca(env, point, instruction.result.as_deref(), ty, count.as_ref(), &at)?;
                (Some(base), "alloca".to_string())
            }
            InstructionKind::Load { ty, address } => {
                let sort = self.sort_of(ty, &at)?;
                let bytes = self.store_size(ty, &at)?;
                let address = self.value(env, address, &Type::Ptr, &at)?;
                self.check_access(point, &address, bytes, &at, "load");
                (Some(memory::load(pool, &env.memory, &address, bytes, sort)), "load".to_string())
            }
            InstructionKind::Store { value, address } => {
                let bytes = self.store_size(&value.ty, &at)?;
                let term = self.value(env, &value.operand, &value.ty, &at)?;
                let address = self.value(env, address, &Type::Ptr, &at)?;
                self.check_access(point, &address, bytes, &at, "store");
                let updated = memory::store(pool, &env.memory, &address, &term, bytes);
                env.memory = self.memory_version(updated, format!("store (line {})", instruction.line));
                (None, "store".to_string())
            }
            InstructionKind::Gep { source, base, indices } => {
                (Some(self.gep(env, source, base, indices, &at)?), "getelementptr".to_string())
            }
            InstructionKind::Call { callee, ret, args } => {
                let term = self.call(env, point, instruction, callee, ret, args, &at)?;
                (term, format!("call @{}", callee))
            }
            InstructionKind::Phi { .. } => {
                return Err(Error::invariant("phi after the head of its block", at));
            }
            InstructionKind::Unsupported { construct } => {
                return Err(Error::unsupported(construct.clone(), at));
            }
        };

        match (&instruction.result, term) {
            (Some(result), Some(term)) => {
                self.assign(env, point, result, term, &opcode, instruction.line);
                Ok(())
            }
            (Some(result), None) => Err(Error::type_error(
                format!("%{} is bound to an instruction without a value", result),
                at,
            )),
            (None, _) => Ok(()),
        }
    }

    //
    // Private Implementation
    //

    fn global_address(&self, name: &str, at: &Location) -> Result<ExprRef> {
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| Error::invariant(format!("@{} has no address", name), at.clone()))
    }

    fn store_size(&self, ty: &Type, at: &Location) -> Result<u64> {
        match self.module.resolve(ty) {
            Type::Int(_) | Type::Ptr => self
                .module
                .store_size_of(ty)
                .ok_or_else(|| Error::invariant(format!("no size for {}", ty), at.clone())),
            other => Err(Error::unsupported(format!("memory access of type {}", other), at.clone())),
        }
    }

    fn binary(
        &mut self,
        env: &Env,
        op: BinaryOp,
        ty: &Type,
        left: &Operand,
        right: &Operand,
        at: &Location,
    ) -> Result<ExprRef> {
        let pool = self.pool;
        let l = self.value(env, left, ty, at)?;
        let r = self.value(env, right, ty, at)?;
        if l.sort() != Sort::Bool {
            return Ok(pool.binary(bv_op(op), &l, &r));
        }
        Ok(match op {
            BinaryOp::And => pool.and2(&l, &r),
            BinaryOp::Or => pool.or2(&l, &r),
            BinaryOp::Xor => pool.ne(&l, &r),
            _ => {
                let bits = pool.binary(bv_op(op), &pool.bool_to_bv(&l), &pool.bool_to_bv(&r));
                pool.bv_to_bool(&bits)
            }
        })
    }

    fn icmp(
        &mut self,
        env: &Env,
        predicate: IntPredicate,
        ty: &Type,
        left: &Operand,
        right: &Operand,
        at: &Location,
    ) -> Result<ExprRef> {
        let pool = self.pool;
        let l = self.value(env, left, ty, at)?;
        let r = self.value(env, right, ty, at)?;
        #[rustfmt::skip]
        let op = match predicate {
            IntPredicate::Eq => return Ok(pool.eq(&l, &r)),
            IntPredicate::Ne => return Ok(pool.ne(&l, &r)),
            IntPredicate::Ugt => BvCmp::Ugt, IntPredicate::Uge => BvCmp::Uge,
            IntPredicate::Ult => BvCmp::Ult, IntPredicate::Ule => BvCmp::Ule,
            IntPredicate::Sgt => BvCmp::Sgt, IntPredicate::Sge => BvCmp::Sge,
            IntPredicate::Slt => BvCmp::Slt, IntPredicate::Sle => BvCmp::Sle,
        };
        Ok(pool.compare(op, &pool.bool_to_bv(&l), &pool.bool_to_bv(&r)))
    }

    fn cast(&mut self, env: &Env, op: CastOp, value: &TypedOperand, to: &Type, at: &Location) -> Result<ExprRef> {
        let term = self.value(env, &value.operand, &value.ty, at)?;
        let target = self.sort_of(to, at)?;
        let from_width = term.width();
        let to_width = target.width().unwrap_or(1);

        let valid = match op {
            CastOp::Trunc => to_width < from_width,
            CastOp::ZExt | CastOp::SExt => to_width > from_width,
            CastOp::BitCast => to_width == from_width,
            CastOp::PtrToInt => self.module.resolve(&value.ty).is_pointer(),
            CastOp::IntToPtr => target == Sort::BitVec(ADDRESS_BITS),
        };
        if !valid {
            return Err(Error::type_error(
                format!("{} from {} to {}", opcode_name(&op), value.ty, to),
                at.clone(),
            ));
        }
        Ok(self.resize(&term, target, op == CastOp::SExt))
    }

    /// Converts between booleans and bit-vectors of any width.
    fn resize(&self, term: &ExprRef, target: Sort, signed: bool) -> ExprRef {
        let pool = self.pool;
        if term.sort() == target {
            return term.clone();
        }
        let bits = pool.bool_to_bv(term);
        let width = target.width().unwrap_or(1);
        let resized = if bits.width() > width {
            pool.extract(width - 1, 0, &bits)
        } else if bits.width() < width && signed {
            pool.sign_ext(width - bits.width(), &bits)
        } else if bits.width() < width {
            pool.zero_ext(width - bits.width(), &bits)
        } else {
            bits
        };
        match target {
            Sort::Bool => pool.bv_to_bool(&resized),
            _ => resized,
        }
    }

    fn gep(
        &mut self,
        env: &Env,
        source: &Type,
        base: &Operand,
        indices: &[TypedOperand],
        at: &Location,
    ) -> Result<ExprRef> {
        let pool = self.pool;
        let module = self.module;
        let mut address = self.value(env, base, &Type::Ptr, at)?;
        let mut current = source.clone();

        for (position, index) in indices.iter().enumerate() {
            if position == 0 {
                let stride = self.size_of(source, at)?;
                let step = self.scaled(env, index, stride, at)?;
                address = pool.binary(BvOp::Add, &address, &step);
                continue;
            }
            match module.resolve(&current).clone() {
                Type::Struct(fields) => {
                    let field = match index.operand {
                        Operand::Int(field) if field >= 0 && (field as usize) < fields.len() => field as usize,
                        _ => {
                            return Err(Error::type_error(
                                format!("struct field index {} is not a valid constant", index.operand),
                                at.clone(),
                            ))
                        }
                    };
                    let offset = module
                        .field_offset(&current, field)
                        .ok_or_else(|| Error::unsupported(format!("field of {}", current), at.clone()))?;
                    address = memory::offset(pool, &address, offset);
                    current = fields[field].clone();
                }
                Type::Array(_, element) => {
                    let element = *element;
                    let stride = self.size_of(&element, at)?;
                    let step = self.scaled(env, index, stride, at)?;
                    address = pool.binary(BvOp::Add, &address, &step);
                    current = element;
                }
                other => {
                    return Err(Error::unsupported(format!("getelementptr into {}", other), at.clone()));
                }
            }
        }
        Ok(address)
    }

    fn size_of(&self, ty: &Type, at: &Location) -> Result<u64> {
        self.module
            .size_of(ty)
            .ok_or_else(|| Error::unsupported(format!("size of type {}", ty), at.clone()))
    }

    /// Index term sign-extended to addresses and multiplied by `stride`.
    fn scaled(&mut self, env: &Env, index: &TypedOperand, stride: u64, at: &Location) -> Result<ExprRef> {
        let term = self.value(env, &index.operand, &index.ty, at)?;
        let term = self.resize(&term, Sort::BitVec(ADDRESS_BITS), true);
        Ok(self.pool.binary(BvOp::Mul, &term, &address_of(self.pool, stride)))
    }

    fn alloca(
        &mut self,
        env: &Env,
        point: &Point,
        result: Option<&str>,
        ty: &Type,
        count: Option<&TypedOperand>,
        at: &Location,
    ) -> Result<ExprRef> {
        let size = address_of(self.pool, self.size_of(ty, at)?);
        let size = match count {
            Some(count) => {
                let n = self.value(env, &count.operand, &count.ty, at)?;
                let n = self.resize(&n, Sort::BitVec(ADDRESS_BITS), false);
                self.pool.binary(BvOp::Mul, &size, &n)
            }
            None => size,
        };
        let name = match result {
            Some(result) => format!("{}.%{}.base{}", self.function.name, result, point.suffix),
            None => {
                self.fresh += 1;
                format!("{}.alloca.{}", self.function.name, self.fresh)
            }
        };
        Ok(self.allocation(&name, size, &point.pc))
    }

    fn allocation(&mut self, name: &str, size: ExprRef, pc: &ExprRef) -> ExprRef {
        let (base, facts) = self.memory.allocate(self.pool, name, size, pc);
        self.formula.inputs.push(base.clone());
        for fact in facts {
            self.assume(fact, format!("allocation {}", name));
        }
        base
    }

    /// Records the bounds condition of an access of `bytes` bytes.
    fn check_access(&mut self, point: &Point, address: &ExprRef, bytes: u64, at: &Location, what: &str) {
        if !self.config.bounds_checking {
            return;
        }
        let pool = self.pool;
        let inside = match self.memory.in_bounds(pool, address, bytes) {
            Some(inside) => inside,
            None => {
                trace!("{} at {} has no known allocation", what, at);
                return;
            }
        };
        if *self.goal == Goal::MemorySafety {
            self.violations.push(pool.and2(&point.pc, &pool.not(&inside)));
            return;
        }
        let obligation = pool.implies(&point.pc, &inside);
        if obligation.is_true() {
            return;
        }
        let name = format!("{}.bounds.{}", self.function.name, self.formula.assertions.len());
        let comment = format!("{} of {} bytes in bounds (line {})", what, bytes, at.line.unwrap_or(0));
        self.formula.push(name, AssertionKind::Obligation, obligation, comment);
    }

    /// Non-zero test of an integer, or the boolean itself.
    fn truth(&self, term: &ExprRef) -> ExprRef {
        match term.sort() {
            Sort::Bool => term.clone(),
            _ => self.pool.ne(term, &self.pool.bv(0, term.width())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn call(
        &mut self,
        env: &mut Env,
        point: &Point,
        instruction: &Instruction,
        callee: &str,
        ret: &Type,
        args: &[TypedOperand],
        at: &Location,
    ) -> Result<Option<ExprRef>> {
        let pool = self.pool;
        let module = self.module;
        let pc = &point.pc;

        if ret.is_void() && IGNORED_INTRINSICS.iter().any(|p| callee.starts_with(p)) {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.value(env, &arg.operand, &arg.ty, at)?);
        }

        match callee {
            "llvm.assume" | "__VERIFIER_assume" if values.len() == 1 => {
                let holds = self.truth(&values[0]);
                self.assume(pool.implies(pc, &holds), format!("{} (line {})", callee, instruction.line));
                return Ok(None);
            }
            name if ERROR_FUNCTIONS.contains(&name) => {
                self.failures.push(pc.clone());
                return Ok(None);
            }
            name if name.ends_with("assert") && values.len() == 1 && values[0].sort() != Sort::Memory => {
                let holds = self.truth(&values[0]);
                self.failures.push(pool.and2(pc, &pool.not(&holds)));
                return Ok(None);
            }
            "free" => return Ok(None),
            "malloc" if values.len() == 1 => {
                let size = self.resize(&values[0], Sort::BitVec(ADDRESS_BITS), false);
                let name = match &instruction.result {
                    Some(result) => format!("{}.%{}.base{}", self.function.name, result, point.suffix),
                    None => {
                        self.fresh += 1;
                        format!("{}.malloc.{}", self.function.name, self.fresh)
                    }
                };
                return Ok(Some(self.allocation(&name, size, pc)));
            }
            _ => {}
        }

        if let Some(term) = min_max(pool, callee, &values) {
            return Ok(Some(term));
        }
        if let Some(kind) = memory_intrinsic(callee) {
            return self.memory_intrinsic(env, point, kind, callee, &values, at).map(Some).map(|t| {
                t.filter(|_| !ret.is_void())
            });
        }

        let declaration = module.function(callee);
        let attributes = declaration.map(|f| f.attributes.as_slice()).unwrap_or(&[]);
        let effect = self.config.call_effect(callee, attributes);
        let defined = declaration.map(|f| !f.is_declaration()).unwrap_or(false);

        let result = if ret.is_void() {
            None
        } else {
            let sort = self.sort_of(ret, at)?;
            if effect == CallEffect::Pure || defined {
                let mut inputs = values.clone();
                if reads_memory(self.config.pure_functions.contains(callee), declaration) {
                    inputs.push(env.memory.clone());
                }
                Some(self.apply(callee, &inputs, sort, at)?)
            } else {
                Some(self.fresh_var(&format!("call.@{}", callee), sort))
            }
        };
        if effect == CallEffect::Effectful {
            debug!("@{}: call to @{} clobbers memory", self.function.name, callee);
            env.memory = self.fresh_var("mem.call", Sort::Memory);
        }
        Ok(result)
    }

    /// Uninterpreted function application, declared on first use.
    fn apply(&mut self, callee: &str, args: &[ExprRef], sort: Sort, at: &Location) -> Result<ExprRef> {
        let name = format!("fn.{}", callee);
        let decl = FunctionDecl {
            name: name.clone(),
            args: args.iter().map(|a| a.sort()).collect(),
            ret: sort,
        };
        match self.formula.functions.iter().find(|f| f.name == name) {
            Some(existing) if *existing != decl => {
                return Err(Error::type_error(
                    format!("@{} is called with conflicting signatures", callee),
                    at.clone(),
                ));
            }
            Some(_) => {}
            None => self.formula.functions.push(decl),
        }
        Ok(self.pool.apply(&name, args, sort))
    }

    /// Expands memset, memcpy and memmove. Returns the destination.
    fn memory_intrinsic(
        &mut self,
        env: &mut Env,
        point: &Point,
        kind: MemoryIntrinsic,
        callee: &str,
        values: &[ExprRef],
        at: &Location,
    ) -> Result<ExprRef> {
        let pool = self.pool;
        if values.len() < 3 {
            return Err(Error::type_error(format!("@{} expects three arguments", callee), at.clone()));
        }
        let target = values[0].clone();
        let length = values[2].as_const().filter(|&n| n <= MAX_EXPANDED_BYTES as u128);
        let length = match length {
            Some(length) => length as u64,
            None => {
                debug!("@{}: @{} with unknown length clobbers memory", self.function.name, callee);
                env.memory = self.fresh_var("mem.call", Sort::Memory);
                return Ok(target);
            }
        };
        if length == 0 {
            return Ok(target);
        }

        self.check_access(point, &target, length, at, callee);
        let updated = match kind {
            MemoryIntrinsic::Set => {
                let byte = self.resize(&values[1], Sort::BitVec(8), false);
                memory::fill(pool, &env.memory, &target, &byte, length)
            }
            MemoryIntrinsic::Copy => {
                self.check_access(point, &values[1], length, at, callee);
                memory::copy(pool, &env.memory, &target, &values[1], length)
            }
        };
        env.memory = self.memory_version(updated, format!("@{} of {} bytes", callee, length));
        Ok(target)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MemoryIntrinsic {
    Set,
    Copy,
}

fn memory_intrinsic(callee: &str) -> Option<MemoryIntrinsic> {
    match callee {
        "memset" => Some(MemoryIntrinsic::Set),
        "memcpy" | "memmove" => Some(MemoryIntrinsic::Copy),
        name if name.starts_with("llvm.memset.") => Some(MemoryIntrinsic::Set),
        name if name.starts_with("llvm.memcpy.") || name.starts_with("llvm.memmove.") => {
            Some(MemoryIntrinsic::Copy)
        }
        _ => None,
    }
}

/// `llvm.{s,u}{min,max}` and `llvm.abs` as conditionals.
fn min_max(pool: &crate::smt::ExprPool, callee: &str, values: &[ExprRef]) -> Option<ExprRef> {
    let family = callee.strip_prefix("llvm.")?.split('.').next()?;
    let first = values.first().filter(|v| v.sort() != Sort::Bool)?;
    let zero = pool.bv(0, first.width());
    let (op, other) = match family {
        "smax" => (BvCmp::Sgt, values.get(1)?),
        "smin" => (BvCmp::Slt, values.get(1)?),
        "umax" => (BvCmp::Ugt, values.get(1)?),
        "umin" => (BvCmp::Ult, values.get(1)?),
        "abs" => {
            let negated = pool.binary(BvOp::Sub, &zero, first);
            return Some(pool.ite(&pool.compare(BvCmp::Slt, first, &zero), &negated, first));
        }
        _ => return None,
    };
    Some(pool.ite(&pool.compare(op, first, other), first, other))
}

/// Listed pure functions are taken to depend on their arguments only.
fn reads_memory(listed: bool, declaration: Option<&Function>) -> bool {
    if listed {
        return false;
    }
    match declaration {
        Some(f) => !(f.has_attribute("readnone") || f.has_attribute("memory(none)")),
        None => true,
    }
}

fn opcode_name<T: std::fmt::Debug>(op: &T) -> String {
    format!("{:?}", op).to_lowercase()
}

#[rustfmt::skip]
fn bv_op(op: BinaryOp) -> BvOp {
    match op {
        BinaryOp::Add => BvOp::Add,   BinaryOp::Sub => BvOp::Sub,   BinaryOp::Mul => BvOp::Mul,
        BinaryOp::UDiv => BvOp::UDiv, BinaryOp::SDiv => BvOp::SDiv,
        BinaryOp::URem => BvOp::URem, BinaryOp::SRem => BvOp::SRem,
        BinaryOp::Shl => BvOp::Shl,   BinaryOp::LShr => BvOp::LShr, BinaryOp::AShr => BvOp::AShr,
        BinaryOp::And => BvOp::And,   BinaryOp::Or => BvOp::Or,     BinaryOp::Xor => BvOp::Xor,
    }
}

fn collect_symbols(operand: &Operand, out: &mut BTreeSet<String>) {
    match operand {
        Operand::Global(name) => {
            out.insert(name.clone());
        }
        Operand::ConstExpr(expr) => match expr.as_ref() {
            ConstExpr::Gep { base, indices, .. } => {
                collect_symbols(&base.operand, out);
                for index in indices {
                    collect_symbols(&index.operand, out);
                }
            }
            ConstExpr::Cast { value, .. } => collect_symbols(&value.operand, out),
        },
        _ => {}
    }
}

fn initializer_symbols(init: &Initializer, out: &mut BTreeSet<String>) {
    match init {
        Initializer::Symbol(name) => {
            out.insert(name.clone());
        }
        Initializer::Aggregate(fields) => {
            for (_, field) in fields {
                initializer_symbols(field, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::encoder::encode;
    use crate::error::Error;
    use crate::formula::{AssertionKind, Goal};
    use crate::ir::parse_module;
    use crate::smt::eval::Value;
    use crate::smt::solver::EnumerationSolver;
    use crate::smt::ExprPool;

    fn solve(text: &str, name: &str, config: &Config, goal: Goal) -> (crate::formula::Formula, crate::smt::solver::Verdict) {
        let pool = ExprPool::new();
        let module = parse_module(text).expect("parses");
        let function = module.function(name).expect("defined");
        let formula = encode(&module, function, config, &goal, &pool).expect("encodes");
        let verdict = formula
            .solve(&pool, &mut EnumerationSolver::default(), 5_000)
            .expect("solves");
        (formula, verdict)
    }

    #[test]
    fn stored_value_is_loaded_back() {
        let text = r#"
define i32 @roundtrip(i32 %v) {
entry:
  %p = alloca i32, align 4
  store i32 %v, ptr %p, align 4
  %r = load i32, ptr %p, align 4
  ret i32 %r
}
"#;
        let pool = ExprPool::new();
        let module = parse_module(text).unwrap();
        let function = module.function("roundtrip").unwrap();
        let formula = encode(&module, function, &Config::default(), &Goal::AssertionFailure, &pool).unwrap();
        assert_eq!(formula.term_of("r"), formula.term_of("v"));
    }

    #[test]
    fn narrow_addition_wraps() {
        let text = r#"
define i8 @wrap(i8 %a, i8 %b) {
entry:
  %s = add i8 %a, %b
  %hit = icmp eq i8 %s, 44
  br i1 %hit, label %bad, label %ok
bad:
  call void @reach_error()
  unreachable
ok:
  ret i8 %s
}
declare void @reach_error()
"#;
        let (formula, verdict) = solve(text, "wrap", &Config::default(), Goal::AssertionFailure);
        let model = verdict.model().expect("sat");
        let a = formula.value_of(model, "a").unwrap().as_u128();
        let b = formula.value_of(model, "b").unwrap().as_u128();
        assert_eq!((a + b) % 256, 44);
        assert_eq!(formula.value_of(model, "s"), Some(Value::BitVec { value: 44, width: 8 }));
    }

    #[test]
    fn assertion_calls_fail_when_the_argument_is_zero() {
        let text = r#"
define void @check(i8 %x) {
entry:
  %pos = icmp sgt i8 %x, 0
  %c = zext i1 %pos to i32
  call void @__VERIFIER_assume(i32 %c)
  %y = sub i8 %x, 1
  %ok = icmp sge i8 %y, 0
  %arg = zext i1 %ok to i32
  call void @my_assert(i32 %arg)
  ret void
}
declare void @__VERIFIER_assume(i32)
declare void @my_assert(i32)
"#;
        let (_, verdict) = solve(text, "check", &Config::default(), Goal::AssertionFailure);
        assert!(verdict.is_unsat());
    }

    #[test]
    fn out_of_bounds_store_is_a_memory_safety_violation() {
        let text = r#"
define void @oob(i64 %i) {
entry:
  %buf = alloca [4 x i8], align 1
  %p = getelementptr inbounds [4 x i8], ptr %buf, i64 0, i64 %i
  store i8 1, ptr %p, align 1
  ret void
}
"#;
        let config = Config::default().with_bounds_checking(true);
        let (formula, verdict) = solve(text, "oob", &config, Goal::MemorySafety);
        assert!(verdict.is_sat());
        let i = formula.value_of(verdict.model().unwrap(), "i").unwrap().as_u128();
        assert!(i >= 4);
    }

    #[test]
    fn bounds_are_obligations_under_other_goals() {
        let text = r#"
define i8 @inside(ptr %q) {
entry:
  %buf = alloca [4 x i8], align 1
  %p = getelementptr inbounds [4 x i8], ptr %buf, i64 0, i64 2
  store i8 7, ptr %p, align 1
  %v = load i8, ptr %p, align 1
  %w = load i8, ptr %q, align 1
  ret i8 %v
}
"#;
        let pool = ExprPool::new();
        let module = parse_module(text).unwrap();
        let function = module.function("inside").unwrap();
        let config = Config::default().with_bounds_checking(true);
        let formula = encode(&module, function, &config, &Goal::AssertionFailure, &pool).unwrap();
        // constant offsets into a known allocation simplify away
        assert!(formula
            .assertions
            .iter()
            .all(|a| a.kind != AssertionKind::Obligation));
        assert_eq!(formula.term_of("v").and_then(|t| t.as_const()), Some(7));
    }

    #[test]
    fn memory_safety_goal_requires_bounds_checking() {
        let text = "define void @f() {\nentry:\n  ret void\n}\n";
        let pool = ExprPool::new();
        let module = parse_module(text).unwrap();
        let function = module.function("f").unwrap();
        let result = encode(&module, function, &Config::default(), &Goal::MemorySafety, &pool);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn pure_calls_become_uninterpreted_functions() {
        let text = r#"
define i32 @twice(i32 %x) {
entry:
  %a = call i32 @hash(i32 %x)
  %b = call i32 @hash(i32 %x)
  %same = icmp eq i32 %a, %b
  ret i32 %a
}
declare i32 @hash(i32) #0
attributes #0 = { nounwind memory(none) }
"#;
        let pool = ExprPool::new();
        let module = parse_module(text).unwrap();
        let function = module.function("twice").unwrap();
        let formula = encode(&module, function, &Config::default(), &Goal::AssertionFailure, &pool).unwrap();
        assert_eq!(formula.functions.len(), 1);
        assert_eq!(formula.term_of("a"), formula.term_of("b"));
        assert!(formula.term_of("same").map(|t| t.is_true()).unwrap_or(false));
    }

    #[test]
    fn effectful_calls_return_fresh_values() {
        let text = r#"
define i32 @twice(i32 %x) {
entry:
  %a = call i32 @rand(i32 %x)
  %b = call i32 @rand(i32 %x)
  ret i32 %a
}
declare i32 @rand(i32)
"#;
        let pool = ExprPool::new();
        let module = parse_module(text).unwrap();
        let function = module.function("twice").unwrap();
        let formula = encode(&module, function, &Config::default(), &Goal::AssertionFailure, &pool).unwrap();
        assert!(formula.functions.is_empty());
        assert_ne!(formula.term_of("a"), formula.term_of("b"));
    }

    #[test]
    fn constant_globals_are_initialized() {
        let text = r#"
@table = private constant [4 x i8] c"\01\02\03\04", align 1

define i8 @third() {
entry:
  %p = getelementptr inbounds [4 x i8], ptr @table, i64 0, i64 2
  %v = load i8, ptr %p, align 1
  ret i8 %v
}
"#;
        let pool = ExprPool::new();
        let module = parse_module(text).unwrap();
        let function = module.function("third").unwrap();
        let formula = encode(&module, function, &Config::default(), &Goal::AssertionFailure, &pool).unwrap();
        assert_eq!(formula.term_of("v").and_then(|t| t.as_const()), Some(3));
    }

    #[test]
    fn memcpy_with_constant_length_moves_bytes() {
        let text = r#"
define i16 @copy(i16 %v) {
entry:
  %src = alloca i16, align 2
  %dst = alloca i16, align 2
  store i16 %v, ptr %src, align 2
  call void @llvm.memcpy.p0.p0.i64(ptr %dst, ptr %src, i64 2, i1 false)
  %r = load i16, ptr %dst, align 2
  ret i16 %r
}
declare void @llvm.memcpy.p0.p0.i64(ptr, ptr, i64, i1)
"#;
        let pool = ExprPool::new();
        let module = parse_module(text).unwrap();
        let function = module.function("copy").unwrap();
        let formula = encode(&module, function, &Config::default(), &Goal::AssertionFailure, &pool).unwrap();
        assert!(formula.term_of("r").is_some());
        assert_eq!(formula.term_of("r"), formula.term_of("v"));
    }
}
