//! In-memory form of a textual LLVM IR module.
//!
//! The graph is owned by a [`Module`] and lives for one translation run.
//! Instruction results are single-assignment names; blocks refer to each
//! other by label.

use std::collections::BTreeMap;
use std::fmt;

pub mod inline;
pub mod parser;

pub use parser::parse_module;

//
// Public Interface
//

/// Pointer width of the supported targets (x86-64, aarch64, riscv64).
pub const POINTER_BITS: u32 = 64;
pub const POINTER_BYTES: u64 = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Type {
    Void,
    Int(u32),
    Ptr,
    Array(u64, Box<Type>),
    Struct(Vec<Type>),
    Named(String),
    Vector(u32, Box<Type>),
    Float(String),
    Label,
    Metadata,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Local(String),
    Global(String),
    Int(i128),
    Null,
    /// `undef` and `poison`, both read as an unconstrained value.
    Undef,
    ConstExpr(Box<ConstExpr>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypedOperand {
    pub ty: Type,
    pub operand: Operand,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConstExpr {
    Gep {
        source: Type,
        base: TypedOperand,
        indices: Vec<TypedOperand>,
    },
    Cast {
        op: CastOp,
        value: TypedOperand,
        to: Type,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    BitCast,
    PtrToInt,
    IntToPtr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstructionKind {
    Binary {
        op: BinaryOp,
        ty: Type,
        left: Operand,
        right: Operand,
    },
    ICmp {
        predicate: IntPredicate,
        ty: Type,
        left: Operand,
        right: Operand,
    },
    Select {
        cond: Operand,
        ty: Type,
        then: Operand,
        otherwise: Operand,
    },
    Cast {
        op: CastOp,
        value: TypedOperand,
        to: Type,
    },
    Freeze {
        value: TypedOperand,
    },
    Alloca {
        ty: Type,
        count: Option<TypedOperand>,
    },
    Load {
        ty: Type,
        address: Operand,
    },
    Store {
        value: TypedOperand,
        address: Operand,
    },
    Gep {
        source: Type,
        base: Operand,
        indices: Vec<TypedOperand>,
    },
    Phi {
        ty: Type,
        incoming: Vec<(Operand, String)>,
    },
    Call {
        callee: String,
        ret: Type,
        args: Vec<TypedOperand>,
    },
    /// Recognised construct without a translation (vector ops, floats,
    /// landing pads, variadic calls, ...).
    Unsupported {
        construct: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub result: Option<String>,
    pub kind: InstructionKind,
    pub line: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminator {
    Br(String),
    CondBr {
        cond: Operand,
        then: String,
        otherwise: String,
    },
    Switch {
        ty: Type,
        value: Operand,
        default: String,
        cases: Vec<(i128, String)>,
    },
    Ret(Option<TypedOperand>),
    Unreachable,
    Unsupported {
        construct: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub label: String,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
    pub terminator_line: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub ret: Type,
    pub params: Vec<Param>,
    pub variadic: bool,
    /// Function attributes, with attribute groups already expanded.
    pub attributes: Vec<String>,
    /// Empty for declarations.
    pub blocks: Vec<Block>,
    pub line: usize,
    /// Signature uses a construct the translator rejects.
    pub unsupported: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Initializer {
    Zero,
    Int(i128),
    Bytes(Vec<u8>),
    Aggregate(Vec<(Type, Initializer)>),
    Null,
    Symbol(String),
    /// Contents not modelled, read as unconstrained memory.
    Opaque,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    pub init: Option<Initializer>,
    pub constant: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Module {
    pub source_filename: Option<String>,
    pub types: BTreeMap<String, Type>,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Type {
    pub fn is_bool(&self) -> bool {
        *self == Type::Int(1)
    }

    pub fn is_pointer(&self) -> bool {
        *self == Type::Ptr
    }

    pub fn is_void(&self) -> bool {
        *self == Type::Void
    }
}

impl Operand {
    pub fn as_local(&self) -> Option<&str> {
        match self {
            Operand::Local(name) => Some(name),
            _ => None,
        }
    }
}

impl InstructionKind {
    /// Local names read by this instruction, in operand order.
    pub fn operands(&self) -> Vec<&Operand> {
        fn typed(operands: &[TypedOperand]) -> impl Iterator<Item = &Operand> {
            operands.iter().map(|t| &t.operand)
        }
        match self {
            InstructionKind::Binary { left, right, .. } => vec![left, right],
            InstructionKind::ICmp { left, right, .. } => vec![left, right],
            InstructionKind::Select {
                cond,
                then,
                otherwise,
                ..
            } => vec![cond, then, otherwise],
            InstructionKind::Cast { value, .. } => vec![&value.operand],
            InstructionKind::Freeze { value } => vec![&value.operand],
            InstructionKind::Alloca { count, .. } => count.iter().map(|c| &c.operand).collect(),
            InstructionKind::Load { address, .. } => vec![address],
            InstructionKind::Store { value, address } => vec![&value.operand, address],
            InstructionKind::Gep { base, indices, .. } => {
                std::iter::once(base).chain(typed(indices)).collect()
            }
            InstructionKind::Phi { incoming, .. } => incoming.iter().map(|(v, _)| v).collect(),
            InstructionKind::Call { args, .. } => typed(args).collect(),
            InstructionKind::Unsupported { .. } => vec![],
        }
    }
}

impl Terminator {
    /// Successor labels in branch order (duplicates preserved).
    pub fn successors(&self) -> Vec<&str> {
        match self {
            Terminator::Br(target) => vec![target],
            Terminator::CondBr {
                then, otherwise, ..
            } => vec![then, otherwise],
            Terminator::Switch { default, cases, .. } => std::iter::once(default.as_str())
                .chain(cases.iter().map(|(_, l)| l.as_str()))
                .collect(),
            Terminator::Ret(_) | Terminator::Unreachable | Terminator::Unsupported { .. } => {
                vec![]
            }
        }
    }

    pub fn operand(&self) -> Option<&Operand> {
        match self {
            Terminator::CondBr { cond, .. } => Some(cond),
            Terminator::Switch { value, .. } => Some(value),
            Terminator::Ret(Some(value)) => Some(&value.operand),
            _ => None,
        }
    }
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn entry(&self) -> Option<&Block> {
        self.blocks.first()
    }

    pub fn block(&self, label: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.label == label)
    }

    pub fn block_index(&self, label: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.label == label)
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.attributes.iter().any(|a| a == attribute)
    }
}

impl Module {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().filter(|f| !f.is_declaration())
    }

    pub fn resolve<'a>(&'a self, ty: &'a Type) -> &'a Type {
        let mut current = ty;
        while let Type::Named(name) = current {
            match self.types.get(name) {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    /// Allocation size in bytes following the default x86-64 data layout.
    pub fn size_of(&self, ty: &Type) -> Option<u64> {
        match self.resolve(ty) {
            Type::Int(bits) => Some(round_up(int_bytes(*bits), self.align_of(ty)?)),
            Type::Ptr => Some(POINTER_BYTES),
            Type::Array(n, element) => Some(n * self.size_of(element)?),
            Type::Struct(fields) => {
                let mut offset = 0;
                for field in fields {
                    offset = round_up(offset, self.align_of(field)?) + self.size_of(field)?;
                }
                Some(round_up(offset, self.align_of(ty)?))
            }
            _ => None,
        }
    }

    /// Number of bytes a load or store of this type touches.
    pub fn store_size_of(&self, ty: &Type) -> Option<u64> {
        match self.resolve(ty) {
            Type::Int(bits) => Some(int_bytes(*bits)),
            _ => self.size_of(ty),
        }
    }

    pub fn align_of(&self, ty: &Type) -> Option<u64> {
        match self.resolve(ty) {
            Type::Int(bits) => Some(int_bytes(*bits).next_power_of_two().min(16)),
            Type::Ptr => Some(POINTER_BYTES),
            Type::Array(_, element) => self.align_of(element),
            Type::Struct(fields) => fields
                .iter()
                .map(|f| self.align_of(f))
                .try_fold(1, |acc, a| a.map(|a| acc.max(a))),
            _ => None,
        }
    }

    pub fn field_offset(&self, ty: &Type, index: usize) -> Option<u64> {
        match self.resolve(ty) {
            Type::Struct(fields) if index < fields.len() => {
                let mut offset = 0;
                for (i, field) in fields.iter().enumerate() {
                    offset = round_up(offset, self.align_of(field)?);
                    if i == index {
                        return Some(offset);
                    }
                    offset += self.size_of(field)?;
                }
                None
            }
            _ => None,
        }
    }

    /// Bit width of a first-class scalar type (pointers are integers).
    pub fn bit_width(&self, ty: &Type) -> Option<u32> {
        match self.resolve(ty) {
            Type::Int(bits) => Some(*bits),
            Type::Ptr => Some(POINTER_BITS),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{}", bits),
            Type::Ptr => write!(f, "ptr"),
            Type::Array(n, element) => write!(f, "[{} x {}]", n, element),
            Type::Struct(fields) => {
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, " }}")
            }
            Type::Named(name) => write!(f, "%{}", name),
            Type::Vector(n, element) => write!(f, "<{} x {}>", n, element),
            Type::Float(name) => write!(f, "{}", name),
            Type::Label => write!(f, "label"),
            Type::Metadata => write!(f, "metadata"),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Local(name) => write!(f, "%{}", name),
            Operand::Global(name) => write!(f, "@{}", name),
            Operand::Int(value) => write!(f, "{}", value),
            Operand::Null => write!(f, "null"),
            Operand::Undef => write!(f, "undef"),
            Operand::ConstExpr(_) => write!(f, "<constexpr>"),
        }
    }
}

//
// Private Implementation
//

fn int_bytes(bits: u32) -> u64 {
    (bits as u64 + 7) / 8
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_layout_respects_field_alignment() {
        let mut module = Module::default();
        module.types.insert(
            "struct.S".to_string(),
            Type::Struct(vec![Type::Int(8), Type::Int(32), Type::Ptr]),
        );
        let s = Type::Named("struct.S".to_string());
        assert_eq!(module.field_offset(&s, 0), Some(0));
        assert_eq!(module.field_offset(&s, 1), Some(4));
        assert_eq!(module.field_offset(&s, 2), Some(8));
        assert_eq!(module.size_of(&s), Some(16));
        assert_eq!(module.align_of(&s), Some(8));
    }

    #[test]
    fn odd_integer_widths_round_to_allocation_size() {
        let module = Module::default();
        assert_eq!(module.size_of(&Type::Int(1)), Some(1));
        assert_eq!(module.size_of(&Type::Int(24)), Some(4));
        assert_eq!(module.store_size_of(&Type::Int(24)), Some(3));
        assert_eq!(
            module.size_of(&Type::Array(3, Box::new(Type::Int(16)))),
            Some(6)
        );
    }
}
