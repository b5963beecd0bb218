//! Block-structured intermediate representation.
//!
//! The translator only talks to the [`IrBuilder`] capability; [`Module`] is the
//! in-memory control-flow graph implementing it, and the backends consume a
//! finished `Module`.

use std::fmt;

use thiserror::Error;

mod cfg;

pub use cfg::{Block, Function, Module};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    I1,
    I8,
    I32,
    I64,
    Ptr,
    /// `[n x i8]`
    Bytes(u64),
}

impl Type {
    /// Storage size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Type::I1 | Type::I8 => 1,
            Type::I32 => 4,
            Type::I64 | Type::Ptr => 8,
            Type::Bytes(n) => *n,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::I1 => write!(f, "i1"),
            Type::I8 => write!(f, "i8"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::Ptr => write!(f, "ptr"),
            Type::Bytes(n) => write!(f, "[{n} x i8]"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub(crate) u32);

impl FuncId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub(crate) func: u32,
    pub(crate) index: u32,
}

impl BlockId {
    pub fn func(&self) -> FuncId {
        FuncId(self.func)
    }

    /// Position of the block inside its function, in creation order.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// SSA value, numbered per function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub(crate) u32);

impl Value {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Value(Value),
    Const(Type, i64),
}

impl Operand {
    pub fn int(ty: Type, value: i64) -> Self {
        Operand::Const(ty, value)
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Value(value)
    }
}

/// Host primitives a generated program links against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    /// Reads one byte from standard input.
    GetChar,
    /// Writes one byte to standard output.
    PutChar,
    MemSet,
}

impl Intrinsic {
    pub fn name(&self) -> &'static str {
        match self {
            Intrinsic::GetChar => "getchar",
            Intrinsic::PutChar => "putchar",
            Intrinsic::MemSet => "memset",
        }
    }

    /// `None` for void.
    pub fn ret(&self) -> Option<Type> {
        match self {
            Intrinsic::GetChar | Intrinsic::PutChar => Some(Type::I8),
            Intrinsic::MemSet => None,
        }
    }

    pub fn params(&self) -> &'static [(&'static str, Type)] {
        match self {
            Intrinsic::GetChar => &[],
            Intrinsic::PutChar => &[("c", Type::I8)],
            Intrinsic::MemSet => &[("ptr", Type::Ptr), ("val", Type::I8), ("len", Type::I64)],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    Alloca {
        dst: Value,
        ty: Type,
    },
    Load {
        dst: Value,
        ty: Type,
        ptr: Value,
    },
    Store {
        ty: Type,
        value: Operand,
        ptr: Value,
    },
    /// Wrapping integer addition at the width of `ty`.
    Add {
        dst: Value,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    },
    /// Address of element `index` of the byte array behind `base`.
    ElementPtr {
        dst: Value,
        array: Type,
        base: Value,
        index: Operand,
    },
    ICmpNe {
        dst: Value,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    },
    Call {
        dst: Option<Value>,
        callee: Intrinsic,
        args: Vec<Operand>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Terminator {
    CondBr {
        cond: Value,
        then: BlockId,
        otherwise: BlockId,
    },
    Ret {
        value: Operand,
    },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::CondBr {
                then, otherwise, ..
            } => vec![*then, *otherwise],
            Terminator::Ret { .. } => vec![],
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum BuildError {
    #[error("block `{0}` already has a terminator")]
    Terminated(String),
    #[error("block `{0}` has no terminator")]
    Unterminated(String),
    #[error("unknown block {0:?}")]
    UnknownBlock(BlockId),
    #[error("branch from `{from}` leaves its function")]
    ForeignTarget { from: String },
    #[error("size {0} does not fit in an i64")]
    SizeOutOfRange(u64),
    #[error("call to `{0}` produces no value")]
    NoResult(&'static str),
}

/// Everything the translator needs to grow a control-flow graph.
///
/// Instructions are appended to the block passed in; a block accepts
/// instructions until it receives its single terminator.
pub trait IrBuilder {
    fn declare(&mut self, callee: Intrinsic);

    fn create_function(&mut self, name: &str, ret: Type) -> FuncId;

    fn create_block(&mut self, func: FuncId, label: &str) -> BlockId;

    fn alloca(&mut self, block: BlockId, ty: Type) -> Result<Value, BuildError>;

    fn load(&mut self, block: BlockId, ty: Type, ptr: Value) -> Result<Value, BuildError>;

    fn store(
        &mut self,
        block: BlockId,
        ty: Type,
        value: Operand,
        ptr: Value,
    ) -> Result<(), BuildError>;

    fn add(
        &mut self,
        block: BlockId,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<Value, BuildError>;

    fn element_ptr(
        &mut self,
        block: BlockId,
        array: Type,
        base: Value,
        index: Operand,
    ) -> Result<Value, BuildError>;

    fn icmp_ne(
        &mut self,
        block: BlockId,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<Value, BuildError>;

    /// Returns `None` for intrinsics without a result.
    fn call(
        &mut self,
        block: BlockId,
        callee: Intrinsic,
        args: &[Operand],
    ) -> Result<Option<Value>, BuildError>;

    fn cond_br(
        &mut self,
        block: BlockId,
        cond: Value,
        then: BlockId,
        otherwise: BlockId,
    ) -> Result<(), BuildError>;

    fn ret(&mut self, block: BlockId, value: Operand) -> Result<(), BuildError>;
}
