//! Intermediate representation consumed by the JIT.
//!
//! A method body is a forest of instruction trees: each top-level
//! instruction is the root of a tree whose children produced its stack
//! operands. The producer guarantees that translating children first
//! (post-order) reconstructs the original evaluation order.
//!
//! The types derive serde so programs can be written as JSON and fed to
//! the CLI, or built directly in code by tests and embedders.

use serde::{Deserialize, Serialize};

/// Cell types the translator distinguishes on the virtual stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Int32,
    Int64,
}

impl ValueType {
    /// Result type of a binary operation over two operands.
    pub fn widen(self, other: ValueType) -> ValueType {
        if self == ValueType::Int64 || other == ValueType::Int64 {
            ValueType::Int64
        } else {
            ValueType::Int32
        }
    }
}

/// A formal parameter declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub ty: ValueType,
}

/// A local variable declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalVar {
    pub ty: ValueType,
}

/// CIL opcodes the IR can carry, with their inline operands.
///
/// Carrying an opcode here does not imply the translator supports it:
/// `Div`, `Rem` and `Ldstr` have no entry in the translation table (the
/// SPE has no hardware divide and the JIT has no string heap) and fail
/// compilation with an unknown-opcode error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CilOp {
    Nop,
    Dup,
    Pop,
    LdcI4(i32),
    LdcI8(i64),
    Ldloc(u16),
    Stloc(u16),
    Ldarg(u16),
    Starg(u16),
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Not,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ceq,
    Cgt,
    Clt,
    ConvI4,
    ConvI8,
    Br(u32),
    Brfalse(u32),
    Brtrue(u32),
    Beq(u32),
    Bne(u32),
    Blt(u32),
    Ble(u32),
    Bgt(u32),
    Bge(u32),
    Call {
        method: String,
        args: u16,
        ret: Option<ValueType>,
    },
    Ret,
    Ldstr(String),
}

impl CilOp {
    /// The CIL mnemonic, for diagnostics and listings.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            CilOp::Nop => "nop",
            CilOp::Dup => "dup",
            CilOp::Pop => "pop",
            CilOp::LdcI4(_) => "ldc.i4",
            CilOp::LdcI8(_) => "ldc.i8",
            CilOp::Ldloc(_) => "ldloc",
            CilOp::Stloc(_) => "stloc",
            CilOp::Ldarg(_) => "ldarg",
            CilOp::Starg(_) => "starg",
            CilOp::Add => "add",
            CilOp::Sub => "sub",
            CilOp::Mul => "mul",
            CilOp::Div => "div",
            CilOp::Rem => "rem",
            CilOp::Neg => "neg",
            CilOp::Not => "not",
            CilOp::And => "and",
            CilOp::Or => "or",
            CilOp::Xor => "xor",
            CilOp::Shl => "shl",
            CilOp::Shr => "shr",
            CilOp::Ceq => "ceq",
            CilOp::Cgt => "cgt",
            CilOp::Clt => "clt",
            CilOp::ConvI4 => "conv.i4",
            CilOp::ConvI8 => "conv.i8",
            CilOp::Br(_) => "br",
            CilOp::Brfalse(_) => "brfalse",
            CilOp::Brtrue(_) => "brtrue",
            CilOp::Beq(_) => "beq",
            CilOp::Bne(_) => "bne.un",
            CilOp::Blt(_) => "blt",
            CilOp::Ble(_) => "ble",
            CilOp::Bgt(_) => "bgt",
            CilOp::Bge(_) => "bge",
            CilOp::Call { .. } => "call",
            CilOp::Ret => "ret",
            CilOp::Ldstr(_) => "ldstr",
        }
    }
}

/// One node of a method's instruction tree.
///
/// `offset` is the CIL byte offset of the instruction and serves as its
/// identity: branch operands name the target instruction by offset, and
/// the compiler keys its per-instruction native-offset map on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrInstruction {
    pub offset: u32,
    pub op: CilOp,
    #[serde(default)]
    pub children: Vec<IrInstruction>,
}

impl IrInstruction {
    /// Leaf node convenience constructor.
    pub fn new(offset: u32, op: CilOp) -> Self {
        Self {
            offset,
            op,
            children: Vec::new(),
        }
    }

    /// Interior node with operand-producing children.
    pub fn with_children(offset: u32, op: CilOp, children: Vec<IrInstruction>) -> Self {
        Self {
            offset,
            op,
            children,
        }
    }
}

/// A parsed managed method, ready for translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrMethod {
    /// Method identity, referenced by call sites and the linker.
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub locals: Vec<LocalVar>,
    /// Whether locals must be zero-initialized on entry.
    #[serde(default)]
    pub init_locals: bool,
    pub body: Vec<IrInstruction>,
}

/// A whole program: an ordered set of methods.
///
/// The first method is the image entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub methods: Vec<IrMethod>,
}
