//! Byte-level x86-64 instruction emission.
//!
//! Every helper in [`emit`] appends one fully formed instruction to a
//! [`CodeSink`](crate::buffer::CodeSink): REX prefix, opcode, ModR/M,
//! optional SIB, displacement and immediate. The field-level composition
//! rules live in [`enc`]. Nothing above this layer touches instruction
//! bytes directly; keeping encoding in one place makes the expected
//! machine output checkable byte-for-byte in unit tests.

pub mod emit;
pub mod enc;

pub use enc::{modrm, put_mem, put_rex, sib};

/// A general-purpose register, by hardware encoding (0–15).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gpr(u8);

#[allow(missing_docs)]
impl Gpr {
    pub const RAX: Gpr = Gpr(0);
    pub const RCX: Gpr = Gpr(1);
    pub const RDX: Gpr = Gpr(2);
    pub const RBX: Gpr = Gpr(3);
    pub const RSP: Gpr = Gpr(4);
    pub const RBP: Gpr = Gpr(5);
    pub const RSI: Gpr = Gpr(6);
    pub const RDI: Gpr = Gpr(7);
    pub const R8: Gpr = Gpr(8);
    pub const R9: Gpr = Gpr(9);
    pub const R10: Gpr = Gpr(10);
    pub const R11: Gpr = Gpr(11);
    pub const R12: Gpr = Gpr(12);
    pub const R13: Gpr = Gpr(13);
    pub const R14: Gpr = Gpr(14);
    pub const R15: Gpr = Gpr(15);

    /// Construct from a hardware encoding.
    pub fn new(enc: u8) -> Gpr {
        debug_assert!(enc < 16);
        Gpr(enc)
    }

    /// The hardware encoding.
    pub fn enc(self) -> u8 {
        self.0
    }
}

/// An SSE register, by hardware encoding (0–15).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Xmm(u8);

#[allow(missing_docs)]
impl Xmm {
    pub const XMM0: Xmm = Xmm(0);
    pub const XMM1: Xmm = Xmm(1);
    pub const XMM2: Xmm = Xmm(2);
    pub const XMM3: Xmm = Xmm(3);
    pub const XMM4: Xmm = Xmm(4);
    pub const XMM5: Xmm = Xmm(5);
    pub const XMM6: Xmm = Xmm(6);
    pub const XMM7: Xmm = Xmm(7);

    /// Construct from a hardware encoding.
    pub fn new(enc: u8) -> Xmm {
        debug_assert!(enc < 16);
        Xmm(enc)
    }

    /// The hardware encoding.
    pub fn enc(self) -> u8 {
        self.0
    }
}

/// Operand width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandSize {
    /// 8 bits.
    S8,
    /// 16 bits.
    S16,
    /// 32 bits.
    S32,
    /// 64 bits.
    S64,
}

impl OperandSize {
    /// From a bit count; anything outside {8, 16, 32, 64} is rejected by
    /// the caller before reaching the emitter.
    pub fn from_bits(bits: u32) -> OperandSize {
        match bits {
            8 => OperandSize::S8,
            16 => OperandSize::S16,
            64 => OperandSize::S64,
            _ => OperandSize::S32,
        }
    }

    /// Bit count.
    pub fn bits(self) -> u32 {
        match self {
            OperandSize::S8 => 8,
            OperandSize::S16 => 16,
            OperandSize::S32 => 32,
            OperandSize::S64 => 64,
        }
    }
}

/// x86 condition codes, by hardware encoding (the low nibble of
/// `SETcc`/`Jcc` opcodes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CC {
    O = 0,
    NO = 1,
    B = 2,
    AE = 3,
    E = 4,
    NE = 5,
    BE = 6,
    A = 7,
    S = 8,
    NS = 9,
    P = 10,
    NP = 11,
    L = 12,
    GE = 13,
    LE = 14,
    G = 15,
}

impl CC {
    /// The condition's hardware encoding.
    pub fn enc(self) -> u8 {
        self as u8
    }
}

/// Two-operand integer ALU operations sharing the classic opcode layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    /// `add`
    Add,
    /// `or`
    Or,
    /// `and`
    And,
    /// `sub`
    Sub,
    /// `xor`
    Xor,
    /// `cmp`
    Cmp,
}

impl AluOp {
    /// Opcode for the `r/m, r` form.
    pub(crate) fn opcode_mr(self) -> u8 {
        match self {
            AluOp::Add => 0x01,
            AluOp::Or => 0x09,
            AluOp::And => 0x21,
            AluOp::Sub => 0x29,
            AluOp::Xor => 0x31,
            AluOp::Cmp => 0x39,
        }
    }

    /// The `/digit` selecting this operation in the `0x81`/`0x83`
    /// immediate forms.
    pub(crate) fn digit(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }
}

/// Scalar SSE arithmetic sharing the `F3/F2 0F xx` layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SseOp {
    /// `addss`/`addsd`
    Add,
    /// `mulss`/`mulsd`
    Mul,
    /// `subss`/`subsd`
    Sub,
    /// `divss`/`divsd`
    Div,
}

impl SseOp {
    pub(crate) fn opcode(self) -> u8 {
        match self {
            SseOp::Add => 0x58,
            SseOp::Mul => 0x59,
            SseOp::Sub => 0x5C,
            SseOp::Div => 0x5E,
        }
    }
}
