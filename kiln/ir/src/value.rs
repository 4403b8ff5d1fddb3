//! Values flowing between IR instructions.

use crate::interner::StringId;
use crate::registry::TypeIndex;
use crate::types::{IrType, TypeDesc};

/// A numbered temporary. The back end assigns it a stack slot on first use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TempVar(pub u32);

impl TempVar {
    /// The temporary's number.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// An operand: a temporary, a named variable, or an immediate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IrValue {
    /// A numbered temporary.
    Temp(TempVar),
    /// A named user variable; resolves to a local slot or a global.
    Name(StringId),
    /// Integer immediate as a 64-bit bit pattern.
    Imm(u64),
    /// Floating immediate. `float` literals use the low 32 bits of the
    /// bit-cast of the `f32` value.
    FloatImm(f64),
}

/// An operand together with the type the front end assigned it.
///
/// The back end never re-derives type information; everything it needs to
/// size loads, pick register classes and classify call arguments is here.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TypedValue {
    /// The operand itself.
    pub value: IrValue,
    /// Value category.
    pub ty: IrType,
    /// Width of the (pointed-to) value in bits.
    pub size_bits: u32,
    /// Number of pointer levels.
    pub pointer_depth: u8,
    /// The operand is an lvalue reference.
    pub is_reference: bool,
    /// The operand is an rvalue reference.
    pub is_rvalue_reference: bool,
    /// Registry index when `ty == Struct`.
    pub type_index: Option<TypeIndex>,
}

impl TypedValue {
    /// A typed temporary.
    pub fn temp(t: TempVar, ty: IrType, size_bits: u32) -> Self {
        Self {
            value: IrValue::Temp(t),
            ty,
            size_bits,
            pointer_depth: 0,
            is_reference: false,
            is_rvalue_reference: false,
            type_index: None,
        }
    }

    /// A typed named variable.
    pub fn name(n: StringId, ty: IrType, size_bits: u32) -> Self {
        Self {
            value: IrValue::Name(n),
            ty,
            size_bits,
            pointer_depth: 0,
            is_reference: false,
            is_rvalue_reference: false,
            type_index: None,
        }
    }

    /// An integer immediate.
    pub fn imm(bits: u64, ty: IrType, size_bits: u32) -> Self {
        Self {
            value: IrValue::Imm(bits),
            ty,
            size_bits,
            pointer_depth: 0,
            is_reference: false,
            is_rvalue_reference: false,
            type_index: None,
        }
    }

    /// A floating immediate.
    pub fn float_imm(v: f64, ty: IrType) -> Self {
        Self {
            value: IrValue::FloatImm(v),
            ty,
            size_bits: if ty == IrType::Float { 32 } else { 64 },
            pointer_depth: 0,
            is_reference: false,
            is_rvalue_reference: false,
            type_index: None,
        }
    }

    /// Mark as a pointer of the given depth.
    pub fn with_pointer_depth(mut self, depth: u8) -> Self {
        self.pointer_depth = depth;
        self
    }

    /// Mark as a reference.
    pub fn with_reference(mut self) -> Self {
        self.is_reference = true;
        self
    }

    /// The type portion, discarding the operand.
    pub fn type_desc(&self) -> TypeDesc {
        TypeDesc {
            ty: self.ty,
            size_bits: self.size_bits,
            pointer_depth: self.pointer_depth,
            is_reference: self.is_reference,
            type_index: self.type_index,
        }
    }

    /// Width the value occupies in a register or slot (64 for pointers and
    /// references).
    pub fn storage_bits(&self) -> u32 {
        self.type_desc().storage_bits()
    }

    /// True if this value travels in XMM registers.
    pub fn in_xmm(&self) -> bool {
        self.type_desc().in_xmm()
    }
}
