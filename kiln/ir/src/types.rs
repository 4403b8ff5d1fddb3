//! Scalar type descriptions shared by IR payloads.

use crate::registry::TypeIndex;

/// The closed set of value categories the back end distinguishes.
///
/// The front end resolves typedefs, enums and template parameters before IR
/// generation, so only machine-relevant categories remain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IrType {
    /// `void`; only valid behind a pointer or as a return type.
    Void,
    /// `bool`, 8 bits.
    Bool,
    /// Signed character, 8 bits.
    Char,
    /// Unsigned character, 8 bits.
    UnsignedChar,
    /// Signed 16-bit integer.
    Short,
    /// Unsigned 16-bit integer.
    UnsignedShort,
    /// Signed 32-bit integer.
    Int,
    /// Unsigned 32-bit integer.
    UnsignedInt,
    /// Signed 64-bit integer.
    Long,
    /// Unsigned 64-bit integer.
    UnsignedLong,
    /// IEEE-754 binary32.
    Float,
    /// IEEE-754 binary64.
    Double,
    /// A class or struct type; layout lives in the type registry.
    Struct,
    /// Pointer to function; always 64 bits.
    FunctionPointer,
}

impl IrType {
    /// True for `Float` and `Double`.
    pub fn is_float(self) -> bool {
        matches!(self, IrType::Float | IrType::Double)
    }

    /// True for the unsigned integer categories (including `Bool`).
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            IrType::Bool
                | IrType::UnsignedChar
                | IrType::UnsignedShort
                | IrType::UnsignedInt
                | IrType::UnsignedLong
        )
    }

    /// True for any integer category, signed or not.
    pub fn is_integer(self) -> bool {
        !self.is_float() && !matches!(self, IrType::Void | IrType::Struct)
    }
}

/// Linkage of a function or global symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linkage {
    /// C++ linkage; symbol names arrive pre-mangled.
    CPlusPlus,
    /// `extern "C"`; names are emitted verbatim.
    C,
    /// Internal (static) linkage; symbol is not exported.
    Internal,
}

/// A type without a value: category, width, indirection and reference-ness.
///
/// This is the shape the front end reports for parameters, returns, members
/// and conversion targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeDesc {
    /// Value category.
    pub ty: IrType,
    /// Size of the pointed-to or direct value, in bits.
    pub size_bits: u32,
    /// Number of `*` levels; 0 for a direct value.
    pub pointer_depth: u8,
    /// `T&` or `T&&`.
    pub is_reference: bool,
    /// Registry index when `ty == Struct`.
    pub type_index: Option<TypeIndex>,
}

impl TypeDesc {
    /// A direct scalar of the given category and width.
    pub fn scalar(ty: IrType, size_bits: u32) -> Self {
        Self {
            ty,
            size_bits,
            pointer_depth: 0,
            is_reference: false,
            type_index: None,
        }
    }

    /// A pointer to the given category.
    pub fn pointer(ty: IrType, pointee_size_bits: u32) -> Self {
        Self {
            ty,
            size_bits: pointee_size_bits,
            pointer_depth: 1,
            is_reference: false,
            type_index: None,
        }
    }

    /// Size in bits of the value as it moves through registers and slots:
    /// 64 for pointers and references, the declared width otherwise.
    pub fn storage_bits(&self) -> u32 {
        if self.pointer_depth > 0 || self.is_reference || self.ty == IrType::FunctionPointer {
            64
        } else {
            self.size_bits
        }
    }

    /// True if values of this type travel in XMM registers.
    pub fn in_xmm(&self) -> bool {
        self.pointer_depth == 0 && !self.is_reference && self.ty.is_float()
    }
}
