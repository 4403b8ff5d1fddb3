//! Relocatable object output for the Kiln back end.
//!
//! The code generator hands this crate finished bytes (machine code, EH
//! tables, RTTI records) plus symbol and relocation requests; everything
//! here is about placing those into a COFF or ELF relocatable file through
//! `object::write`. The choice of format is a compile-time type parameter:
//! `ObjectModule<Coff>` or `ObjectModule<Elf>`, never a runtime virtual
//! writer.

#![deny(missing_docs)]

mod debug;
mod ehframe;
mod module;

pub use crate::debug::LineMapping;
pub use crate::ehframe::{EhSymbol, RelocTarget, RelocWriter, WriterReloc};
pub use crate::module::{ObjectModule, SectionRef, SymbolScope};

/// The two supported relocatable formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinFormat {
    /// Microsoft COFF (`.obj`).
    Coff,
    /// ELF64 (`.o`).
    Elf,
}

/// Relocation kinds the code generator records against section bytes.
///
/// The addend convention is ELF-style throughout: the final value is
/// `S + A - P` for PC-relative kinds and `S + A` for absolute kinds. The
/// COFF mapping folds the addend into the section bytes (COFF stores
/// implicit addends) and compensates for `IMAGE_REL_AMD64_REL32`'s built-in
/// `P + 4`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute 8-byte pointer (`R_X86_64_64` / `IMAGE_REL_AMD64_ADDR64`).
    Abs8,
    /// Absolute 4-byte value (`R_X86_64_32` / `IMAGE_REL_AMD64_ADDR32`).
    Abs4,
    /// PC-relative 4-byte data reference (`R_X86_64_PC32` /
    /// `IMAGE_REL_AMD64_REL32`).
    X86PCRel4,
    /// PC-relative 4-byte call (`R_X86_64_PLT32` on ELF so the linker may
    /// route through the PLT; plain `REL32` on COFF).
    X86CallPCRel4,
    /// GOT-relative 4-byte reference (`R_X86_64_GOTPCREL`); ELF only.
    X86GOTPCRel4,
    /// Image-relative 4-byte RVA (`IMAGE_REL_AMD64_ADDR32NB`); COFF only.
    ImageRel4,
    /// Section-relative 4-byte offset (`IMAGE_REL_AMD64_SECREL`); COFF
    /// only, used by debug subsections.
    SectionRel4,
    /// Two-byte section index (`IMAGE_REL_AMD64_SECTION`); COFF only,
    /// paired with [`RelocKind::SectionRel4`] in debug subsections.
    SectionIndex2,
}

/// Statically selects the output format and the format-specific symbol
/// spellings the code generator needs.
///
/// Implemented only by [`Coff`] and [`Elf`]; the trait is sealed.
pub trait ObjectKind: sealed::Sealed + 'static {
    /// Which container format this kind writes.
    const FORMAT: BinFormat;

    /// Human-readable name for logs.
    const NAME: &'static str;

    /// Symbol the dynamic-cast runtime compares against: the Itanium
    /// `_ZTI<len><name>` typeinfo on ELF, the MSVC complete object locator
    /// `??_R4.?AV<name>@@6B@` on COFF.
    fn typeinfo_symbol(class: &str) -> String;

    /// Vtable symbol for a class (`_ZTV<len><name>` / `??_7<name>@@6B@`).
    fn vtable_symbol(class: &str) -> String;

    /// Slot filler for pure virtual functions.
    fn pure_virtual_symbol() -> &'static str;

    /// C++ personality / frame handler routine referenced from unwind data.
    fn personality_symbol() -> &'static str;
}

/// Marker type for COFF output.
pub struct Coff;

/// Marker type for ELF output.
pub struct Elf;

impl ObjectKind for Coff {
    const FORMAT: BinFormat = BinFormat::Coff;
    const NAME: &'static str = "coff";

    fn typeinfo_symbol(class: &str) -> String {
        format!("??_R4.?AV{class}@@6B@")
    }

    fn vtable_symbol(class: &str) -> String {
        format!("??_7{class}@@6B@")
    }

    fn pure_virtual_symbol() -> &'static str {
        "_purecall"
    }

    fn personality_symbol() -> &'static str {
        "__CxxFrameHandler3"
    }
}

impl ObjectKind for Elf {
    const FORMAT: BinFormat = BinFormat::Elf;
    const NAME: &'static str = "elf";

    fn typeinfo_symbol(class: &str) -> String {
        format!("_ZTI{}{}", class.len(), class)
    }

    fn vtable_symbol(class: &str) -> String {
        format!("_ZTV{}{}", class.len(), class)
    }

    fn pure_virtual_symbol() -> &'static str {
        "__cxa_pure_virtual"
    }

    fn personality_symbol() -> &'static str {
        "__gxx_personality_v0"
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Coff {}
    impl Sealed for super::Elf {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typeinfo_symbol_spellings() {
        assert_eq!(Elf::typeinfo_symbol("Derived"), "_ZTI7Derived");
        assert_eq!(Coff::typeinfo_symbol("Derived"), "??_R4.?AVDerived@@6B@");
        assert_eq!(Elf::vtable_symbol("B"), "_ZTV1B");
        assert_eq!(Coff::vtable_symbol("B"), "??_7B@@6B@");
    }
}
