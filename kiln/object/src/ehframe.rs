//! `.eh_frame` assembly and the relocation-capturing `gimli` writer.
//!
//! The code generator builds a `gimli::write::FrameTable` whose addresses
//! are `Address::Symbol { symbol, .. }` indices into a list it supplies.
//! Rendering that table needs a writer that turns symbolic addresses into
//! relocation records instead of failing; [`RelocWriter`] does exactly
//! that, and is reused for the DWARF debug sections.

use crate::module::{ObjectModule, SectionRef};
use crate::{ObjectKind, RelocKind};
use anyhow::{Context, Result};
use gimli::write::{Address, EhFrame, EndianVec, FrameTable, Writer};
use gimli::{LittleEndian, SectionId};

/// What a captured relocation points at.
#[derive(Clone, Debug)]
pub enum RelocTarget {
    /// Index into the symbol list supplied alongside the frame table.
    SymbolIndex(usize),
    /// A DWARF section, by its canonical name (cross-section offsets such
    /// as `DW_AT_stmt_list`).
    DebugSection(&'static str),
}

/// One relocation captured while rendering gimli output.
#[derive(Clone, Debug)]
pub struct WriterReloc {
    /// Offset within the rendered bytes.
    pub offset: u32,
    /// Relocation width in bits (32 or 64).
    pub size: u8,
    /// Relocation target.
    pub target: RelocTarget,
    /// Addend.
    pub addend: i64,
}

/// An `EndianVec` that records symbolic addresses as relocations.
#[derive(Clone)]
pub struct RelocWriter {
    inner: EndianVec<LittleEndian>,
    /// Captured relocations, in emission order.
    pub relocs: Vec<WriterReloc>,
}

impl RelocWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self {
            inner: EndianVec::new(LittleEndian),
            relocs: Vec::new(),
        }
    }

    /// The rendered bytes.
    pub fn into_parts(self) -> (Vec<u8>, Vec<WriterReloc>) {
        (self.inner.into_vec(), self.relocs)
    }

    /// Borrow the rendered bytes.
    pub fn slice(&self) -> &[u8] {
        self.inner.slice()
    }
}

impl Default for RelocWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer for RelocWriter {
    type Endian = LittleEndian;

    fn endian(&self) -> Self::Endian {
        LittleEndian
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn write(&mut self, bytes: &[u8]) -> gimli::write::Result<()> {
        self.inner.write(bytes)
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> gimli::write::Result<()> {
        self.inner.write_at(offset, bytes)
    }

    fn write_address(&mut self, address: Address, size: u8) -> gimli::write::Result<()> {
        match address {
            Address::Constant(val) => self.write_udata(val, size),
            Address::Symbol { symbol, addend } => {
                self.relocs.push(WriterReloc {
                    offset: self.len() as u32,
                    size: size * 8,
                    target: RelocTarget::SymbolIndex(symbol),
                    addend,
                });
                self.write_udata(0, size)
            }
        }
    }

    fn write_offset(
        &mut self,
        val: usize,
        section: SectionId,
        size: u8,
    ) -> gimli::write::Result<()> {
        self.relocs.push(WriterReloc {
            offset: self.len() as u32,
            size: size * 8,
            target: RelocTarget::DebugSection(section.name()),
            addend: val as i64,
        });
        self.write_udata(0, size)
    }

    fn write_offset_at(
        &mut self,
        offset: usize,
        val: usize,
        section: SectionId,
        size: u8,
    ) -> gimli::write::Result<()> {
        self.relocs.push(WriterReloc {
            offset: offset as u32,
            size: size * 8,
            target: RelocTarget::DebugSection(section.name()),
            addend: val as i64,
        });
        self.write_udata_at(offset, 0, size)
    }
}

/// How an entry in the frame-table symbol list resolves.
#[derive(Clone, Debug)]
pub enum EhSymbol {
    /// A named symbol (a function, the personality routine).
    Name(String),
    /// An offset inside one of our own sections (an LSDA).
    Section(SectionRef, u32),
}

impl<K: ObjectKind> ObjectModule<K> {
    /// Render a frame table into `.eh_frame`, resolving `Address::Symbol`
    /// indices through `symbols`.
    pub fn write_eh_frame(&mut self, table: FrameTable, symbols: &[EhSymbol]) -> Result<()> {
        let mut eh = EhFrame(RelocWriter::new());
        table
            .write_eh_frame(&mut eh)
            .context("rendering .eh_frame")?;
        let (bytes, relocs) = eh.0.into_parts();
        let base = self.append_data(SectionRef::EhFrame, &bytes, 8);
        for r in relocs {
            let kind = if r.size == 64 {
                RelocKind::Abs8
            } else {
                RelocKind::Abs4
            };
            match r.target {
                RelocTarget::SymbolIndex(i) => match &symbols[i] {
                    EhSymbol::Name(name) => {
                        self.add_reloc(SectionRef::EhFrame, base + r.offset, kind, name, r.addend)?
                    }
                    EhSymbol::Section(sref, off) => self.add_section_reloc(
                        SectionRef::EhFrame,
                        base + r.offset,
                        kind,
                        *sref,
                        *off as i64 + r.addend,
                    )?,
                },
                RelocTarget::DebugSection(_) => {
                    // Frame tables never reference debug sections.
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::write::{CallFrameInstruction, CommonInformationEntry, FrameDescriptionEntry};
    use gimli::{Encoding, Format, Register};

    fn x64_cie() -> CommonInformationEntry {
        let mut cie = CommonInformationEntry::new(
            Encoding {
                address_size: 8,
                format: Format::Dwarf32,
                version: 1,
            },
            1,
            -8,
            Register(16),
        );
        cie.add_instruction(CallFrameInstruction::Cfa(Register(7), 8));
        cie.add_instruction(CallFrameInstruction::Offset(Register(16), -8));
        cie
    }

    #[test]
    fn symbolic_fde_address_becomes_reloc() {
        let mut table = FrameTable::default();
        let cie = table.add_cie(x64_cie());
        let mut fde = FrameDescriptionEntry::new(
            Address::Symbol {
                symbol: 0,
                addend: 0,
            },
            0x20,
        );
        fde.add_instruction(1, CallFrameInstruction::CfaOffset(16));
        table.add_fde(cie, fde);

        let mut eh = EhFrame(RelocWriter::new());
        table.write_eh_frame(&mut eh).unwrap();
        let (bytes, relocs) = eh.0.into_parts();
        assert!(!bytes.is_empty());
        assert_eq!(relocs.len(), 1);
        assert!(matches!(relocs[0].target, RelocTarget::SymbolIndex(0)));
        assert_eq!(relocs[0].size, 64);
    }
}
