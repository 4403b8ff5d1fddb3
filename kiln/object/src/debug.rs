//! Debug line information: DWARF on ELF, a CodeView `.debug$S` line
//! subsection on COFF.

use crate::ehframe::{RelocTarget, RelocWriter};
use crate::module::{ObjectModule, SectionRef};
use crate::{BinFormat, ObjectKind, RelocKind};
use anyhow::{Context, Result};
use gimli::write::{
    Address, AttributeValue, DwarfUnit, LineProgram, LineString, Sections,
};
use gimli::{Encoding, Format, LineEncoding};

/// One source-line record: a `.text` offset and the 1-based line starting
/// there.
#[derive(Clone, Copy, Debug)]
pub struct LineMapping {
    /// Offset from the start of `.text`.
    pub offset: u32,
    /// Source line number.
    pub line: u32,
}

const CV_SIGNATURE_C13: u32 = 4;
const DEBUG_S_STRINGTABLE: u32 = 0xF3;
const DEBUG_S_FILECHKSMS: u32 = 0xF4;
const DEBUG_S_LINES: u32 = 0xF2;

impl<K: ObjectKind> ObjectModule<K> {
    /// Emit line debug information covering the whole `.text` contribution.
    ///
    /// `mappings` must be sorted by offset; empty mappings emit nothing.
    pub fn append_line_info(
        &mut self,
        source_path: &str,
        text_size: u32,
        mappings: &[LineMapping],
    ) -> Result<()> {
        if mappings.is_empty() || text_size == 0 {
            return Ok(());
        }
        match K::FORMAT {
            BinFormat::Elf => self.append_dwarf_lines(source_path, text_size, mappings),
            BinFormat::Coff => self.append_codeview_lines(source_path, text_size, mappings),
        }
    }

    fn append_dwarf_lines(
        &mut self,
        source_path: &str,
        text_size: u32,
        mappings: &[LineMapping],
    ) -> Result<()> {
        let encoding = Encoding {
            format: Format::Dwarf32,
            version: 4,
            address_size: 8,
        };
        let comp_dir = LineString::String(b".".to_vec());
        let comp_file = LineString::String(source_path.as_bytes().to_vec());
        let mut program = LineProgram::new(
            encoding,
            LineEncoding::default(),
            comp_dir,
            comp_file.clone(),
            None,
        );
        let dir = program.default_directory();
        let file = program.add_file(comp_file, dir, None);

        // Symbol index 0 is resolved below as "start of .text".
        program.begin_sequence(Some(Address::Symbol {
            symbol: 0,
            addend: 0,
        }));
        for m in mappings {
            let row = program.row();
            row.address_offset = m.offset as u64;
            row.file = file;
            row.line = m.line as u64;
            program.generate_row();
        }
        program.end_sequence(text_size as u64);

        let mut dwarf = DwarfUnit::new(encoding);
        dwarf.unit.line_program = program;
        let root = dwarf.unit.root();
        let entry = dwarf.unit.get_mut(root);
        entry.set(
            gimli::DW_AT_producer,
            AttributeValue::String(b"kiln".to_vec()),
        );
        entry.set(
            gimli::DW_AT_name,
            AttributeValue::String(source_path.as_bytes().to_vec()),
        );
        entry.set(
            gimli::DW_AT_low_pc,
            AttributeValue::Address(Address::Symbol {
                symbol: 0,
                addend: 0,
            }),
        );
        entry.set(
            gimli::DW_AT_high_pc,
            AttributeValue::Udata(text_size as u64),
        );

        let mut sections = Sections::new(RelocWriter::new());
        dwarf.write(&mut sections).context("rendering DWARF")?;

        // First pass: place every non-empty section so cross-section
        // relocations can resolve.
        let mut placed: Vec<(&'static str, Vec<u8>, Vec<crate::ehframe::WriterReloc>)> =
            Vec::new();
        sections
            .for_each(|id, writer: &RelocWriter| {
                if !writer.slice().is_empty() {
                    placed.push((id.name(), writer.slice().to_vec(), writer.relocs.clone()));
                }
                Ok::<(), gimli::write::Error>(())
            })
            .context("collecting DWARF sections")?;

        for (name, bytes, relocs) in placed {
            let base = self.append_named_debug_section(name, &bytes);
            for r in relocs {
                let kind = if r.size == 64 {
                    RelocKind::Abs8
                } else {
                    RelocKind::Abs4
                };
                match r.target {
                    RelocTarget::SymbolIndex(_) => {
                        // All symbolic addresses in this unit are .text-based.
                        self.add_named_debug_reloc_to_section(
                            name,
                            base + r.offset,
                            kind,
                            SectionRef::Text,
                            r.addend,
                        )?;
                    }
                    RelocTarget::DebugSection(target) => {
                        self.add_named_debug_reloc_to_named(
                            name,
                            base + r.offset,
                            kind,
                            target,
                            r.addend,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn append_codeview_lines(
        &mut self,
        source_path: &str,
        text_size: u32,
        mappings: &[LineMapping],
    ) -> Result<()> {
        let mut data = Vec::new();
        data.extend_from_slice(&CV_SIGNATURE_C13.to_le_bytes());

        // String table: a leading NUL, then the source path.
        let path_offset = 1u32;
        let mut strtab = vec![0u8];
        strtab.extend_from_slice(source_path.as_bytes());
        strtab.push(0);
        push_subsection(&mut data, DEBUG_S_STRINGTABLE, &strtab);

        // One checksum entry (kind "none") referencing the path.
        let mut chksms = Vec::new();
        chksms.extend_from_slice(&path_offset.to_le_bytes());
        chksms.push(0); // checksum length
        chksms.push(0); // CHKSUM_TYPE_NONE
        while chksms.len() % 4 != 0 {
            chksms.push(0);
        }
        push_subsection(&mut data, DEBUG_S_FILECHKSMS, &chksms);

        // The lines subsection itself. The leading SECREL/SECTION pair is
        // relocated against the start of .text.
        let mut lines = Vec::new();
        lines.extend_from_slice(&0u32.to_le_bytes()); // contribution offset (SECREL)
        lines.extend_from_slice(&0u16.to_le_bytes()); // section index (SECTION)
        lines.extend_from_slice(&0u16.to_le_bytes()); // flags
        lines.extend_from_slice(&text_size.to_le_bytes());
        lines.extend_from_slice(&0u32.to_le_bytes()); // file checksum offset
        lines.extend_from_slice(&(mappings.len() as u32).to_le_bytes());
        let block_size = 12 + 8 * mappings.len() as u32;
        lines.extend_from_slice(&block_size.to_le_bytes());
        for m in mappings {
            lines.extend_from_slice(&m.offset.to_le_bytes());
            // Bit 31 marks the row as a statement boundary.
            lines.extend_from_slice(&(m.line | 0x8000_0000).to_le_bytes());
        }
        let lines_offset = data.len() as u32 + 8;
        push_subsection(&mut data, DEBUG_S_LINES, &lines);

        let base = self.append_data(SectionRef::DebugLine, &data, 4);
        self.add_section_reloc(
            SectionRef::DebugLine,
            base + lines_offset,
            RelocKind::SectionRel4,
            SectionRef::Text,
            0,
        )?;
        self.add_section_reloc(
            SectionRef::DebugLine,
            base + lines_offset + 4,
            RelocKind::SectionIndex2,
            SectionRef::Text,
            0,
        )?;
        Ok(())
    }
}

fn push_subsection(out: &mut Vec<u8>, kind: u32, payload: &[u8]) {
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}
