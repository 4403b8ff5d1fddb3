//! The object module: sections, symbols and relocations over `object::write`.

use crate::{BinFormat, ObjectKind, RelocKind};
use anyhow::{bail, Context, Result};
use object::write::{
    Object, Relocation, StandardSegment, Symbol, SymbolId, SymbolSection,
};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationKind, SectionKind,
    SymbolFlags, SymbolKind,
};
use rustc_hash::FxHashMap;
use std::marker::PhantomData;
use std::path::Path;
use target_lexicon::Triple;

/// Sections the code generator can address directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SectionRef {
    /// Machine code.
    Text,
    /// Read-only data: literals, vtables, RTTI, LSDAs, FuncInfo.
    RData,
    /// Initialized globals.
    Data,
    /// Zero-initialized globals.
    Bss,
    /// COFF function table.
    Pdata,
    /// COFF unwind information.
    Xdata,
    /// ELF call-frame information.
    EhFrame,
    /// ELF language-specific data areas.
    GccExceptTable,
    /// Debug line information (`.debug$S` on COFF, DWARF on ELF).
    DebugLine,
}

/// Visibility of a defined symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolScope {
    /// Visible to the linker across objects.
    Export,
    /// Local to this object.
    Local,
}

/// A relocatable object under construction.
///
/// `K` picks COFF or ELF at compile time; all section naming and relocation
/// mapping flows from it. Symbols referenced by relocations but never
/// defined become external undefined symbols, the way a compiler references
/// `malloc` or the C++ runtime.
pub struct ObjectModule<K: ObjectKind> {
    obj: Object<'static>,
    sections: FxHashMap<SectionRef, object::write::SectionId>,
    named_sections: FxHashMap<String, object::write::SectionId>,
    symbols: FxHashMap<String, SymbolId>,
    sizes: FxHashMap<SectionRef, u32>,
    _kind: PhantomData<K>,
}

impl<K: ObjectKind> ObjectModule<K> {
    /// Create an empty module.
    pub fn new() -> Self {
        let format = match K::FORMAT {
            BinFormat::Coff => BinaryFormat::Coff,
            BinFormat::Elf => BinaryFormat::Elf,
        };
        let obj = Object::new(format, Architecture::X86_64, Endianness::Little);
        Self {
            obj,
            sections: FxHashMap::default(),
            named_sections: FxHashMap::default(),
            symbols: FxHashMap::default(),
            sizes: FxHashMap::default(),
            _kind: PhantomData,
        }
    }

    /// Create a module after checking that `triple` matches the static
    /// format choice (x86-64 and the right binary container).
    pub fn for_triple(triple: &Triple) -> Result<Self> {
        if triple.architecture != target_lexicon::Architecture::X86_64 {
            bail!("unsupported architecture: {}", triple.architecture);
        }
        let wants_coff = matches!(
            triple.operating_system,
            target_lexicon::OperatingSystem::Windows
        );
        match (wants_coff, K::FORMAT) {
            (true, BinFormat::Coff) | (false, BinFormat::Elf) => Ok(Self::new()),
            _ => bail!(
                "target {} does not match writer kind {}",
                triple,
                K::NAME
            ),
        }
    }

    fn section(&mut self, sref: SectionRef) -> object::write::SectionId {
        if let Some(&id) = self.sections.get(&sref) {
            return id;
        }
        let is_coff = K::FORMAT == BinFormat::Coff;
        let (name, kind): (&str, SectionKind) = match sref {
            SectionRef::Text => (".text", SectionKind::Text),
            SectionRef::RData => {
                if is_coff {
                    (".rdata", SectionKind::ReadOnlyData)
                } else {
                    (".rodata", SectionKind::ReadOnlyData)
                }
            }
            SectionRef::Data => (".data", SectionKind::Data),
            SectionRef::Bss => (".bss", SectionKind::UninitializedData),
            SectionRef::Pdata => (".pdata", SectionKind::ReadOnlyData),
            SectionRef::Xdata => (".xdata", SectionKind::ReadOnlyData),
            SectionRef::EhFrame => (".eh_frame", SectionKind::ReadOnlyData),
            SectionRef::GccExceptTable => (".gcc_except_table", SectionKind::ReadOnlyData),
            SectionRef::DebugLine => {
                if is_coff {
                    (".debug$S", SectionKind::Debug)
                } else {
                    (".debug_line", SectionKind::Debug)
                }
            }
        };
        let segment = self.obj.segment_name(StandardSegment::Data).to_vec();
        let id = self
            .obj
            .add_section(segment, name.as_bytes().to_vec(), kind);
        self.sections.insert(sref, id);
        id
    }

    /// Get or create a symbol by name. Unknown names become external
    /// undefined references.
    pub fn symbol_id(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.symbols.get(name) {
            return id;
        }
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.symbols.insert(name.to_string(), id);
        id
    }

    /// Define a function symbol at `offset` within `.text`.
    pub fn define_function(&mut self, name: &str, offset: u32, size: u32, scope: SymbolScope) {
        let text = self.section(SectionRef::Text);
        let scope = match scope {
            SymbolScope::Export => object::SymbolScope::Linkage,
            SymbolScope::Local => object::SymbolScope::Compilation,
        };
        if let Some(&id) = self.symbols.get(name) {
            // Previously referenced as external; turn it into a definition.
            let sym = self.obj.symbol_mut(id);
            sym.value = offset as u64;
            sym.size = size as u64;
            sym.kind = SymbolKind::Text;
            sym.scope = scope;
            sym.section = SymbolSection::Section(text);
            return;
        }
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset as u64,
            size: size as u64,
            kind: SymbolKind::Text,
            scope,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        self.symbols.insert(name.to_string(), id);
    }

    /// Update a function symbol's size once its final length is known.
    pub fn update_function_size(&mut self, name: &str, size: u32) {
        if let Some(&id) = self.symbols.get(name) {
            self.obj.symbol_mut(id).size = size as u64;
        }
    }

    /// Append bytes to a section, returning their offset.
    pub fn append_data(&mut self, sref: SectionRef, bytes: &[u8], align: u64) -> u32 {
        let id = self.section(sref);
        let offset = self.obj.append_section_data(id, bytes, align) as u32;
        self.sizes.insert(sref, offset + bytes.len() as u32);
        offset
    }

    /// Reserve zero-initialized space in `.bss`, returning its offset.
    pub fn append_bss(&mut self, size: u64, align: u64) -> u32 {
        let id = self.section(SectionRef::Bss);
        let offset = self.obj.section_mut(id).append_bss(size, align) as u32;
        self.sizes.insert(SectionRef::Bss, offset + size as u32);
        offset
    }

    /// Current size of a section's data.
    pub fn section_size(&mut self, sref: SectionRef) -> u32 {
        self.sizes.get(&sref).copied().unwrap_or(0)
    }

    /// Define a data symbol at `offset` within `sref`.
    pub fn define_data_symbol(
        &mut self,
        name: &str,
        sref: SectionRef,
        offset: u32,
        size: u32,
        scope: SymbolScope,
    ) {
        let section = self.section(sref);
        let scope = match scope {
            SymbolScope::Export => object::SymbolScope::Linkage,
            SymbolScope::Local => object::SymbolScope::Compilation,
        };
        if let Some(&id) = self.symbols.get(name) {
            let sym = self.obj.symbol_mut(id);
            sym.value = offset as u64;
            sym.size = size as u64;
            sym.kind = SymbolKind::Data;
            sym.scope = scope;
            sym.section = SymbolSection::Section(section);
            return;
        }
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset as u64,
            size: size as u64,
            kind: SymbolKind::Data,
            scope,
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
        self.symbols.insert(name.to_string(), id);
    }

    /// True if a symbol with this name has been created (defined or not).
    pub fn has_symbol(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    fn map_reloc(kind: RelocKind) -> Result<(RelocationKind, RelocationEncoding, u8)> {
        let is_coff = K::FORMAT == BinFormat::Coff;
        Ok(match kind {
            RelocKind::Abs8 => (RelocationKind::Absolute, RelocationEncoding::Generic, 64),
            RelocKind::Abs4 => (RelocationKind::Absolute, RelocationEncoding::Generic, 32),
            RelocKind::X86PCRel4 => (RelocationKind::Relative, RelocationEncoding::Generic, 32),
            RelocKind::X86CallPCRel4 => {
                if is_coff {
                    // COFF has no PLT; calls are plain REL32.
                    (RelocationKind::Relative, RelocationEncoding::X86Branch, 32)
                } else {
                    (
                        RelocationKind::PltRelative,
                        RelocationEncoding::X86Branch,
                        32,
                    )
                }
            }
            RelocKind::X86GOTPCRel4 => {
                if is_coff {
                    bail!("GOT-relative relocation is ELF-only");
                }
                (RelocationKind::GotRelative, RelocationEncoding::Generic, 32)
            }
            RelocKind::ImageRel4 => {
                if !is_coff {
                    bail!("image-relative relocation is COFF-only");
                }
                (
                    RelocationKind::Coff(object::pe::IMAGE_REL_AMD64_ADDR32NB),
                    RelocationEncoding::Generic,
                    32,
                )
            }
            RelocKind::SectionRel4 => {
                if !is_coff {
                    bail!("section-relative relocation is COFF-only");
                }
                (
                    RelocationKind::Coff(object::pe::IMAGE_REL_AMD64_SECREL),
                    RelocationEncoding::Generic,
                    32,
                )
            }
            RelocKind::SectionIndex2 => {
                if !is_coff {
                    bail!("section-index relocation is COFF-only");
                }
                (
                    RelocationKind::Coff(object::pe::IMAGE_REL_AMD64_SECTION),
                    RelocationEncoding::Generic,
                    16,
                )
            }
        })
    }

    fn named_debug_section(&mut self, name: &str) -> object::write::SectionId {
        if let Some(&id) = self.named_sections.get(name) {
            return id;
        }
        let segment = self.obj.segment_name(StandardSegment::Debug).to_vec();
        let id = self
            .obj
            .add_section(segment, name.as_bytes().to_vec(), SectionKind::Debug);
        self.named_sections.insert(name.to_string(), id);
        id
    }

    /// Append bytes to a debug section addressed by its DWARF name
    /// (`.debug_info`, `.debug_abbrev`, …), returning the offset.
    pub fn append_named_debug_section(&mut self, name: &str, bytes: &[u8]) -> u32 {
        let id = self.named_debug_section(name);
        self.obj.append_section_data(id, bytes, 1) as u32
    }

    /// Relocation from a named debug section to one of the fixed sections.
    pub fn add_named_debug_reloc_to_section(
        &mut self,
        from: &str,
        offset: u32,
        kind: RelocKind,
        target: SectionRef,
        addend: i64,
    ) -> Result<()> {
        let target_section = self.section(target);
        let symbol = self.obj.section_symbol(target_section);
        let section = self.named_debug_section(from);
        let (kind, encoding, size) = Self::map_reloc(kind)?;
        self.obj
            .add_relocation(
                section,
                Relocation {
                    offset: offset as u64,
                    size,
                    kind,
                    encoding,
                    symbol,
                    addend,
                },
            )
            .context("recording debug relocation")
    }

    /// Relocation between two named debug sections.
    pub fn add_named_debug_reloc_to_named(
        &mut self,
        from: &str,
        offset: u32,
        kind: RelocKind,
        target: &str,
        addend: i64,
    ) -> Result<()> {
        let target_section = self.named_debug_section(target);
        let symbol = self.obj.section_symbol(target_section);
        let section = self.named_debug_section(from);
        let (kind, encoding, size) = Self::map_reloc(kind)?;
        self.obj
            .add_relocation(
                section,
                Relocation {
                    offset: offset as u64,
                    size,
                    kind,
                    encoding,
                    symbol,
                    addend,
                },
            )
            .context("recording debug relocation")
    }

    /// Record a relocation against a named symbol.
    ///
    /// Addends follow the ELF `S + A - P` / `S + A` convention; the COFF
    /// path stores the addend as an implicit addend in the section bytes.
    pub fn add_reloc(
        &mut self,
        sref: SectionRef,
        offset: u32,
        kind: RelocKind,
        target: &str,
        addend: i64,
    ) -> Result<()> {
        let symbol = self.symbol_id(target);
        let section = self.section(sref);
        let (kind, encoding, size) = Self::map_reloc(kind)?;
        self.obj
            .add_relocation(
                section,
                Relocation {
                    offset: offset as u64,
                    size,
                    kind,
                    encoding,
                    symbol,
                    addend,
                },
            )
            .context("recording relocation")
    }

    /// Record a relocation whose target is a section rather than a named
    /// symbol (COFF debug subsections use these).
    pub fn add_section_reloc(
        &mut self,
        sref: SectionRef,
        offset: u32,
        kind: RelocKind,
        target: SectionRef,
        addend: i64,
    ) -> Result<()> {
        let target_section = self.section(target);
        let symbol = self.obj.section_symbol(target_section);
        let section = self.section(sref);
        let (kind, encoding, size) = Self::map_reloc(kind)?;
        self.obj
            .add_relocation(
                section,
                Relocation {
                    offset: offset as u64,
                    size,
                    kind,
                    encoding,
                    symbol,
                    addend,
                },
            )
            .context("recording section relocation")
    }

    /// Install the finished `.text` contents.
    pub fn set_text(&mut self, bytes: &[u8]) {
        let id = self.section(SectionRef::Text);
        let offset = self.obj.append_section_data(id, bytes, 16) as u32;
        self.sizes.insert(SectionRef::Text, offset + bytes.len() as u32);
    }

    /// Serialize and write the object file.
    pub fn write_to(self, path: &Path) -> Result<()> {
        let bytes = self.obj.write().context("serializing object file")?;
        std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Serialize to memory (tests).
    pub fn emit(self) -> Result<Vec<u8>> {
        self.obj.write().context("serializing object file")
    }
}

impl<K: ObjectKind> Default for ObjectModule<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Coff, Elf};

    #[test]
    fn undefined_reference_becomes_external_symbol() {
        let mut module = ObjectModule::<Elf>::new();
        module.set_text(&[0xe8, 0, 0, 0, 0]);
        module
            .add_reloc(SectionRef::Text, 1, RelocKind::X86CallPCRel4, "malloc", -4)
            .unwrap();
        let bytes = module.emit().unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn coff_rejects_got_relocs() {
        let mut module = ObjectModule::<Coff>::new();
        module.set_text(&[0; 8]);
        let err = module.add_reloc(SectionRef::Text, 0, RelocKind::X86GOTPCRel4, "x", -4);
        assert!(err.is_err());
    }

    #[test]
    fn function_definition_upgrades_external() {
        let mut module = ObjectModule::<Elf>::new();
        // Referenced first (a call), defined later in the same unit.
        let _ = module.symbol_id("_Z3foov");
        module.define_function("_Z3foov", 0x40, 12, SymbolScope::Export);
        module.update_function_size("_Z3foov", 16);
        assert!(module.has_symbol("_Z3foov"));
    }
}
