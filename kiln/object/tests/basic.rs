//! Round-trip tests: build a module, serialize it, parse it back.

use gimli::write::{
    Address, CallFrameInstruction, CommonInformationEntry, FrameDescriptionEntry, FrameTable,
};
use gimli::{Encoding, Format, Register};
use kiln_object::{
    Coff, EhSymbol, Elf, ObjectModule, RelocKind, SectionRef, SymbolScope,
};
use object::{Object as _, ObjectSection as _, ObjectSymbol as _};

#[test]
fn elf_function_with_call_reloc() {
    let mut module = ObjectModule::<Elf>::new();
    // A function that calls malloc: E8 + rel32 placeholder.
    module.set_text(&[0x55, 0xE8, 0, 0, 0, 0, 0x5D, 0xC3]);
    module.define_function("_Z4workv", 0, 8, SymbolScope::Export);
    module
        .add_reloc(SectionRef::Text, 2, RelocKind::X86CallPCRel4, "malloc", -4)
        .unwrap();

    let bytes = module.emit().unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(file.format(), object::BinaryFormat::Elf);

    let text = file.section_by_name(".text").unwrap();
    assert_eq!(text.data().unwrap().len(), 8);
    let relocs: Vec<_> = text.relocations().collect();
    assert_eq!(relocs.len(), 1);
    assert_eq!(relocs[0].0, 2);
    assert_eq!(relocs[0].1.kind(), object::RelocationKind::PltRelative);

    assert!(file
        .symbols()
        .any(|s| s.name() == Ok("malloc") && s.is_undefined()));
    let work = file.symbols().find(|s| s.name() == Ok("_Z4workv")).unwrap();
    assert_eq!(work.size(), 8);
}

#[test]
fn coff_sections_and_rtti_style_relocs() {
    let mut module = ObjectModule::<Coff>::new();
    module.set_text(&[0xC3]);
    module.define_function("main", 0, 1, SymbolScope::Export);

    // A vtable-style slot: ADDR64 to a locator symbol.
    let off = module.append_data(SectionRef::RData, &[0u8; 16], 8);
    module.define_data_symbol("??_7X@@6B@", SectionRef::RData, off + 8, 8, SymbolScope::Export);
    module
        .add_reloc(SectionRef::RData, off, RelocKind::Abs8, "??_R4X@@6B@", 0)
        .unwrap();
    // An image-relative field, as xdata uses.
    let x = module.append_data(SectionRef::Xdata, &[0u8; 8], 4);
    module
        .add_reloc(SectionRef::Xdata, x, RelocKind::ImageRel4, "__CxxFrameHandler3", 0)
        .unwrap();

    let bytes = module.emit().unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(file.format(), object::BinaryFormat::Coff);
    assert!(file.section_by_name(".rdata").is_some());
    assert!(file.section_by_name(".xdata").is_some());
    assert!(file
        .symbols()
        .any(|s| s.name() == Ok("??_7X@@6B@") && !s.is_undefined()));
}

#[test]
fn bss_reserves_zero_space() {
    let mut module = ObjectModule::<Elf>::new();
    module.set_text(&[0xC3]);
    let off = module.append_bss(64, 8);
    module.define_data_symbol("counter", SectionRef::Bss, off, 64, SymbolScope::Export);
    let bytes = module.emit().unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    let bss = file.section_by_name(".bss").unwrap();
    assert_eq!(bss.size(), 64);
}

#[test]
fn eh_frame_resolves_symbolic_addresses_to_relocs() {
    let mut module = ObjectModule::<Elf>::new();
    module.set_text(&[0x55, 0x48, 0x8B, 0xEC, 0x5D, 0xC3]);
    module.define_function("f", 0, 6, SymbolScope::Export);

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
    let mut table = FrameTable::default();
    let cie_id = table.add_cie(cie);
    let mut fde = FrameDescriptionEntry::new(
        Address::Symbol {
            symbol: 0,
            addend: 0,
        },
        6,
    );
    fde.add_instruction(1, CallFrameInstruction::CfaOffset(16));
    table.add_fde(cie_id, fde);

    module
        .write_eh_frame(table, &[EhSymbol::Name("f".to_string())])
        .unwrap();

    let bytes = module.emit().unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    let eh = file.section_by_name(".eh_frame").unwrap();
    assert!(eh.size() > 0);
    let relocs: Vec<_> = eh.relocations().collect();
    assert_eq!(relocs.len(), 1, "the FDE pc-begin field is relocated");
}

#[test]
fn line_info_sections_appear() {
    let mut module = ObjectModule::<Elf>::new();
    module.set_text(&[0x90; 16]);
    module.define_function("f", 0, 16, SymbolScope::Export);
    module
        .append_line_info(
            "demo.cpp",
            16,
            &[
                kiln_object::LineMapping { offset: 0, line: 3 },
                kiln_object::LineMapping { offset: 8, line: 4 },
            ],
        )
        .unwrap();
    let bytes = module.emit().unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert!(file.section_by_name(".debug_line").is_some());

    let mut coff = ObjectModule::<Coff>::new();
    coff.set_text(&[0x90; 16]);
    coff.define_function("f", 0, 16, SymbolScope::Export);
    coff.append_line_info(
        "demo.cpp",
        16,
        &[kiln_object::LineMapping { offset: 0, line: 3 }],
    )
    .unwrap();
    let bytes = coff.emit().unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert!(file.section_by_name(".debug$S").is_some());
}
