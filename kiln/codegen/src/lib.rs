//! Single-pass x86-64 code generation for the Kiln C++ back end.
//!
//! [`convert`] drives everything: it walks a translation unit's IR once,
//! in order, emitting machine code and metadata as it goes, then writes
//! one relocatable object file. The output format is a compile-time
//! choice (`convert::<Coff>` or `convert::<Elf>`), never a runtime
//! writer.

#![deny(missing_docs)]

pub mod abi;
pub mod asm;
pub mod buffer;
mod dyncast;
mod eh;
pub mod frame;
pub mod regalloc;
mod result;
mod rtti;
pub mod timing;

pub(crate) mod lower;

pub use crate::result::{CodegenError, CodegenResult};
pub use kiln_ir::CompilationContext;
pub use kiln_object::{Coff, Elf, ObjectKind};

use crate::abi::CallConv;
use crate::eh::{CfiInst, CfiRule};
use crate::lower::Lowerer;
use crate::timing::{Pass, PassTimes};
use gimli::write::{
    Address, CallFrameInstruction, CommonInformationEntry, FrameDescriptionEntry, FrameTable,
};
use gimli::{Encoding, Format, Register};
use kiln_ir::Ir;
use kiln_object::{EhSymbol, LineMapping, ObjectModule, SectionRef};
use std::path::Path;

// DWARF register numbering for x86-64.
const DW_REG_RBP: u16 = 6;
const DW_REG_RSP: u16 = 7;
const DW_REG_RA: u16 = 16;

/// Convert a translation unit's IR into a relocatable object file.
///
/// On a per-function codegen failure the function's partial output is
/// discarded and conversion continues; the unit still produces an object
/// file and the error count is reported through
/// [`CodegenError::PartialFailure`]. Semantic and writer errors abort.
pub fn convert<K: ObjectKind>(
    ctx: &mut CompilationContext,
    ir: &Ir,
    output_path: &Path,
    source_path: &Path,
    show_timing: bool,
) -> CodegenResult<()> {
    let conv = match K::FORMAT {
        kiln_object::BinFormat::Coff => CallConv::WindowsFastcall,
        kiln_object::BinFormat::Elf => CallConv::SystemV,
    };
    log::info!(
        "converting {} instructions for {}",
        ir.instructions.len(),
        K::NAME
    );
    let mut times = PassTimes::new();
    let module = ObjectModule::<K>::new();
    let mut lw = Lowerer::new(ctx, conv, module);

    let token = times.start(Pass::Lower);
    for (i, inst) in ir.instructions.iter().enumerate() {
        let rest = &ir.instructions[i + 1..];
        let next_opcode = rest.first().map(|n| n.opcode);
        match lw.lower(inst, rest, next_opcode) {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                log::error!("{e}");
                lw.skipping = true;
            }
            Err(e) => return Err(e),
        }
    }
    times.end(token);

    let token = times.start(Pass::Finalize);
    lw.finalize_current_function()?;
    times.end(token);

    let token = times.start(Pass::UnitFinalize);
    lw.emit_vtables()?;
    if lw.needs_dyncast_runtime {
        lw.emit_dynamic_cast_runtime()?;
    }

    let Lowerer {
        buf,
        mut module,
        finished,
        error_count,
        ..
    } = lw;

    module.set_text(buf.data());
    for r in buf.relocs() {
        module.add_reloc(SectionRef::Text, r.offset, r.kind, &r.target, r.addend)?;
    }

    if K::FORMAT == kiln_object::BinFormat::Elf && !finished.is_empty() {
        write_frame_table::<K>(&mut module, &finished)?;
    }

    let mappings: Vec<LineMapping> = buf
        .lines()
        .iter()
        .map(|&(offset, line)| LineMapping { offset, line })
        .collect();
    module.append_line_info(
        &source_path.display().to_string(),
        buf.data().len() as u32,
        &mappings,
    )?;
    times.end(token);

    let token = times.start(Pass::Write);
    module.write_to(output_path)?;
    times.end(token);

    if show_timing {
        print!("{times}");
    }
    if error_count > 0 {
        return Err(CodegenError::PartialFailure { failed: error_count });
    }
    Ok(())
}

fn x64_cie() -> CommonInformationEntry {
    let mut cie = CommonInformationEntry::new(
        Encoding {
            address_size: 8,
            format: Format::Dwarf32,
            version: 1,
        },
        1,
        -8,
        Register(DW_REG_RA),
    );
    cie.add_instruction(CallFrameInstruction::Cfa(Register(DW_REG_RSP), 8));
    cie.add_instruction(CallFrameInstruction::Offset(Register(DW_REG_RA), -8));
    cie
}

fn cfi_to_fde(fde: &mut FrameDescriptionEntry, cfi: &[CfiInst]) {
    for inst in cfi {
        match inst.rule {
            CfiRule::PushRbp => {
                fde.add_instruction(inst.offset, CallFrameInstruction::CfaOffset(16));
                fde.add_instruction(
                    inst.offset,
                    CallFrameInstruction::Offset(Register(DW_REG_RBP), -16),
                );
            }
            CfiRule::SetRbp => {
                fde.add_instruction(
                    inst.offset,
                    CallFrameInstruction::CfaRegister(Register(DW_REG_RBP)),
                );
            }
            CfiRule::RememberState => {
                fde.add_instruction(inst.offset, CallFrameInstruction::RememberState);
            }
            CfiRule::RestoreState => {
                fde.add_instruction(inst.offset, CallFrameInstruction::RestoreState);
            }
        }
    }
}

/// Render every function's FDE into `.eh_frame`. Functions with an LSDA
/// share a CIE that names the personality routine; the rest use a plain
/// CIE.
fn write_frame_table<K: ObjectKind>(
    module: &mut ObjectModule<K>,
    finished: &[lower::FinishedFunction],
) -> CodegenResult<()> {
    let mut table = FrameTable::default();
    let mut symbols: Vec<EhSymbol> = Vec::new();

    let plain_cie = table.add_cie(x64_cie());
    let eh_cie = if finished.iter().any(|f| f.lsda_offset.is_some()) {
        let mut cie = x64_cie();
        let idx = symbols.len();
        symbols.push(EhSymbol::Name(K::personality_symbol().to_string()));
        cie.personality = Some((
            gimli::constants::DW_EH_PE_absptr,
            Address::Symbol {
                symbol: idx,
                addend: 0,
            },
        ));
        cie.lsda_encoding = Some(gimli::constants::DW_EH_PE_absptr);
        Some(table.add_cie(cie))
    } else {
        None
    };

    for f in finished {
        let sym = symbols.len();
        symbols.push(EhSymbol::Name(f.mangled.clone()));
        let mut fde = FrameDescriptionEntry::new(
            Address::Symbol {
                symbol: sym,
                addend: 0,
            },
            f.len,
        );
        cfi_to_fde(&mut fde, &f.cfi);
        match f.lsda_offset {
            Some(off) => {
                let lsda_sym = symbols.len();
                symbols.push(EhSymbol::Section(SectionRef::GccExceptTable, off));
                fde.lsda = Some(Address::Symbol {
                    symbol: lsda_sym,
                    addend: 0,
                });
                table.add_fde(eh_cie.expect("EH CIE exists"), fde);
            }
            None => {
                table.add_fde(plain_cie, fde);
            }
        }
    }
    module.write_eh_frame(table, &symbols)?;
    Ok(())
}
