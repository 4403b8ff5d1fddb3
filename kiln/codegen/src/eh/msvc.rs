//! Windows x64 exception metadata: UNWIND_INFO, FH3 `FuncInfo` chains and
//! SEH scope tables, placed in `.xdata` with a `.pdata` entry per
//! function.

use super::SehTryBlock;
use crate::lower::{FuncState, Lowerer};
use crate::result::CodegenResult;
use kiln_object::{ObjectKind, RelocKind, SectionRef};

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;

const REG_RBP: u8 = 5;

const FH3_MAGIC: u32 = 0x1993_0522;

/// UNWIND_INFO header fields plus the unwind-code slots, built for one of
/// the two prologue shapes.
pub(crate) struct UnwindCodes {
    pub prolog_size: u8,
    pub frame_reg_and_offset: u8,
    /// Encoded slots, two bytes each, reverse chronological.
    pub codes: Vec<u8>,
}

fn push_code(out: &mut Vec<u8>, prolog_offset: u8, op: u8, info: u8) {
    out.push(prolog_offset);
    out.push(op | (info << 4));
}

fn push_alloc(out: &mut Vec<u8>, prolog_offset: u8, size: u32) {
    if size == 0 {
        return;
    }
    if size <= 128 {
        push_code(out, prolog_offset, UWOP_ALLOC_SMALL, ((size - 8) / 8) as u8);
    } else if size < 512 * 1024 {
        push_code(out, prolog_offset, UWOP_ALLOC_LARGE, 0);
        let scaled = (size / 8) as u16;
        out.extend_from_slice(&scaled.to_le_bytes());
    } else {
        push_code(out, prolog_offset, UWOP_ALLOC_LARGE, 1);
        out.extend_from_slice(&size.to_le_bytes());
    }
}

/// The unwind codes for our two prologue shapes. Codes appear in reverse
/// order of the prologue instructions, each tagged with the offset just
/// past its instruction.
pub(crate) fn build_unwind_codes(eh_prologue: bool, frame_size: u32) -> UnwindCodes {
    let mut codes = Vec::new();
    if eh_prologue {
        // push rbp (1) | sub rsp, imm32 (8) | lea rbp, [rsp+N] (16)
        let frame_offset = (frame_size / 16).min(15) as u8;
        if frame_size / 16 > 15 {
            log::warn!(
                "EH frame of {frame_size} bytes exceeds the UNWIND_INFO frame-offset range"
            );
        }
        push_code(&mut codes, 16, UWOP_SET_FPREG, 0);
        push_alloc(&mut codes, 8, frame_size);
        push_code(&mut codes, 1, UWOP_PUSH_NONVOL, REG_RBP);
        UnwindCodes {
            prolog_size: 16,
            frame_reg_and_offset: REG_RBP | (frame_offset << 4),
            codes,
        }
    } else {
        // push rbp (1) | mov rbp, rsp (4) | sub rsp, imm32 (11)
        push_alloc(&mut codes, 11, frame_size);
        push_code(&mut codes, 4, UWOP_SET_FPREG, 0);
        push_code(&mut codes, 1, UWOP_PUSH_NONVOL, REG_RBP);
        UnwindCodes {
            prolog_size: 11,
            frame_reg_and_offset: REG_RBP,
            codes,
        }
    }
}

fn le32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Where an `.xdata` field points.
enum XdataTarget {
    /// An offset within `.text`.
    Text(u32),
    /// An offset within `.xdata` itself.
    Xdata(u32),
    /// A named symbol (handlers, type descriptors).
    Symbol(String),
}

fn push_seh_scope_entry(
    xdata: &mut Vec<u8>,
    b: &SehTryBlock,
    start: u32,
    relocs: &mut Vec<(u32, XdataTarget)>,
) {
    relocs.push((xdata.len() as u32, XdataTarget::Text(start + b.try_start)));
    le32(xdata, 0);
    relocs.push((xdata.len() as u32, XdataTarget::Text(start + b.try_end)));
    le32(xdata, 0);
    if let Some(filter) = b.filter_offset {
        relocs.push((xdata.len() as u32, XdataTarget::Text(start + filter)));
        le32(xdata, 0);
    } else if let Some(finally) = b.finally_offset {
        relocs.push((xdata.len() as u32, XdataTarget::Text(start + finally)));
        le32(xdata, 0);
    } else {
        // Constant filter: EXCEPTION_EXECUTE_HANDLER collapses to 1.
        le32(xdata, b.filter_constant.unwrap_or(1) as u32);
    }
    if let Some(except) = b.except_offset {
        relocs.push((xdata.len() as u32, XdataTarget::Text(start + except)));
        le32(xdata, 0);
    } else {
        le32(xdata, 0);
    }
}

impl<'a, K: ObjectKind> Lowerer<'a, K> {
    fn xdata_text_rva(
        &mut self,
        xdata_off: u32,
        text_off: u32,
    ) -> CodegenResult<()> {
        self.module.add_section_reloc(
            SectionRef::Xdata,
            xdata_off,
            RelocKind::ImageRel4,
            SectionRef::Text,
            text_off as i64,
        )?;
        Ok(())
    }

    fn xdata_self_rva(&mut self, at: u32, target: u32) -> CodegenResult<()> {
        self.module.add_section_reloc(
            SectionRef::Xdata,
            at,
            RelocKind::ImageRel4,
            SectionRef::Xdata,
            target as i64,
        )?;
        Ok(())
    }

    /// Emit `.xdata` + `.pdata` for one finished function.
    pub(crate) fn finish_coff_function(
        &mut self,
        fs: &FuncState,
        func_len: u32,
        frame_size: u32,
    ) -> CodegenResult<()> {
        let is_seh = !fs.seh_blocks.is_empty();
        let mut is_cpp = !fs.try_blocks.is_empty();
        if is_seh && is_cpp {
            log::warn!(
                "function `{}` mixes SEH and C++ exception handling; using SEH",
                fs.mangled
            );
            is_cpp = false;
        }

        // The codes must describe the prologue that was actually emitted,
        // which was chosen by the pre-scan before any SEH conflict was
        // known.
        let unwind = build_unwind_codes(fs.has_cpp_eh, frame_size);
        let flags: u8 = if is_seh || is_cpp { 0x03 } else { 0 };

        let xdata_base = self.module.section_size(SectionRef::Xdata);
        let mut xdata: Vec<u8> = Vec::new();
        let count_of_codes = unwind.codes.len() / 2;
        xdata.push(0x01 | (flags << 3));
        xdata.push(unwind.prolog_size);
        xdata.push(count_of_codes as u8);
        xdata.push(unwind.frame_reg_and_offset);
        xdata.extend_from_slice(&unwind.codes);
        // The code array is padded to an even slot count.
        if count_of_codes % 2 == 1 {
            xdata.extend_from_slice(&[0, 0]);
        }

        let mut relocs: Vec<(u32, XdataTarget)> = Vec::new();

        if is_seh || is_cpp {
            let handler = if is_cpp {
                "__CxxFrameHandler3"
            } else {
                "__C_specific_handler"
            };
            relocs.push((xdata.len() as u32, XdataTarget::Symbol(handler.into())));
            le32(&mut xdata, 0);
        }

        if is_seh {
            // Scope table follows the handler RVA directly.
            le32(&mut xdata, fs.seh_blocks.len() as u32);
            for b in &fs.seh_blocks {
                push_seh_scope_entry(&mut xdata, b, fs.start, &mut relocs);
            }
        }

        if is_cpp {
            // FuncInfo RVA slot, then the FuncInfo itself with its maps.
            let funcinfo_rva_at = xdata.len() as u32;
            le32(&mut xdata, 0);

            let funcinfo_off = xdata.len() as u32;
            relocs.push((funcinfo_rva_at, XdataTarget::Xdata(funcinfo_off)));

            let max_state = fs.next_state;
            let n_try = fs.try_blocks.len() as u32;

            // Layout: FuncInfo (40 bytes), UnwindMap, TryBlockMap,
            // HandlerType arrays, IpToStateMap.
            let unwind_map_off = funcinfo_off + 40;
            let try_map_off = unwind_map_off + max_state as u32 * 8;
            let handlers_off = try_map_off + n_try * 20;
            let total_handlers: u32 = fs.try_blocks.iter().map(|t| t.handlers.len() as u32).sum();
            let ip_map_off = handlers_off + total_handlers * 20;

            // IP-to-state rows: function entry, then the transitions each
            // try block induces.
            let mut ip_rows: Vec<(u32, i32)> = vec![(0, -1)];
            for tb in &fs.try_blocks {
                ip_rows.push((tb.try_start, tb.state));
                ip_rows.push((tb.try_end, tb.parent_state));
                if let Some(h) = tb.handlers.first() {
                    ip_rows.push((h.handler_offset, tb.catch_state));
                }
                ip_rows.push((tb.catch_end, tb.parent_state));
            }
            ip_rows.sort_by_key(|&(ip, _)| ip);
            ip_rows.dedup_by_key(|&mut (ip, _)| ip);

            // FuncInfo.
            le32(&mut xdata, FH3_MAGIC);
            le32(&mut xdata, max_state as u32);
            relocs.push((xdata.len() as u32, XdataTarget::Xdata(unwind_map_off)));
            le32(&mut xdata, 0);
            le32(&mut xdata, n_try);
            relocs.push((xdata.len() as u32, XdataTarget::Xdata(try_map_off)));
            le32(&mut xdata, 0);
            le32(&mut xdata, ip_rows.len() as u32);
            relocs.push((xdata.len() as u32, XdataTarget::Xdata(ip_map_off)));
            le32(&mut xdata, 0);
            // dispUnwindHelp: the state variable at [rbp-8], measured from
            // the establisher frame.
            le32(&mut xdata, frame_size.wrapping_sub(8));
            le32(&mut xdata, 0); // dispESTypeList
            le32(&mut xdata, 1); // EHFlags

            // UnwindMap: one entry per state, no cleanup actions.
            for state in 0..max_state {
                let to = fs
                    .try_blocks
                    .iter()
                    .find(|t| t.state == state || t.catch_state == state)
                    .map(|t| t.parent_state)
                    .unwrap_or(-1);
                le32(&mut xdata, to as u32);
                le32(&mut xdata, 0);
            }

            // TryBlockMap.
            let mut running_handlers = handlers_off;
            for tb in &fs.try_blocks {
                le32(&mut xdata, tb.state as u32);
                le32(&mut xdata, tb.state as u32);
                le32(&mut xdata, tb.catch_state as u32);
                le32(&mut xdata, tb.handlers.len() as u32);
                relocs.push((xdata.len() as u32, XdataTarget::Xdata(running_handlers)));
                le32(&mut xdata, 0);
                running_handlers += tb.handlers.len() as u32 * 20;
            }

            // HandlerType arrays.
            for tb in &fs.try_blocks {
                for h in &tb.handlers {
                    let adjectives: u32 = if h.is_catch_all { 0x40 } else { 0 };
                    le32(&mut xdata, adjectives);
                    if h.is_catch_all {
                        le32(&mut xdata, 0);
                    } else {
                        let td = match (&h.class_name, h.builtin) {
                            (Some(class), _) => format!("??_R0.?AV{class}@@"),
                            (None, _) => "??_R0H@8".to_string(),
                        };
                        relocs.push((xdata.len() as u32, XdataTarget::Symbol(td)));
                        le32(&mut xdata, 0);
                    }
                    // dispCatchObj, establisher-relative.
                    let disp = if h.catch_obj_offset != 0 {
                        (frame_size as i64 + h.catch_obj_offset as i64) as u32
                    } else {
                        0
                    };
                    le32(&mut xdata, disp);
                    relocs.push((
                        xdata.len() as u32,
                        XdataTarget::Text(fs.start + h.handler_offset),
                    ));
                    le32(&mut xdata, 0);
                    le32(&mut xdata, 0); // dispFrame
                }
            }

            // IpToStateMap.
            for (ip, state) in &ip_rows {
                relocs.push((xdata.len() as u32, XdataTarget::Text(fs.start + ip)));
                le32(&mut xdata, 0);
                le32(&mut xdata, *state as u32);
            }
        }

        self.module.append_data(SectionRef::Xdata, &xdata, 4);
        for (at, target) in relocs {
            let at = xdata_base + at;
            match target {
                XdataTarget::Text(off) => self.xdata_text_rva(at, off)?,
                XdataTarget::Xdata(off) => self.xdata_self_rva(at, xdata_base + off)?,
                XdataTarget::Symbol(sym) => {
                    self.module
                        .add_reloc(SectionRef::Xdata, at, RelocKind::ImageRel4, &sym, 0)?;
                }
            }
        }

        // RUNTIME_FUNCTION: start, end, unwind info.
        let pdata_base = self.module.section_size(SectionRef::Pdata);
        let entry = [0u8; 12];
        self.module.append_data(SectionRef::Pdata, &entry, 4);
        self.module.add_section_reloc(
            SectionRef::Pdata,
            pdata_base,
            RelocKind::ImageRel4,
            SectionRef::Text,
            fs.start as i64,
        )?;
        self.module.add_section_reloc(
            SectionRef::Pdata,
            pdata_base + 4,
            RelocKind::ImageRel4,
            SectionRef::Text,
            (fs.start + func_len) as i64,
        )?;
        self.module.add_section_reloc(
            SectionRef::Pdata,
            pdata_base + 8,
            RelocKind::ImageRel4,
            SectionRef::Xdata,
            xdata_base as i64,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traditional_prologue_codes_reverse_the_stack_effects() {
        let u = build_unwind_codes(false, 0x40);
        assert_eq!(u.prolog_size, 11);
        assert_eq!(u.frame_reg_and_offset, REG_RBP);
        // alloc-small(0x40) @11, set-fpreg @4, push rbp @1.
        assert_eq!(
            u.codes,
            vec![11, UWOP_ALLOC_SMALL | (7 << 4), 4, UWOP_SET_FPREG, 1, UWOP_PUSH_NONVOL | (5 << 4)]
        );
    }

    #[test]
    fn eh_prologue_encodes_frame_offset() {
        let u = build_unwind_codes(true, 0x60);
        assert_eq!(u.prolog_size, 16);
        // FrameOffset is the allocation scaled by 16.
        assert_eq!(u.frame_reg_and_offset, REG_RBP | ((0x60 / 16) << 4));
        assert_eq!(u.codes[0], 16);
        assert_eq!(u.codes[1], UWOP_SET_FPREG);
    }

    #[test]
    fn large_allocations_take_extra_slots() {
        let u = build_unwind_codes(false, 0x2000);
        // UWOP_ALLOC_LARGE with a scaled u16 payload.
        assert_eq!(u.codes[1], UWOP_ALLOC_LARGE);
        let scaled = u16::from_le_bytes([u.codes[2], u.codes[3]]);
        assert_eq!(scaled as u32 * 8, 0x2000);
    }
}
