//! Typed emission helpers, one per instruction form.
//!
//! Helpers append complete instructions; callers never see partial bytes.
//! Forward references (call/jmp/jcc targets, RIP-relative fields) return
//! the offset of their 32-bit placeholder so the caller can record a patch
//! site or relocation.

use super::enc::{modrm, needs_bare_rex, put_mem, put_mem_sib, put_rex};
use super::{AluOp, Gpr, OperandSize, SseOp, Xmm, CC};
use crate::buffer::{CodeOffset, CodeSink};

fn wide(size: OperandSize) -> bool {
    size == OperandSize::S64
}

fn put_prefix16(sink: &mut impl CodeSink, size: OperandSize) {
    if size == OperandSize::S16 {
        sink.put1(0x66);
    }
}

// ---- stack, control transfer ------------------------------------------

/// `push r64`
pub fn push_r(sink: &mut impl CodeSink, reg: Gpr) {
    if reg.enc() >= 8 {
        sink.put1(0x41);
    }
    sink.put1(0x50 | (reg.enc() & 7));
}

/// `pop r64`
pub fn pop_r(sink: &mut impl CodeSink, reg: Gpr) {
    if reg.enc() >= 8 {
        sink.put1(0x41);
    }
    sink.put1(0x58 | (reg.enc() & 7));
}

/// `ret`
pub fn ret(sink: &mut impl CodeSink) {
    sink.put1(0xC3);
}

/// `call rel32` with a zero placeholder; returns the placeholder offset.
pub fn call_rel32(sink: &mut impl CodeSink) -> CodeOffset {
    sink.put1(0xE8);
    let at = sink.current_offset();
    sink.put4(0);
    at
}

/// `call r64` (`FF /2`)
pub fn call_r(sink: &mut impl CodeSink, reg: Gpr) {
    put_rex(sink, false, 0, 0, reg.enc(), false);
    sink.put1(0xFF);
    sink.put1(modrm(0b11, 2, reg.enc()));
}

/// `jmp rel32` with a zero placeholder; returns the placeholder offset.
pub fn jmp_rel32(sink: &mut impl CodeSink) -> CodeOffset {
    sink.put1(0xE9);
    let at = sink.current_offset();
    sink.put4(0);
    at
}

/// `jmp rel8` with a known displacement.
pub fn jmp_rel8(sink: &mut impl CodeSink, disp: i8) {
    sink.put1(0xEB);
    sink.put1(disp as u8);
}

/// `jCC rel32` with a zero placeholder; returns the placeholder offset.
pub fn jcc_rel32(sink: &mut impl CodeSink, cc: CC) -> CodeOffset {
    sink.put1(0x0F);
    sink.put1(0x80 | cc.enc());
    let at = sink.current_offset();
    sink.put4(0);
    at
}

/// `jCC rel8` with a known displacement.
pub fn jcc_rel8(sink: &mut impl CodeSink, cc: CC, disp: i8) {
    sink.put1(0x70 | cc.enc());
    sink.put1(disp as u8);
}

// ---- moves -------------------------------------------------------------

/// `mov dst, src` at the given width.
pub fn mov_rr(sink: &mut impl CodeSink, size: OperandSize, dst: Gpr, src: Gpr) {
    put_prefix16(sink, size);
    let force = needs_bare_rex(size, dst.enc()) || needs_bare_rex(size, src.enc());
    put_rex(sink, wide(size), dst.enc(), 0, src.enc(), force);
    sink.put1(if size == OperandSize::S8 { 0x8A } else { 0x8B });
    sink.put1(modrm(0b11, dst.enc(), src.enc()));
}

/// `mov r32, imm32` (5 bytes; zero-extends into the full register).
pub fn mov_ri32(sink: &mut impl CodeSink, dst: Gpr, imm: u32) {
    put_rex(sink, false, 0, 0, dst.enc(), false);
    sink.put1(0xB8 | (dst.enc() & 7));
    sink.put4(imm);
}

/// `mov r64, imm64` (10 bytes).
pub fn mov_ri64(sink: &mut impl CodeSink, dst: Gpr, imm: u64) {
    put_rex(sink, true, 0, 0, dst.enc(), false);
    sink.put1(0xB8 | (dst.enc() & 7));
    sink.put8(imm);
}

/// Load `dst` from `[base + disp]` at the given width, with no extension
/// semantics beyond the architectural ones (32-bit loads zero the upper
/// half; 8/16-bit loads merge).
pub fn mov_r_m(sink: &mut impl CodeSink, size: OperandSize, dst: Gpr, base: Gpr, disp: i32) {
    put_prefix16(sink, size);
    let force = needs_bare_rex(size, dst.enc());
    put_rex(sink, wide(size), dst.enc(), 0, base.enc(), force);
    sink.put1(if size == OperandSize::S8 { 0x8A } else { 0x8B });
    put_mem(sink, dst.enc(), base, disp);
}

/// Store `src` to `[base + disp]` at the given width.
pub fn mov_m_r(sink: &mut impl CodeSink, size: OperandSize, base: Gpr, disp: i32, src: Gpr) {
    put_prefix16(sink, size);
    let force = needs_bare_rex(size, src.enc());
    put_rex(sink, wide(size), src.enc(), 0, base.enc(), force);
    sink.put1(if size == OperandSize::S8 { 0x88 } else { 0x89 });
    put_mem(sink, src.enc(), base, disp);
}

/// Store a sign-extended 32-bit immediate to `[base + disp]`.
pub fn mov_m_i32(sink: &mut impl CodeSink, size: OperandSize, base: Gpr, disp: i32, imm: i32) {
    put_prefix16(sink, size);
    put_rex(sink, wide(size), 0, 0, base.enc(), false);
    sink.put1(if size == OperandSize::S8 { 0xC6 } else { 0xC7 });
    put_mem(sink, 0, base, disp);
    match size {
        OperandSize::S8 => sink.put1(imm as u8),
        OperandSize::S16 => sink.put2(imm as u16),
        _ => sink.put4(imm as u32),
    }
}

/// Sign-extending load: `movsx dst, <size> [base + disp]` widening to
/// `to` (32 or 64 bits). 32→64 uses `movsxd`.
pub fn load_sx(
    sink: &mut impl CodeSink,
    from: OperandSize,
    to: OperandSize,
    dst: Gpr,
    base: Gpr,
    disp: i32,
) {
    put_rex(sink, wide(to), dst.enc(), 0, base.enc(), false);
    match from {
        OperandSize::S8 => {
            sink.put1(0x0F);
            sink.put1(0xBE);
        }
        OperandSize::S16 => {
            sink.put1(0x0F);
            sink.put1(0xBF);
        }
        OperandSize::S32 => sink.put1(0x63),
        OperandSize::S64 => sink.put1(0x8B),
    }
    put_mem(sink, dst.enc(), base, disp);
}

/// Zero-extending load. 32-bit loads zero-extend architecturally, so
/// `from == S32` emits a plain 32-bit move.
pub fn load_zx(sink: &mut impl CodeSink, from: OperandSize, dst: Gpr, base: Gpr, disp: i32) {
    put_rex(sink, false, dst.enc(), 0, base.enc(), false);
    match from {
        OperandSize::S8 => {
            sink.put1(0x0F);
            sink.put1(0xB6);
        }
        OperandSize::S16 => {
            sink.put1(0x0F);
            sink.put1(0xB7);
        }
        _ => sink.put1(0x8B),
    }
    put_mem(sink, dst.enc(), base, disp);
}

/// Register-to-register sign extension.
pub fn movsx_rr(
    sink: &mut impl CodeSink,
    from: OperandSize,
    to: OperandSize,
    dst: Gpr,
    src: Gpr,
) {
    let force = needs_bare_rex(from, src.enc());
    put_rex(sink, wide(to), dst.enc(), 0, src.enc(), force);
    match from {
        OperandSize::S8 => {
            sink.put1(0x0F);
            sink.put1(0xBE);
        }
        OperandSize::S16 => {
            sink.put1(0x0F);
            sink.put1(0xBF);
        }
        _ => sink.put1(0x63),
    }
    sink.put1(modrm(0b11, dst.enc(), src.enc()));
}

/// Register-to-register zero extension. `from == S32` emits a 32-bit
/// `mov`, which zeroes the upper half.
pub fn movzx_rr(sink: &mut impl CodeSink, from: OperandSize, dst: Gpr, src: Gpr) {
    let force = needs_bare_rex(from, src.enc());
    put_rex(sink, false, dst.enc(), 0, src.enc(), force);
    match from {
        OperandSize::S8 => {
            sink.put1(0x0F);
            sink.put1(0xB6);
        }
        OperandSize::S16 => {
            sink.put1(0x0F);
            sink.put1(0xB7);
        }
        _ => sink.put1(0x8B),
    }
    sink.put1(modrm(0b11, dst.enc(), src.enc()));
}

// ---- effective addresses ----------------------------------------------

/// `lea dst, [base + disp]`
pub fn lea(sink: &mut impl CodeSink, dst: Gpr, base: Gpr, disp: i32) {
    put_rex(sink, true, dst.enc(), 0, base.enc(), false);
    sink.put1(0x8D);
    put_mem(sink, dst.enc(), base, disp);
}

/// `lea dst, [base + index*scale + disp]`
pub fn lea_sib(
    sink: &mut impl CodeSink,
    dst: Gpr,
    base: Gpr,
    index: Gpr,
    scale_log2: u8,
    disp: i32,
) {
    put_rex(sink, true, dst.enc(), index.enc(), base.enc(), false);
    sink.put1(0x8D);
    put_mem_sib(sink, dst.enc(), base, index, scale_log2, disp);
}

/// `lea dst, [rip + rel32]` with a zero placeholder; returns the
/// placeholder offset for the caller's relocation.
pub fn lea_rip(sink: &mut impl CodeSink, dst: Gpr) -> CodeOffset {
    put_rex(sink, true, dst.enc(), 0, 0, false);
    sink.put1(0x8D);
    sink.put1(modrm(0b00, dst.enc(), 0b101));
    let at = sink.current_offset();
    sink.put4(0);
    at
}

/// RIP-relative load; returns the placeholder offset.
pub fn mov_r_rip(sink: &mut impl CodeSink, size: OperandSize, dst: Gpr) -> CodeOffset {
    put_prefix16(sink, size);
    put_rex(sink, wide(size), dst.enc(), 0, 0, false);
    sink.put1(if size == OperandSize::S8 { 0x8A } else { 0x8B });
    sink.put1(modrm(0b00, dst.enc(), 0b101));
    let at = sink.current_offset();
    sink.put4(0);
    at
}

/// RIP-relative store; returns the placeholder offset.
pub fn mov_rip_r(sink: &mut impl CodeSink, size: OperandSize, src: Gpr) -> CodeOffset {
    put_prefix16(sink, size);
    put_rex(sink, wide(size), src.enc(), 0, 0, false);
    sink.put1(if size == OperandSize::S8 { 0x88 } else { 0x89 });
    sink.put1(modrm(0b00, src.enc(), 0b101));
    let at = sink.current_offset();
    sink.put4(0);
    at
}

// ---- integer ALU -------------------------------------------------------

/// `op dst, src` in the `r/m, r` form (result lands in `dst`).
pub fn alu_rr(sink: &mut impl CodeSink, op: AluOp, size: OperandSize, dst: Gpr, src: Gpr) {
    put_prefix16(sink, size);
    put_rex(sink, wide(size), src.enc(), 0, dst.enc(), false);
    sink.put1(op.opcode_mr());
    sink.put1(modrm(0b11, src.enc(), dst.enc()));
}

/// `op dst, imm`, preferring the sign-extended 8-bit form.
pub fn alu_ri(sink: &mut impl CodeSink, op: AluOp, size: OperandSize, dst: Gpr, imm: i32) {
    put_prefix16(sink, size);
    put_rex(sink, wide(size), 0, 0, dst.enc(), false);
    if i8::try_from(imm).is_ok() {
        sink.put1(0x83);
        sink.put1(modrm(0b11, op.digit(), dst.enc()));
        sink.put1(imm as u8);
    } else {
        sink.put1(0x81);
        sink.put1(modrm(0b11, op.digit(), dst.enc()));
        sink.put4(imm as u32);
    }
}

/// `imul dst, src` (`0F AF`; destination is the reg field).
pub fn imul_rr(sink: &mut impl CodeSink, size: OperandSize, dst: Gpr, src: Gpr) {
    put_rex(sink, wide(size), dst.enc(), 0, src.enc(), false);
    sink.put1(0x0F);
    sink.put1(0xAF);
    sink.put1(modrm(0b11, dst.enc(), src.enc()));
}

/// `cdq` (sign-extend EAX into EDX).
pub fn cdq(sink: &mut impl CodeSink) {
    sink.put1(0x99);
}

/// `cqo` (sign-extend RAX into RDX).
pub fn cqo(sink: &mut impl CodeSink) {
    sink.put1(0x48);
    sink.put1(0x99);
}

/// `idiv r` (`F7 /7`).
pub fn idiv_r(sink: &mut impl CodeSink, size: OperandSize, reg: Gpr) {
    put_rex(sink, wide(size), 0, 0, reg.enc(), false);
    sink.put1(0xF7);
    sink.put1(modrm(0b11, 7, reg.enc()));
}

/// `div r` (`F7 /6`).
pub fn div_r(sink: &mut impl CodeSink, size: OperandSize, reg: Gpr) {
    put_rex(sink, wide(size), 0, 0, reg.enc(), false);
    sink.put1(0xF7);
    sink.put1(modrm(0b11, 6, reg.enc()));
}

fn shift_cl(sink: &mut impl CodeSink, size: OperandSize, digit: u8, reg: Gpr) {
    put_rex(sink, wide(size), 0, 0, reg.enc(), needs_bare_rex(size, reg.enc()));
    sink.put1(if size == OperandSize::S8 { 0xD2 } else { 0xD3 });
    sink.put1(modrm(0b11, digit, reg.enc()));
}

/// `shl reg, cl`
pub fn shl_cl(sink: &mut impl CodeSink, size: OperandSize, reg: Gpr) {
    shift_cl(sink, size, 4, reg);
}

/// `shr reg, cl` (logical)
pub fn shr_cl(sink: &mut impl CodeSink, size: OperandSize, reg: Gpr) {
    shift_cl(sink, size, 5, reg);
}

/// `sar reg, cl` (arithmetic)
pub fn sar_cl(sink: &mut impl CodeSink, size: OperandSize, reg: Gpr) {
    shift_cl(sink, size, 7, reg);
}

/// `not r` (`F7 /2`)
pub fn not_r(sink: &mut impl CodeSink, size: OperandSize, reg: Gpr) {
    put_rex(sink, wide(size), 0, 0, reg.enc(), false);
    sink.put1(0xF7);
    sink.put1(modrm(0b11, 2, reg.enc()));
}

/// `neg r` (`F7 /3`)
pub fn neg_r(sink: &mut impl CodeSink, size: OperandSize, reg: Gpr) {
    put_rex(sink, wide(size), 0, 0, reg.enc(), false);
    sink.put1(0xF7);
    sink.put1(modrm(0b11, 3, reg.enc()));
}

/// `test a, b` (`84`/`85 /r`)
pub fn test_rr(sink: &mut impl CodeSink, size: OperandSize, a: Gpr, b: Gpr) {
    put_prefix16(sink, size);
    let force = needs_bare_rex(size, a.enc()) || needs_bare_rex(size, b.enc());
    put_rex(sink, wide(size), b.enc(), 0, a.enc(), force);
    sink.put1(if size == OperandSize::S8 { 0x84 } else { 0x85 });
    sink.put1(modrm(0b11, b.enc(), a.enc()));
}

/// `setCC dst8`; REX is forced for SPL/BPL/SIL/DIL and R8B..R15B.
pub fn setcc(sink: &mut impl CodeSink, cc: CC, dst: Gpr) {
    put_rex(
        sink,
        false,
        0,
        0,
        dst.enc(),
        needs_bare_rex(OperandSize::S8, dst.enc()),
    );
    sink.put1(0x0F);
    sink.put1(0x90 | cc.enc());
    sink.put1(modrm(0b11, 0, dst.enc()));
}

// ---- SSE scalar --------------------------------------------------------

fn sse_prefix(sink: &mut impl CodeSink, is_double: bool) {
    sink.put1(if is_double { 0xF2 } else { 0xF3 });
}

/// `movss/movsd dst_xmm, src_xmm`
pub fn movs_rr(sink: &mut impl CodeSink, is_double: bool, dst: Xmm, src: Xmm) {
    sse_prefix(sink, is_double);
    put_rex(sink, false, dst.enc(), 0, src.enc(), false);
    sink.put1(0x0F);
    sink.put1(0x10);
    sink.put1(modrm(0b11, dst.enc(), src.enc()));
}

/// `movss/movsd dst_xmm, [base + disp]`
pub fn movs_r_m(sink: &mut impl CodeSink, is_double: bool, dst: Xmm, base: Gpr, disp: i32) {
    sse_prefix(sink, is_double);
    put_rex(sink, false, dst.enc(), 0, base.enc(), false);
    sink.put1(0x0F);
    sink.put1(0x10);
    put_mem(sink, dst.enc(), base, disp);
}

/// `movss/movsd [base + disp], src_xmm`
pub fn movs_m_r(sink: &mut impl CodeSink, is_double: bool, base: Gpr, disp: i32, src: Xmm) {
    sse_prefix(sink, is_double);
    put_rex(sink, false, src.enc(), 0, base.enc(), false);
    sink.put1(0x0F);
    sink.put1(0x11);
    put_mem(sink, src.enc(), base, disp);
}

/// Scalar SSE arithmetic, `dst op= src`.
pub fn sse_rr(sink: &mut impl CodeSink, op: SseOp, is_double: bool, dst: Xmm, src: Xmm) {
    sse_prefix(sink, is_double);
    put_rex(sink, false, dst.enc(), 0, src.enc(), false);
    sink.put1(0x0F);
    sink.put1(op.opcode());
    sink.put1(modrm(0b11, dst.enc(), src.enc()));
}

/// `ucomiss/ucomisd a, b` (sets ZF/PF/CF; unordered sets all three).
pub fn ucomis_rr(sink: &mut impl CodeSink, is_double: bool, a: Xmm, b: Xmm) {
    if is_double {
        sink.put1(0x66);
    }
    put_rex(sink, false, a.enc(), 0, b.enc(), false);
    sink.put1(0x0F);
    sink.put1(0x2E);
    sink.put1(modrm(0b11, a.enc(), b.enc()));
}

/// `cvtss2sd` / `cvtsd2ss` (`from_double` names the source format).
pub fn cvt_float_float(sink: &mut impl CodeSink, from_double: bool, dst: Xmm, src: Xmm) {
    sse_prefix(sink, from_double);
    put_rex(sink, false, dst.enc(), 0, src.enc(), false);
    sink.put1(0x0F);
    sink.put1(0x5A);
    sink.put1(modrm(0b11, dst.enc(), src.enc()));
}

/// `cvtsi2ss/cvtsi2sd dst_xmm, src_gpr` (REX.W for 64-bit sources).
pub fn cvt_int_float(
    sink: &mut impl CodeSink,
    to_double: bool,
    src64: bool,
    dst: Xmm,
    src: Gpr,
) {
    sse_prefix(sink, to_double);
    put_rex(sink, src64, dst.enc(), 0, src.enc(), false);
    sink.put1(0x0F);
    sink.put1(0x2A);
    sink.put1(modrm(0b11, dst.enc(), src.enc()));
}

/// `cvttss2si/cvttsd2si dst_gpr, src_xmm` (truncating; REX.W for 64-bit
/// destinations).
pub fn cvt_float_int(
    sink: &mut impl CodeSink,
    from_double: bool,
    dst64: bool,
    dst: Gpr,
    src: Xmm,
) {
    sse_prefix(sink, from_double);
    put_rex(sink, dst64, dst.enc(), 0, src.enc(), false);
    sink.put1(0x0F);
    sink.put1(0x2C);
    sink.put1(modrm(0b11, dst.enc(), src.enc()));
}

/// `movq dst_gpr, src_xmm` (`66 REX.W 0F 7E`); copies raw bits.
pub fn movq_gpr_xmm(sink: &mut impl CodeSink, dst: Gpr, src: Xmm) {
    sink.put1(0x66);
    put_rex(sink, true, src.enc(), 0, dst.enc(), false);
    sink.put1(0x0F);
    sink.put1(0x7E);
    sink.put1(modrm(0b11, src.enc(), dst.enc()));
}

/// `movq dst_xmm, src_gpr` (`66 REX.W 0F 6E`); copies raw bits.
pub fn movq_xmm_gpr(sink: &mut impl CodeSink, dst: Xmm, src: Gpr) {
    sink.put1(0x66);
    put_rex(sink, true, dst.enc(), 0, src.enc(), false);
    sink.put1(0x0F);
    sink.put1(0x6E);
    sink.put1(modrm(0b11, dst.enc(), src.enc()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(f: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut v = Vec::new();
        f(&mut v);
        v
    }

    #[test]
    fn mov_rr_wide_and_narrow() {
        assert_eq!(
            bytes(|s| mov_rr(s, OperandSize::S64, Gpr::RAX, Gpr::RCX)),
            vec![0x48, 0x8B, 0xC1]
        );
        assert_eq!(
            bytes(|s| mov_rr(s, OperandSize::S32, Gpr::RAX, Gpr::RCX)),
            vec![0x8B, 0xC1]
        );
        assert_eq!(
            bytes(|s| mov_rr(s, OperandSize::S16, Gpr::RAX, Gpr::RCX)),
            vec![0x66, 0x8B, 0xC1]
        );
        // 8-bit access to SIL needs a bare REX.
        assert_eq!(
            bytes(|s| mov_rr(s, OperandSize::S8, Gpr::RAX, Gpr::RSI)),
            vec![0x40, 0x8A, 0xC6]
        );
    }

    #[test]
    fn extended_registers_set_rex_bits() {
        assert_eq!(
            bytes(|s| mov_rr(s, OperandSize::S64, Gpr::R8, Gpr::R15)),
            vec![0x4D, 0x8B, 0xC7]
        );
        assert_eq!(
            bytes(|s| alu_rr(s, AluOp::Add, OperandSize::S64, Gpr::R12, Gpr::RAX)),
            vec![0x49, 0x01, 0xC4]
        );
        assert_eq!(bytes(|s| push_r(s, Gpr::R12)), vec![0x41, 0x54]);
    }

    #[test]
    fn frame_stores_pick_disp_width() {
        // disp8 at the -128 boundary, disp32 just past it.
        assert_eq!(
            bytes(|s| mov_m_r(s, OperandSize::S32, Gpr::RBP, -128, Gpr::RAX)),
            vec![0x89, 0x45, 0x80]
        );
        assert_eq!(
            bytes(|s| mov_m_r(s, OperandSize::S32, Gpr::RBP, -129, Gpr::RAX)),
            vec![0x89, 0x85, 0x7F, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn rsp_base_forces_sib() {
        assert_eq!(
            bytes(|s| mov_r_m(s, OperandSize::S64, Gpr::RAX, Gpr::RSP, 8)),
            vec![0x48, 0x8B, 0x44, 0x24, 0x08]
        );
    }

    #[test]
    fn rbp_base_forces_disp8() {
        // [rbp + 0] cannot use mod=00.
        assert_eq!(
            bytes(|s| mov_r_m(s, OperandSize::S64, Gpr::RAX, Gpr::RBP, 0)),
            vec![0x48, 0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn lea_rbp_rsp_frame_setup() {
        // The EH prologue form: lea rbp, [rsp + imm32], composed the way
        // the prologue emits it with a forced 32-bit displacement.
        let mut v = Vec::new();
        put_rex(&mut v, true, Gpr::RBP.enc(), 0, Gpr::RSP.enc(), false);
        v.put1(0x8D);
        v.put1(modrm(0b10, Gpr::RBP.enc(), 0b100));
        v.put1(super::super::enc::sib(0, 0b100, 0b100));
        v.put4(0x40);
        assert_eq!(v, vec![0x48, 0x8D, 0xAC, 0x24, 0x40, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn division_sequences() {
        assert_eq!(bytes(cdq), vec![0x99]);
        assert_eq!(bytes(cqo), vec![0x48, 0x99]);
        assert_eq!(
            bytes(|s| idiv_r(s, OperandSize::S32, Gpr::RBX)),
            vec![0xF7, 0xFB]
        );
        assert_eq!(
            bytes(|s| div_r(s, OperandSize::S64, Gpr::RCX)),
            vec![0x48, 0xF7, 0xF1]
        );
    }

    #[test]
    fn shifts_use_cl_forms() {
        assert_eq!(
            bytes(|s| shl_cl(s, OperandSize::S64, Gpr::RAX)),
            vec![0x48, 0xD3, 0xE0]
        );
        assert_eq!(
            bytes(|s| sar_cl(s, OperandSize::S32, Gpr::RDX)),
            vec![0xD3, 0xFA]
        );
    }

    #[test]
    fn setcc_rex_for_low_byte_access() {
        assert_eq!(bytes(|s| setcc(s, CC::E, Gpr::RAX)), vec![0x0F, 0x94, 0xC0]);
        // DIL requires a bare REX prefix.
        assert_eq!(
            bytes(|s| setcc(s, CC::NE, Gpr::RDI)),
            vec![0x40, 0x0F, 0x95, 0xC7]
        );
        assert_eq!(
            bytes(|s| setcc(s, CC::A, Gpr::R9)),
            vec![0x41, 0x0F, 0x97, 0xC1]
        );
    }

    #[test]
    fn sse_scalar_encodings() {
        assert_eq!(
            bytes(|s| movs_r_m(s, true, Xmm::XMM0, Gpr::RBP, -8)),
            vec![0xF2, 0x0F, 0x10, 0x45, 0xF8]
        );
        assert_eq!(
            bytes(|s| sse_rr(s, SseOp::Add, false, Xmm::XMM1, Xmm::XMM2)),
            vec![0xF3, 0x0F, 0x58, 0xCA]
        );
        assert_eq!(
            bytes(|s| ucomis_rr(s, true, Xmm::XMM0, Xmm::XMM1)),
            vec![0x66, 0x0F, 0x2E, 0xC1]
        );
        assert_eq!(
            bytes(|s| cvt_int_float(s, true, true, Xmm::XMM0, Gpr::RAX)),
            vec![0xF2, 0x48, 0x0F, 0x2A, 0xC0]
        );
        assert_eq!(
            bytes(|s| cvt_float_int(s, false, false, Gpr::RAX, Xmm::XMM0)),
            vec![0xF3, 0x0F, 0x2C, 0xC0]
        );
        // XMM8 needs REX.R.
        assert_eq!(
            bytes(|s| movs_rr(s, true, Xmm::new(8), Xmm::XMM0)),
            vec![0xF2, 0x44, 0x0F, 0x10, 0xC0]
        );
    }

    #[test]
    fn calls_and_jumps_leave_placeholders() {
        let mut v = Vec::new();
        let at = call_rel32(&mut v);
        assert_eq!(at, 1);
        assert_eq!(v, vec![0xE8, 0, 0, 0, 0]);

        let mut v = Vec::new();
        let at = jcc_rel32(&mut v, CC::E);
        assert_eq!(at, 2);
        assert_eq!(v, vec![0x0F, 0x84, 0, 0, 0, 0]);
    }

    #[test]
    fn imm_forms() {
        assert_eq!(
            bytes(|s| mov_ri32(s, Gpr::RAX, 7)),
            vec![0xB8, 7, 0, 0, 0]
        );
        assert_eq!(
            bytes(|s| mov_ri64(s, Gpr::RAX, 0x1122334455667788)),
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        // Small immediates take the sign-extended 8-bit ALU form.
        assert_eq!(
            bytes(|s| alu_ri(s, AluOp::Add, OperandSize::S64, Gpr::RAX, 1)),
            vec![0x48, 0x83, 0xC0, 0x01]
        );
        assert_eq!(
            bytes(|s| alu_ri(s, AluOp::Sub, OperandSize::S64, Gpr::RSP, 0x1000)),
            vec![0x48, 0x81, 0xEC, 0x00, 0x10, 0x00, 0x00]
        );
    }
}
