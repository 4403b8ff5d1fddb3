//! Instruction-field encoding: REX prefixes, ModR/M, SIB and
//! displacements.
//!
//! Everything here is a plain function over register encodings; the
//! emitters in [`emit`](super::emit) call these with already-resolved
//! operands. Three hardware quirks are centralized in this module so no
//! emitter has to remember them:
//!
//! * an RSP or R12 base has no plain ModR/M form and always routes
//!   through a SIB byte;
//! * an RBP or R13 base has no displacement-free form, so a zero
//!   displacement still costs one byte;
//! * the byte registers SPL/BPL/SIL/DIL only exist while a REX prefix is
//!   present, even an otherwise-empty `0x40` one.

use super::{Gpr, OperandSize};
use crate::buffer::CodeSink;

/// Compose a ModR/M byte. Register encodings are masked to their low
/// three bits; the high bit travels in the REX prefix.
#[inline]
pub fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Compose a SIB byte from a log2 scale, index and base.
#[inline]
pub fn sib(scale_log2: u8, index: u8, base: u8) -> u8 {
    (scale_log2 << 6) | ((index & 7) << 3) | (base & 7)
}

/// Append the REX prefix an instruction needs, or nothing when the
/// prefix would be empty.
///
/// `wide` sets REX.W; the three encodings feed REX.R, REX.X and REX.B
/// (pass 0 for operands an instruction does not have). `force` keeps an
/// empty `0x40` prefix, which byte-register operands need; compute it
/// with [`needs_bare_rex`].
#[inline]
pub fn put_rex(sink: &mut impl CodeSink, wide: bool, reg: u8, index: u8, base: u8, force: bool) {
    let mut rex = 0x40u8;
    if wide {
        rex |= 0b1000;
    }
    rex |= (reg & 8) >> 1;
    rex |= (index & 8) >> 2;
    rex |= (base & 8) >> 3;
    if rex != 0x40 || force {
        sink.put1(rex);
    }
}

/// True when accessing `enc` at the given width only encodes under a REX
/// prefix: 8-bit uses of encodings 4..8 would otherwise mean AH..BH.
#[inline]
pub fn needs_bare_rex(size: OperandSize, enc: u8) -> bool {
    size == OperandSize::S8 && (4..8).contains(&enc)
}

/// Pick the shortest displacement mode for a memory operand: the two
/// ModR/M mode bits plus the number of displacement bytes to emit.
#[inline]
fn disp_mode(disp: i32, base_low3: u8) -> (u8, u8) {
    if disp == 0 && base_low3 != 5 {
        (0b00, 0)
    } else if i8::try_from(disp).is_ok() {
        (0b01, 1)
    } else {
        (0b10, 4)
    }
}

fn put_disp(sink: &mut impl CodeSink, width: u8, disp: i32) {
    match width {
        1 => sink.put1(disp as i8 as u8),
        4 => sink.put4(disp as u32),
        _ => {}
    }
}

/// Write the ModR/M (+ SIB) and displacement bytes for `[base + disp]`.
pub fn put_mem(sink: &mut impl CodeSink, reg: u8, base: Gpr, disp: i32) {
    let b = base.enc() & 7;
    let (mode, width) = disp_mode(disp, b);
    if b == 4 {
        // Index 0b100 in the SIB byte means "no index".
        sink.put1(modrm(mode, reg, 0b100));
        sink.put1(sib(0, 0b100, 0b100));
    } else {
        sink.put1(modrm(mode, reg, b));
    }
    put_disp(sink, width, disp);
}

/// Write the ModR/M, SIB and displacement bytes for
/// `[base + index * 2^scale + disp]`.
pub fn put_mem_sib(
    sink: &mut impl CodeSink,
    reg: u8,
    base: Gpr,
    index: Gpr,
    scale_log2: u8,
    disp: i32,
) {
    // RSP can never index; R12 shares its low bits but REX.X
    // disambiguates it.
    debug_assert!(index != Gpr::RSP);
    let b = base.enc() & 7;
    let (mode, width) = disp_mode(disp, b);
    sink.put1(modrm(mode, reg, 0b100));
    sink.put1(sib(scale_log2, index.enc() & 7, b));
    put_disp(sink, width, disp);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rex_is_omitted_when_empty() {
        let mut sink = Vec::new();
        put_rex(&mut sink, false, 0, 0, 0, false);
        assert!(sink.is_empty());
        put_rex(&mut sink, true, 0, 0, 0, false);
        assert_eq!(sink, vec![0x48]);
    }

    #[test]
    fn rex_bits_track_extended_operands() {
        let mut sink = Vec::new();
        put_rex(&mut sink, false, 8, 0, 0, false); // REX.R
        put_rex(&mut sink, false, 0, 8, 0, false); // REX.X
        put_rex(&mut sink, false, 0, 0, 8, false); // REX.B
        assert_eq!(sink, vec![0x44, 0x42, 0x41]);
    }

    #[test]
    fn bare_rex_for_low_byte_registers() {
        assert!(needs_bare_rex(OperandSize::S8, Gpr::RSI.enc()));
        assert!(!needs_bare_rex(OperandSize::S8, Gpr::RAX.enc()));
        assert!(!needs_bare_rex(OperandSize::S32, Gpr::RSI.enc()));
        let mut sink = Vec::new();
        put_rex(&mut sink, false, 0, 0, 6, true);
        assert_eq!(sink, vec![0x40]);
    }

    #[test]
    fn displacements_switch_width_at_the_byte_boundary() {
        assert_eq!(disp_mode(0, 0), (0b00, 0));
        assert_eq!(disp_mode(127, 0), (0b01, 1));
        assert_eq!(disp_mode(-128, 0), (0b01, 1));
        assert_eq!(disp_mode(128, 0), (0b10, 4));
        assert_eq!(disp_mode(-129, 0), (0b10, 4));
        // An RBP-family base never gets the displacement-free mode.
        assert_eq!(disp_mode(0, 5), (0b01, 1));
    }

    #[test]
    fn rsp_base_takes_a_sib_byte() {
        let mut sink = Vec::new();
        put_mem(&mut sink, 0, Gpr::RSP, 8);
        assert_eq!(sink, vec![0x44, 0x24, 0x08]);
        // [rbp + 0] spends a zero displacement byte.
        let mut sink = Vec::new();
        put_mem(&mut sink, 0, Gpr::RBP, 0);
        assert_eq!(sink, vec![0x45, 0x00]);
    }
}
