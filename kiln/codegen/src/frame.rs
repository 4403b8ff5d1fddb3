//! Stack frames: named variables, temporaries, reference slots, and the
//! end-of-function size patch.
//!
//! The frame grows downward from RBP. Parameter home slots come first,
//! then named locals, then temporaries; the outgoing-argument area is
//! addressed RSP-relative at call sites and only contributes to the final
//! frame size. The prologue's `SUB RSP, imm32` (and, for Windows EH
//! functions, `LEA RBP, [RSP+imm32]`) carries a placeholder patched once
//! the lowest slot is known.

use kiln_ir::{IrType, StringId};
use rustc_hash::FxHashMap;

/// A named variable's slot.
#[derive(Clone, Copy, Debug)]
pub struct VarSlot {
    /// Offset from RBP (negative for locals, positive for incoming stack
    /// arguments).
    pub offset: i32,
    /// Declared width in bits.
    pub size_bits: u32,
    /// Slot holds an array head, not a scalar.
    pub is_array: bool,
}

/// What a reference-holding slot points at.
#[derive(Clone, Copy, Debug)]
pub struct RefSlot {
    /// Referent value category.
    pub value_ty: IrType,
    /// Referent width in bits.
    pub value_size_bits: u32,
    /// The reference is `T&&`.
    pub is_rvalue: bool,
    /// Slot holds an address that is never auto-dereferenced (`this`,
    /// hidden return slots).
    pub holds_address_only: bool,
}

struct Scope {
    vars: FxHashMap<StringId, VarSlot>,
}

/// Per-function frame state.
pub struct Frame {
    scopes: Vec<Scope>,
    ref_slots: FxHashMap<i32, RefSlot>,
    temp_slots: FxHashMap<u32, i32>,
    /// Lowest (most negative) allocated offset.
    watermark: i32,
    /// Where temporaries start (below parameter homes and named locals).
    temp_base: i32,
    next_temp: i32,
    /// Named-region cursor (below parameter homes).
    next_named: i32,
    /// Largest outgoing argument area (incl. shadow space) of any call.
    pub outgoing_area: u32,
}

impl Frame {
    /// A frame with `param_home_bytes` reserved at the top for parameter
    /// home slots and `named_bytes` pre-sized for named locals (from the
    /// function pre-scan).
    pub fn new(param_home_bytes: u32, named_bytes: u32) -> Self {
        let named_base = -(param_home_bytes as i32);
        let temp_base = named_base - named_bytes as i32;
        Self {
            scopes: vec![Scope {
                vars: FxHashMap::default(),
            }],
            ref_slots: FxHashMap::default(),
            temp_slots: FxHashMap::default(),
            watermark: temp_base,
            temp_base,
            next_temp: temp_base,
            next_named: named_base,
            outgoing_area: 0,
        }
    }

    /// Enter a nested block scope.
    pub fn push_scope(&mut self) {
        self.scopes.push(Scope {
            vars: FxHashMap::default(),
        });
    }

    /// Leave a block scope, dropping its name bindings. Slot storage is
    /// not recycled; the low-water mark is what sizes the frame.
    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Bind a named variable at a fixed offset (parameters, the hidden
    /// return slot).
    pub fn bind_at(&mut self, name: StringId, slot: VarSlot) {
        if slot.offset < self.watermark {
            self.watermark = slot.offset;
        }
        self.scopes
            .last_mut()
            .expect("a scope is always present")
            .vars
            .insert(name, slot);
    }

    /// Allocate a named local in the pre-sized named region, 8-byte
    /// granules.
    pub fn alloc_named(&mut self, name: StringId, size_bits: u32, is_array: bool) -> i32 {
        let bytes = ((size_bits as i32 + 7) / 8).max(1);
        let granules = (bytes + 7) / 8;
        self.next_named -= granules * 8;
        let offset = self.next_named;
        if offset < self.watermark {
            self.watermark = offset;
        }
        self.bind_at(
            name,
            VarSlot {
                offset,
                size_bits,
                is_array,
            },
        );
        offset
    }

    /// Look a name up through the scope stack, innermost first.
    pub fn lookup(&self, name: StringId) -> Option<VarSlot> {
        for scope in self.scopes.iter().rev() {
            if let Some(slot) = scope.vars.get(&name) {
                return Some(*slot);
            }
        }
        None
    }

    /// The slot of a temporary, allocated on first use. Values wider than
    /// 8 bytes reserve contiguous granules.
    pub fn temp_slot(&mut self, temp: u32, size_bits: u32) -> i32 {
        if let Some(&offset) = self.temp_slots.get(&temp) {
            return offset;
        }
        let bytes = ((size_bits as i32 + 7) / 8).max(8);
        let granules = (bytes + 7) / 8;
        self.next_temp -= granules * 8;
        let offset = self.next_temp;
        if offset < self.watermark {
            self.watermark = offset;
        }
        self.temp_slots.insert(temp, offset);
        offset
    }

    /// The slot of a temporary that must already exist.
    pub fn existing_temp_slot(&self, temp: u32) -> Option<i32> {
        self.temp_slots.get(&temp).copied()
    }

    /// Register that `offset` holds a pointer to a value, not the value.
    pub fn mark_reference(&mut self, offset: i32, info: RefSlot) {
        self.ref_slots.insert(offset, info);
    }

    /// Remove a reference marking (slot reused for a plain value).
    pub fn clear_reference(&mut self, offset: i32) {
        self.ref_slots.remove(&offset);
    }

    /// Reference info for a slot, if registered.
    pub fn reference_at(&self, offset: i32) -> Option<RefSlot> {
        self.ref_slots.get(&offset).copied()
    }

    /// Record a call's outgoing argument area (stack args + shadow space).
    pub fn note_outgoing(&mut self, bytes: u32) {
        if bytes > self.outgoing_area {
            self.outgoing_area = bytes;
        }
    }

    /// Offset where temporaries begin (for diagnostics).
    pub fn temp_base(&self) -> i32 {
        self.temp_base
    }

    /// Bytes of frame below RBP that slots occupy, before the outgoing
    /// area and alignment.
    pub fn slot_bytes(&self) -> u32 {
        (-self.watermark) as u32
    }

    /// Final frame size: slots + outgoing area, rounded so that RSP is
    /// 16-byte aligned after `push rbp; sub rsp, N`.
    ///
    /// After the push RSP is at `16k + 8`; System V subtracts a `16m + 8`
    /// total and Windows a `16m` total because the Windows EH prologue
    /// model measures the establisher frame from the full allocation.
    pub fn final_frame_size(&self, windows: bool, floor: u32) -> u32 {
        let raw = self.slot_bytes().max(floor) + self.outgoing_area;
        if windows {
            (raw + 15) & !15
        } else {
            ((raw + 7) & !15) + 8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_ir::Interner;

    #[test]
    fn named_then_temp_regions() {
        let mut strings = Interner::new();
        // Two parameter homes, 16 bytes of named locals.
        let mut frame = Frame::new(16, 16);
        let a = strings.intern("a");
        let off_a = frame.alloc_named(a, 32, false);
        assert_eq!(off_a, -24);
        let t0 = frame.temp_slot(0, 64);
        assert_eq!(t0, -40);
        // Re-query returns the same slot.
        assert_eq!(frame.temp_slot(0, 64), -40);
        // Wide temporaries take contiguous granules.
        let t1 = frame.temp_slot(1, 24 * 8);
        assert_eq!(t1, -64);
    }

    #[test]
    fn scope_shadowing_resolves_innermost() {
        let mut strings = Interner::new();
        let mut frame = Frame::new(0, 32);
        let x = strings.intern("x");
        frame.alloc_named(x, 32, false);
        let outer = frame.lookup(x).unwrap().offset;
        frame.push_scope();
        frame.alloc_named(x, 64, false);
        let inner = frame.lookup(x).unwrap().offset;
        assert_ne!(outer, inner);
        frame.pop_scope();
        assert_eq!(frame.lookup(x).unwrap().offset, outer);
    }

    #[test]
    fn alignment_keeps_call_sites_misaligned_by_eight() {
        let mut frame = Frame::new(8, 8);
        frame.temp_slot(0, 64);
        frame.note_outgoing(32);
        // (frame_size + 8) % 16 == 0 must hold on both ABIs.
        let elf = frame.final_frame_size(false, 0);
        assert_eq!((elf + 8) % 16, 0);
        let coff = frame.final_frame_size(true, 0);
        assert_eq!(coff % 16, 0);
    }
}
