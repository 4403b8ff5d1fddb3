//! The register file: a fixed 32-entry table caching stack-resident values
//! in physical registers.
//!
//! This is the hottest data path in the back end; all state lives in a
//! plain array and no operation allocates. Each entry tracks whether the
//! register is handed out, which stack slot it caches, whether it is ahead
//! of memory (dirty), and an eviction priority. Spills are returned to the
//! caller as value-level requests; the lowering layer owns the emitter.

use crate::abi::CallConv;
use crate::asm::{Gpr, Xmm};
use smallvec::SmallVec;

/// Either register class, as the allocator sees them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnyReg {
    /// A general-purpose register.
    Gpr(Gpr),
    /// An SSE register.
    Xmm(Xmm),
}

impl AnyReg {
    fn index(self) -> usize {
        match self {
            AnyReg::Gpr(r) => r.enc() as usize,
            AnyReg::Xmm(x) => 16 + x.enc() as usize,
        }
    }

    fn from_index(i: usize) -> AnyReg {
        if i < 16 {
            AnyReg::Gpr(Gpr::new(i as u8))
        } else {
            AnyReg::Xmm(Xmm::new((i - 16) as u8))
        }
    }
}

/// A write-back the caller must emit: store `reg` to its slot.
#[derive(Clone, Copy, Debug)]
pub struct Spill {
    /// The register holding the value.
    pub reg: AnyReg,
    /// Frame offset of the slot it caches.
    pub slot: i32,
    /// Value width in bits.
    pub size_bits: u32,
}

/// Priority given to ABI-fixed reservations; never evicted.
pub const PRIORITY_FIXED: i32 = i32::MIN;

#[derive(Clone, Copy, Default)]
struct RegState {
    allocated: bool,
    dirty: bool,
    slot: Option<i32>,
    size_bits: u32,
    priority: i32,
    stamp: u64,
}

/// The 32-entry register table (16 GPRs + 16 XMMs).
pub struct RegisterFile {
    regs: [RegState; 32],
    conv: CallConv,
    tick: u64,
}

impl RegisterFile {
    /// A fresh table for one calling convention.
    pub fn new(conv: CallConv) -> Self {
        Self {
            regs: [RegState::default(); 32],
            conv,
            tick: 0,
        }
    }

    fn touch(&mut self, idx: usize) {
        self.tick += 1;
        self.regs[idx].stamp = self.tick;
    }

    /// Full invalidation: every register free, nothing cached. Applied at
    /// function entry and at every label (control-flow merge points must
    /// not inherit speculative caches).
    pub fn reset(&mut self) {
        self.regs = [RegState::default(); 32];
    }

    fn pick<I: Iterator<Item = usize>>(&mut self, candidates: I) -> (usize, Option<Spill>) {
        let mut free: Option<usize> = None;
        let mut victim: Option<usize> = None;
        for idx in candidates {
            let st = &self.regs[idx];
            if !st.allocated && st.slot.is_none() {
                // Prefer the least-recently-used completely free register.
                match free {
                    Some(f) if self.regs[f].stamp <= st.stamp => {}
                    _ => free = Some(idx),
                }
            } else if !st.allocated && st.priority != PRIORITY_FIXED {
                // A cache-only register can be stolen after write-back.
                match victim {
                    Some(v)
                        if (self.regs[v].priority, self.regs[v].stamp)
                            <= (st.priority, st.stamp) => {}
                    _ => victim = Some(idx),
                }
            }
        }
        if let Some(idx) = free {
            return (idx, None);
        }
        if let Some(idx) = victim {
            let spill = self.evict(idx);
            return (idx, spill);
        }
        // Every candidate is a live allocation; over-allocation is a bug in
        // the lowering code, not an input condition.
        panic!("register allocator exhausted");
    }

    fn evict(&mut self, idx: usize) -> Option<Spill> {
        let st = self.regs[idx];
        let spill = match (st.dirty, st.slot) {
            (true, Some(slot)) => Some(Spill {
                reg: AnyReg::from_index(idx),
                slot,
                size_bits: st.size_bits,
            }),
            _ => None,
        };
        self.regs[idx] = RegState::default();
        spill
    }

    /// Allocate any free GPR from the convention's pool, evicting the
    /// lowest-priority cache if none is free. The returned spill, if any,
    /// must be emitted before the register is reused.
    pub fn allocate_gpr(&mut self) -> (Gpr, Option<Spill>) {
        let pool: SmallVec<[usize; 9]> = self
            .conv
            .allocatable_gprs()
            .iter()
            .map(|r| r.enc() as usize)
            .collect();
        let (idx, spill) = self.pick(pool.into_iter());
        self.regs[idx].allocated = true;
        self.regs[idx].priority = 0;
        self.touch(idx);
        (Gpr::new(idx as u8), spill)
    }

    /// Allocate any free XMM register.
    pub fn allocate_xmm(&mut self) -> (Xmm, Option<Spill>) {
        let n = self.conv.allocatable_xmms() as usize;
        let (idx, spill) = self.pick(16..16 + n);
        self.regs[idx].allocated = true;
        self.regs[idx].priority = 0;
        self.touch(idx);
        (Xmm::new((idx - 16) as u8), spill)
    }

    /// Claim a specific register for an ABI-fixed use (division, shift
    /// counts, argument registers). The current occupant is evicted.
    pub fn allocate_specific(&mut self, reg: AnyReg) -> Option<Spill> {
        let idx = reg.index();
        let spill = self.evict(idx);
        self.regs[idx].allocated = true;
        self.regs[idx].priority = PRIORITY_FIXED;
        self.touch(idx);
        spill
    }

    /// Release a register without touching its cache association.
    pub fn release(&mut self, reg: AnyReg) {
        let idx = reg.index();
        self.regs[idx].allocated = false;
        self.regs[idx].priority = 0;
    }

    /// Release a register and forget anything it cached.
    pub fn release_and_forget(&mut self, reg: AnyReg) {
        self.regs[reg.index()] = RegState::default();
    }

    /// Declare that `reg` now caches `slot` and is ahead of memory.
    /// Any other register caching the same slot is forgotten; at most one
    /// register caches a given slot.
    pub fn set_slot(&mut self, reg: AnyReg, slot: i32, size_bits: u32) {
        for (i, st) in self.regs.iter_mut().enumerate() {
            if i != reg.index() && st.slot == Some(slot) {
                *st = RegState::default();
            }
        }
        let st = &mut self.regs[reg.index()];
        st.slot = Some(slot);
        st.size_bits = size_bits;
        st.dirty = true;
        self.touch(reg.index());
    }

    /// Declare that `reg` holds a clean copy of `slot`.
    pub fn set_slot_clean(&mut self, reg: AnyReg, slot: i32, size_bits: u32) {
        self.set_slot(reg, slot, size_bits);
        self.regs[reg.index()].dirty = false;
    }

    /// Raise a register's eviction priority (frequently-used locals).
    pub fn set_priority(&mut self, reg: AnyReg, priority: i32) {
        self.regs[reg.index()].priority = priority;
    }

    /// The register currently caching `slot`, if any.
    pub fn reg_for_slot(&mut self, slot: i32) -> Option<AnyReg> {
        for i in 0..self.regs.len() {
            if self.regs[i].slot == Some(slot) {
                self.touch(i);
                return Some(AnyReg::from_index(i));
            }
        }
        None
    }

    /// Forget any cache of `slot` without writing back (the memory copy
    /// was just rewritten directly).
    pub fn forget_slot(&mut self, slot: i32) {
        for st in self.regs.iter_mut() {
            if st.slot == Some(slot) {
                *st = RegState::default();
            }
        }
    }

    /// Write-back requests for every dirty register. Dirty bits clear;
    /// cache associations survive so values can still be reused.
    pub fn flush_dirty(&mut self) -> SmallVec<[Spill; 8]> {
        let mut spills = SmallVec::new();
        for i in 0..self.regs.len() {
            let st = &mut self.regs[i];
            if st.dirty {
                if let Some(slot) = st.slot {
                    spills.push(Spill {
                        reg: AnyReg::from_index(i),
                        slot,
                        size_bits: st.size_bits,
                    });
                }
                st.dirty = false;
            }
        }
        spills
    }

    /// Write-back request for one register, if it is dirty.
    pub fn flush_single(&mut self, reg: AnyReg) -> Option<Spill> {
        let st = &mut self.regs[reg.index()];
        if st.dirty {
            st.dirty = false;
            st.slot.map(|slot| Spill {
                reg,
                slot,
                size_bits: st.size_bits,
            })
        } else {
            None
        }
    }

    /// After a call: every caller-saved register holds garbage. Their
    /// cache associations are dropped so the next read reloads.
    pub fn invalidate_caller_saved(&mut self) {
        for i in 0..16 {
            if self.conv.is_caller_saved_gpr(Gpr::new(i as u8)) {
                self.regs[i] = RegState::default();
            }
        }
        for i in 0..16 {
            if self.conv.is_caller_saved_xmm(Xmm::new(i as u8)) {
                self.regs[16 + i] = RegState::default();
            }
        }
    }

    /// True if no register is allocated and nothing is cached (the state
    /// `reset` produces). Checked at label merge points in debug builds.
    pub fn is_pristine(&self) -> bool {
        self.regs
            .iter()
            .all(|st| !st.allocated && !st.dirty && st.slot.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_prefers_free_registers() {
        let mut rf = RegisterFile::new(CallConv::SystemV);
        let (a, spill) = rf.allocate_gpr();
        assert!(spill.is_none());
        let (b, spill) = rf.allocate_gpr();
        assert!(spill.is_none());
        assert_ne!(a, b);
    }

    #[test]
    fn eviction_spills_dirty_cache() {
        let mut rf = RegisterFile::new(CallConv::WindowsFastcall);
        // Fill the whole Windows pool with released-but-cached values.
        let pool: Vec<Gpr> = CallConv::WindowsFastcall.allocatable_gprs().to_vec();
        for (i, r) in pool.iter().enumerate() {
            let (g, _) = rf.allocate_gpr();
            assert_eq!(g, *r);
            rf.set_slot(AnyReg::Gpr(g), -8 * (i as i32 + 1), 64);
            rf.release(AnyReg::Gpr(g));
        }
        // Next allocation must evict and request a write-back.
        let (_, spill) = rf.allocate_gpr();
        let spill = spill.expect("expected a spill");
        assert_eq!(spill.size_bits, 64);
    }

    #[test]
    fn one_register_per_slot() {
        let mut rf = RegisterFile::new(CallConv::SystemV);
        let (a, _) = rf.allocate_gpr();
        let (b, _) = rf.allocate_gpr();
        rf.set_slot(AnyReg::Gpr(a), -16, 32);
        rf.set_slot(AnyReg::Gpr(b), -16, 32);
        assert_eq!(rf.reg_for_slot(-16), Some(AnyReg::Gpr(b)));
        // The earlier cache is gone, not merely shadowed.
        rf.release(AnyReg::Gpr(b));
        rf.forget_slot(-16);
        assert_eq!(rf.reg_for_slot(-16), None);
    }

    #[test]
    fn fixed_reservations_survive_pressure() {
        let mut rf = RegisterFile::new(CallConv::SystemV);
        assert!(rf.allocate_specific(AnyReg::Gpr(Gpr::RCX)).is_none());
        for _ in 0..8 {
            let (g, _) = rf.allocate_gpr();
            assert_ne!(g, Gpr::RCX);
        }
    }

    #[test]
    fn flush_clears_dirty_but_keeps_cache() {
        let mut rf = RegisterFile::new(CallConv::SystemV);
        let (a, _) = rf.allocate_gpr();
        rf.set_slot(AnyReg::Gpr(a), -24, 64);
        let spills = rf.flush_dirty();
        assert_eq!(spills.len(), 1);
        assert_eq!(spills[0].slot, -24);
        assert!(rf.flush_dirty().is_empty());
        assert_eq!(rf.reg_for_slot(-24), Some(AnyReg::Gpr(a)));
    }

    #[test]
    fn caller_saved_invalidation() {
        let mut rf = RegisterFile::new(CallConv::SystemV);
        let (a, _) = rf.allocate_gpr();
        rf.set_slot(AnyReg::Gpr(a), -8, 64);
        rf.release(AnyReg::Gpr(a));
        rf.invalidate_caller_saved();
        assert_eq!(rf.reg_for_slot(-8), None);
        assert!(rf.is_pristine());
    }
}
