//! Calling conventions: argument registers, struct passing, caller-saved
//! sets.

use crate::asm::{Gpr, Xmm};
use target_lexicon::{OperatingSystem, Triple};

/// The two supported calling conventions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallConv {
    /// System V AMD64 (Linux).
    SystemV,
    /// Windows x64.
    WindowsFastcall,
}

static SYSV_INT_ARGS: [Gpr; 6] = [
    Gpr::RDI,
    Gpr::RSI,
    Gpr::RDX,
    Gpr::RCX,
    Gpr::R8,
    Gpr::R9,
];
static WIN_INT_ARGS: [Gpr; 4] = [Gpr::RCX, Gpr::RDX, Gpr::R8, Gpr::R9];

static SYSV_FLOAT_ARGS: [Xmm; 8] = [
    Xmm::XMM0,
    Xmm::XMM1,
    Xmm::XMM2,
    Xmm::XMM3,
    Xmm::XMM4,
    Xmm::XMM5,
    Xmm::XMM6,
    Xmm::XMM7,
];
static WIN_FLOAT_ARGS: [Xmm; 4] = [Xmm::XMM0, Xmm::XMM1, Xmm::XMM2, Xmm::XMM3];

// Allocation pools are caller-saved registers only, scratch-first so the
// argument registers stay free as long as possible.
static SYSV_POOL: [Gpr; 9] = [
    Gpr::RAX,
    Gpr::R10,
    Gpr::R11,
    Gpr::RSI,
    Gpr::RDI,
    Gpr::RCX,
    Gpr::RDX,
    Gpr::R8,
    Gpr::R9,
];
static WIN_POOL: [Gpr; 7] = [
    Gpr::RAX,
    Gpr::R10,
    Gpr::R11,
    Gpr::RCX,
    Gpr::RDX,
    Gpr::R8,
    Gpr::R9,
];

impl CallConv {
    /// The convention a target triple implies.
    pub fn triple_default(triple: &Triple) -> CallConv {
        match triple.operating_system {
            OperatingSystem::Windows => CallConv::WindowsFastcall,
            _ => CallConv::SystemV,
        }
    }

    /// Integer argument registers, in slot order.
    pub fn int_args(self) -> &'static [Gpr] {
        match self {
            CallConv::SystemV => &SYSV_INT_ARGS,
            CallConv::WindowsFastcall => &WIN_INT_ARGS,
        }
    }

    /// Floating argument registers, in slot order.
    pub fn float_args(self) -> &'static [Xmm] {
        match self {
            CallConv::SystemV => &SYSV_FLOAT_ARGS,
            CallConv::WindowsFastcall => &WIN_FLOAT_ARGS,
        }
    }

    /// Bytes of callee home space the caller reserves below its outgoing
    /// arguments.
    pub fn shadow_space(self) -> u32 {
        match self {
            CallConv::SystemV => 0,
            CallConv::WindowsFastcall => 32,
        }
    }

    /// GPRs the register allocator may hand out.
    pub fn allocatable_gprs(self) -> &'static [Gpr] {
        match self {
            CallConv::SystemV => &SYSV_POOL,
            CallConv::WindowsFastcall => &WIN_POOL,
        }
    }

    /// Number of XMM registers the allocator may hand out (the rest are
    /// callee-saved on Windows).
    pub fn allocatable_xmms(self) -> u8 {
        match self {
            CallConv::SystemV => 16,
            CallConv::WindowsFastcall => 6,
        }
    }

    /// True if `reg` does not survive a call.
    pub fn is_caller_saved_gpr(self, reg: Gpr) -> bool {
        match self {
            CallConv::SystemV => !matches!(
                reg,
                Gpr::RBX | Gpr::RSP | Gpr::RBP | Gpr::R12 | Gpr::R13 | Gpr::R14 | Gpr::R15
            ),
            CallConv::WindowsFastcall => matches!(
                reg,
                Gpr::RAX | Gpr::RCX | Gpr::RDX | Gpr::R8 | Gpr::R9 | Gpr::R10 | Gpr::R11
            ),
        }
    }

    /// True if `xmm` does not survive a call.
    pub fn is_caller_saved_xmm(self, xmm: Xmm) -> bool {
        match self {
            CallConv::SystemV => true,
            CallConv::WindowsFastcall => xmm.enc() < 6,
        }
    }
}

/// How one struct argument travels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructPassing {
    /// By value in one GPR.
    OneReg,
    /// By value in two consecutive GPRs (System V, 9–16 bytes).
    TwoRegs,
    /// By hidden pointer to a caller-owned copy.
    ByPointer,
}

/// Classify a by-value struct argument of `size_bytes`.
pub fn struct_passing(conv: CallConv, size_bytes: u32) -> StructPassing {
    match conv {
        CallConv::SystemV => {
            if size_bytes <= 8 {
                StructPassing::OneReg
            } else if size_bytes <= 16 {
                StructPassing::TwoRegs
            } else {
                StructPassing::ByPointer
            }
        }
        CallConv::WindowsFastcall => {
            if matches!(size_bytes, 1 | 2 | 4 | 8) {
                StructPassing::OneReg
            } else {
                StructPassing::ByPointer
            }
        }
    }
}

/// Pre-classification of one call argument.
#[derive(Clone, Copy, Debug)]
pub struct ArgShape {
    /// Travels in an XMM register.
    pub is_float: bool,
    /// Occupies two consecutive GPRs (System V 9–16 byte struct).
    pub two_gpr: bool,
    /// Lands in the variadic tail of the callee's parameter list.
    pub is_variadic_arg: bool,
}

/// Where one argument goes at the call boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgSlot {
    /// One integer register.
    IntReg(Gpr),
    /// One XMM register.
    FloatReg(Xmm),
    /// XMM register plus the positionally matching GPR (Windows variadic:
    /// the bit pattern is duplicated so `va_arg` finds it either way).
    FloatRegMirrored(Xmm, Gpr),
    /// Two consecutive integer registers, low half first.
    IntRegPair(Gpr, Gpr),
    /// On the stack at this byte offset from RSP at the call point.
    Stack(u32),
}

/// A classified call: one slot per argument plus area sizes.
#[derive(Debug, Default)]
pub struct CallPlan {
    /// One entry per argument, in source order.
    pub slots: Vec<ArgSlot>,
    /// Outgoing stack bytes used by overflow arguments (beyond shadow
    /// space).
    pub stack_bytes: u32,
    /// XMM registers used by variadic arguments (System V sets AL to this).
    pub xmm_count: u8,
}

/// Assign every argument its slot.
///
/// Windows uses one unified position counter across both banks; System V
/// keeps independent integer and floating counters.
pub fn classify_args(conv: CallConv, args: &[ArgShape]) -> CallPlan {
    let mut plan = CallPlan::default();
    match conv {
        CallConv::WindowsFastcall => {
            let mut pos = 0usize;
            for arg in args {
                if pos < 4 {
                    let slot = if arg.is_float {
                        plan.xmm_count += 1;
                        if arg.is_variadic_arg {
                            ArgSlot::FloatRegMirrored(WIN_FLOAT_ARGS[pos], WIN_INT_ARGS[pos])
                        } else {
                            ArgSlot::FloatReg(WIN_FLOAT_ARGS[pos])
                        }
                    } else {
                        ArgSlot::IntReg(WIN_INT_ARGS[pos])
                    };
                    plan.slots.push(slot);
                } else {
                    plan.slots.push(ArgSlot::Stack(pos as u32 * 8));
                    plan.stack_bytes += 8;
                }
                pos += 1;
            }
        }
        CallConv::SystemV => {
            let mut int_idx = 0usize;
            let mut float_idx = 0usize;
            let mut stack = 0u32;
            for arg in args {
                if arg.is_float {
                    if float_idx < SYSV_FLOAT_ARGS.len() {
                        plan.slots.push(ArgSlot::FloatReg(SYSV_FLOAT_ARGS[float_idx]));
                        float_idx += 1;
                        if arg.is_variadic_arg {
                            plan.xmm_count += 1;
                        }
                    } else {
                        plan.slots.push(ArgSlot::Stack(stack));
                        stack += 8;
                    }
                } else if arg.two_gpr {
                    if int_idx + 1 < SYSV_INT_ARGS.len() {
                        plan.slots.push(ArgSlot::IntRegPair(
                            SYSV_INT_ARGS[int_idx],
                            SYSV_INT_ARGS[int_idx + 1],
                        ));
                        int_idx += 2;
                    } else {
                        plan.slots.push(ArgSlot::Stack(stack));
                        stack += 16;
                    }
                } else if int_idx < SYSV_INT_ARGS.len() {
                    plan.slots.push(ArgSlot::IntReg(SYSV_INT_ARGS[int_idx]));
                    int_idx += 1;
                } else {
                    plan.slots.push(ArgSlot::Stack(stack));
                    stack += 8;
                }
            }
            plan.stack_bytes = stack;
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_arg() -> ArgShape {
        ArgShape {
            is_float: false,
            two_gpr: false,
            is_variadic_arg: false,
        }
    }

    fn float_arg(variadic: bool) -> ArgShape {
        ArgShape {
            is_float: true,
            two_gpr: false,
            is_variadic_arg: variadic,
        }
    }

    #[test]
    fn sysv_integer_slots_in_order() {
        let plan = classify_args(CallConv::SystemV, &[int_arg(); 7]);
        assert_eq!(plan.slots[0], ArgSlot::IntReg(Gpr::RDI));
        assert_eq!(plan.slots[3], ArgSlot::IntReg(Gpr::RCX));
        assert_eq!(plan.slots[5], ArgSlot::IntReg(Gpr::R9));
        assert_eq!(plan.slots[6], ArgSlot::Stack(0));
        assert_eq!(plan.stack_bytes, 8);
    }

    #[test]
    fn sysv_banks_are_independent() {
        let plan = classify_args(
            CallConv::SystemV,
            &[int_arg(), float_arg(false), int_arg(), float_arg(false)],
        );
        assert_eq!(plan.slots[0], ArgSlot::IntReg(Gpr::RDI));
        assert_eq!(plan.slots[1], ArgSlot::FloatReg(Xmm::XMM0));
        assert_eq!(plan.slots[2], ArgSlot::IntReg(Gpr::RSI));
        assert_eq!(plan.slots[3], ArgSlot::FloatReg(Xmm::XMM1));
    }

    #[test]
    fn win64_unified_positions_and_mirroring() {
        let plan = classify_args(
            CallConv::WindowsFastcall,
            &[int_arg(), float_arg(true), int_arg(), float_arg(true), int_arg()],
        );
        assert_eq!(plan.slots[0], ArgSlot::IntReg(Gpr::RCX));
        assert_eq!(
            plan.slots[1],
            ArgSlot::FloatRegMirrored(Xmm::XMM1, Gpr::RDX)
        );
        assert_eq!(plan.slots[2], ArgSlot::IntReg(Gpr::R8));
        assert_eq!(
            plan.slots[3],
            ArgSlot::FloatRegMirrored(Xmm::XMM3, Gpr::R9)
        );
        // Fifth argument overflows past the four shared slots.
        assert_eq!(plan.slots[4], ArgSlot::Stack(32));
    }

    #[test]
    fn sysv_al_counts_variadic_xmm_args() {
        let plan = classify_args(
            CallConv::SystemV,
            &[float_arg(false), float_arg(true), float_arg(true)],
        );
        assert_eq!(plan.xmm_count, 2);
    }

    #[test]
    fn struct_passing_rules() {
        assert_eq!(struct_passing(CallConv::SystemV, 8), StructPassing::OneReg);
        assert_eq!(struct_passing(CallConv::SystemV, 12), StructPassing::TwoRegs);
        assert_eq!(
            struct_passing(CallConv::SystemV, 24),
            StructPassing::ByPointer
        );
        assert_eq!(
            struct_passing(CallConv::WindowsFastcall, 8),
            StructPassing::OneReg
        );
        assert_eq!(
            struct_passing(CallConv::WindowsFastcall, 12),
            StructPassing::ByPointer
        );
    }
}
