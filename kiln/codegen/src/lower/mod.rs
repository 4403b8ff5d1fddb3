//! The per-instruction lowering engine.
//!
//! [`Lowerer`] owns the text buffer, the register file and the object
//! module for one translation unit; [`FuncState`] is rebuilt at every
//! `FunctionDecl`. The dispatcher matches exhaustively on the opcode and
//! treats an unimplemented or mismatched payload as a hard error, never a
//! silent fallthrough.

mod arith;
mod call;
mod eh;
mod flow;
mod func;
mod mem;

use crate::abi::CallConv;
use crate::asm::{emit, AluOp, Gpr, OperandSize, Xmm};
use crate::buffer::{CodeBuffer, CodeOffset, CodeSink};
use crate::eh::{CfiInst, FilterPatch, SehTryBlock, TryBlock};
use crate::frame::Frame;
use crate::regalloc::{AnyReg, RegisterFile, Spill};
use crate::result::{CodegenError, CodegenResult};
use kiln_ir::{
    CompilationContext, IrInstruction, IrOpcode, IrPayload, IrValue, StringId, TempVar, TypedValue,
};
use kiln_object::{ObjectKind, ObjectModule, RelocKind};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// A forward branch awaiting its label.
#[derive(Clone, Debug)]
pub(crate) struct PendingBranch {
    pub target: StringId,
    /// Offset of the 4-byte displacement field.
    pub patch_offset: CodeOffset,
}

/// `break`/`continue` targets of one loop.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LoopCtx {
    pub end_label: StringId,
    pub increment_label: StringId,
}

/// What the pre-scan of a function's instruction run found.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Prescan {
    pub has_cpp_eh: bool,
    pub has_seh: bool,
    /// Total bytes of named locals (8-byte granules).
    pub named_bytes: u32,
}

/// Per-function lowering state, rebuilt at each `FunctionDecl`.
pub(crate) struct FuncState {
    pub name: StringId,
    pub mangled: String,
    pub start: CodeOffset,
    pub frame: Frame,
    pub labels: FxHashMap<StringId, CodeOffset>,
    pub pending: Vec<PendingBranch>,
    pub loops: Vec<LoopCtx>,
    /// Offset of the prologue `SUB RSP` imm32.
    pub sub_rsp_patch: CodeOffset,
    /// Offset of the EH prologue `LEA RBP, [RSP+imm32]` imm32 (COFF EH).
    pub lea_rbp_patch: Option<CodeOffset>,
    pub has_cpp_eh: bool,
    pub has_seh: bool,
    pub is_variadic: bool,
    pub has_hidden_return: bool,
    pub returns_reference: bool,
    /// A constructor ran directly in the hidden return slot (RVO); the
    /// return path must not copy again.
    pub rvo_constructed: bool,
    pub cfi: Vec<CfiInst>,
    pub try_blocks: Vec<TryBlock>,
    pub try_stack: Vec<usize>,
    pub filter_patches: Vec<FilterPatch>,
    /// COFF catch funclets' `LEA RBP, [RDX+imm32]` imm32 offsets.
    pub funclet_lea_patches: Vec<CodeOffset>,
    /// COFF catch continuations' `SUB RSP, imm32` imm32 offsets.
    pub continuation_sub_patches: Vec<CodeOffset>,
    pub seh_blocks: Vec<SehTryBlock>,
    pub seh_stack: Vec<usize>,
    /// Innermost catch context: (try index, handler index).
    pub catch_stack: Vec<(usize, usize)>,
    /// Label bound after a try's last handler (normal-flow resume point).
    pub try_done_labels: Vec<StringId>,
    /// COFF continuation labels the catch funclets resume through.
    pub try_cont_labels: Vec<StringId>,
    /// ELF landing-pad dispatch: the pending "selector did not match this
    /// arm" label of the arm currently open.
    pub catch_next_label: Option<StringId>,
    /// Exit labels of active `__try` regions.
    pub seh_exit_labels: Vec<StringId>,
    /// Lowering is inside an SEH filter funclet.
    pub in_seh_filter: bool,
    /// Next FH3 state number.
    pub next_state: i32,
    /// Sequence for synthesized label names.
    pub synth_seq: u32,
    /// Slot caching the SEH exception code, once saved.
    pub seh_code_slot: Option<i32>,
    /// Label of the catch-return trampoline (COFF), created on the first
    /// `return` inside a catch funclet and emitted at finalization.
    pub catch_ret_label: Option<StringId>,
    /// Slot the trampoline reloads the return value from.
    pub catch_ret_home: Option<i32>,
}

impl FuncState {
    fn new(name: StringId, mangled: String, start: CodeOffset, frame: Frame) -> Self {
        Self {
            name,
            mangled,
            start,
            frame,
            labels: FxHashMap::default(),
            pending: Vec::new(),
            loops: Vec::new(),
            sub_rsp_patch: 0,
            lea_rbp_patch: None,
            has_cpp_eh: false,
            has_seh: false,
            is_variadic: false,
            has_hidden_return: false,
            returns_reference: false,
            rvo_constructed: false,
            cfi: Vec::new(),
            try_blocks: Vec::new(),
            try_stack: Vec::new(),
            filter_patches: Vec::new(),
            funclet_lea_patches: Vec::new(),
            continuation_sub_patches: Vec::new(),
            seh_blocks: Vec::new(),
            seh_stack: Vec::new(),
            catch_stack: Vec::new(),
            try_done_labels: Vec::new(),
            try_cont_labels: Vec::new(),
            catch_next_label: None,
            seh_exit_labels: Vec::new(),
            in_seh_filter: false,
            next_state: 0,
            synth_seq: 0,
            seh_code_slot: None,
            catch_ret_label: None,
            catch_ret_home: None,
        }
    }
}

/// A finalized function's record, consumed at unit finalization (ELF FDE
/// construction needs them all together).
pub(crate) struct FinishedFunction {
    pub mangled: String,
    pub start: CodeOffset,
    pub len: u32,
    pub cfi: Vec<CfiInst>,
    /// Offset of this function's LSDA in `.gcc_except_table`, when it has
    /// one.
    pub lsda_offset: Option<u32>,
}

/// A scheduled vtable emission (flushed at unit finalization).
pub(crate) struct PendingVtable {
    pub class_name: String,
}

/// The translation-unit lowering driver.
pub(crate) struct Lowerer<'a, K: ObjectKind> {
    pub ctx: &'a mut CompilationContext,
    pub buf: CodeBuffer,
    pub module: ObjectModule<K>,
    pub conv: CallConv,
    pub regs: RegisterFile,
    pub func: Option<FuncState>,
    /// Globals declared so far: name → (size_bits, in XMM class).
    pub globals: FxHashMap<StringId, (u32, bool)>,
    pub finished: Vec<FinishedFunction>,
    pub vtables: Vec<PendingVtable>,
    pub needs_dyncast_runtime: bool,
    pub string_lit_seq: u64,
    /// Recoverable per-function failures (reported, then skipped).
    pub error_count: u32,
    /// Set while a function's remaining instructions are being skipped.
    pub skipping: bool,
}

impl<'a, K: ObjectKind> Lowerer<'a, K> {
    pub fn new(ctx: &'a mut CompilationContext, conv: CallConv, module: ObjectModule<K>) -> Self {
        Self {
            ctx,
            buf: CodeBuffer::new(),
            module,
            conv,
            regs: RegisterFile::new(conv),
            func: None,
            globals: FxHashMap::default(),
            finished: Vec::new(),
            vtables: Vec::new(),
            needs_dyncast_runtime: false,
            string_lit_seq: 0,
            error_count: 0,
            skipping: false,
        }
    }

    /// Shorthand: current function state or an internal error.
    pub(crate) fn f(&mut self) -> CodegenResult<&mut FuncState> {
        self.func
            .as_mut()
            .ok_or_else(|| CodegenError::Internal("instruction outside a function".into()))
    }

    pub(crate) fn cur(&self) -> CodeOffset {
        self.buf.current_offset()
    }

    /// Is the target Windows/COFF? Drives the EH model and ABI details.
    pub(crate) fn is_coff(&self) -> bool {
        K::FORMAT == kiln_object::BinFormat::Coff
    }

    // ---- register plumbing ---------------------------------------------

    /// Emit the store a spill request describes.
    pub(crate) fn emit_spill(&mut self, spill: Spill) {
        match spill.reg {
            AnyReg::Gpr(g) => {
                let size = OperandSize::from_bits(spill.size_bits);
                emit::mov_m_r(&mut self.buf, size, Gpr::RBP, spill.slot, g);
            }
            AnyReg::Xmm(x) => {
                emit::movs_m_r(&mut self.buf, spill.size_bits == 64, Gpr::RBP, spill.slot, x);
            }
        }
    }

    fn emit_spills(&mut self, spills: SmallVec<[Spill; 8]>) {
        for s in spills {
            self.emit_spill(s);
        }
    }

    /// Write every dirty register back to its slot.
    pub(crate) fn flush_all(&mut self) {
        let spills = self.regs.flush_dirty();
        self.emit_spills(spills);
    }

    /// Flush and fully reset the allocator (labels, function boundaries).
    pub(crate) fn flush_and_reset(&mut self) {
        self.flush_all();
        self.regs.reset();
    }

    pub(crate) fn alloc_gpr(&mut self) -> Gpr {
        let (reg, spill) = self.regs.allocate_gpr();
        if let Some(s) = spill {
            self.emit_spill(s);
        }
        reg
    }

    pub(crate) fn alloc_xmm(&mut self) -> Xmm {
        let (reg, spill) = self.regs.allocate_xmm();
        if let Some(s) = spill {
            self.emit_spill(s);
        }
        reg
    }

    pub(crate) fn reserve(&mut self, reg: AnyReg) {
        if let Some(s) = self.regs.allocate_specific(reg) {
            self.emit_spill(s);
        }
    }

    pub(crate) fn release(&mut self, reg: AnyReg) {
        self.regs.release(reg);
    }

    // ---- value access ---------------------------------------------------

    /// Frame slot of a temporary or named operand.
    pub(crate) fn slot_of(&mut self, tv: &TypedValue) -> CodegenResult<i32> {
        let bits = tv.storage_bits();
        match tv.value {
            IrValue::Temp(t) => {
                let f = self.f()?;
                Ok(f.frame.temp_slot(t.index(), bits))
            }
            IrValue::Name(n) => {
                let f = self.f()?;
                match f.frame.lookup(n) {
                    Some(s) => Ok(s.offset),
                    // Malformed IR; discard this function and keep going.
                    None => Err(CodegenError::in_function(
                        f.mangled.clone(),
                        format!("unknown variable in operand: handle {n:?}"),
                    )),
                }
            }
            _ => Err(CodegenError::Internal(
                "immediate has no stack slot".into(),
            )),
        }
    }

    /// Materialize an integer/pointer operand in a GPR.
    ///
    /// Reference-typed slots are loaded and then dereferenced unless the
    /// slot was registered as address-only (`this`, hidden return slots)
    /// or `deref_refs` is false.
    pub(crate) fn read_gpr(&mut self, tv: &TypedValue, deref_refs: bool) -> CodegenResult<Gpr> {
        match tv.value {
            IrValue::Imm(bits) => {
                let reg = self.alloc_gpr();
                if tv.storage_bits() == 64 && bits > u32::MAX as u64 {
                    emit::mov_ri64(&mut self.buf, reg, bits);
                } else {
                    emit::mov_ri32(&mut self.buf, reg, bits as u32);
                }
                Ok(reg)
            }
            IrValue::FloatImm(v) => {
                // Raw bit pattern; used for stores and Win64 mirroring.
                let reg = self.alloc_gpr();
                if tv.size_bits == 32 {
                    emit::mov_ri32(&mut self.buf, reg, (v as f32).to_bits());
                } else {
                    emit::mov_ri64(&mut self.buf, reg, v.to_bits());
                }
                Ok(reg)
            }
            _ => {
                let slot = self.slot_of(tv)?;
                let refinfo = self.f()?.frame.reference_at(slot);
                let is_plain_deref = match refinfo {
                    Some(info) => deref_refs && !info.holds_address_only,
                    None => false,
                };
                if is_plain_deref {
                    let info = refinfo.unwrap();
                    let reg = self.load_slot_gpr(slot, 64, false)?;
                    // The register held the referent's address; it will now
                    // hold the referent's value, so drop the association.
                    self.regs.release_and_forget(AnyReg::Gpr(reg));
                    if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(reg)) {
                        self.emit_spill(s);
                    }
                    let from = OperandSize::from_bits(info.value_size_bits);
                    match from {
                        OperandSize::S8 | OperandSize::S16 => {
                            if info.value_ty.is_unsigned() {
                                emit::load_zx(&mut self.buf, from, reg, reg, 0);
                            } else {
                                emit::load_sx(&mut self.buf, from, OperandSize::S32, reg, reg, 0);
                            }
                        }
                        s => emit::mov_r_m(&mut self.buf, s, reg, reg, 0),
                    }
                    Ok(reg)
                } else {
                    let signed = !tv.ty.is_unsigned();
                    self.load_slot_gpr(slot, tv.storage_bits(), signed)
                }
            }
        }
    }

    /// Load a slot into a GPR, reusing a cached register when one exists.
    pub(crate) fn load_slot_gpr(
        &mut self,
        slot: i32,
        size_bits: u32,
        signed: bool,
    ) -> CodegenResult<Gpr> {
        if let Some(AnyReg::Gpr(g)) = self.regs.reg_for_slot(slot) {
            if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(g)) {
                // Keep the cache association; allocate_specific dropped it.
                self.emit_spill(s);
            }
            self.regs.set_slot_clean(AnyReg::Gpr(g), slot, size_bits);
            return Ok(g);
        }
        let reg = self.alloc_gpr();
        match OperandSize::from_bits(size_bits) {
            OperandSize::S8 | OperandSize::S16 => {
                let from = OperandSize::from_bits(size_bits);
                if signed {
                    emit::load_sx(&mut self.buf, from, OperandSize::S32, reg, Gpr::RBP, slot);
                } else {
                    emit::load_zx(&mut self.buf, from, reg, Gpr::RBP, slot);
                }
            }
            s => emit::mov_r_m(&mut self.buf, s, reg, Gpr::RBP, slot),
        }
        self.regs.set_slot_clean(AnyReg::Gpr(reg), slot, size_bits);
        Ok(reg)
    }

    /// Materialize a floating operand in an XMM register.
    pub(crate) fn read_xmm(&mut self, tv: &TypedValue) -> CodegenResult<Xmm> {
        let is_double = tv.size_bits == 64;
        match tv.value {
            IrValue::FloatImm(v) => {
                let gpr = self.alloc_gpr();
                if is_double {
                    emit::mov_ri64(&mut self.buf, gpr, v.to_bits());
                } else {
                    emit::mov_ri32(&mut self.buf, gpr, (v as f32).to_bits());
                }
                let xmm = self.alloc_xmm();
                emit::movq_xmm_gpr(&mut self.buf, xmm, gpr);
                self.release(AnyReg::Gpr(gpr));
                Ok(xmm)
            }
            IrValue::Imm(bits) => {
                let gpr = self.alloc_gpr();
                emit::mov_ri64(&mut self.buf, gpr, bits);
                let xmm = self.alloc_xmm();
                emit::movq_xmm_gpr(&mut self.buf, xmm, gpr);
                self.release(AnyReg::Gpr(gpr));
                Ok(xmm)
            }
            _ => {
                let slot = self.slot_of(tv)?;
                let refinfo = self.f()?.frame.reference_at(slot);
                if let Some(info) = refinfo {
                    if !info.holds_address_only {
                        let ptr = self.load_slot_gpr(slot, 64, false)?;
                        let xmm = self.alloc_xmm();
                        emit::movs_r_m(
                            &mut self.buf,
                            info.value_size_bits == 64,
                            xmm,
                            ptr,
                            0,
                        );
                        self.release(AnyReg::Gpr(ptr));
                        return Ok(xmm);
                    }
                }
                if let Some(AnyReg::Xmm(x)) = self.regs.reg_for_slot(slot) {
                    if let Some(s) = self.regs.allocate_specific(AnyReg::Xmm(x)) {
                        self.emit_spill(s);
                    }
                    self.regs.set_slot_clean(AnyReg::Xmm(x), slot, tv.size_bits);
                    return Ok(x);
                }
                let xmm = self.alloc_xmm();
                emit::movs_r_m(&mut self.buf, is_double, xmm, Gpr::RBP, slot);
                self.regs.set_slot_clean(AnyReg::Xmm(xmm), slot, tv.size_bits);
                Ok(xmm)
            }
        }
    }

    /// Address of an lvalue operand: `LEA` of its slot, or the pointer the
    /// slot holds when it is a registered reference.
    pub(crate) fn read_addr(&mut self, tv: &TypedValue) -> CodegenResult<Gpr> {
        let slot = self.slot_of(tv)?;
        let refinfo = self.f()?.frame.reference_at(slot);
        if refinfo.is_some() || tv.pointer_depth > 0 {
            self.load_slot_gpr(slot, 64, false)
        } else {
            let reg = self.alloc_gpr();
            emit::lea(&mut self.buf, reg, Gpr::RBP, slot);
            Ok(reg)
        }
    }

    /// Bind `reg` as the value of result temporary `t`. The store to the
    /// slot is deferred to the next flush.
    pub(crate) fn def_temp(&mut self, t: TempVar, size_bits: u32, reg: AnyReg) -> CodegenResult<()> {
        let slot = {
            let f = self.f()?;
            f.frame.temp_slot(t.index(), size_bits)
        };
        self.regs.set_slot(reg, slot, size_bits.max(32));
        self.regs.release(reg);
        Ok(())
    }

    /// Store `reg` straight to a temporary's slot (paths that must not
    /// leave dirty state, e.g. around calls).
    pub(crate) fn store_temp_now(
        &mut self,
        t: TempVar,
        size_bits: u32,
        reg: Gpr,
    ) -> CodegenResult<()> {
        let slot = {
            let f = self.f()?;
            f.frame.temp_slot(t.index(), size_bits)
        };
        emit::mov_m_r(
            &mut self.buf,
            OperandSize::from_bits(size_bits.max(32)),
            Gpr::RBP,
            slot,
            reg,
        );
        self.regs.forget_slot(slot);
        Ok(())
    }

    // ---- labels and branches -------------------------------------------

    /// Intern a fresh function-local label name.
    pub(crate) fn synth_label(&mut self, prefix: &str) -> CodegenResult<StringId> {
        let seq = {
            let f = self.f()?;
            f.synth_seq += 1;
            f.synth_seq
        };
        Ok(self.ctx.interner.intern(&format!("{prefix}${seq}")))
    }

    /// Bind a label here. Dirty registers flush first (they belong to the
    /// preceding straight-line flow) and the allocator resets: merge
    /// points must not inherit speculative caches.
    pub(crate) fn bind_label(&mut self, label: StringId) -> CodegenResult<()> {
        self.flush_and_reset();
        let at = self.cur();
        let f = self.f()?;
        debug_assert!(!f.labels.contains_key(&label), "label bound twice");
        f.labels.insert(label, at);
        Ok(())
    }

    /// Emit `jmp rel32` to a (possibly forward) label.
    pub(crate) fn jump_to(&mut self, label: StringId) -> CodegenResult<()> {
        self.flush_all();
        let patch = emit::jmp_rel32(&mut self.buf);
        self.f()?.pending.push(PendingBranch {
            target: label,
            patch_offset: patch,
        });
        Ok(())
    }

    /// Emit `jCC rel32` to a label.
    pub(crate) fn jump_cc_to(&mut self, cc: crate::asm::CC, label: StringId) -> CodegenResult<()> {
        self.flush_all();
        let patch = emit::jcc_rel32(&mut self.buf, cc);
        self.f()?.pending.push(PendingBranch {
            target: label,
            patch_offset: patch,
        });
        Ok(())
    }

    /// Record a patch site that resolves like a branch (funclet LEA of a
    /// continuation label).
    pub(crate) fn pend_patch(&mut self, patch_offset: CodeOffset, label: StringId) -> CodegenResult<()> {
        self.f()?.pending.push(PendingBranch {
            target: label,
            patch_offset,
        });
        Ok(())
    }

    /// Resolve every pending branch of the current function.
    pub(crate) fn patch_branches(&mut self) -> CodegenResult<()> {
        let f = self
            .func
            .as_mut()
            .ok_or_else(|| CodegenError::Internal("patching outside a function".into()))?;
        let name = f.mangled.clone();
        for pb in std::mem::take(&mut f.pending) {
            let Some(&target) = f.labels.get(&pb.target) else {
                return Err(CodegenError::in_function(
                    name,
                    format!("unresolved label at patch offset {}", pb.patch_offset),
                ));
            };
            let disp = target as i64 - (pb.patch_offset as i64 + 4);
            self.buf.patch4(pb.patch_offset, disp as i32 as u32);
        }
        Ok(())
    }

    // ---- small shared emitters -----------------------------------------

    /// `call <symbol>` with a relocation.
    pub(crate) fn call_symbol(&mut self, symbol: &str) {
        let patch = emit::call_rel32(&mut self.buf);
        self.buf
            .reloc_at(patch, RelocKind::X86CallPCRel4, symbol, -4);
    }

    /// `lea reg, [rip + <symbol>]` with a data relocation.
    pub(crate) fn lea_symbol(&mut self, reg: Gpr, symbol: &str) {
        let patch = emit::lea_rip(&mut self.buf, reg);
        self.buf.reloc_at(patch, RelocKind::X86PCRel4, symbol, -4);
    }

    /// Copy `size_bytes` from `[src]` to `[dst]` in 8/4/2/1-byte chunks
    /// through a scratch register.
    pub(crate) fn emit_memcpy(&mut self, dst: Gpr, src: Gpr, size_bytes: u32) {
        let scratch = self.alloc_gpr();
        let mut off: i32 = 0;
        let mut remaining = size_bytes;
        for (bytes, size) in [
            (8u32, OperandSize::S64),
            (4, OperandSize::S32),
            (2, OperandSize::S16),
            (1, OperandSize::S8),
        ] {
            while remaining >= bytes {
                emit::mov_r_m(&mut self.buf, size, scratch, src, off);
                emit::mov_m_r(&mut self.buf, size, dst, off, scratch);
                off += bytes as i32;
                remaining -= bytes;
            }
        }
        self.release(AnyReg::Gpr(scratch));
    }

    /// The shared `add reg, imm` used by increments and pointer math.
    pub(crate) fn emit_add_imm(&mut self, size: OperandSize, reg: Gpr, imm: i32) {
        emit::alu_ri(&mut self.buf, AluOp::Add, size, reg, imm);
    }

    // ---- dispatch -------------------------------------------------------

    /// Lower one instruction. `next_opcode` is the following instruction's
    /// opcode, used to detect the end of catch chains.
    pub fn lower(
        &mut self,
        inst: &IrInstruction,
        rest: &[IrInstruction],
        next_opcode: Option<IrOpcode>,
    ) -> CodegenResult<()> {
        if self.skipping && inst.opcode != IrOpcode::FunctionDecl {
            return Ok(());
        }
        if let (Some(line), Some(_)) = (inst.line, self.func.as_ref()) {
            let at = self.cur();
            self.buf.add_line(at, line);
        }
        log::trace!("lowering {:?}", inst.opcode);
        match inst.opcode {
            IrOpcode::FunctionDecl => self.lower_function_decl(inst, rest),
            IrOpcode::VariableDecl | IrOpcode::StackAlloc => self.lower_variable_decl(inst),
            IrOpcode::GlobalVariableDecl => self.lower_global_decl(inst),
            IrOpcode::Return => self.lower_return(inst),

            IrOpcode::FunctionCall | IrOpcode::IndirectCall => self.lower_call(inst),
            IrOpcode::ConstructorCall => self.lower_constructor_call(inst),
            IrOpcode::DestructorCall => self.lower_destructor_call(inst),
            IrOpcode::VirtualCall => self.lower_virtual_call(inst),
            IrOpcode::FunctionAddress => self.lower_function_address(inst),

            IrOpcode::Add
            | IrOpcode::Subtract
            | IrOpcode::BitwiseAnd
            | IrOpcode::BitwiseOr
            | IrOpcode::BitwiseXor => self.lower_int_binary(inst),
            IrOpcode::Multiply => self.lower_multiply(inst),
            IrOpcode::Divide
            | IrOpcode::UnsignedDivide
            | IrOpcode::Modulo
            | IrOpcode::UnsignedModulo => self.lower_division(inst),
            IrOpcode::ShiftLeft | IrOpcode::ShiftRight | IrOpcode::UnsignedShiftRight => {
                self.lower_shift(inst)
            }
            IrOpcode::FloatAdd
            | IrOpcode::FloatSubtract
            | IrOpcode::FloatMultiply
            | IrOpcode::FloatDivide => self.lower_float_binary(inst),
            IrOpcode::Equal
            | IrOpcode::NotEqual
            | IrOpcode::LessThan
            | IrOpcode::LessEqual
            | IrOpcode::GreaterThan
            | IrOpcode::GreaterEqual
            | IrOpcode::UnsignedLessThan
            | IrOpcode::UnsignedLessEqual
            | IrOpcode::UnsignedGreaterThan
            | IrOpcode::UnsignedGreaterEqual => self.lower_int_compare(inst),
            IrOpcode::FloatEqual
            | IrOpcode::FloatNotEqual
            | IrOpcode::FloatLessThan
            | IrOpcode::FloatLessEqual
            | IrOpcode::FloatGreaterThan
            | IrOpcode::FloatGreaterEqual => self.lower_float_compare(inst),
            IrOpcode::LogicalAnd | IrOpcode::LogicalOr => self.lower_int_binary(inst),
            IrOpcode::LogicalNot | IrOpcode::BitwiseNot | IrOpcode::Negate => {
                self.lower_unary(inst)
            }
            IrOpcode::SignExtend
            | IrOpcode::ZeroExtend
            | IrOpcode::Truncate
            | IrOpcode::FloatToInt
            | IrOpcode::IntToFloat
            | IrOpcode::FloatToFloat => self.lower_conversion(inst),
            IrOpcode::PreIncrement
            | IrOpcode::PostIncrement
            | IrOpcode::PreDecrement
            | IrOpcode::PostDecrement => self.lower_incdec(inst),
            IrOpcode::AddAssign
            | IrOpcode::SubAssign
            | IrOpcode::MulAssign
            | IrOpcode::DivAssign
            | IrOpcode::ModAssign
            | IrOpcode::AndAssign
            | IrOpcode::OrAssign
            | IrOpcode::XorAssign
            | IrOpcode::ShlAssign
            | IrOpcode::ShrAssign => self.lower_compound_assign(inst),

            IrOpcode::Assignment => self.lower_assignment(inst),
            IrOpcode::StringLiteral => self.lower_string_literal(inst),
            IrOpcode::GlobalLoad => self.lower_global_load(inst),
            IrOpcode::GlobalStore => self.lower_global_store(inst),
            IrOpcode::ArrayAccess | IrOpcode::ArrayElementAddress => self.lower_array_access(inst),
            IrOpcode::ArrayStore => self.lower_array_store(inst),
            IrOpcode::MemberAccess | IrOpcode::AddressOfMember => self.lower_member_access(inst),
            IrOpcode::MemberStore => self.lower_member_store(inst),
            IrOpcode::AddressOf => self.lower_address_of(inst),
            IrOpcode::ComputeAddress => self.lower_compute_address(inst),
            IrOpcode::Dereference => self.lower_dereference(inst),
            IrOpcode::DereferenceStore => self.lower_dereference_store(inst),

            IrOpcode::HeapAlloc | IrOpcode::PlacementNew => self.lower_heap_alloc(inst),
            IrOpcode::HeapAllocArray => self.lower_heap_alloc_array(inst),
            IrOpcode::HeapFree | IrOpcode::HeapFreeArray => self.lower_heap_free(inst),

            IrOpcode::Typeid => self.lower_typeid(inst),
            IrOpcode::DynamicCast => self.lower_dynamic_cast(inst),

            IrOpcode::Label => self.lower_label(inst),
            IrOpcode::Branch => self.lower_branch(inst),
            IrOpcode::ConditionalBranch => self.lower_cond_branch(inst),
            IrOpcode::LoopBegin => self.lower_loop_begin(inst),
            IrOpcode::LoopEnd => self.lower_loop_end(),
            IrOpcode::ScopeBegin => self.lower_scope_begin(),
            IrOpcode::ScopeEnd => self.lower_scope_end(),
            IrOpcode::Break => self.lower_break(),
            IrOpcode::Continue => self.lower_continue(),

            IrOpcode::TryBegin => self.lower_try_begin(),
            IrOpcode::TryEnd => self.lower_try_end(),
            IrOpcode::CatchBegin => self.lower_catch_begin(inst),
            IrOpcode::CatchEnd => {
                let next_is_catch = next_opcode == Some(IrOpcode::CatchBegin);
                self.lower_catch_end(next_is_catch)
            }
            IrOpcode::Throw => self.lower_throw(inst),
            IrOpcode::Rethrow => self.lower_rethrow(),

            IrOpcode::SehTryBegin => self.lower_seh_try_begin(),
            IrOpcode::SehTryEnd => self.lower_seh_try_end(),
            IrOpcode::SehExceptBegin => self.lower_seh_except_begin(inst),
            IrOpcode::SehExceptEnd => self.lower_seh_except_end(),
            IrOpcode::SehFinallyBegin => self.lower_seh_finally_begin(),
            IrOpcode::SehFinallyEnd => self.lower_seh_finally_end(),
            IrOpcode::SehFinallyCall => self.lower_seh_finally_call(),
            IrOpcode::SehFilterBegin => self.lower_seh_filter_begin(inst),
            IrOpcode::SehFilterEnd => self.lower_seh_filter_end(),
            IrOpcode::SehLeave => self.lower_seh_leave(),
            IrOpcode::SehGetExceptionCode | IrOpcode::SehSaveExceptionCode => {
                self.lower_seh_exception_code(inst)
            }
        }
    }

    /// Payload helper. A mismatched family is malformed IR: recoverable
    /// inside a function (the function is discarded), fatal outside one.
    pub(crate) fn payload<'i, T>(
        &self,
        inst: &'i IrInstruction,
        extract: impl FnOnce(&'i IrPayload) -> Option<T>,
    ) -> CodegenResult<T> {
        extract(&inst.payload).ok_or_else(|| match &self.func {
            Some(f) => CodegenError::in_function(
                f.mangled.clone(),
                format!("malformed payload for {:?}", inst.opcode),
            ),
            None => CodegenError::Internal(format!("malformed payload for {:?}", inst.opcode)),
        })
    }
}
