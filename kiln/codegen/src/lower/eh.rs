//! Lowering of C++ exception handling and Windows SEH opcodes.
//!
//! Two completely different models share these opcodes. On ELF the try
//! body is covered by an LSDA call-site entry whose landing pad runs
//! selector dispatch (`CMP EDX, filter; JE handler`) with filter values
//! back-patched at finalization. On COFF each catch handler is a funclet
//! with its own mini prologue/epilogue; the parent function resumes at a
//! continuation address the funclet returns in RAX.

use super::Lowerer;
use crate::asm::{emit, modrm, AluOp, Gpr, OperandSize, CC};
use crate::buffer::CodeSink;
use crate::eh::{CatchHandler, FilterPatch, SehTryBlock, TryBlock};
use crate::regalloc::AnyReg;
use crate::result::{CodegenError, CodegenResult};
use kiln_ir::{IrInstruction, IrPayload, IrType, TypedValue};
use kiln_object::BinFormat;

impl<'a, K: kiln_object::ObjectKind> Lowerer<'a, K> {
    pub(crate) fn lower_try_begin(&mut self) -> CodegenResult<()> {
        let done = self.synth_label("__katch_done")?;
        let cont = self.synth_label("__katch_cont")?;
        let coff = self.is_coff();
        let at = self.cur();
        let f = self.f()?;
        let state = f.next_state;
        f.next_state += 2;
        let parent_state = f
            .try_stack
            .last()
            .map(|&i| f.try_blocks[i].state)
            .unwrap_or(-1);
        let index = f.try_blocks.len();
        f.try_blocks.push(TryBlock {
            try_start: at - f.start,
            try_end: 0,
            catch_end: 0,
            handlers: Vec::new(),
            state,
            catch_state: state + 1,
            parent_state,
        });
        f.try_stack.push(index);
        f.try_done_labels.push(done);
        f.try_cont_labels.push(cont);
        if coff {
            // FH3 state transition into the try body.
            emit::mov_m_i32(&mut self.buf, OperandSize::S64, Gpr::RBP, -8, state);
            let after = self.cur();
            let f = self.f()?;
            f.try_blocks[index].try_start = after - f.start;
        }
        Ok(())
    }

    pub(crate) fn lower_try_end(&mut self) -> CodegenResult<()> {
        let coff = self.is_coff();
        if coff {
            emit::mov_m_i32(&mut self.buf, OperandSize::S64, Gpr::RBP, -8, -2);
        }
        let at = self.cur();
        let f = self.f()?;
        let &index = f
            .try_stack
            .last()
            .ok_or_else(|| CodegenError::Internal("TryEnd without TryBegin".into()))?;
        f.try_blocks[index].try_end = at - f.start;
        let done = f.try_done_labels[index];
        self.jump_to(done)
    }

    pub(crate) fn lower_catch_begin(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::CatchBegin(op) => Some(op.clone()),
            _ => None,
        })?;
        let index = *self
            .f()?
            .try_stack
            .last()
            .ok_or_else(|| CodegenError::Internal("CatchBegin outside a try".into()))?;

        // Close the previous arm's miss path (ELF dispatch chain).
        if let Some(next) = self.f()?.catch_next_label.take() {
            self.bind_label(next)?;
        }
        self.regs.reset();

        let handler_index = self.f()?.try_blocks[index].handlers.len();
        let handler_offset = self.cur() - self.f()?.start;
        let class_name = op
            .type_name
            .map(|n| self.ctx.str(n).to_string())
            .filter(|s| !s.is_empty());
        let is_catch_all = class_name.is_none() && op.builtin.is_none();

        let mut catch_obj_offset = 0i32;

        if self.is_coff() {
            // Catch funclet prologue. RDX carries the establisher frame;
            // the parent RBP is re-derived from it with the frame size
            // patched in at finalization.
            emit::push_r(&mut self.buf, Gpr::RBP);
            emit::alu_ri(&mut self.buf, AluOp::Sub, OperandSize::S64, Gpr::RSP, 32);
            self.buf.put1(0x48);
            self.buf.put1(0x8D);
            self.buf.put1(0xAA);
            let lea_at = self.cur();
            self.buf.put4(0);
            self.f()?.funclet_lea_patches.push(lea_at);

            if let Some(var) = op.catch_var {
                let f = self.f()?;
                catch_obj_offset = f.frame.alloc_named(var, op.catch_var_size_bits.max(32), false);
            }
        } else {
            // Landing-pad arm: RDX holds the selector. The immediate is a
            // placeholder; the filter value exists only once the type
            // table order is final.
            self.buf.put1(0x81);
            self.buf.put1(modrm(0b11, 7, Gpr::RDX.enc()));
            let patch_offset = self.cur();
            self.buf.put4(0);
            self.f()?.filter_patches.push(FilterPatch {
                patch_offset,
                try_index: index,
                handler_index,
            });
            let next = self.synth_label("__katch_next")?;
            self.f()?.catch_next_label = Some(next);
            // Selector mismatch tries the next arm (or falls out).
            let miss = emit::jcc_rel32(&mut self.buf, CC::NE);
            self.pend_patch(miss, next)?;

            // Enter the handler: RAX is the exception header.
            emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RDI, Gpr::RAX);
            self.call_symbol("__cxa_begin_catch");
            self.f()?.frame.note_outgoing(0);
            self.regs.invalidate_caller_saved();

            if let Some(var) = op.catch_var {
                let bits = op.catch_var_size_bits.max(32);
                let slot = {
                    let f = self.f()?;
                    f.frame.alloc_named(var, bits, false)
                };
                catch_obj_offset = slot;
                if op.builtin.map(IrType::is_float).unwrap_or(false) {
                    let x = self.alloc_xmm();
                    emit::movs_r_m(&mut self.buf, bits == 64, x, Gpr::RAX, 0);
                    emit::movs_m_r(&mut self.buf, bits == 64, Gpr::RBP, slot, x);
                    self.release(AnyReg::Xmm(x));
                } else if class_name.is_some() && op.catch_var_size_bits > 64 {
                    let dst = self.alloc_gpr();
                    emit::lea(&mut self.buf, dst, Gpr::RBP, slot);
                    let bytes = (op.catch_var_size_bits + 7) / 8;
                    self.emit_memcpy(dst, Gpr::RAX, bytes);
                    self.release(AnyReg::Gpr(dst));
                } else {
                    let tmp = self.alloc_gpr();
                    let size = OperandSize::from_bits(op.catch_var_size_bits.max(32));
                    emit::mov_r_m(&mut self.buf, size, tmp, Gpr::RAX, 0);
                    emit::mov_m_r(&mut self.buf, size, Gpr::RBP, slot, tmp);
                    self.release(AnyReg::Gpr(tmp));
                }
            }
        }

        let f = self.f()?;
        f.try_blocks[index].handlers.push(CatchHandler {
            class_name,
            builtin: op.builtin,
            is_catch_all,
            handler_offset,
            catch_obj_offset,
        });
        f.catch_stack.push((index, handler_index));
        Ok(())
    }

    pub(crate) fn lower_catch_end(&mut self, next_is_catch: bool) -> CodegenResult<()> {
        let (index, _handler) = self
            .f()?
            .catch_stack
            .pop()
            .ok_or_else(|| CodegenError::Internal("CatchEnd outside a catch".into()))?;
        let done = self.f()?.try_done_labels[index];

        if self.is_coff() {
            // Funclet epilogue: hand the continuation address back to
            // __CxxFrameHandler3 in RAX.
            let cont = self.f()?.try_cont_labels[index];
            let lea_at = emit::lea_rip(&mut self.buf, Gpr::RAX);
            self.pend_patch(lea_at, cont)?;
            emit::alu_ri(&mut self.buf, AluOp::Add, OperandSize::S64, Gpr::RSP, 32);
            emit::pop_r(&mut self.buf, Gpr::RBP);
            emit::ret(&mut self.buf);
            self.regs.reset();

            if !next_is_catch {
                // Continuation point: re-reserve the frame the unwinder
                // unwound, then fall into normal flow.
                self.bind_label(cont)?;
                self.buf.put1(0x48);
                self.buf.put1(0x81);
                self.buf.put1(0xEC);
                let sub_at = self.cur();
                self.buf.put4(0);
                self.f()?.continuation_sub_patches.push(sub_at);
                self.bind_label(done)?;
                let at = self.cur();
                let f = self.f()?;
                f.try_blocks[index].catch_end = at - f.start;
                f.try_stack.pop();
                f.try_done_labels.truncate(index);
                f.try_cont_labels.truncate(index);
            }
        } else {
            self.call_symbol("__cxa_end_catch");
            self.regs.invalidate_caller_saved();
            self.jump_to(done)?;
            if let Some(next) = self.f()?.catch_next_label.take() {
                self.bind_label(next)?;
            }
            if !next_is_catch {
                self.bind_label(done)?;
                let at = self.cur();
                let f = self.f()?;
                f.try_blocks[index].catch_end = at - f.start;
                f.try_stack.pop();
                f.try_done_labels.truncate(index);
                f.try_cont_labels.truncate(index);
            }
        }
        Ok(())
    }

    pub(crate) fn lower_throw(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Throw(op) => Some(op.clone()),
            _ => None,
        })?;
        let Some(value) = op.value else {
            return self.lower_rethrow();
        };
        self.flush_all();
        match K::FORMAT {
            BinFormat::Elf => self.lower_throw_elf(&value),
            BinFormat::Coff => self.lower_throw_coff(&value),
        }
    }

    fn lower_throw_elf(&mut self, value: &TypedValue) -> CodegenResult<()> {
        let bytes = ((value.storage_bits() + 7) / 8).max(1);
        self.reserve(AnyReg::Gpr(Gpr::RDI));
        emit::mov_ri32(&mut self.buf, Gpr::RDI, bytes);
        self.call_symbol("__cxa_allocate_exception");
        self.regs.invalidate_caller_saved();

        // RAX points at the exception storage; place the thrown value.
        self.reserve(AnyReg::Gpr(Gpr::RAX));
        let v = self.read_gpr(value, true)?;
        let size = OperandSize::from_bits(value.storage_bits());
        emit::mov_m_r(&mut self.buf, size, Gpr::RAX, 0, v);
        self.release(AnyReg::Gpr(v));

        emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RDI, Gpr::RAX);
        let typeinfo = crate::eh::itanium::typeinfo_symbol_for_type(value, self.ctx);
        self.lea_symbol(Gpr::RSI, &typeinfo);
        emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S32, Gpr::RDX, Gpr::RDX);
        self.call_symbol("__cxa_throw");
        self.f()?.frame.note_outgoing(0);
        self.regs.reset();
        Ok(())
    }

    fn lower_throw_coff(&mut self, value: &TypedValue) -> CodegenResult<()> {
        // Park the thrown value in a dedicated slot; _CxxThrowException
        // takes its address plus the matching _ThrowInfo.
        let slot = {
            let f = self.f()?;
            f.frame.temp_slot(u32::MAX - 2, value.storage_bits().max(64))
        };
        let v = self.read_gpr(value, true)?;
        let size = OperandSize::from_bits(value.storage_bits());
        emit::mov_m_r(&mut self.buf, size, Gpr::RBP, slot, v);
        self.release(AnyReg::Gpr(v));

        self.reserve(AnyReg::Gpr(Gpr::RCX));
        self.reserve(AnyReg::Gpr(Gpr::RDX));
        emit::lea(&mut self.buf, Gpr::RCX, Gpr::RBP, slot);
        let throwinfo = if value.ty == IrType::Int {
            Some(self.ensure_int_throwinfo()?)
        } else {
            None
        };
        match throwinfo {
            Some(symbol) => self.lea_symbol(Gpr::RDX, &symbol),
            None => {
                log::warn!("throw of a non-int type has no _ThrowInfo; runtime will terminate");
                emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S32, Gpr::RDX, Gpr::RDX);
            }
        }
        self.call_symbol("_CxxThrowException");
        let shadow = self.conv.shadow_space();
        self.f()?.frame.note_outgoing(shadow);
        self.regs.reset();
        Ok(())
    }

    pub(crate) fn lower_rethrow(&mut self) -> CodegenResult<()> {
        self.flush_all();
        match K::FORMAT {
            BinFormat::Elf => {
                self.call_symbol("__cxa_rethrow");
            }
            BinFormat::Coff => {
                emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S32, Gpr::RCX, Gpr::RCX);
                emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S32, Gpr::RDX, Gpr::RDX);
                self.call_symbol("_CxxThrowException");
            }
        }
        let shadow = self.conv.shadow_space();
        self.f()?.frame.note_outgoing(shadow);
        self.regs.reset();
        Ok(())
    }

    // ---- SEH -----------------------------------------------------------

    fn require_coff(&self) -> CodegenResult<()> {
        if K::FORMAT != BinFormat::Coff {
            return Err(CodegenError::Unsupported(
                "structured exception handling requires a COFF target".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn lower_seh_try_begin(&mut self) -> CodegenResult<()> {
        self.require_coff()?;
        let exit = self.synth_label("__seh_exit")?;
        let at = self.cur();
        let f = self.f()?;
        let index = f.seh_blocks.len();
        f.seh_blocks.push(SehTryBlock {
            try_start: at - f.start,
            try_end: 0,
            except_offset: None,
            filter_constant: None,
            filter_offset: None,
            finally_offset: None,
        });
        f.seh_stack.push(index);
        f.seh_exit_labels.push(exit);
        Ok(())
    }

    pub(crate) fn lower_seh_try_end(&mut self) -> CodegenResult<()> {
        self.require_coff()?;
        let at = self.cur();
        let f = self.f()?;
        let &index = f
            .seh_stack
            .last()
            .ok_or_else(|| CodegenError::Internal("SehTryEnd without SehTryBegin".into()))?;
        f.seh_blocks[index].try_end = at - f.start;
        let exit = f.seh_exit_labels[index];
        self.jump_to(exit)
    }

    pub(crate) fn lower_seh_except_begin(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        self.require_coff()?;
        let op = self.payload(inst, |p| match p {
            IrPayload::SehExcept(op) => Some(op.clone()),
            _ => None,
        })?;
        self.regs.reset();
        let at = self.cur();
        let f = self.f()?;
        let &index = f
            .seh_stack
            .last()
            .ok_or_else(|| CodegenError::Internal("SehExceptBegin outside __try".into()))?;
        f.seh_blocks[index].except_offset = Some(at - f.start);
        f.seh_blocks[index].filter_constant = op.filter_constant;
        Ok(())
    }

    pub(crate) fn lower_seh_except_end(&mut self) -> CodegenResult<()> {
        self.require_coff()?;
        let f = self.f()?;
        let index = f
            .seh_stack
            .pop()
            .ok_or_else(|| CodegenError::Internal("SehExceptEnd outside __try".into()))?;
        let exit = f.seh_exit_labels[index];
        f.seh_exit_labels.truncate(index);
        self.bind_label(exit)
    }

    pub(crate) fn lower_seh_finally_begin(&mut self) -> CodegenResult<()> {
        self.require_coff()?;
        let at = self.cur();
        let f = self.f()?;
        let &index = f
            .seh_stack
            .last()
            .ok_or_else(|| CodegenError::Internal("SehFinallyBegin outside __try".into()))?;
        f.seh_blocks[index].finally_offset = Some(at - f.start);
        // Termination-handler funclet: RDX is the establisher frame.
        emit::push_r(&mut self.buf, Gpr::RBP);
        emit::alu_ri(&mut self.buf, AluOp::Sub, OperandSize::S64, Gpr::RSP, 32);
        self.buf.put1(0x48);
        self.buf.put1(0x8D);
        self.buf.put1(0xAA);
        let lea_at = self.cur();
        self.buf.put4(0);
        self.f()?.funclet_lea_patches.push(lea_at);
        self.regs.reset();
        Ok(())
    }

    pub(crate) fn lower_seh_finally_end(&mut self) -> CodegenResult<()> {
        self.require_coff()?;
        emit::alu_ri(&mut self.buf, AluOp::Add, OperandSize::S64, Gpr::RSP, 32);
        emit::pop_r(&mut self.buf, Gpr::RBP);
        emit::ret(&mut self.buf);
        let f = self.f()?;
        let index = f
            .seh_stack
            .pop()
            .ok_or_else(|| CodegenError::Internal("SehFinallyEnd outside __try".into()))?;
        let exit = f.seh_exit_labels[index];
        f.seh_exit_labels.truncate(index);
        self.bind_label(exit)
    }

    pub(crate) fn lower_seh_finally_call(&mut self) -> CodegenResult<()> {
        self.require_coff()?;
        let target = {
            let f = self.f()?;
            f.seh_blocks
                .iter()
                .rev()
                .find_map(|b| b.finally_offset)
                .ok_or_else(|| {
                    CodegenError::Internal("SehFinallyCall without a __finally funclet".into())
                })?
                + f.start
        };
        self.flush_all();
        // Local invocation of the termination handler on the normal path.
        let patch = emit::call_rel32(&mut self.buf);
        let disp = target as i64 - (patch as i64 + 4);
        self.buf.patch4(patch, disp as i32 as u32);
        self.regs.invalidate_caller_saved();
        Ok(())
    }

    pub(crate) fn lower_seh_filter_begin(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        self.require_coff()?;
        let op = self.payload(inst, |p| match p {
            IrPayload::SehExcept(op) => Some(op.clone()),
            _ => None,
        })?;
        let at = self.cur();
        let f = self.f()?;
        let &index = f
            .seh_stack
            .last()
            .ok_or_else(|| CodegenError::Internal("SehFilterBegin outside __try".into()))?;
        f.seh_blocks[index].filter_offset = Some(at - f.start);
        f.seh_blocks[index].filter_constant = op.filter_constant;
        f.in_seh_filter = true;
        // Filter funclet: RCX = EXCEPTION_POINTERS, RDX = establisher.
        emit::push_r(&mut self.buf, Gpr::RBP);
        emit::alu_ri(&mut self.buf, AluOp::Sub, OperandSize::S64, Gpr::RSP, 32);
        self.regs.reset();
        Ok(())
    }

    pub(crate) fn lower_seh_filter_end(&mut self) -> CodegenResult<()> {
        self.require_coff()?;
        // The filter's decision is already in EAX.
        emit::alu_ri(&mut self.buf, AluOp::Add, OperandSize::S64, Gpr::RSP, 32);
        emit::pop_r(&mut self.buf, Gpr::RBP);
        emit::ret(&mut self.buf);
        self.f()?.in_seh_filter = false;
        self.regs.reset();
        Ok(())
    }

    pub(crate) fn lower_seh_leave(&mut self) -> CodegenResult<()> {
        self.require_coff()?;
        let exit = {
            let f = self.f()?;
            let &index = f
                .seh_stack
                .last()
                .ok_or_else(|| CodegenError::Internal("__leave outside __try".into()))?;
            f.seh_exit_labels[index]
        };
        self.jump_to(exit)
    }

    pub(crate) fn lower_seh_exception_code(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        self.require_coff()?;
        let op = self.payload(inst, |p| match p {
            IrPayload::SehCode(op) => Some(op.clone()),
            _ => None,
        })?;
        let in_filter = self.f()?.in_seh_filter;
        let code_slot = {
            let f = self.f()?;
            if f.seh_code_slot.is_none() {
                f.seh_code_slot = Some(f.frame.temp_slot(u32::MAX - 3, 64));
            }
            f.seh_code_slot.unwrap()
        };
        if in_filter {
            // RCX is EXCEPTION_POINTERS; the record's first field is the
            // exception code.
            let reg = self.alloc_gpr();
            emit::mov_r_m(&mut self.buf, OperandSize::S64, reg, Gpr::RCX, 0);
            emit::mov_r_m(&mut self.buf, OperandSize::S32, reg, reg, 0);
            emit::mov_m_r(&mut self.buf, OperandSize::S32, Gpr::RBP, code_slot, reg);
            self.def_temp(op.result, 32, AnyReg::Gpr(reg))
        } else {
            let reg = self.load_slot_gpr(code_slot, 32, false)?;
            self.def_temp(op.result, 32, AnyReg::Gpr(reg))
        }
    }
}
