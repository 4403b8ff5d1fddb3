//! Control flow: labels, branches, loops, scopes.

use super::{LoopCtx, Lowerer};
use crate::asm::{emit, AluOp, OperandSize, CC};
use crate::regalloc::AnyReg;
use crate::result::{CodegenError, CodegenResult};
use kiln_ir::{IrInstruction, IrPayload};

impl<'a, K: kiln_object::ObjectKind> Lowerer<'a, K> {
    pub(crate) fn lower_label(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Label(op) => Some(op.clone()),
            _ => None,
        })?;
        self.bind_label(op.label)?;
        debug_assert!(self.regs.is_pristine());
        Ok(())
    }

    pub(crate) fn lower_branch(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Branch(op) => Some(op.clone()),
            _ => None,
        })?;
        self.jump_to(op.target)
    }

    pub(crate) fn lower_cond_branch(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::CondBranch(op) => Some(op.clone()),
            _ => None,
        })?;
        let reg = self.read_gpr(&op.condition, true)?;
        let size = OperandSize::from_bits(op.condition.storage_bits().max(32));
        emit::alu_ri(&mut self.buf, AluOp::Cmp, size, reg, 0);
        self.release(AnyReg::Gpr(reg));
        self.jump_cc_to(CC::E, op.false_target)?;
        self.jump_to(op.true_target)
    }

    pub(crate) fn lower_loop_begin(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::LoopBegin(op) => Some(op.clone()),
            _ => None,
        })?;
        self.f()?.loops.push(LoopCtx {
            end_label: op.end_label,
            increment_label: op.increment_label,
        });
        Ok(())
    }

    pub(crate) fn lower_loop_end(&mut self) -> CodegenResult<()> {
        self.f()?.loops.pop().ok_or_else(|| {
            CodegenError::Internal("LoopEnd without a matching LoopBegin".into())
        })?;
        Ok(())
    }

    pub(crate) fn lower_break(&mut self) -> CodegenResult<()> {
        let target = self
            .f()?
            .loops
            .last()
            .copied()
            .ok_or_else(|| CodegenError::Internal("break outside a loop".into()))?
            .end_label;
        self.jump_to(target)
    }

    pub(crate) fn lower_continue(&mut self) -> CodegenResult<()> {
        let target = self
            .f()?
            .loops
            .last()
            .copied()
            .ok_or_else(|| CodegenError::Internal("continue outside a loop".into()))?
            .increment_label;
        self.jump_to(target)
    }

    pub(crate) fn lower_scope_begin(&mut self) -> CodegenResult<()> {
        self.f()?.frame.push_scope();
        Ok(())
    }

    pub(crate) fn lower_scope_end(&mut self) -> CodegenResult<()> {
        self.f()?.frame.pop_scope();
        Ok(())
    }
}
