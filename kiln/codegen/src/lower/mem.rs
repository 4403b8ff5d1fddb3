//! Data movement: assignment, lvalue write-back, string literals,
//! globals, arrays, members, pointers and address materialization.

use super::Lowerer;
use crate::asm::{emit, Gpr, OperandSize, Xmm};
use crate::regalloc::AnyReg;
use crate::result::{CodegenError, CodegenResult};
use kiln_ir::{IrInstruction, IrPayload, IrType, IrValue, TypedValue};
use kiln_object::{RelocKind, SectionRef, SymbolScope};

impl<'a, K: kiln_object::ObjectKind> Lowerer<'a, K> {
    /// Store `src` back into an lvalue operand: through the registered
    /// reference pointer when the operand is a reference variable, into
    /// the slot otherwise. References are written through, never rebound.
    pub(crate) fn write_back_lvalue(&mut self, lv: &TypedValue, src: Gpr) -> CodegenResult<()> {
        let slot = self.slot_of(lv)?;
        let refinfo = self.f()?.frame.reference_at(slot);
        match refinfo {
            Some(info) if !info.holds_address_only => {
                let ptr = self.load_slot_gpr(slot, 64, false)?;
                let size = OperandSize::from_bits(info.value_size_bits);
                emit::mov_m_r(&mut self.buf, size, ptr, 0, src);
                self.release(AnyReg::Gpr(ptr));
            }
            _ => {
                let size = OperandSize::from_bits(lv.storage_bits());
                emit::mov_m_r(&mut self.buf, size, Gpr::RBP, slot, src);
                self.regs.forget_slot(slot);
            }
        }
        Ok(())
    }

    /// Floating counterpart of [`Self::write_back_lvalue`].
    pub(crate) fn write_back_lvalue_xmm(&mut self, lv: &TypedValue, src: Xmm) -> CodegenResult<()> {
        let slot = self.slot_of(lv)?;
        let is_double = lv.size_bits == 64;
        let refinfo = self.f()?.frame.reference_at(slot);
        match refinfo {
            Some(info) if !info.holds_address_only => {
                let ptr = self.load_slot_gpr(slot, 64, false)?;
                emit::movs_m_r(&mut self.buf, info.value_size_bits == 64, ptr, 0, src);
                self.release(AnyReg::Gpr(ptr));
            }
            _ => {
                emit::movs_m_r(&mut self.buf, is_double, Gpr::RBP, slot, src);
                self.regs.forget_slot(slot);
            }
        }
        Ok(())
    }

    /// The `Assignment` handler, branching on the LHS shape exactly as the
    /// value model requires: pointer store, function pointer, struct copy,
    /// reference write-through, or a plain sized store.
    pub(crate) fn lower_assignment(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Assignment(op) => Some(op.clone()),
            _ => None,
        })?;

        if op.is_pointer_store {
            // LHS temp holds a destination address.
            let ptr = self.read_gpr(&op.lhs, false)?;
            if op.rhs.in_xmm() {
                let v = self.read_xmm(&op.rhs)?;
                emit::movs_m_r(&mut self.buf, op.rhs.size_bits == 64, ptr, 0, v);
                self.release(AnyReg::Xmm(v));
            } else {
                let v = self.read_value_for_store(&op.rhs, op.dereference_rhs_references)?;
                let size = OperandSize::from_bits(op.rhs.storage_bits());
                emit::mov_m_r(&mut self.buf, size, ptr, 0, v);
                self.release(AnyReg::Gpr(v));
            }
            self.release(AnyReg::Gpr(ptr));
            return Ok(());
        }

        if op.lhs.ty == IrType::Struct && op.lhs.pointer_depth == 0 {
            // Struct-to-struct copy in descending power-of-two chunks.
            let dst = self.read_addr(&op.lhs)?;
            let src = self.read_addr(&op.rhs)?;
            let bytes = (op.lhs.size_bits + 7) / 8;
            self.emit_memcpy(dst, src, bytes);
            self.release(AnyReg::Gpr(dst));
            self.release(AnyReg::Gpr(src));
            return Ok(());
        }

        let lhs_slot = self.slot_of(&op.lhs)?;
        let lhs_ref = self.f()?.frame.reference_at(lhs_slot);
        let write_through = matches!(lhs_ref, Some(info) if !info.holds_address_only);

        if op.lhs.in_xmm() && !write_through {
            let v = self.read_xmm(&op.rhs)?;
            emit::movs_m_r(&mut self.buf, op.lhs.size_bits == 64, Gpr::RBP, lhs_slot, v);
            self.release(AnyReg::Xmm(v));
            self.regs.forget_slot(lhs_slot);
            return Ok(());
        }

        if write_through {
            let info = lhs_ref.unwrap();
            let ptr = self.load_slot_gpr(lhs_slot, 64, false)?;
            if info.value_ty.is_float() {
                let v = self.read_xmm(&op.rhs)?;
                emit::movs_m_r(&mut self.buf, info.value_size_bits == 64, ptr, 0, v);
                self.release(AnyReg::Xmm(v));
            } else {
                let v = self.read_value_for_store(&op.rhs, op.dereference_rhs_references)?;
                let size = OperandSize::from_bits(info.value_size_bits);
                emit::mov_m_r(&mut self.buf, size, ptr, 0, v);
                self.release(AnyReg::Gpr(v));
            }
            self.release(AnyReg::Gpr(ptr));
            return Ok(());
        }

        // Plain local store. Small integer immediates store directly.
        let size = OperandSize::from_bits(op.lhs.storage_bits());
        if let IrValue::Imm(bits) = op.rhs.value {
            if i32::try_from(bits as i64).is_ok() {
                emit::mov_m_i32(&mut self.buf, size, Gpr::RBP, lhs_slot, bits as i64 as i32);
                self.regs.forget_slot(lhs_slot);
                return Ok(());
            }
        }
        let v = self.read_value_for_store(&op.rhs, op.dereference_rhs_references)?;
        emit::mov_m_r(&mut self.buf, size, Gpr::RBP, lhs_slot, v);
        self.release(AnyReg::Gpr(v));
        self.regs.forget_slot(lhs_slot);
        Ok(())
    }

    /// RHS materialization for stores: like `read_gpr`, honoring the
    /// assignment's opt-out of reference dereferencing.
    fn read_value_for_store(&mut self, rhs: &TypedValue, deref_refs: bool) -> CodegenResult<Gpr> {
        self.read_gpr(rhs, deref_refs)
    }

    pub(crate) fn lower_string_literal(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::StringLiteral(op) => Some(op.clone()),
            _ => None,
        })?;
        let symbol = format!(".str.{}", self.string_lit_seq);
        self.string_lit_seq += 1;
        let mut bytes = op.bytes;
        bytes.push(0);
        let off = self.module.append_data(SectionRef::RData, &bytes, 1);
        self.module.define_data_symbol(
            &symbol,
            SectionRef::RData,
            off,
            bytes.len() as u32,
            SymbolScope::Local,
        );
        let reg = self.alloc_gpr();
        self.lea_symbol(reg, &symbol);
        self.def_temp(op.result, 64, AnyReg::Gpr(reg))
    }

    pub(crate) fn lower_global_load(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::GlobalLoad(op) => Some(op.clone()),
            _ => None,
        })?;
        let name = self.ctx.str(op.var_name).to_string();
        if op.ty.in_xmm() {
            let x = self.alloc_xmm();
            // movss/movsd xmm, [rip+sym]
            let is_double = op.ty.size_bits == 64;
            self.buf_put_sse_rip_load(is_double, x, &name);
            return self.def_temp(op.result, op.ty.size_bits, AnyReg::Xmm(x));
        }
        let reg = self.alloc_gpr();
        let size = OperandSize::from_bits(op.ty.storage_bits());
        let patch = emit::mov_r_rip(&mut self.buf, size, reg);
        self.buf.reloc_at(patch, RelocKind::X86PCRel4, &name, -4);
        self.def_temp(op.result, op.ty.storage_bits(), AnyReg::Gpr(reg))
    }

    fn buf_put_sse_rip_load(&mut self, is_double: bool, dst: Xmm, symbol: &str) {
        use crate::asm::{modrm, put_rex};
        use crate::buffer::CodeSink;
        self.buf.put1(if is_double { 0xF2 } else { 0xF3 });
        put_rex(&mut self.buf, false, dst.enc(), 0, 0, false);
        self.buf.put1(0x0F);
        self.buf.put1(0x10);
        self.buf.put1(modrm(0b00, dst.enc(), 0b101));
        let at = self.buf.current_offset();
        self.buf.put4(0);
        self.buf.reloc_at(at, RelocKind::X86PCRel4, symbol, -4);
    }

    pub(crate) fn lower_global_store(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::GlobalStore(op) => Some(op.clone()),
            _ => None,
        })?;
        let name = self.ctx.str(op.var_name).to_string();
        let v = self.read_gpr(&op.value, true)?;
        let size = OperandSize::from_bits(op.ty.storage_bits());
        let patch = emit::mov_rip_r(&mut self.buf, size, v);
        self.buf.reloc_at(patch, RelocKind::X86PCRel4, &name, -4);
        self.release(AnyReg::Gpr(v));
        Ok(())
    }

    /// Base address of an array expression: the array slot itself, the
    /// pointer it holds, or a pointer-held object's member array.
    fn array_base(
        &mut self,
        array: &TypedValue,
        member_offset: u32,
        is_pointer: bool,
    ) -> CodegenResult<Gpr> {
        let base = if is_pointer || array.pointer_depth > 0 {
            self.read_gpr(array, false)?
        } else {
            self.read_addr(array)?
        };
        if member_offset != 0 {
            self.regs.release_and_forget(AnyReg::Gpr(base));
            if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(base)) {
                self.emit_spill(s);
            }
            self.emit_add_imm(OperandSize::S64, base, member_offset as i32);
        }
        Ok(base)
    }

    /// Effective address `base + member_offset + index*element_size`.
    /// Constant indices fold; variable indices multiply with IMUL.
    fn array_element_addr(
        &mut self,
        array: &TypedValue,
        index: &TypedValue,
        element_bytes: u32,
        member_offset: u32,
        is_pointer: bool,
    ) -> CodegenResult<Gpr> {
        let base = self.array_base(array, member_offset, is_pointer)?;
        if let IrValue::Imm(i) = index.value {
            let disp = i as i64 * element_bytes as i64;
            let addr = self.alloc_gpr();
            emit::lea(&mut self.buf, addr, base, disp as i32);
            self.release(AnyReg::Gpr(base));
            return Ok(addr);
        }
        let idx = self.read_gpr(index, true)?;
        self.regs.release_and_forget(AnyReg::Gpr(idx));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(idx)) {
            self.emit_spill(s);
        }
        let scale = self.alloc_gpr();
        emit::mov_ri32(&mut self.buf, scale, element_bytes);
        emit::imul_rr(&mut self.buf, OperandSize::S64, idx, scale);
        self.release(AnyReg::Gpr(scale));
        emit::alu_rr(
            &mut self.buf,
            crate::asm::AluOp::Add,
            OperandSize::S64,
            idx,
            base,
        );
        self.release(AnyReg::Gpr(base));
        Ok(idx)
    }

    pub(crate) fn lower_array_access(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::ArrayAccess(op) => Some(op.clone()),
            _ => None,
        })?;
        let element_bytes = (op.element_type.size_bits + 7) / 8;
        let addr = self.array_element_addr(
            &op.array,
            &op.index,
            element_bytes.max(1),
            op.member_offset,
            op.is_pointer_to_array,
        )?;
        let want_address = inst.opcode == kiln_ir::IrOpcode::ArrayElementAddress
            || op.element_type.ty == IrType::Struct;
        if want_address {
            self.def_temp(op.result, 64, AnyReg::Gpr(addr))?;
            // The result temp holds an address; reads through it must
            // dereference.
            let slot = {
                let f = self.f()?;
                f.frame.temp_slot(op.result.index(), 64)
            };
            let f = self.f()?;
            f.frame.mark_reference(
                slot,
                crate::frame::RefSlot {
                    value_ty: op.element_type.ty,
                    value_size_bits: op.element_type.size_bits,
                    is_rvalue: false,
                    holds_address_only: false,
                },
            );
            return Ok(());
        }
        if op.element_type.in_xmm() {
            let x = self.alloc_xmm();
            emit::movs_r_m(&mut self.buf, op.element_type.size_bits == 64, x, addr, 0);
            self.release(AnyReg::Gpr(addr));
            return self.def_temp(op.result, op.element_type.size_bits, AnyReg::Xmm(x));
        }
        self.regs.release_and_forget(AnyReg::Gpr(addr));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(addr)) {
            self.emit_spill(s);
        }
        let from = OperandSize::from_bits(op.element_type.size_bits);
        match from {
            OperandSize::S8 | OperandSize::S16 => {
                if op.element_type.ty.is_unsigned() {
                    emit::load_zx(&mut self.buf, from, addr, addr, 0);
                } else {
                    emit::load_sx(&mut self.buf, from, OperandSize::S32, addr, addr, 0);
                }
            }
            s => emit::mov_r_m(&mut self.buf, s, addr, addr, 0),
        }
        self.def_temp(op.result, op.element_type.storage_bits(), AnyReg::Gpr(addr))
    }

    pub(crate) fn lower_array_store(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::ArrayStore(op) => Some(op.clone()),
            _ => None,
        })?;
        let element_bytes = ((op.element_type.size_bits + 7) / 8).max(1);
        let addr = self.array_element_addr(
            &op.array,
            &op.index,
            element_bytes,
            op.member_offset,
            op.is_pointer_to_array,
        )?;
        if op.element_type.in_xmm() {
            let v = self.read_xmm(&op.value)?;
            emit::movs_m_r(&mut self.buf, op.element_type.size_bits == 64, addr, 0, v);
            self.release(AnyReg::Xmm(v));
        } else {
            let v = self.read_gpr(&op.value, true)?;
            let size = OperandSize::from_bits(op.element_type.size_bits);
            emit::mov_m_r(&mut self.buf, size, addr, 0, v);
            self.release(AnyReg::Gpr(v));
        }
        self.release(AnyReg::Gpr(addr));
        Ok(())
    }

    fn member_addr(
        &mut self,
        object: &TypedValue,
        member_offset: u32,
        is_pointer: bool,
    ) -> CodegenResult<Gpr> {
        let base = if is_pointer || object.pointer_depth > 0 {
            self.read_gpr(object, false)?
        } else {
            self.read_addr(object)?
        };
        let addr = self.alloc_gpr();
        emit::lea(&mut self.buf, addr, base, member_offset as i32);
        self.release(AnyReg::Gpr(base));
        Ok(addr)
    }

    pub(crate) fn lower_member_access(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Member(op) => Some(op.clone()),
            _ => None,
        })?;
        let addr = self.member_addr(&op.object, op.member_offset, op.is_pointer_access)?;
        let want_address = inst.opcode == kiln_ir::IrOpcode::AddressOfMember
            || op.member_type.ty == IrType::Struct;
        if want_address {
            self.def_temp(op.result, 64, AnyReg::Gpr(addr))?;
            let slot = {
                let f = self.f()?;
                f.frame.temp_slot(op.result.index(), 64)
            };
            let f = self.f()?;
            f.frame.mark_reference(
                slot,
                crate::frame::RefSlot {
                    value_ty: op.member_type.ty,
                    value_size_bits: op.member_type.size_bits,
                    is_rvalue: false,
                    holds_address_only: inst.opcode == kiln_ir::IrOpcode::AddressOfMember,
                },
            );
            return Ok(());
        }
        if op.member_type.in_xmm() {
            let x = self.alloc_xmm();
            emit::movs_r_m(&mut self.buf, op.member_type.size_bits == 64, x, addr, 0);
            self.release(AnyReg::Gpr(addr));
            return self.def_temp(op.result, op.member_type.size_bits, AnyReg::Xmm(x));
        }
        self.regs.release_and_forget(AnyReg::Gpr(addr));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(addr)) {
            self.emit_spill(s);
        }
        let from = OperandSize::from_bits(op.member_type.size_bits);
        match from {
            OperandSize::S8 | OperandSize::S16 => {
                if op.member_type.ty.is_unsigned() {
                    emit::load_zx(&mut self.buf, from, addr, addr, 0);
                } else {
                    emit::load_sx(&mut self.buf, from, OperandSize::S32, addr, addr, 0);
                }
            }
            s => emit::mov_r_m(&mut self.buf, s, addr, addr, 0),
        }
        self.def_temp(op.result, op.member_type.storage_bits(), AnyReg::Gpr(addr))
    }

    pub(crate) fn lower_member_store(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::MemberStore(op) => Some(op.clone()),
            _ => None,
        })?;
        let addr = self.member_addr(&op.object, op.member_offset, op.is_pointer_access)?;
        if op.member_type.in_xmm() {
            let v = self.read_xmm(&op.value)?;
            emit::movs_m_r(&mut self.buf, op.member_type.size_bits == 64, addr, 0, v);
            self.release(AnyReg::Xmm(v));
        } else if op.member_type.ty == IrType::Struct && op.member_type.pointer_depth == 0 {
            let src = self.read_addr(&op.value)?;
            let bytes = (op.member_type.size_bits + 7) / 8;
            self.emit_memcpy(addr, src, bytes);
            self.release(AnyReg::Gpr(src));
        } else {
            let v = self.read_gpr(&op.value, true)?;
            let size = OperandSize::from_bits(op.member_type.size_bits);
            emit::mov_m_r(&mut self.buf, size, addr, 0, v);
            self.release(AnyReg::Gpr(v));
        }
        self.release(AnyReg::Gpr(addr));
        Ok(())
    }

    pub(crate) fn lower_address_of(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Unary(op) => Some(op.clone()),
            _ => None,
        })?;
        let addr = self.read_addr(&op.operand)?;
        self.def_temp(op.result, 64, AnyReg::Gpr(addr))
    }

    pub(crate) fn lower_compute_address(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::ComputeAddress(op) => Some(op.clone()),
            _ => None,
        })?;
        let base = self.read_addr(&op.base)?;
        self.regs.release_and_forget(AnyReg::Gpr(base));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(base)) {
            self.emit_spill(s);
        }
        if op.byte_offset != 0 {
            self.emit_add_imm(OperandSize::S64, base, op.byte_offset);
        }
        self.def_temp(op.result, 64, AnyReg::Gpr(base))
    }

    pub(crate) fn lower_dereference(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Dereference(op) => Some(op.clone()),
            _ => None,
        })?;
        let ptr = self.read_gpr(&op.pointer, true)?;
        self.regs.release_and_forget(AnyReg::Gpr(ptr));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(ptr)) {
            self.emit_spill(s);
        }
        if op.value_type.in_xmm() {
            let x = self.alloc_xmm();
            emit::movs_r_m(&mut self.buf, op.value_type.size_bits == 64, x, ptr, 0);
            self.release(AnyReg::Gpr(ptr));
            return self.def_temp(op.result, op.value_type.size_bits, AnyReg::Xmm(x));
        }
        let from = OperandSize::from_bits(op.value_type.size_bits);
        match from {
            OperandSize::S8 | OperandSize::S16 => {
                if op.value_type.ty.is_unsigned() {
                    emit::load_zx(&mut self.buf, from, ptr, ptr, 0);
                } else {
                    emit::load_sx(&mut self.buf, from, OperandSize::S32, ptr, ptr, 0);
                }
            }
            s => emit::mov_r_m(&mut self.buf, s, ptr, ptr, 0),
        }
        self.def_temp(op.result, op.value_type.storage_bits(), AnyReg::Gpr(ptr))
    }

    pub(crate) fn lower_dereference_store(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::DereferenceStore(op) => Some(op.clone()),
            _ => None,
        })?;
        let ptr = self.read_gpr(&op.pointer, true)?;
        if op.value.in_xmm() {
            let v = self.read_xmm(&op.value)?;
            emit::movs_m_r(&mut self.buf, op.value.size_bits == 64, ptr, 0, v);
            self.release(AnyReg::Xmm(v));
        } else {
            let v = self.read_gpr(&op.value, true)?;
            let size = OperandSize::from_bits(op.value.storage_bits().min(64));
            emit::mov_m_r(&mut self.buf, size, ptr, 0, v);
            self.release(AnyReg::Gpr(v));
        }
        self.release(AnyReg::Gpr(ptr));
        Ok(())
    }
}
