//! Calls: direct, indirect, constructors, destructors, virtual dispatch,
//! heap operations, `typeid` and `dynamic_cast`.

use super::Lowerer;
use crate::abi::{classify_args, struct_passing, ArgShape, ArgSlot, StructPassing};
use crate::asm::{emit, AluOp, Gpr, OperandSize, Xmm, CC};
use crate::regalloc::AnyReg;
use crate::result::{CodegenError, CodegenResult};
use kiln_ir::{IrInstruction, IrOpcode, IrPayload, IrType, IrValue, TempVar, TypeDesc, TypedValue};
use kiln_object::BinFormat;

/// How one argument's bits are produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ArgMode {
    /// The value itself.
    Value,
    /// The value's address (references, large structs, `this`).
    Address,
    /// The value's address plus a byte offset (base-class subobjects).
    AddressWithOffset(i32),
}

/// Who is being called.
pub(crate) enum Callee {
    /// A named symbol.
    Direct(String),
    /// A function pointer value.
    Indirect(TypedValue),
    /// A vtable slot of an object.
    Virtual {
        object: TypedValue,
        object_is_pointer: bool,
        vtable_index: u32,
    },
}

impl<'a, K: kiln_object::ObjectKind> Lowerer<'a, K> {
    fn load_operand_into_gpr(
        &mut self,
        tv: &TypedValue,
        dst: Gpr,
        deref_refs: bool,
    ) -> CodegenResult<()> {
        // Immediates materialize straight into the destination.
        match tv.value {
            IrValue::Imm(bits) => {
                if tv.storage_bits() == 64 && bits > u32::MAX as u64 {
                    emit::mov_ri64(&mut self.buf, dst, bits);
                } else {
                    emit::mov_ri32(&mut self.buf, dst, bits as u32);
                }
                return Ok(());
            }
            IrValue::FloatImm(v) => {
                if tv.size_bits == 32 {
                    emit::mov_ri32(&mut self.buf, dst, (v as f32).to_bits());
                } else {
                    emit::mov_ri64(&mut self.buf, dst, v.to_bits());
                }
                return Ok(());
            }
            _ => {}
        }
        let src = self.read_gpr(tv, deref_refs)?;
        if src != dst {
            emit::mov_rr(&mut self.buf, OperandSize::S64, dst, src);
        }
        self.release(AnyReg::Gpr(src));
        Ok(())
    }

    fn load_address_into_gpr(&mut self, tv: &TypedValue, dst: Gpr, extra: i32) -> CodegenResult<()> {
        let src = self.read_addr(tv)?;
        if extra != 0 {
            emit::lea(&mut self.buf, dst, src, extra);
        } else if src != dst {
            emit::mov_rr(&mut self.buf, OperandSize::S64, dst, src);
        }
        self.release(AnyReg::Gpr(src));
        Ok(())
    }

    fn load_float_into_xmm(&mut self, tv: &TypedValue, dst: Xmm) -> CodegenResult<()> {
        let src = self.read_xmm(tv)?;
        if src != dst {
            emit::movs_rr(&mut self.buf, tv.size_bits == 64, dst, src);
        }
        self.release(AnyReg::Xmm(src));
        Ok(())
    }

    /// The full call protocol: flush, classify, stack args first, then
    /// register args, hidden return pointer, variadic AL, the call itself,
    /// and caller-saved invalidation.
    pub(crate) fn emit_call(
        &mut self,
        callee: Callee,
        args: &[(TypedValue, ArgMode)],
        is_variadic: bool,
        hidden_ret_slot: Option<i32>,
    ) -> CodegenResult<()> {
        self.flush_all();

        // An indirect or virtual target is materialized into R10 before
        // the argument registers are pinned.
        let target_reg = match &callee {
            Callee::Direct(_) => None,
            Callee::Indirect(tv) => {
                self.reserve(AnyReg::Gpr(Gpr::R10));
                let tv = *tv;
                self.load_operand_into_gpr(&tv, Gpr::R10, true)?;
                Some(Gpr::R10)
            }
            Callee::Virtual {
                object,
                object_is_pointer,
                vtable_index,
            } => {
                self.reserve(AnyReg::Gpr(Gpr::R10));
                let object = *object;
                if *object_is_pointer || object.pointer_depth > 0 {
                    self.load_operand_into_gpr(&object, Gpr::R10, false)?;
                } else {
                    self.load_address_into_gpr(&object, Gpr::R10, 0)?;
                }
                // vtable pointer, then the slot.
                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::R10, Gpr::R10, 0);
                emit::mov_r_m(
                    &mut self.buf,
                    OperandSize::S64,
                    Gpr::R10,
                    Gpr::R10,
                    *vtable_index as i32 * 8,
                );
                Some(Gpr::R10)
            }
        };

        // Classification covers the hidden return pointer as slot zero.
        let mut shapes = Vec::with_capacity(args.len() + 1);
        if hidden_ret_slot.is_some() {
            shapes.push(ArgShape {
                is_float: false,
                two_gpr: false,
                is_variadic_arg: false,
            });
        }
        for (tv, mode) in args {
            let by_value_struct = *mode == ArgMode::Value
                && tv.ty == IrType::Struct
                && tv.pointer_depth == 0
                && !tv.is_reference;
            let two_gpr = by_value_struct
                && struct_passing(self.conv, (tv.size_bits + 7) / 8) == StructPassing::TwoRegs;
            shapes.push(ArgShape {
                is_float: *mode == ArgMode::Value && tv.in_xmm(),
                two_gpr,
                is_variadic_arg: is_variadic,
            });
        }
        let plan = classify_args(self.conv, &shapes);

        // Reserve every register the plan touches before evaluating
        // anything into them.
        for slot in &plan.slots {
            match *slot {
                ArgSlot::IntReg(r) => self.reserve(AnyReg::Gpr(r)),
                ArgSlot::FloatReg(x) => self.reserve(AnyReg::Xmm(x)),
                ArgSlot::FloatRegMirrored(x, g) => {
                    self.reserve(AnyReg::Xmm(x));
                    self.reserve(AnyReg::Gpr(g));
                }
                ArgSlot::IntRegPair(lo, hi) => {
                    self.reserve(AnyReg::Gpr(lo));
                    self.reserve(AnyReg::Gpr(hi));
                }
                ArgSlot::Stack(_) => {}
            }
        }

        let hidden_shift = usize::from(hidden_ret_slot.is_some());

        // Pass 1: arguments that overflow to the stack.
        for (i, slot) in plan.slots.iter().enumerate() {
            let ArgSlot::Stack(off) = *slot else { continue };
            let (tv, mode) = &args[i - hidden_shift];
            let reg = match mode {
                ArgMode::Value => self.read_gpr(tv, true)?,
                ArgMode::Address => self.read_addr(tv)?,
                ArgMode::AddressWithOffset(extra) => {
                    let base = self.read_addr(tv)?;
                    let r = self.alloc_gpr();
                    emit::lea(&mut self.buf, r, base, *extra);
                    self.release(AnyReg::Gpr(base));
                    r
                }
            };
            emit::mov_m_r(&mut self.buf, OperandSize::S64, Gpr::RSP, off as i32, reg);
            self.release(AnyReg::Gpr(reg));
        }

        // Pass 2: register arguments, in plan order.
        for (i, slot) in plan.slots.iter().enumerate() {
            if hidden_ret_slot.is_some() && i == 0 {
                let ArgSlot::IntReg(r) = *slot else {
                    return Err(CodegenError::Internal(
                        "hidden return pointer not in a register".into(),
                    ));
                };
                emit::lea(&mut self.buf, r, Gpr::RBP, hidden_ret_slot.unwrap());
                continue;
            }
            let (tv, mode) = &args[i - hidden_shift];
            match *slot {
                ArgSlot::IntReg(r) => match mode {
                    ArgMode::Value => self.load_operand_into_gpr(tv, r, true)?,
                    ArgMode::Address => self.load_address_into_gpr(tv, r, 0)?,
                    ArgMode::AddressWithOffset(extra) => {
                        self.load_address_into_gpr(tv, r, *extra)?
                    }
                },
                ArgSlot::FloatReg(x) => self.load_float_into_xmm(tv, x)?,
                ArgSlot::FloatRegMirrored(x, g) => {
                    // Windows variadic: the callee may fetch the value from
                    // either bank, so the bit pattern rides in both.
                    self.load_float_into_xmm(tv, x)?;
                    emit::movq_gpr_xmm(&mut self.buf, g, x);
                }
                ArgSlot::IntRegPair(lo, hi) => {
                    let addr = self.read_addr(tv)?;
                    emit::mov_r_m(&mut self.buf, OperandSize::S64, lo, addr, 0);
                    emit::mov_r_m(&mut self.buf, OperandSize::S64, hi, addr, 8);
                    self.release(AnyReg::Gpr(addr));
                }
                ArgSlot::Stack(_) => {}
            }
        }

        // System V variadic calls pass the vector-register count in AL.
        if is_variadic && self.conv == crate::abi::CallConv::SystemV {
            emit::mov_ri32(&mut self.buf, Gpr::RAX, plan.xmm_count as u32);
        }

        match &callee {
            Callee::Direct(symbol) => self.call_symbol(symbol),
            _ => emit::call_r(&mut self.buf, target_reg.expect("indirect target loaded")),
        }

        let outgoing = self.conv.shadow_space()
            + match self.conv {
                crate::abi::CallConv::SystemV => plan.stack_bytes,
                crate::abi::CallConv::WindowsFastcall => {
                    plan.stack_bytes // offsets already include the shadow area
                }
            };
        self.f()?.frame.note_outgoing(outgoing);

        self.regs.invalidate_caller_saved();
        Ok(())
    }

    /// Copy the return value into the result temporary's slot.
    fn store_call_result(
        &mut self,
        result: TempVar,
        ret: &TypeDesc,
        uses_return_slot: bool,
    ) -> CodegenResult<()> {
        if uses_return_slot || ret.ty == IrType::Void && ret.pointer_depth == 0 {
            return Ok(());
        }
        let bits = ret.storage_bits();
        let slot = {
            let f = self.f()?;
            f.frame.temp_slot(result.index(), bits)
        };
        if ret.in_xmm() {
            emit::movs_m_r(&mut self.buf, ret.size_bits == 64, Gpr::RBP, slot, Xmm::XMM0);
            self.regs.forget_slot(slot);
            return Ok(());
        }
        if ret.ty == IrType::Struct && ret.pointer_depth == 0 && !ret.is_reference {
            // Small struct in RAX (and RDX for the System V 9..16 case).
            let slot = {
                let f = self.f()?;
                f.frame.temp_slot(result.index(), ret.size_bits)
            };
            emit::mov_m_r(&mut self.buf, OperandSize::S64, Gpr::RBP, slot, Gpr::RAX);
            if ret.size_bits > 64 {
                emit::mov_m_r(&mut self.buf, OperandSize::S64, Gpr::RBP, slot + 8, Gpr::RDX);
            }
            self.regs.forget_slot(slot);
            return Ok(());
        }
        let size = OperandSize::from_bits(bits);
        emit::mov_m_r(&mut self.buf, size, Gpr::RBP, slot, Gpr::RAX);
        self.regs.forget_slot(slot);
        if ret.is_reference {
            let f = self.f()?;
            f.frame.mark_reference(
                slot,
                crate::frame::RefSlot {
                    value_ty: ret.ty,
                    value_size_bits: ret.size_bits,
                    is_rvalue: false,
                    holds_address_only: false,
                },
            );
        }
        Ok(())
    }

    fn arg_mode_for(&self, tv: &TypedValue) -> ArgMode {
        if tv.is_reference {
            return ArgMode::Address;
        }
        if tv.ty == IrType::Struct && tv.pointer_depth == 0 {
            if struct_passing(self.conv, (tv.size_bits + 7) / 8) == StructPassing::ByPointer {
                return ArgMode::Address;
            }
            // Small structs load by value straight from their storage.
            return ArgMode::Value;
        }
        ArgMode::Value
    }

    pub(crate) fn lower_call(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Call(op) => Some(op.as_ref().clone()),
            _ => None,
        })?;
        let args: Vec<(TypedValue, ArgMode)> = op
            .args
            .iter()
            .map(|tv| (*tv, self.arg_mode_for(tv)))
            .collect();
        let hidden = if op.uses_return_slot {
            let f = self.f()?;
            Some(f.frame.temp_slot(op.result.index(), op.return_type.size_bits.max(64)))
        } else {
            None
        };
        let callee = if inst.opcode == IrOpcode::IndirectCall || op.indirect_target.is_some() {
            let target = op.indirect_target.ok_or_else(|| {
                CodegenError::Internal("indirect call without a target".into())
            })?;
            Callee::Indirect(target)
        } else {
            Callee::Direct(self.ctx.str(op.function_name).to_string())
        };
        self.emit_call(callee, &args, op.is_variadic, hidden)?;
        self.store_call_result(op.result, &op.return_type, op.uses_return_slot)
    }

    pub(crate) fn lower_constructor_call(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::ConstructorCall(op) => Some(op.as_ref().clone()),
            _ => None,
        })?;
        let class = self.ctx.str(op.struct_name).to_string();
        let layout_index = self.ctx.types.index_of(op.struct_name);
        let Some(layout) = self.ctx.types.by_name(op.struct_name) else {
            return Err(CodegenError::in_function(
                self.func.as_ref().map(|f| f.mangled.clone()).unwrap_or_default(),
                format!("constructor call on unknown class `{class}`"),
            ));
        };
        let arg_is_same_struct = op.args.len() == 1
            && op.args[0].ty == IrType::Struct
            && op.args[0].type_index == layout_index;
        let ctor = layout
            .select_constructor(op.args.len() as u32, arg_is_same_struct)
            .map(|c| c.mangled);
        let Some(ctor) = ctor else {
            if op.args.is_empty() {
                // Trivial default construction: storage is already there.
                return Ok(());
            }
            return Err(CodegenError::in_function(
                self.func.as_ref().map(|f| f.mangled.clone()).unwrap_or_default(),
                format!("no matching constructor for `{class}`"),
            ));
        };
        let ctor = self.ctx.str(ctor).to_string();

        // `this`: the hidden return slot (RVO), heap storage, or the
        // object's own slot (offset by the base subobject when chaining
        // base constructors).
        let mut args: Vec<(TypedValue, ArgMode)> = Vec::with_capacity(op.args.len() + 1);
        if op.use_return_slot {
            let ret_name = self.ctx.intern("__return_slot");
            let this_tv = TypedValue::name(ret_name, IrType::Struct, 64).with_pointer_depth(1);
            args.push((this_tv, ArgMode::Value));
            if let Some(f) = self.func.as_mut() {
                f.rvo_constructed = true;
            }
        } else if op.is_heap_allocated {
            args.push((op.object, ArgMode::Value));
        } else if op.base_class_offset != 0 {
            args.push((op.object, ArgMode::AddressWithOffset(op.base_class_offset as i32)));
        } else {
            args.push((op.object, ArgMode::Address));
        }
        for tv in &op.args {
            args.push((*tv, self.arg_mode_for(tv)));
        }
        self.emit_call(Callee::Direct(ctor), &args, false, None)
    }

    pub(crate) fn lower_destructor_call(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::DestructorCall(op) => Some(op.clone()),
            _ => None,
        })?;
        let Some(layout) = self.ctx.types.by_name(op.struct_name) else {
            return Ok(());
        };
        let Some(dtor) = layout.destructor else {
            return Ok(());
        };
        let dtor = self.ctx.str(dtor).to_string();
        let mode = if op.object_is_pointer {
            ArgMode::Value
        } else {
            ArgMode::Address
        };
        self.emit_call(Callee::Direct(dtor), &[(op.object, mode)], false, None)
    }

    pub(crate) fn lower_virtual_call(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::VirtualCall(op) => Some(op.as_ref().clone()),
            _ => None,
        })?;
        let mut args: Vec<(TypedValue, ArgMode)> = Vec::with_capacity(op.args.len() + 1);
        let this_mode = if op.is_pointer_access || op.object.pointer_depth > 0 {
            ArgMode::Value
        } else {
            ArgMode::Address
        };
        args.push((op.object, this_mode));
        for tv in &op.args {
            args.push((*tv, self.arg_mode_for(tv)));
        }
        self.emit_call(
            Callee::Virtual {
                object: op.object,
                object_is_pointer: op.is_pointer_access,
                vtable_index: op.vtable_index,
            },
            &args,
            false,
            None,
        )?;
        self.store_call_result(op.result, &op.return_type, false)
    }

    pub(crate) fn lower_function_address(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::FunctionAddress(op) => Some(op.clone()),
            _ => None,
        })?;
        let symbol = self.ctx.str(op.function_name).to_string();
        let reg = self.alloc_gpr();
        self.lea_symbol(reg, &symbol);
        self.def_temp(op.result, 64, AnyReg::Gpr(reg))
    }

    pub(crate) fn lower_heap_alloc(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::HeapAlloc(op) => Some(op.clone()),
            _ => None,
        })?;
        if inst.opcode == IrOpcode::PlacementNew {
            // Placement new allocates nothing: the placement address is the
            // result.
            let placement = op.placement.ok_or_else(|| {
                CodegenError::Internal("placement new without an address".into())
            })?;
            let reg = self.read_gpr(&placement, true)?;
            return self.def_temp(op.result, 64, AnyReg::Gpr(reg));
        }
        let size = TypedValue::imm(op.size_bytes, IrType::UnsignedLong, 64);
        self.emit_call(
            Callee::Direct("malloc".into()),
            &[(size, ArgMode::Value)],
            false,
            None,
        )?;
        self.store_temp_now(op.result, 64, Gpr::RAX)
    }

    pub(crate) fn lower_heap_alloc_array(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::HeapAllocArray(op) => Some(op.clone()),
            _ => None,
        })?;
        self.flush_all();
        let arg0 = self.conv.int_args()[0];
        self.reserve(AnyReg::Gpr(arg0));
        self.load_operand_into_gpr(&op.count, arg0, true)?;
        let scale = self.alloc_gpr();
        emit::mov_ri32(&mut self.buf, scale, op.element_size as u32);
        emit::imul_rr(&mut self.buf, OperandSize::S64, arg0, scale);
        self.release(AnyReg::Gpr(scale));
        if op.needs_cookie {
            // Arrays of types with destructors carry their element count
            // ahead of the data so delete[] can find it.
            emit::alu_ri(&mut self.buf, AluOp::Add, OperandSize::S64, arg0, 8);
        }
        self.call_symbol("malloc");
        let shadow = self.conv.shadow_space();
        self.f()?.frame.note_outgoing(shadow);
        self.regs.invalidate_caller_saved();
        if op.needs_cookie {
            let cnt = self.read_gpr(&op.count, true)?;
            emit::mov_m_r(&mut self.buf, OperandSize::S64, Gpr::RAX, 0, cnt);
            self.release(AnyReg::Gpr(cnt));
            emit::lea(&mut self.buf, Gpr::RAX, Gpr::RAX, 8);
        }
        self.store_temp_now(op.result, 64, Gpr::RAX)
    }

    pub(crate) fn lower_heap_free(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::HeapFree(op) => Some(op.clone()),
            _ => None,
        })?;
        self.flush_all();
        let arg0 = self.conv.int_args()[0];
        self.reserve(AnyReg::Gpr(arg0));
        self.load_operand_into_gpr(&op.pointer, arg0, true)?;
        if op.has_cookie {
            // Step back over the element-count cookie delete[] stored.
            emit::lea(&mut self.buf, arg0, arg0, -8);
        }
        self.call_symbol("free");
        let shadow = self.conv.shadow_space();
        self.f()?.frame.note_outgoing(shadow);
        self.regs.invalidate_caller_saved();
        Ok(())
    }

    pub(crate) fn lower_typeid(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Typeid(op) => Some(op.clone()),
            _ => None,
        })?;
        let class = self.ctx.str(op.type_name).to_string();
        let symbol = match K::FORMAT {
            BinFormat::Elf => format!("_ZTI{}{}", class.len(), class),
            BinFormat::Coff => format!("??_R0.?AV{class}@@"),
        };
        let reg = self.alloc_gpr();
        self.lea_symbol(reg, &symbol);
        self.def_temp(op.result, 64, AnyReg::Gpr(reg))
    }

    /// `dynamic_cast`: null-check, fetch RTTI from `vtable[-1]`, call the
    /// synthesized `__dynamic_cast_check`, and either produce the source
    /// pointer, null, or a `bad_cast` throw. Register use is fixed (RAX
    /// working value, R8 saved source, platform argument registers), so
    /// the allocator resets afterwards.
    pub(crate) fn lower_dynamic_cast(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::DynamicCast(op) => Some(op.clone()),
            _ => None,
        })?;
        self.flush_all();
        self.needs_dyncast_runtime = true;

        let source_slot = self.slot_of(&op.source)?;
        emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::RAX, Gpr::RBP, source_slot);
        emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::R8, Gpr::RAX);

        emit::test_rr(&mut self.buf, OperandSize::S64, Gpr::RAX, Gpr::RAX);
        let null_check = emit::jcc_rel32(&mut self.buf, CC::E);

        // vtable pointer, then the type info stored just below slot zero.
        emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::RAX, Gpr::RAX, 0);
        let (src_arg, tgt_arg) = match K::FORMAT {
            BinFormat::Elf => (Gpr::RDI, Gpr::RSI),
            BinFormat::Coff => (Gpr::RCX, Gpr::RDX),
        };
        emit::mov_r_m(&mut self.buf, OperandSize::S64, src_arg, Gpr::RAX, -8);

        let class = self.ctx.str(op.target_type_name).to_string();
        let target_sym = K::typeinfo_symbol(&class);
        self.lea_symbol(tgt_arg, &target_sym);

        let coff = K::FORMAT == BinFormat::Coff;
        if coff {
            emit::alu_ri(&mut self.buf, AluOp::Sub, OperandSize::S64, Gpr::RSP, 32);
        }
        self.call_symbol("__dynamic_cast_check");
        if coff {
            emit::alu_ri(&mut self.buf, AluOp::Add, OperandSize::S64, Gpr::RSP, 32);
        }

        emit::test_rr(&mut self.buf, OperandSize::S8, Gpr::RAX, Gpr::RAX);
        let check_failed = emit::jcc_rel32(&mut self.buf, CC::E);

        // Success: the saved source pointer is the result.
        emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RAX, Gpr::R8);
        let success_jmp = self.cur() + 1;
        emit::jmp_rel8(&mut self.buf, 0);

        let null_result = self.cur();
        if op.is_reference {
            // Failed reference casts cannot produce null; they throw.
            if coff {
                emit::alu_ri(&mut self.buf, AluOp::Sub, OperandSize::S64, Gpr::RSP, 32);
            }
            self.call_symbol("__dynamic_cast_throw_bad_cast");
        } else {
            emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S64, Gpr::RAX, Gpr::RAX);
        }
        let end = self.cur();

        self.buf
            .patch4(null_check, (null_result as i64 - (null_check as i64 + 4)) as u32);
        self.buf.patch4(
            check_failed,
            (null_result as i64 - (check_failed as i64 + 4)) as u32,
        );
        let rel8 = (end as i64 - (success_jmp as i64 + 1)) as i8;
        self.buf.patch1(success_jmp, rel8 as u8);

        let result_slot = {
            let f = self.f()?;
            f.frame.temp_slot(op.result.index(), 64)
        };
        emit::mov_m_r(&mut self.buf, OperandSize::S64, Gpr::RBP, result_slot, Gpr::RAX);
        self.regs.reset();
        Ok(())
    }
}
