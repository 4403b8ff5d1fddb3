//! Function boundaries: declaration, prologue, parameters, locals,
//! returns and finalization.

use super::{FinishedFunction, FuncState, Lowerer, PendingVtable, Prescan};
use crate::abi::{classify_args, struct_passing, ArgShape, ArgSlot, StructPassing};
use crate::asm::{emit, Gpr, OperandSize, Xmm};
use crate::buffer::CodeSink;
use crate::eh::{CfiInst, CfiRule};
use crate::frame::{Frame, RefSlot, VarSlot};
use crate::regalloc::AnyReg;
use crate::result::{CodegenError, CodegenResult};
use kiln_ir::{
    GlobalVariableDeclOp, IrInstruction, IrOpcode, IrPayload, IrType, Linkage, ReturnOp, StringId,
    VariableDeclOp,
};
use kiln_object::{RelocKind, SectionRef, SymbolScope};

impl<'a, K: kiln_object::ObjectKind> Lowerer<'a, K> {
    /// Scan ahead to the next `FunctionDecl` to pre-size the frame and
    /// pick the prologue style.
    fn prescan(&self, rest: &[IrInstruction]) -> Prescan {
        let mut info = Prescan::default();
        for inst in rest {
            match inst.opcode {
                IrOpcode::FunctionDecl => break,
                IrOpcode::TryBegin => info.has_cpp_eh = true,
                IrOpcode::SehTryBegin => info.has_seh = true,
                IrOpcode::VariableDecl | IrOpcode::StackAlloc => {
                    if let IrPayload::VariableDecl(op) = &inst.payload {
                        let elems = op.element_count.max(1) as u64;
                        let bytes = (op.ty.storage_bits() as u64 * elems + 7) / 8;
                        let granules = (bytes + 7) / 8;
                        info.named_bytes += granules as u32 * 8;
                    }
                }
                // Catch objects live in the named region too.
                IrOpcode::CatchBegin => {
                    if let IrPayload::CatchBegin(op) = &inst.payload {
                        if op.catch_var.is_some() {
                            let bytes = (op.catch_var_size_bits.max(32) as u64 + 7) / 8;
                            let granules = (bytes + 7) / 8;
                            info.named_bytes += granules as u32 * 8;
                        }
                    }
                }
                _ => {}
            }
        }
        info
    }

    pub(crate) fn lower_function_decl(
        &mut self,
        inst: &IrInstruction,
        rest: &[IrInstruction],
    ) -> CodegenResult<()> {
        self.finalize_current_function()?;

        let op = self.payload(inst, |p| match p {
            IrPayload::FunctionDecl(op) => Some(op.as_ref().clone()),
            _ => None,
        })?;

        let mangled = if op.mangled_name.is_some() {
            self.ctx.str(op.mangled_name).to_string()
        } else {
            self.ctx.str(op.function_name).to_string()
        };
        log::debug!("function {}", mangled);

        let scan = self.prescan(rest);

        self.buf.align_to(16);
        let start = self.cur();
        let scope = match op.linkage {
            Linkage::Internal => SymbolScope::Local,
            _ => SymbolScope::Export,
        };
        self.module.define_function(&mangled, start, 0, scope);

        // Parameter census: hidden return slot first, then `this`, then the
        // declared parameters.
        let has_this = op.struct_name.is_some() && !op.is_static_member;
        let mut param_count = op.parameters.len();
        if op.has_hidden_return_param {
            param_count += 1;
        }
        if has_this {
            param_count += 1;
        }

        // Two-GPR struct parameters take a 16-byte named slot instead of a
        // home slot; reserve that space up front.
        let mut pair_bytes = 0u32;
        for p in &op.parameters {
            let by_value_struct =
                p.ty.ty == IrType::Struct && p.ty.pointer_depth == 0 && !p.ty.is_reference;
            if by_value_struct
                && struct_passing(self.conv, (p.ty.size_bits + 7) / 8) == StructPassing::TwoRegs
            {
                pair_bytes += 16;
            }
        }

        // The FH3 state variable owns [rbp-8] in the establisher-frame
        // prologue; parameter homes shift down past it.
        let eh_style = self.is_coff() && scan.has_cpp_eh;
        let state_pad: u32 = if eh_style { 8 } else { 0 };

        let frame = Frame::new(
            param_count as u32 * 8 + state_pad,
            scan.named_bytes + pair_bytes,
        );
        let mut fs = FuncState::new(op.function_name, mangled, start, frame);
        fs.has_cpp_eh = scan.has_cpp_eh;
        fs.has_seh = scan.has_seh;
        fs.is_variadic = op.is_variadic;
        fs.has_hidden_return = op.has_hidden_return_param;
        fs.returns_reference = op.returns_reference;

        // Schedule the class vtable the first time one of its methods is
        // seen.
        if op.struct_name.is_some() {
            if let Some(layout) = self.ctx.types.by_name(op.struct_name) {
                if layout.is_polymorphic() {
                    let class = self.ctx.str(op.struct_name).to_string();
                    if !self.vtables.iter().any(|v| v.class_name == class) {
                        self.vtables.push(PendingVtable { class_name: class });
                    }
                }
            }
        }

        self.regs.reset();

        // Prologue. Windows functions containing C++ EH use the
        // establisher-frame form; everything else the traditional one.
        emit::push_r(&mut self.buf, Gpr::RBP);
        fs.cfi.push(CfiInst {
            offset: self.cur() - start,
            rule: CfiRule::PushRbp,
        });

        if eh_style {
            // sub rsp, imm32 (placeholder)
            self.buf.put1(0x48);
            self.buf.put1(0x81);
            self.buf.put1(0xEC);
            fs.sub_rsp_patch = self.cur();
            self.buf.put4(0);
            // lea rbp, [rsp + imm32] (placeholder)
            self.buf.put1(0x48);
            self.buf.put1(0x8D);
            self.buf.put1(0xAC);
            self.buf.put1(0x24);
            fs.lea_rbp_patch = Some(self.cur());
            self.buf.put4(0);
            // FH3 state variable: dispUnwindHelp reads [rbp-8]; -2 selects
            // the IP-to-state map.
            emit::mov_m_i32(&mut self.buf, OperandSize::S64, Gpr::RBP, -8, -2);
        } else {
            emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RBP, Gpr::RSP);
            fs.cfi.push(CfiInst {
                offset: self.cur() - start,
                rule: CfiRule::SetRbp,
            });
            self.buf.put1(0x48);
            self.buf.put1(0x81);
            self.buf.put1(0xEC);
            fs.sub_rsp_patch = self.cur();
            self.buf.put4(0);
        }

        // Classify and home the parameters.
        let mut shapes = Vec::with_capacity(param_count);
        if op.has_hidden_return_param {
            shapes.push(ArgShape {
                is_float: false,
                two_gpr: false,
                is_variadic_arg: false,
            });
        }
        if has_this {
            shapes.push(ArgShape {
                is_float: false,
                two_gpr: false,
                is_variadic_arg: false,
            });
        }
        for p in &op.parameters {
            let by_value_struct =
                p.ty.ty == IrType::Struct && p.ty.pointer_depth == 0 && !p.ty.is_reference;
            let two_gpr = by_value_struct
                && struct_passing(self.conv, (p.ty.size_bits + 7) / 8) == StructPassing::TwoRegs;
            shapes.push(ArgShape {
                is_float: p.ty.in_xmm(),
                two_gpr,
                is_variadic_arg: false,
            });
        }
        let plan = classify_args(self.conv, &shapes);

        let mut names: Vec<StringId> = Vec::with_capacity(param_count);
        if op.has_hidden_return_param {
            names.push(self.ctx.intern("__return_slot"));
        }
        if has_this {
            names.push(self.ctx.intern("this"));
        }
        for p in &op.parameters {
            names.push(p.name);
        }

        let mut declared = op.parameters.iter();
        for (i, (slot, name)) in plan.slots.iter().zip(&names).enumerate() {
            let is_hidden = op.has_hidden_return_param && i == 0;
            let is_this = has_this && i == usize::from(op.has_hidden_return_param);
            let pdesc = if is_hidden || is_this {
                None
            } else {
                declared.next()
            };
            let size_bits = pdesc.map(|p| p.ty.storage_bits()).unwrap_or(64);
            let home = -(state_pad as i32) - 8 * (i as i32 + 1);
            match *slot {
                ArgSlot::IntReg(r) => {
                    emit::mov_m_r(&mut self.buf, OperandSize::S64, Gpr::RBP, home, r);
                    fs.frame.bind_at(
                        *name,
                        VarSlot {
                            offset: home,
                            size_bits,
                            is_array: false,
                        },
                    );
                }
                ArgSlot::FloatReg(x) | ArgSlot::FloatRegMirrored(x, _) => {
                    emit::movs_m_r(&mut self.buf, size_bits == 64, Gpr::RBP, home, x);
                    fs.frame.bind_at(
                        *name,
                        VarSlot {
                            offset: home,
                            size_bits,
                            is_array: false,
                        },
                    );
                }
                ArgSlot::IntRegPair(lo, hi) => {
                    // A 9..16-byte struct arrives by value; it needs a
                    // two-granule slot of its own.
                    let off = fs.frame.alloc_named(*name, 128, false);
                    emit::mov_m_r(&mut self.buf, OperandSize::S64, Gpr::RBP, off, lo);
                    emit::mov_m_r(&mut self.buf, OperandSize::S64, Gpr::RBP, off + 8, hi);
                }
                ArgSlot::Stack(s) => {
                    fs.frame.bind_at(
                        *name,
                        VarSlot {
                            offset: 16 + s as i32,
                            size_bits,
                            is_array: false,
                        },
                    );
                }
            }
            // Reference-like slots: `this` and the hidden return slot are
            // addresses that must never be auto-dereferenced; reference
            // parameters dereference on value reads.
            let home_off = fs.frame.lookup(*name).map(|v| v.offset).unwrap_or(home);
            if is_hidden || is_this {
                fs.frame.mark_reference(
                    home_off,
                    RefSlot {
                        value_ty: IrType::Struct,
                        value_size_bits: 64,
                        is_rvalue: false,
                        holds_address_only: true,
                    },
                );
            } else if let Some(p) = pdesc {
                if p.ty.is_reference {
                    fs.frame.mark_reference(
                        home_off,
                        RefSlot {
                            value_ty: p.ty.ty,
                            value_size_bits: p.ty.size_bits,
                            is_rvalue: false,
                            holds_address_only: false,
                        },
                    );
                } else if p.ty.ty == IrType::Struct
                    && p.ty.pointer_depth == 0
                    && struct_passing(self.conv, (p.ty.size_bits + 7) / 8)
                        == StructPassing::ByPointer
                {
                    fs.frame.mark_reference(
                        home_off,
                        RefSlot {
                            value_ty: IrType::Struct,
                            value_size_bits: p.ty.size_bits,
                            is_rvalue: false,
                            holds_address_only: true,
                        },
                    );
                }
            }
        }

        self.func = Some(fs);
        Ok(())
    }

    pub(crate) fn lower_variable_decl(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::VariableDecl(op) => Some(op.clone()),
            _ => None,
        })?;
        let VariableDeclOp {
            name,
            ty,
            element_count,
        } = op;
        let is_array = element_count > 0;
        let total_bits = ty.storage_bits() * element_count.max(1);
        let f = self.f()?;
        let off = f.frame.alloc_named(name, total_bits, is_array);
        if ty.is_reference {
            f.frame.mark_reference(
                off,
                RefSlot {
                    value_ty: ty.ty,
                    value_size_bits: ty.size_bits,
                    is_rvalue: false,
                    holds_address_only: false,
                },
            );
        } else {
            f.frame.clear_reference(off);
        }
        Ok(())
    }

    pub(crate) fn lower_global_decl(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::GlobalDecl(op) => Some(op.as_ref().clone()),
            _ => None,
        })?;
        let GlobalVariableDeclOp {
            var_name,
            ty,
            element_count,
            is_initialized,
            init_data,
            reloc_target,
        } = op;
        let name = self.ctx.str(var_name).to_string();
        let size = (ty.storage_bits() as u64 * element_count.max(1) as u64 + 7) / 8;
        if is_initialized {
            let mut data = init_data;
            data.resize(size as usize, 0);
            let off = self.module.append_data(SectionRef::Data, &data, 8);
            self.module
                .define_data_symbol(&name, SectionRef::Data, off, size as u32, SymbolScope::Export);
            if let Some(target) = reloc_target {
                let target = self.ctx.str(target).to_string();
                self.module
                    .add_reloc(SectionRef::Data, off, RelocKind::Abs8, &target, 0)?;
            }
        } else {
            let off = self.module.append_bss(size, 8);
            self.module
                .define_data_symbol(&name, SectionRef::Bss, off, size as u32, SymbolScope::Export);
        }
        self.globals.insert(var_name, (ty.storage_bits(), ty.in_xmm()));
        Ok(())
    }

    pub(crate) fn lower_return(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Return(op) => Some(op.clone()),
            _ => None,
        })?;
        let ReturnOp { value } = op;
        let (has_hidden, returns_ref, rvo_done) = {
            let f = self.f()?;
            (f.has_hidden_return, f.returns_reference, f.rvo_constructed)
        };

        if let Some(v) = value {
            if has_hidden && v.ty == IrType::Struct && v.pointer_depth == 0 {
                // The return value lives (or is placed) in the caller's slot;
                // RAX carries that slot's address out.
                let ret_name = self.ctx.intern("__return_slot");
                let slot = {
                    let f = self.f()?;
                    f.frame
                        .lookup(ret_name)
                        .ok_or_else(|| {
                            CodegenError::Internal("missing hidden return slot".into())
                        })?
                        .offset
                };
                self.reserve(AnyReg::Gpr(Gpr::RAX));
                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::RAX, Gpr::RBP, slot);
                if !rvo_done {
                    let src = self.read_addr(&v)?;
                    let bytes = (v.size_bits + 7) / 8;
                    self.emit_memcpy(Gpr::RAX, src, bytes);
                    self.release(AnyReg::Gpr(src));
                }
            } else if returns_ref {
                let addr = self.read_addr(&v)?;
                if addr != Gpr::RAX {
                    emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RAX, addr);
                }
                self.release(AnyReg::Gpr(addr));
            } else if v.in_xmm() {
                let x = self.read_xmm(&v)?;
                if x != Xmm::XMM0 {
                    emit::movs_rr(&mut self.buf, v.size_bits == 64, Xmm::XMM0, x);
                }
                self.release(AnyReg::Xmm(x));
            } else if v.ty == IrType::Struct && v.pointer_depth == 0 {
                // Small struct returned in RAX (and RDX for the 9..16-byte
                // System V case).
                let addr = self.read_addr(&v)?;
                self.reserve(AnyReg::Gpr(Gpr::RAX));
                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::RAX, addr, 0);
                if v.size_bits > 64 {
                    self.reserve(AnyReg::Gpr(Gpr::RDX));
                    emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::RDX, addr, 8);
                }
                self.release(AnyReg::Gpr(addr));
            } else {
                let g = self.read_gpr(&v, true)?;
                if g != Gpr::RAX {
                    emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RAX, g);
                }
                self.release(AnyReg::Gpr(g));
            }
        }

        // A return inside a COFF catch funclet cannot fall through the
        // funclet epilogue into the parent frame; it parks the value and
        // routes through the trampoline emitted at finalization.
        let in_catch = !self.f()?.catch_stack.is_empty();
        if in_catch && self.is_coff() {
            let home = {
                let f = self.f()?;
                if f.catch_ret_home.is_none() {
                    let slot = f.frame.temp_slot(u32::MAX - 1, 64);
                    f.catch_ret_home = Some(slot);
                }
                f.catch_ret_home.unwrap()
            };
            emit::mov_m_r(&mut self.buf, OperandSize::S64, Gpr::RBP, home, Gpr::RAX);
            let label = match self.f()?.catch_ret_label {
                Some(l) => l,
                None => {
                    let l = self.synth_label("__catch_ret")?;
                    self.f()?.catch_ret_label = Some(l);
                    l
                }
            };
            let patch = emit::lea_rip(&mut self.buf, Gpr::RAX);
            self.pend_patch(patch, label)?;
            emit::alu_ri(
                &mut self.buf,
                crate::asm::AluOp::Add,
                OperandSize::S64,
                Gpr::RSP,
                32,
            );
            emit::pop_r(&mut self.buf, Gpr::RBP);
            emit::ret(&mut self.buf);
            self.regs.reset();
            return Ok(());
        }

        self.emit_epilogue()?;
        self.regs.reset();
        Ok(())
    }

    /// The shared epilogue, wrapped in CFI remember/restore so unwind
    /// rules stay correct for code after an early return.
    pub(crate) fn emit_epilogue(&mut self) -> CodegenResult<()> {
        let start = self.f()?.start;
        let at = self.cur() - start;
        self.f()?.cfi.push(CfiInst {
            offset: at,
            rule: CfiRule::RememberState,
        });
        emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RSP, Gpr::RBP);
        emit::pop_r(&mut self.buf, Gpr::RBP);
        emit::ret(&mut self.buf);
        let at = self.cur() - start;
        self.f()?.cfi.push(CfiInst {
            offset: at,
            rule: CfiRule::RestoreState,
        });
        Ok(())
    }

    /// Close out the function currently being lowered, if any: emit the
    /// catch-return trampoline, resolve branches, patch the prologue, and
    /// hand EH metadata to the writer. On a recoverable failure the
    /// function's bytes and relocations are discarded instead.
    pub(crate) fn finalize_current_function(&mut self) -> CodegenResult<()> {
        let Some(mut fs) = self.func.take() else {
            return Ok(());
        };
        if self.skipping {
            self.skipping = false;
            log::error!("discarding function `{}` after codegen error", fs.mangled);
            self.buf.truncate(fs.start);
            self.error_count += 1;
            return Ok(());
        }

        // Catch-return trampoline: reload the parked value, then run the
        // normal epilogue in the parent frame.
        if let Some(label) = fs.catch_ret_label {
            fs.labels.insert(label, self.cur());
            let home = fs.catch_ret_home.unwrap_or(-16);
            emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::RAX, Gpr::RBP, home);
            emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RSP, Gpr::RBP);
            emit::pop_r(&mut self.buf, Gpr::RBP);
            emit::ret(&mut self.buf);
        }

        // Resolve forward branches; a missing label abandons the function.
        self.func = Some(fs);
        if let Err(e) = self.patch_branches() {
            let fs = self.func.take().expect("function state present");
            log::error!("{e}");
            self.buf.truncate(fs.start);
            self.error_count += 1;
            return Ok(());
        }
        let fs = self.func.take().expect("function state present");

        let coff = self.is_coff();
        let eh_floor = if coff && fs.has_cpp_eh {
            fs.frame.slot_bytes() + 32
        } else {
            0
        };
        let frame_size = fs.frame.final_frame_size(coff, eh_floor);
        self.buf.patch4(fs.sub_rsp_patch, frame_size);
        if let Some(at) = fs.lea_rbp_patch {
            self.buf.patch4(at, frame_size);
        }
        for &at in &fs.funclet_lea_patches {
            self.buf.patch4(at, frame_size);
        }
        for &at in &fs.continuation_sub_patches {
            self.buf.patch4(at, frame_size);
        }

        let len = self.cur() - fs.start;
        self.module.update_function_size(&fs.mangled, len);

        if coff {
            self.finish_coff_function(&fs, len, frame_size)?;
        } else {
            let lsda_offset = self.finish_elf_eh(&fs)?;
            self.finished.push(FinishedFunction {
                mangled: fs.mangled.clone(),
                start: fs.start,
                len,
                cfi: fs.cfi.clone(),
                lsda_offset,
            });
        }
        Ok(())
    }
}
