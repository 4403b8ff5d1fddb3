//! Arithmetic, comparisons, shifts, division, conversions, unary ops and
//! increments.

use super::Lowerer;
use crate::asm::{emit, AluOp, Gpr, OperandSize, SseOp, Xmm, CC};
use crate::regalloc::AnyReg;
use crate::result::{CodegenError, CodegenResult};
use kiln_ir::{IrInstruction, IrOpcode, IrPayload, TypedValue};

fn int_size(tv: &TypedValue) -> OperandSize {
    OperandSize::from_bits(tv.storage_bits().max(32))
}

impl<'a, K: kiln_object::ObjectKind> Lowerer<'a, K> {
    fn binary_payload(&self, inst: &IrInstruction) -> CodegenResult<kiln_ir::BinaryOp> {
        self.payload(inst, |p| match p {
            IrPayload::Binary(op) => Some(op.clone()),
            _ => None,
        })
    }

    /// `Add/Sub/And/Or/Xor` (and the bitwise forms of `&&`/`||`, whose
    /// short-circuiting the front end already lowered to branches).
    pub(crate) fn lower_int_binary(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.binary_payload(inst)?;
        let alu = match inst.opcode {
            IrOpcode::Add => AluOp::Add,
            IrOpcode::Subtract => AluOp::Sub,
            IrOpcode::BitwiseAnd | IrOpcode::LogicalAnd => AluOp::And,
            IrOpcode::BitwiseOr | IrOpcode::LogicalOr => AluOp::Or,
            IrOpcode::BitwiseXor => AluOp::Xor,
            _ => return Err(CodegenError::Internal("not an ALU opcode".into())),
        };
        let size = int_size(&op.lhs);
        let lhs = self.read_gpr(&op.lhs, true)?;
        // Destination must be writable without clobbering a cached local;
        // results always build in a fresh association.
        self.regs.release_and_forget(AnyReg::Gpr(lhs));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(lhs)) {
            self.emit_spill(s);
        }
        let rhs = self.read_gpr(&op.rhs, true)?;
        emit::alu_rr(&mut self.buf, alu, size, lhs, rhs);
        self.release(AnyReg::Gpr(rhs));
        self.def_temp(op.result, op.lhs.storage_bits(), AnyReg::Gpr(lhs))
    }

    /// `Multiply`: IMUL keeps the destination in the reg field, unlike the
    /// plain ALU forms.
    pub(crate) fn lower_multiply(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.binary_payload(inst)?;
        let size = int_size(&op.lhs);
        let lhs = self.read_gpr(&op.lhs, true)?;
        self.regs.release_and_forget(AnyReg::Gpr(lhs));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(lhs)) {
            self.emit_spill(s);
        }
        let rhs = self.read_gpr(&op.rhs, true)?;
        emit::imul_rr(&mut self.buf, size, lhs, rhs);
        self.release(AnyReg::Gpr(rhs));
        self.def_temp(op.result, op.lhs.storage_bits(), AnyReg::Gpr(lhs))
    }

    /// `Divide/Modulo/UnsignedDivide/UnsignedModulo`: RAX:RDX are
    /// architecturally fixed, so everything dirty flushes first.
    pub(crate) fn lower_division(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.binary_payload(inst)?;
        let size = int_size(&op.lhs);
        let unsigned = matches!(
            inst.opcode,
            IrOpcode::UnsignedDivide | IrOpcode::UnsignedModulo
        ) || op.lhs.ty.is_unsigned();
        let want_remainder = matches!(inst.opcode, IrOpcode::Modulo | IrOpcode::UnsignedModulo);

        self.flush_all();
        self.reserve(AnyReg::Gpr(Gpr::RAX));
        self.reserve(AnyReg::Gpr(Gpr::RDX));

        let dividend = self.read_gpr(&op.lhs, true)?;
        if dividend != Gpr::RAX {
            emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RAX, dividend);
            self.release(AnyReg::Gpr(dividend));
        }
        let divisor = self.read_gpr(&op.rhs, true)?;

        if unsigned {
            emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S32, Gpr::RDX, Gpr::RDX);
            emit::div_r(&mut self.buf, size, divisor);
        } else {
            if size == OperandSize::S64 {
                emit::cqo(&mut self.buf);
            } else {
                emit::cdq(&mut self.buf);
            }
            emit::idiv_r(&mut self.buf, size, divisor);
        }
        self.release(AnyReg::Gpr(divisor));

        let result_reg = if want_remainder { Gpr::RDX } else { Gpr::RAX };
        let other = if want_remainder { Gpr::RAX } else { Gpr::RDX };
        self.release(AnyReg::Gpr(other));
        self.regs.release_and_forget(AnyReg::Gpr(other));
        self.def_temp(op.result, op.lhs.storage_bits(), AnyReg::Gpr(result_reg))
    }

    /// Shifts: the count is architecturally pinned to CL.
    pub(crate) fn lower_shift(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.binary_payload(inst)?;
        let size = int_size(&op.lhs);
        self.reserve(AnyReg::Gpr(Gpr::RCX));
        let count = self.read_gpr(&op.rhs, true)?;
        if count != Gpr::RCX {
            emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RCX, count);
            self.release(AnyReg::Gpr(count));
        }
        let value = self.read_gpr(&op.lhs, true)?;
        self.regs.release_and_forget(AnyReg::Gpr(value));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(value)) {
            self.emit_spill(s);
        }
        match inst.opcode {
            IrOpcode::ShiftLeft => emit::shl_cl(&mut self.buf, size, value),
            IrOpcode::UnsignedShiftRight => emit::shr_cl(&mut self.buf, size, value),
            // Arithmetic right for signed operands, logical for unsigned.
            IrOpcode::ShiftRight => {
                if op.lhs.ty.is_unsigned() {
                    emit::shr_cl(&mut self.buf, size, value)
                } else {
                    emit::sar_cl(&mut self.buf, size, value)
                }
            }
            _ => return Err(CodegenError::Internal("not a shift opcode".into())),
        }
        self.release(AnyReg::Gpr(Gpr::RCX));
        self.def_temp(op.result, op.lhs.storage_bits(), AnyReg::Gpr(value))
    }

    pub(crate) fn lower_float_binary(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.binary_payload(inst)?;
        let is_double = op.lhs.size_bits == 64;
        let sse = match inst.opcode {
            IrOpcode::FloatAdd => SseOp::Add,
            IrOpcode::FloatSubtract => SseOp::Sub,
            IrOpcode::FloatMultiply => SseOp::Mul,
            IrOpcode::FloatDivide => SseOp::Div,
            _ => return Err(CodegenError::Internal("not a float opcode".into())),
        };
        let lhs = self.read_xmm(&op.lhs)?;
        self.regs.release_and_forget(AnyReg::Xmm(lhs));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Xmm(lhs)) {
            self.emit_spill(s);
        }
        let rhs = self.read_xmm(&op.rhs)?;
        emit::sse_rr(&mut self.buf, sse, is_double, lhs, rhs);
        self.release(AnyReg::Xmm(rhs));
        self.def_temp(op.result, op.lhs.size_bits, AnyReg::Xmm(lhs))
    }

    fn compare_cc(opcode: IrOpcode) -> CC {
        match opcode {
            IrOpcode::Equal | IrOpcode::FloatEqual => CC::E,
            IrOpcode::NotEqual | IrOpcode::FloatNotEqual => CC::NE,
            IrOpcode::LessThan => CC::L,
            IrOpcode::LessEqual => CC::LE,
            IrOpcode::GreaterThan => CC::G,
            IrOpcode::GreaterEqual => CC::GE,
            // Unsigned and floating comparisons use the unsigned flags
            // (UCOMIS sets CF/ZF like an unsigned compare; unordered
            // operands drive the below conditions false).
            IrOpcode::UnsignedLessThan | IrOpcode::FloatLessThan => CC::B,
            IrOpcode::UnsignedLessEqual | IrOpcode::FloatLessEqual => CC::BE,
            IrOpcode::UnsignedGreaterThan | IrOpcode::FloatGreaterThan => CC::A,
            IrOpcode::UnsignedGreaterEqual | IrOpcode::FloatGreaterEqual => CC::AE,
            _ => CC::E,
        }
    }

    pub(crate) fn lower_int_compare(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.binary_payload(inst)?;
        let size = int_size(&op.lhs);
        let lhs = self.read_gpr(&op.lhs, true)?;
        self.regs.release_and_forget(AnyReg::Gpr(lhs));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(lhs)) {
            self.emit_spill(s);
        }
        let rhs = self.read_gpr(&op.rhs, true)?;
        emit::alu_rr(&mut self.buf, AluOp::Cmp, size, lhs, rhs);
        self.release(AnyReg::Gpr(rhs));
        emit::setcc(&mut self.buf, Self::compare_cc(inst.opcode), lhs);
        emit::movzx_rr(&mut self.buf, OperandSize::S8, lhs, lhs);
        self.def_temp(op.result, 8, AnyReg::Gpr(lhs))
    }

    pub(crate) fn lower_float_compare(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.binary_payload(inst)?;
        let is_double = op.lhs.size_bits == 64;
        let lhs = self.read_xmm(&op.lhs)?;
        let rhs = self.read_xmm(&op.rhs)?;
        emit::ucomis_rr(&mut self.buf, is_double, lhs, rhs);
        self.release(AnyReg::Xmm(lhs));
        self.release(AnyReg::Xmm(rhs));
        let result = self.alloc_gpr();
        emit::setcc(&mut self.buf, Self::compare_cc(inst.opcode), result);
        emit::movzx_rr(&mut self.buf, OperandSize::S8, result, result);
        self.def_temp(op.result, 8, AnyReg::Gpr(result))
    }

    pub(crate) fn lower_unary(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Unary(op) => Some(op.clone()),
            _ => None,
        })?;
        let size = int_size(&op.operand);
        let reg = self.read_gpr(&op.operand, true)?;
        self.regs.release_and_forget(AnyReg::Gpr(reg));
        if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(reg)) {
            self.emit_spill(s);
        }
        match inst.opcode {
            IrOpcode::Negate => {
                if op.operand.ty.is_float() {
                    // Negate the bit pattern through an XMM round-trip.
                    return Err(CodegenError::Unsupported(
                        "float negate arrives as FloatSubtract from zero".into(),
                    ));
                }
                emit::neg_r(&mut self.buf, size, reg);
            }
            IrOpcode::BitwiseNot => emit::not_r(&mut self.buf, size, reg),
            IrOpcode::LogicalNot => {
                emit::alu_ri(&mut self.buf, AluOp::Cmp, size, reg, 0);
                emit::setcc(&mut self.buf, CC::E, reg);
                emit::movzx_rr(&mut self.buf, OperandSize::S8, reg, reg);
            }
            _ => return Err(CodegenError::Internal("not a unary opcode".into())),
        }
        self.def_temp(op.result, op.operand.storage_bits(), AnyReg::Gpr(reg))
    }

    pub(crate) fn lower_conversion(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Conversion(op) => Some(op.clone()),
            _ => None,
        })?;
        match inst.opcode {
            IrOpcode::SignExtend => {
                let from = OperandSize::from_bits(op.from.size_bits);
                let to = OperandSize::from_bits(op.to_size_bits.max(32));
                let reg = self.read_gpr(&op.from, true)?;
                self.regs.release_and_forget(AnyReg::Gpr(reg));
                if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(reg)) {
                    self.emit_spill(s);
                }
                if matches!(from, OperandSize::S8 | OperandSize::S16)
                    || (from == OperandSize::S32 && to == OperandSize::S64)
                {
                    emit::movsx_rr(&mut self.buf, from, to, reg, reg);
                }
                self.def_temp(op.result, op.to_size_bits, AnyReg::Gpr(reg))
            }
            IrOpcode::ZeroExtend | IrOpcode::Truncate => {
                let from = OperandSize::from_bits(op.from.size_bits.min(op.to_size_bits));
                let reg = self.read_gpr(&op.from, true)?;
                self.regs.release_and_forget(AnyReg::Gpr(reg));
                if let Some(s) = self.regs.allocate_specific(AnyReg::Gpr(reg)) {
                    self.emit_spill(s);
                }
                // A 32-bit move zero-extends; narrower sources use MOVZX.
                // Truncation reuses the same forms to clear the high bits.
                emit::movzx_rr(&mut self.buf, from, reg, reg);
                self.def_temp(op.result, op.to_size_bits, AnyReg::Gpr(reg))
            }
            IrOpcode::FloatToInt => {
                let from_double = op.from.size_bits == 64;
                let dst64 = op.to_size_bits == 64;
                let src = self.read_xmm(&op.from)?;
                let dst = self.alloc_gpr();
                emit::cvt_float_int(&mut self.buf, from_double, dst64, dst, src);
                self.release(AnyReg::Xmm(src));
                self.def_temp(op.result, op.to_size_bits, AnyReg::Gpr(dst))
            }
            IrOpcode::IntToFloat => {
                let to_double = op.to_size_bits == 64;
                let src64 = op.from.storage_bits() == 64;
                let src = self.read_gpr(&op.from, true)?;
                let dst = self.alloc_xmm();
                emit::cvt_int_float(&mut self.buf, to_double, src64, dst, src);
                self.release(AnyReg::Gpr(src));
                self.def_temp(op.result, op.to_size_bits, AnyReg::Xmm(dst))
            }
            IrOpcode::FloatToFloat => {
                let from_double = op.from.size_bits == 64;
                let src = self.read_xmm(&op.from)?;
                self.regs.release_and_forget(AnyReg::Xmm(src));
                if let Some(s) = self.regs.allocate_specific(AnyReg::Xmm(src)) {
                    self.emit_spill(s);
                }
                emit::cvt_float_float(&mut self.buf, from_double, src, src);
                self.def_temp(op.result, op.to_size_bits, AnyReg::Xmm(src))
            }
            _ => Err(CodegenError::Internal("not a conversion opcode".into())),
        }
    }

    /// Pre/post increment and decrement. `83 /0` and `83 /5` with an
    /// immediate 1; the one-byte `40+r` forms do not exist in 64-bit mode.
    pub(crate) fn lower_incdec(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.payload(inst, |p| match p {
            IrPayload::Unary(op) => Some(op.clone()),
            _ => None,
        })?;
        let is_inc = matches!(inst.opcode, IrOpcode::PreIncrement | IrOpcode::PostIncrement);
        let is_pre = matches!(inst.opcode, IrOpcode::PreIncrement | IrOpcode::PreDecrement);
        let size = int_size(&op.operand);
        // Pointers step by their pointee size.
        let step = if op.operand.pointer_depth > 0 {
            ((op.operand.size_bits + 7) / 8).max(1) as i32
        } else {
            1
        };
        let alu = if is_inc { AluOp::Add } else { AluOp::Sub };

        let reg = self.read_gpr(&op.operand, true)?;
        if is_pre {
            emit::alu_ri(&mut self.buf, alu, size, reg, step);
            self.write_back_lvalue(&op.operand, reg)?;
            let result = self.alloc_gpr();
            emit::mov_rr(&mut self.buf, OperandSize::S64, result, reg);
            self.release(AnyReg::Gpr(reg));
            self.def_temp(op.result, op.operand.storage_bits(), AnyReg::Gpr(result))
        } else {
            let old = self.alloc_gpr();
            emit::mov_rr(&mut self.buf, OperandSize::S64, old, reg);
            emit::alu_ri(&mut self.buf, alu, size, reg, step);
            self.write_back_lvalue(&op.operand, reg)?;
            self.release(AnyReg::Gpr(reg));
            self.def_temp(op.result, op.operand.storage_bits(), AnyReg::Gpr(old))
        }
    }

    /// `AddAssign`..`ShrAssign`: read the lvalue, apply, write back
    /// through the same lvalue path (references stay dereferenced, never
    /// rebound).
    pub(crate) fn lower_compound_assign(&mut self, inst: &IrInstruction) -> CodegenResult<()> {
        let op = self.binary_payload(inst)?;
        if op.lhs.ty.is_float() && op.lhs.pointer_depth == 0 {
            let is_double = op.lhs.size_bits == 64;
            let sse = match inst.opcode {
                IrOpcode::AddAssign => SseOp::Add,
                IrOpcode::SubAssign => SseOp::Sub,
                IrOpcode::MulAssign => SseOp::Mul,
                IrOpcode::DivAssign => SseOp::Div,
                _ => {
                    return Err(CodegenError::Unsupported(
                        "bitwise compound assignment on floating type".into(),
                    ))
                }
            };
            let lhs = self.read_xmm(&op.lhs)?;
            let rhs = self.read_xmm(&op.rhs)?;
            emit::sse_rr(&mut self.buf, sse, is_double, lhs, rhs);
            self.release(AnyReg::Xmm(rhs));
            self.write_back_lvalue_xmm(&op.lhs, lhs)?;
            self.release(AnyReg::Xmm(lhs));
            return Ok(());
        }

        let size = int_size(&op.lhs);
        let lhs = self.read_gpr(&op.lhs, true)?;
        match inst.opcode {
            IrOpcode::AddAssign
            | IrOpcode::SubAssign
            | IrOpcode::AndAssign
            | IrOpcode::OrAssign
            | IrOpcode::XorAssign => {
                let alu = match inst.opcode {
                    IrOpcode::AddAssign => AluOp::Add,
                    IrOpcode::SubAssign => AluOp::Sub,
                    IrOpcode::AndAssign => AluOp::And,
                    IrOpcode::OrAssign => AluOp::Or,
                    _ => AluOp::Xor,
                };
                let rhs = self.read_gpr(&op.rhs, true)?;
                emit::alu_rr(&mut self.buf, alu, size, lhs, rhs);
                self.release(AnyReg::Gpr(rhs));
            }
            IrOpcode::MulAssign => {
                let rhs = self.read_gpr(&op.rhs, true)?;
                emit::imul_rr(&mut self.buf, size, lhs, rhs);
                self.release(AnyReg::Gpr(rhs));
            }
            IrOpcode::ShlAssign | IrOpcode::ShrAssign => {
                self.reserve(AnyReg::Gpr(Gpr::RCX));
                let count = self.read_gpr(&op.rhs, true)?;
                if count != Gpr::RCX {
                    emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RCX, count);
                    self.release(AnyReg::Gpr(count));
                }
                if inst.opcode == IrOpcode::ShlAssign {
                    emit::shl_cl(&mut self.buf, size, lhs);
                } else if op.lhs.ty.is_unsigned() {
                    emit::shr_cl(&mut self.buf, size, lhs);
                } else {
                    emit::sar_cl(&mut self.buf, size, lhs);
                }
                self.release(AnyReg::Gpr(Gpr::RCX));
            }
            IrOpcode::DivAssign | IrOpcode::ModAssign => {
                // Route through the fixed-register division sequence.
                self.flush_all();
                self.reserve(AnyReg::Gpr(Gpr::RAX));
                self.reserve(AnyReg::Gpr(Gpr::RDX));
                emit::mov_rr(&mut self.buf, OperandSize::S64, Gpr::RAX, lhs);
                let divisor = self.read_gpr(&op.rhs, true)?;
                if op.lhs.ty.is_unsigned() {
                    emit::alu_rr(
                        &mut self.buf,
                        AluOp::Xor,
                        OperandSize::S32,
                        Gpr::RDX,
                        Gpr::RDX,
                    );
                    emit::div_r(&mut self.buf, size, divisor);
                } else {
                    if size == OperandSize::S64 {
                        emit::cqo(&mut self.buf);
                    } else {
                        emit::cdq(&mut self.buf);
                    }
                    emit::idiv_r(&mut self.buf, size, divisor);
                }
                self.release(AnyReg::Gpr(divisor));
                let src = if inst.opcode == IrOpcode::DivAssign {
                    Gpr::RAX
                } else {
                    Gpr::RDX
                };
                emit::mov_rr(&mut self.buf, OperandSize::S64, lhs, src);
                self.release(AnyReg::Gpr(Gpr::RAX));
                self.release(AnyReg::Gpr(Gpr::RDX));
            }
            _ => return Err(CodegenError::Internal("not a compound assignment".into())),
        }
        self.write_back_lvalue(&op.lhs, lhs)?;
        // The result temporary observes the updated value.
        self.def_temp(op.result, op.lhs.storage_bits(), AnyReg::Gpr(lhs))
    }
}
