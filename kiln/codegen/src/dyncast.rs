//! The synthesized `dynamic_cast` runtime: `__dynamic_cast_check` walks
//! the platform RTTI structures, `__dynamic_cast_throw_bad_cast` is the
//! noreturn failure stub. Both are emitted once per translation unit,
//! directly as machine code through the same emitter user code uses.

use crate::asm::{emit, AluOp, Gpr, OperandSize, CC};
use crate::buffer::CodeOffset;
use crate::lower::Lowerer;
use crate::result::CodegenResult;
use kiln_object::{BinFormat, ObjectKind, SymbolScope};

impl<'a, K: ObjectKind> Lowerer<'a, K> {
    /// Emit both helpers and register their symbols.
    pub(crate) fn emit_dynamic_cast_runtime(&mut self) -> CodegenResult<()> {
        self.emit_check_function();
        self.emit_throw_function();
        Ok(())
    }

    fn patch_rel8(&mut self, jcc_at: CodeOffset, target: CodeOffset) {
        // jcc_at points at the opcode byte; the displacement byte follows.
        let disp = target as i64 - (jcc_at as i64 + 2);
        self.buf.patch1(jcc_at + 1, disp as i8 as u8);
    }

    fn jcc_rel8_patchable(&mut self, cc: CC) -> CodeOffset {
        let at = self.cur();
        emit::jcc_rel8(&mut self.buf, cc, 0);
        at
    }

    /// `bool __dynamic_cast_check(type_info* source, type_info* target)`.
    ///
    /// ELF walks the Itanium `type_info` (pointer equality, then the
    /// single-inheritance base at offset 16). COFF walks the complete
    /// object locator: type descriptors at +12, hierarchy at +20, base
    /// count at +8 capped at 64, base descriptor array at +12 of the
    /// hierarchy. AL is 1 when the cast is valid.
    fn emit_check_function(&mut self) {
        self.buf.align_to(16);
        let start = self.cur();

        match K::FORMAT {
            BinFormat::Elf => {
                emit::push_r(&mut self.buf, Gpr::RBX);

                emit::test_rr(&mut self.buf, OperandSize::S64, Gpr::RDI, Gpr::RDI);
                let null_source = self.jcc_rel8_patchable(CC::E);
                emit::test_rr(&mut self.buf, OperandSize::S64, Gpr::RSI, Gpr::RSI);
                let null_target = self.jcc_rel8_patchable(CC::E);

                emit::alu_rr(&mut self.buf, AluOp::Cmp, OperandSize::S64, Gpr::RDI, Gpr::RSI);
                let ptr_eq = self.jcc_rel8_patchable(CC::E);

                // Single-inheritance base class at +16 of the type_info.
                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::RBX, Gpr::RDI, 16);
                emit::test_rr(&mut self.buf, OperandSize::S64, Gpr::RBX, Gpr::RBX);
                let no_base = self.jcc_rel8_patchable(CC::E);
                emit::alu_rr(&mut self.buf, AluOp::Cmp, OperandSize::S64, Gpr::RBX, Gpr::RSI);
                let base_eq = self.jcc_rel8_patchable(CC::E);

                let ret_false = self.cur();
                emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S64, Gpr::RAX, Gpr::RAX);
                emit::pop_r(&mut self.buf, Gpr::RBX);
                emit::ret(&mut self.buf);

                let ret_true = self.cur();
                emit::mov_ri32(&mut self.buf, Gpr::RAX, 1);
                emit::pop_r(&mut self.buf, Gpr::RBX);
                emit::ret(&mut self.buf);

                self.patch_rel8(null_source, ret_false);
                self.patch_rel8(null_target, ret_false);
                self.patch_rel8(ptr_eq, ret_true);
                self.patch_rel8(no_base, ret_false);
                self.patch_rel8(base_eq, ret_true);
            }
            BinFormat::Coff => {
                emit::push_r(&mut self.buf, Gpr::RBX);
                emit::push_r(&mut self.buf, Gpr::RSI);
                emit::push_r(&mut self.buf, Gpr::RDI);
                emit::alu_ri(&mut self.buf, AluOp::Sub, OperandSize::S64, Gpr::RSP, 32);

                emit::test_rr(&mut self.buf, OperandSize::S64, Gpr::RCX, Gpr::RCX);
                let null_source = self.jcc_rel8_patchable(CC::E);
                emit::test_rr(&mut self.buf, OperandSize::S64, Gpr::RDX, Gpr::RDX);
                let null_target = self.jcc_rel8_patchable(CC::E);

                emit::alu_rr(&mut self.buf, AluOp::Cmp, OperandSize::S64, Gpr::RCX, Gpr::RDX);
                let col_eq = self.jcc_rel8_patchable(CC::E);

                // Type descriptors from both locators.
                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::R8, Gpr::RCX, 12);
                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::R9, Gpr::RDX, 12);
                emit::alu_rr(&mut self.buf, AluOp::Cmp, OperandSize::S64, Gpr::R8, Gpr::R9);
                let td_eq = self.jcc_rel8_patchable(CC::E);

                // Class hierarchy descriptor and its base-class array.
                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::R10, Gpr::RCX, 20);
                emit::test_rr(&mut self.buf, OperandSize::S64, Gpr::R10, Gpr::R10);
                let null_chd = self.jcc_rel8_patchable(CC::E);

                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::RBX, Gpr::R10, 8);
                emit::alu_ri(&mut self.buf, AluOp::Cmp, OperandSize::S64, Gpr::RBX, 64);
                let too_many = self.jcc_rel8_patchable(CC::A);
                emit::test_rr(&mut self.buf, OperandSize::S64, Gpr::RBX, Gpr::RBX);
                let no_bases = self.jcc_rel8_patchable(CC::E);

                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::R11, Gpr::R10, 12);
                emit::test_rr(&mut self.buf, OperandSize::S64, Gpr::R11, Gpr::R11);
                let null_bca = self.jcc_rel8_patchable(CC::E);

                emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S64, Gpr::RSI, Gpr::RSI);

                let loop_start = self.cur();
                emit::lea_sib(&mut self.buf, Gpr::RDI, Gpr::R11, Gpr::RSI, 3, 0);
                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::RDI, Gpr::RDI, 0);
                emit::test_rr(&mut self.buf, OperandSize::S64, Gpr::RDI, Gpr::RDI);
                let null_bcd = self.jcc_rel8_patchable(CC::E);

                emit::mov_r_m(&mut self.buf, OperandSize::S64, Gpr::RAX, Gpr::RDI, 0);
                emit::alu_rr(&mut self.buf, AluOp::Cmp, OperandSize::S64, Gpr::RAX, Gpr::R9);
                let base_match = self.jcc_rel8_patchable(CC::E);

                let loop_continue = self.cur();
                self.patch_rel8(null_bcd, loop_continue);
                emit::alu_ri(&mut self.buf, AluOp::Add, OperandSize::S64, Gpr::RSI, 1);
                emit::alu_rr(&mut self.buf, AluOp::Cmp, OperandSize::S64, Gpr::RSI, Gpr::RBX);
                // Loop back; the displacement always fits a rel8 with the
                // body above, the 126 clamp guards the impossible case.
                let back = loop_start as i64 - (self.cur() as i64 + 2);
                let back = if !(-128..=127).contains(&back) { 126 } else { back };
                emit::jcc_rel8(&mut self.buf, CC::B, back as i8);

                let ret_false = self.cur();
                emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S64, Gpr::RAX, Gpr::RAX);
                emit::alu_ri(&mut self.buf, AluOp::Add, OperandSize::S64, Gpr::RSP, 32);
                emit::pop_r(&mut self.buf, Gpr::RDI);
                emit::pop_r(&mut self.buf, Gpr::RSI);
                emit::pop_r(&mut self.buf, Gpr::RBX);
                emit::ret(&mut self.buf);

                let ret_true = self.cur();
                emit::mov_ri32(&mut self.buf, Gpr::RAX, 1);
                emit::alu_ri(&mut self.buf, AluOp::Add, OperandSize::S64, Gpr::RSP, 32);
                emit::pop_r(&mut self.buf, Gpr::RDI);
                emit::pop_r(&mut self.buf, Gpr::RSI);
                emit::pop_r(&mut self.buf, Gpr::RBX);
                emit::ret(&mut self.buf);

                self.patch_rel8(null_source, ret_false);
                self.patch_rel8(null_target, ret_false);
                self.patch_rel8(col_eq, ret_true);
                self.patch_rel8(td_eq, ret_true);
                self.patch_rel8(null_chd, ret_false);
                self.patch_rel8(too_many, ret_false);
                self.patch_rel8(no_bases, ret_false);
                self.patch_rel8(null_bca, ret_false);
                self.patch_rel8(base_match, ret_true);
            }
        }

        let len = self.cur() - start;
        self.module
            .define_function("__dynamic_cast_check", start, len, SymbolScope::Export);
    }

    /// `[[noreturn]] void __dynamic_cast_throw_bad_cast()`: clears the
    /// would-be exception arguments and parks in a self-jump. Linking the
    /// runtime's real throw entry point is left to the runtime glue.
    fn emit_throw_function(&mut self) {
        self.buf.align_to(16);
        let start = self.cur();
        emit::alu_ri(&mut self.buf, AluOp::Sub, OperandSize::S64, Gpr::RSP, 40);
        emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S32, Gpr::RCX, Gpr::RCX);
        emit::alu_rr(&mut self.buf, AluOp::Xor, OperandSize::S32, Gpr::RDX, Gpr::RDX);
        emit::alu_ri(&mut self.buf, AluOp::Add, OperandSize::S64, Gpr::RSP, 40);
        emit::jmp_rel8(&mut self.buf, -2);
        let len = self.cur() - start;
        self.module.define_function(
            "__dynamic_cast_throw_bad_cast",
            start,
            len,
            SymbolScope::Export,
        );
    }
}
