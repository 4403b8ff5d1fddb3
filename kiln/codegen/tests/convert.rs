//! End-to-end tests: IR in, relocatable object out, parsed back with
//! `object` and checked down to the byte level where the encoding is
//! pinned.

use kiln_codegen::{convert, Coff, CodegenError, CompilationContext, Elf};
use kiln_ir::*;
use object::{Object as _, ObjectSection as _, ObjectSymbol as _};
use std::path::PathBuf;

fn out_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("kiln-test-{}-{}.o", name, std::process::id()));
    p
}

fn plain_function(ctx: &mut CompilationContext, name: &str) -> IrPayload {
    IrPayload::FunctionDecl(Box::new(FunctionDeclOp {
        function_name: ctx.intern(name),
        mangled_name: StringId::EMPTY,
        struct_name: StringId::EMPTY,
        return_type: TypeDesc::scalar(IrType::Int, 32),
        parameters: vec![],
        linkage: Linkage::C,
        is_variadic: false,
        is_inline: false,
        has_hidden_return_param: false,
        returns_reference: false,
        is_static_member: false,
    }))
}

fn int_var(ctx: &mut CompilationContext, name: &str) -> IrPayload {
    IrPayload::VariableDecl(VariableDeclOp {
        name: ctx.intern(name),
        ty: TypeDesc::scalar(IrType::Int, 32),
        element_count: 0,
    })
}

fn assign_imm(ctx: &mut CompilationContext, name: &str, value: u64) -> IrPayload {
    IrPayload::Assignment(AssignmentOp {
        lhs: TypedValue::name(ctx.interner.intern(name), IrType::Int, 32),
        rhs: TypedValue::imm(value, IrType::Int, 32),
        is_pointer_store: false,
        dereference_rhs_references: true,
    })
}

fn convert_elf(ctx: &mut CompilationContext, ir: &Ir, name: &str) -> Vec<u8> {
    let path = out_path(name);
    convert::<Elf>(ctx, ir, &path, std::path::Path::new("test.cpp"), false).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).ok();
    bytes
}

fn convert_coff(ctx: &mut CompilationContext, ir: &Ir, name: &str) -> Vec<u8> {
    let path = out_path(name);
    convert::<Coff>(ctx, ir, &path, std::path::Path::new("test.cpp"), false).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).ok();
    bytes
}

fn text_of(bytes: &[u8]) -> Vec<u8> {
    let file = object::File::parse(bytes).unwrap();
    file.section_by_name(".text")
        .expect("has .text")
        .data()
        .unwrap()
        .to_vec()
}

fn find(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn add_two_ints_byte_exact() {
    let mut ctx = CompilationContext::new();
    let mut ir = Ir::new();
    ir.push(IrOpcode::FunctionDecl, plain_function(&mut ctx, "main"));
    ir.push(IrOpcode::VariableDecl, int_var(&mut ctx, "a"));
    ir.push(IrOpcode::VariableDecl, int_var(&mut ctx, "b"));
    ir.push(IrOpcode::Assignment, assign_imm(&mut ctx, "a", 3));
    ir.push(IrOpcode::Assignment, assign_imm(&mut ctx, "b", 4));
    let a = ctx.intern("a");
    let b = ctx.intern("b");
    ir.push(
        IrOpcode::Add,
        IrPayload::Binary(BinaryOp {
            result: TempVar(0),
            lhs: TypedValue::name(a, IrType::Int, 32),
            rhs: TypedValue::name(b, IrType::Int, 32),
        }),
    );
    ir.push(
        IrOpcode::Return,
        IrPayload::Return(ReturnOp {
            value: Some(TypedValue::temp(TempVar(0), IrType::Int, 32)),
        }),
    );

    let bytes = convert_elf(&mut ctx, &ir, "add");
    let text = text_of(&bytes);
    let expected: Vec<u8> = vec![
        0x55, // push rbp
        0x48, 0x8B, 0xEC, // mov rbp, rsp
        0x48, 0x81, 0xEC, 0x18, 0x00, 0x00, 0x00, // sub rsp, 24
        0xC7, 0x45, 0xF8, 0x03, 0x00, 0x00, 0x00, // mov dword [rbp-8], 3
        0xC7, 0x45, 0xF0, 0x04, 0x00, 0x00, 0x00, // mov dword [rbp-16], 4
        0x8B, 0x45, 0xF8, // mov eax, [rbp-8]
        0x44, 0x8B, 0x55, 0xF0, // mov r10d, [rbp-16]
        0x44, 0x01, 0xD0, // add eax, r10d
        0x89, 0x45, 0xD8, // mov [rbp-40], eax
        0x48, 0x8B, 0xE5, // mov rsp, rbp
        0x5D, // pop rbp
        0xC3, // ret
    ];
    assert_eq!(&text[..expected.len()], &expected[..]);

    // The frame keeps call sites 16-byte aligned: (N + 8) % 16 == 0.
    let n = u32::from_le_bytes([text[7], text[8], text[9], text[10]]);
    assert_eq!((n + 8) % 16, 0);

    let file = object::File::parse(&*bytes).unwrap();
    let main = file.symbols().find(|s| s.name() == Ok("main")).unwrap();
    assert!(main.is_definition());
}

#[test]
fn backward_branch_displacement() {
    let mut ctx = CompilationContext::new();
    let label = ctx.intern("L0");
    let mut ir = Ir::new();
    ir.push(IrOpcode::FunctionDecl, plain_function(&mut ctx, "spin"));
    ir.push(IrOpcode::Label, IrPayload::Label(LabelOp { label }));
    ir.push(IrOpcode::Branch, IrPayload::Branch(BranchOp { target: label }));
    ir.push(IrOpcode::Return, IrPayload::Return(ReturnOp { value: None }));

    let bytes = convert_elf(&mut ctx, &ir, "branch");
    let text = text_of(&bytes);
    // Prologue is 11 bytes; the jump to the label at 0x0B encodes
    // label − (patch_site + 4) = −5.
    assert_eq!(text[0x0B], 0xE9);
    assert_eq!(&text[0x0C..0x10], &(-5i32).to_le_bytes());
}

#[test]
fn division_uses_fixed_registers() {
    let mut ctx = CompilationContext::new();
    let mut ir = Ir::new();
    ir.push(IrOpcode::FunctionDecl, plain_function(&mut ctx, "divmod"));
    ir.push(IrOpcode::VariableDecl, int_var(&mut ctx, "a"));
    ir.push(IrOpcode::Assignment, assign_imm(&mut ctx, "a", 17));
    let a = ctx.intern("a");
    ir.push(
        IrOpcode::Divide,
        IrPayload::Binary(BinaryOp {
            result: TempVar(0),
            lhs: TypedValue::name(a, IrType::Int, 32),
            rhs: TypedValue::imm(5, IrType::Int, 32),
        }),
    );
    ir.push(
        IrOpcode::Modulo,
        IrPayload::Binary(BinaryOp {
            result: TempVar(1),
            lhs: TypedValue::name(a, IrType::Int, 32),
            rhs: TypedValue::imm(5, IrType::Int, 32),
        }),
    );
    ir.push(
        IrOpcode::Return,
        IrPayload::Return(ReturnOp {
            value: Some(TypedValue::temp(TempVar(1), IrType::Int, 32)),
        }),
    );
    let bytes = convert_elf(&mut ctx, &ir, "div");
    let text = text_of(&bytes);
    // CDQ for the signed 32-bit dividend.
    assert!(find(&text, &[0x99]));
    // idiv r10d appears twice (quotient then remainder).
    assert!(find(&text, &[0x41, 0xF7, 0xFA]));
}

#[test]
fn float_compare_uses_unordered_flags() {
    let mut ctx = CompilationContext::new();
    let mut ir = Ir::new();
    ir.push(IrOpcode::FunctionDecl, plain_function(&mut ctx, "fcmp"));
    ir.push(
        IrOpcode::VariableDecl,
        IrPayload::VariableDecl(VariableDeclOp {
            name: ctx.intern("x"),
            ty: TypeDesc::scalar(IrType::Double, 64),
            element_count: 0,
        }),
    );
    let x = ctx.intern("x");
    ir.push(
        IrOpcode::Assignment,
        IrPayload::Assignment(AssignmentOp {
            lhs: TypedValue::name(x, IrType::Double, 64),
            rhs: TypedValue::float_imm(1.5, IrType::Double),
            is_pointer_store: false,
            dereference_rhs_references: true,
        }),
    );
    ir.push(
        IrOpcode::FloatLessThan,
        IrPayload::Binary(BinaryOp {
            result: TempVar(0),
            lhs: TypedValue::name(x, IrType::Double, 64),
            rhs: TypedValue::float_imm(2.0, IrType::Double),
        }),
    );
    ir.push(
        IrOpcode::Return,
        IrPayload::Return(ReturnOp {
            value: Some(TypedValue::temp(TempVar(0), IrType::Bool, 8)),
        }),
    );
    let bytes = convert_elf(&mut ctx, &ir, "fcmp");
    let text = text_of(&bytes);
    // ucomisd, then setb (unordered operands produce false).
    assert!(find(&text, &[0x66, 0x0F, 0x2E]));
    assert!(find(&text, &[0x0F, 0x92]));
}

#[test]
fn calls_use_plt_relocations_on_elf() {
    let mut ctx = CompilationContext::new();
    let callee = ctx.intern("_Z3fooii");
    let mut ir = Ir::new();
    ir.push(IrOpcode::FunctionDecl, plain_function(&mut ctx, "caller"));
    ir.push(
        IrOpcode::FunctionCall,
        IrPayload::Call(Box::new(CallOp {
            result: TempVar(0),
            return_type: TypeDesc::scalar(IrType::Int, 32),
            function_name: callee,
            indirect_target: None,
            args: vec![
                TypedValue::imm(1, IrType::Int, 32),
                TypedValue::imm(2, IrType::Int, 32),
            ],
            is_variadic: false,
            is_member_function: false,
            uses_return_slot: false,
            returns_rvalue_reference: false,
        })),
    );
    ir.push(
        IrOpcode::Return,
        IrPayload::Return(ReturnOp {
            value: Some(TypedValue::temp(TempVar(0), IrType::Int, 32)),
        }),
    );
    let bytes = convert_elf(&mut ctx, &ir, "call");
    let file = object::File::parse(&*bytes).unwrap();
    let text = file.section_by_name(".text").unwrap();
    let mut found = false;
    for (_, reloc) in text.relocations() {
        if reloc.kind() == object::RelocationKind::PltRelative {
            found = true;
            assert_eq!(reloc.addend(), -4);
        }
    }
    assert!(found, "expected a PLT-relative call relocation");
    // Arguments land in EDI/ESI per the System V order.
    let data = text.data().unwrap();
    assert!(find(data, &[0xBF, 0x01, 0x00, 0x00, 0x00])); // mov edi, 1
    assert!(find(data, &[0xBE, 0x02, 0x00, 0x00, 0x00])); // mov esi, 2
}

#[test]
fn try_catch_emits_lsda_and_patched_filters() {
    let mut ctx = CompilationContext::new();
    let mut ir = Ir::new();
    ir.push(IrOpcode::FunctionDecl, plain_function(&mut ctx, "main"));
    ir.push(IrOpcode::TryBegin, IrPayload::None);
    ir.push(
        IrOpcode::Throw,
        IrPayload::Throw(ThrowOp {
            value: Some(TypedValue::imm(42, IrType::Int, 32)),
        }),
    );
    ir.push(IrOpcode::TryEnd, IrPayload::None);
    ir.push(
        IrOpcode::CatchBegin,
        IrPayload::CatchBegin(CatchBeginOp {
            type_name: None,
            builtin: Some(IrType::Int),
            catch_var: Some(ctx.intern("x")),
            catch_var_size_bits: 32,
        }),
    );
    let x = ctx.intern("x");
    ir.push(
        IrOpcode::Return,
        IrPayload::Return(ReturnOp {
            value: Some(TypedValue::name(x, IrType::Int, 32)),
        }),
    );
    ir.push(IrOpcode::CatchEnd, IrPayload::None);
    ir.push(
        IrOpcode::Return,
        IrPayload::Return(ReturnOp {
            value: Some(TypedValue::imm(0, IrType::Int, 32)),
        }),
    );

    let bytes = convert_elf(&mut ctx, &ir, "trycatch");
    let file = object::File::parse(&*bytes).unwrap();

    // The landing-pad dispatch compares the selector against the patched
    // filter for the single table entry.
    let text = file.section_by_name(".text").unwrap().data().unwrap().to_vec();
    assert!(find(&text, &[0x81, 0xFA, 0x01, 0x00, 0x00, 0x00]));

    let lsda = file.section_by_name(".gcc_except_table").unwrap();
    assert!(lsda.size() > 0);
    let eh = file.section_by_name(".eh_frame").unwrap();
    assert!(eh.size() > 0);

    // The unit references the runtime and the int typeinfo.
    for name in ["__cxa_throw", "__cxa_begin_catch", "__cxa_end_catch", "_ZTIi"] {
        assert!(
            file.symbols().any(|s| s.name() == Ok(name) && s.is_undefined()),
            "missing external reference to {name}"
        );
    }
    assert!(file
        .symbols()
        .any(|s| s.name() == Ok("__gxx_personality_v0")));
}

#[test]
fn coff_dynamic_cast_synthesizes_runtime_and_pdata() {
    let mut ctx = CompilationContext::new();
    let d = ctx.intern("D");
    ctx.types.define(StructLayout {
        name: d,
        size_bytes: 8,
        vtable: vec![VirtualSlot {
            mangled: ctx.interner.intern("?f@D@@UEAAHXZ"),
            is_pure: false,
        }],
        ..Default::default()
    });

    let mut ir = Ir::new();
    ir.push(IrOpcode::FunctionDecl, plain_function(&mut ctx, "main"));
    ir.push(
        IrOpcode::VariableDecl,
        IrPayload::VariableDecl(VariableDeclOp {
            name: ctx.intern("p"),
            ty: TypeDesc::pointer(IrType::Struct, 64),
            element_count: 0,
        }),
    );
    let p = ctx.intern("p");
    ir.push(
        IrOpcode::DynamicCast,
        IrPayload::DynamicCast(DynamicCastOp {
            result: TempVar(0),
            source: TypedValue::name(p, IrType::Struct, 64).with_pointer_depth(1),
            target_type_name: d,
            is_reference: false,
        }),
    );
    ir.push(
        IrOpcode::Return,
        IrPayload::Return(ReturnOp {
            value: Some(TypedValue::temp(TempVar(0), IrType::Int, 32)),
        }),
    );

    let bytes = convert_coff(&mut ctx, &ir, "dyncast");
    let file = object::File::parse(&*bytes).unwrap();

    for name in ["__dynamic_cast_check", "__dynamic_cast_throw_bad_cast"] {
        let sym = file
            .symbols()
            .find(|s| s.name() == Ok(name))
            .unwrap_or_else(|| panic!("missing {name}"));
        assert!(sym.is_definition());
    }
    // The target locator is referenced, not defined here.
    assert!(file
        .symbols()
        .any(|s| s.name() == Ok("??_R4.?AVD@@6B@") && s.is_undefined()));
    // One RUNTIME_FUNCTION entry for main.
    let pdata = file.section_by_name(".pdata").unwrap();
    assert_eq!(pdata.size(), 12);
}

#[test]
fn coff_member_function_schedules_vtable_and_rtti() {
    let mut ctx = CompilationContext::new();
    let b = ctx.intern("B");
    let b_idx = ctx.types.define(StructLayout {
        name: b,
        size_bytes: 8,
        vtable: vec![VirtualSlot {
            mangled: ctx.interner.intern("?f@B@@UEAAHXZ"),
            is_pure: false,
        }],
        ..Default::default()
    });
    let d = ctx.intern("D");
    ctx.types.define(StructLayout {
        name: d,
        size_bytes: 8,
        base_classes: vec![BaseClass {
            name: b,
            type_index: b_idx,
            offset: 0,
            is_virtual: false,
            num_contained_bases: 0,
        }],
        vtable: vec![VirtualSlot {
            mangled: ctx.interner.intern("?f@D@@UEAAHXZ"),
            is_pure: false,
        }],
        ..Default::default()
    });

    let mut ir = Ir::new();
    let method = IrPayload::FunctionDecl(Box::new(FunctionDeclOp {
        function_name: ctx.intern("f"),
        mangled_name: ctx.intern("?f@D@@UEAAHXZ"),
        struct_name: d,
        return_type: TypeDesc::scalar(IrType::Int, 32),
        parameters: vec![],
        linkage: Linkage::CPlusPlus,
        is_variadic: false,
        is_inline: false,
        has_hidden_return_param: false,
        returns_reference: false,
        is_static_member: false,
    }));
    ir.push(IrOpcode::FunctionDecl, method);
    ir.push(
        IrOpcode::Return,
        IrPayload::Return(ReturnOp {
            value: Some(TypedValue::imm(7, IrType::Int, 32)),
        }),
    );

    let bytes = convert_coff(&mut ctx, &ir, "vtable");
    let file = object::File::parse(&*bytes).unwrap();
    for name in [
        "??_7D@@6B@",
        "??_R0.?AVD@@",
        "??_R1.?AVD@@8",
        "??_R2.?AVD@@8",
        "??_R3.?AVD@@8",
        "??_R4.?AVD@@6B@",
    ] {
        let sym = file
            .symbols()
            .find(|s| s.name() == Ok(name))
            .unwrap_or_else(|| panic!("missing {name}"));
        assert!(sym.is_definition(), "{name} should be defined");
    }
    // The vtable slot points at the final overrider.
    let rdata = file.section_by_name(".rdata").unwrap();
    let mut targets = Vec::new();
    for (_, reloc) in rdata.relocations() {
        if let object::RelocationTarget::Symbol(id) = reloc.target() {
            targets.push(file.symbol_by_index(id).unwrap().name().unwrap().to_string());
        }
    }
    assert!(targets.iter().any(|t| t == "?f@D@@UEAAHXZ"));
}

#[test]
fn partial_failure_still_writes_the_object() {
    let mut ctx = CompilationContext::new();
    let missing = ctx.intern("Lmissing");
    let mut ir = Ir::new();
    ir.push(IrOpcode::FunctionDecl, plain_function(&mut ctx, "bad"));
    // A branch to a label that never appears poisons this function only.
    ir.push(
        IrOpcode::Branch,
        IrPayload::Branch(BranchOp { target: missing }),
    );
    ir.push(IrOpcode::FunctionDecl, plain_function(&mut ctx, "good"));
    ir.push(
        IrOpcode::Return,
        IrPayload::Return(ReturnOp {
            value: Some(TypedValue::imm(0, IrType::Int, 32)),
        }),
    );

    let path = out_path("partial");
    let err = convert::<Elf>(&mut ctx, &ir, &path, std::path::Path::new("t.cpp"), false)
        .expect_err("expected a partial failure");
    match err {
        CodegenError::PartialFailure { failed } => assert_eq!(failed, 1),
        other => panic!("unexpected error: {other}"),
    }
    let bytes = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).ok();
    let file = object::File::parse(&*bytes).unwrap();
    assert!(file.symbols().any(|s| s.name() == Ok("good")));
}
