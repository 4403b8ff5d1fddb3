//! Instructions, opcodes and their typed payloads.

use crate::interner::StringId;
use crate::types::{IrType, Linkage, TypeDesc};
use crate::value::{TempVar, TypedValue};

/// The closed opcode set.
///
/// One enum variant per operation the front end can emit. The payload family
/// each opcode carries is fixed; the dispatcher matches exhaustively and
/// treats a mismatched payload as malformed IR.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum IrOpcode {
    // Declarations
    FunctionDecl,
    VariableDecl,
    StackAlloc,
    GlobalVariableDecl,

    // Calls and returns
    Return,
    FunctionCall,
    IndirectCall,
    ConstructorCall,
    DestructorCall,
    VirtualCall,
    FunctionAddress,

    // Integer arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    UnsignedDivide,
    Modulo,
    UnsignedModulo,
    ShiftLeft,
    ShiftRight,
    UnsignedShiftRight,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,

    // Floating arithmetic
    FloatAdd,
    FloatSubtract,
    FloatMultiply,
    FloatDivide,

    // Comparisons
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    UnsignedLessThan,
    UnsignedLessEqual,
    UnsignedGreaterThan,
    UnsignedGreaterEqual,
    FloatEqual,
    FloatNotEqual,
    FloatLessThan,
    FloatLessEqual,
    FloatGreaterThan,
    FloatGreaterEqual,

    // Logic and unary
    LogicalAnd,
    LogicalOr,
    LogicalNot,
    BitwiseNot,
    Negate,

    // Conversions
    SignExtend,
    ZeroExtend,
    Truncate,
    FloatToInt,
    IntToFloat,
    FloatToFloat,

    // Compound assignment
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    ShlAssign,
    ShrAssign,

    // Data movement
    Assignment,
    StringLiteral,
    GlobalLoad,
    GlobalStore,

    // Control flow
    Label,
    Branch,
    ConditionalBranch,
    LoopBegin,
    LoopEnd,
    ScopeBegin,
    ScopeEnd,
    Break,
    Continue,

    // Arrays
    ArrayAccess,
    ArrayStore,
    ArrayElementAddress,

    // Increment / decrement
    PreIncrement,
    PostIncrement,
    PreDecrement,
    PostDecrement,

    // Addresses, pointers, members
    AddressOf,
    AddressOfMember,
    ComputeAddress,
    Dereference,
    DereferenceStore,
    MemberAccess,
    MemberStore,

    // Heap
    HeapAlloc,
    HeapAllocArray,
    HeapFree,
    HeapFreeArray,
    PlacementNew,

    // RTTI
    Typeid,
    DynamicCast,

    // C++ exception handling
    TryBegin,
    TryEnd,
    CatchBegin,
    CatchEnd,
    Throw,
    Rethrow,

    // Windows structured exception handling
    SehTryBegin,
    SehTryEnd,
    SehExceptBegin,
    SehExceptEnd,
    SehFinallyBegin,
    SehFinallyEnd,
    SehFinallyCall,
    SehFilterBegin,
    SehFilterEnd,
    SehLeave,
    SehGetExceptionCode,
    SehSaveExceptionCode,
}

/// One IR instruction: opcode, payload, optional source line.
pub struct IrInstruction {
    /// What to do.
    pub opcode: IrOpcode,
    /// Operands and metadata; the variant family is fixed per opcode.
    pub payload: IrPayload,
    /// 1-based source line, when the front end tracked one.
    pub line: Option<u32>,
}

/// A function parameter as declared.
#[derive(Clone, Debug)]
pub struct ParamDesc {
    /// Parameter name (empty for unnamed).
    pub name: StringId,
    /// Declared type.
    pub ty: TypeDesc,
}

/// Payload of `FunctionDecl`.
#[derive(Clone, Debug)]
pub struct FunctionDeclOp {
    /// Unmangled name.
    pub function_name: StringId,
    /// Mangled symbol; empty means `function_name` is the symbol.
    pub mangled_name: StringId,
    /// Owning class for member functions, empty otherwise.
    pub struct_name: StringId,
    /// Return type.
    pub return_type: TypeDesc,
    /// Declared parameters, excluding `this` and the hidden return slot.
    pub parameters: Vec<ParamDesc>,
    /// Symbol linkage.
    pub linkage: Linkage,
    /// Variadic (`...`).
    pub is_variadic: bool,
    /// Declared inline (affects COMDAT-style symbol handling).
    pub is_inline: bool,
    /// Returns a large struct through a hidden pointer parameter.
    pub has_hidden_return_param: bool,
    /// Returns `T&`; the address is returned, never dereferenced.
    pub returns_reference: bool,
    /// Static member function (no `this`).
    pub is_static_member: bool,
}

/// Payload of `VariableDecl` and `StackAlloc`.
#[derive(Clone, Debug)]
pub struct VariableDeclOp {
    /// Variable name.
    pub name: StringId,
    /// Declared type.
    pub ty: TypeDesc,
    /// Element count for arrays; 0 for scalars.
    pub element_count: u32,
}

/// Payload of `Return`.
#[derive(Clone, Debug)]
pub struct ReturnOp {
    /// Returned value; `None` for `return;`.
    pub value: Option<TypedValue>,
}

/// Payload of `FunctionCall` and `IndirectCall`.
#[derive(Clone, Debug)]
pub struct CallOp {
    /// Destination temporary for the return value.
    pub result: TempVar,
    /// Return type.
    pub return_type: TypeDesc,
    /// Callee symbol (mangled). Unused for indirect calls.
    pub function_name: StringId,
    /// Callee expression for indirect calls.
    pub indirect_target: Option<TypedValue>,
    /// Arguments in source order, excluding hidden ones.
    pub args: Vec<TypedValue>,
    /// Callee is variadic.
    pub is_variadic: bool,
    /// First argument is `this`.
    pub is_member_function: bool,
    /// Callee returns a large struct via a hidden first parameter.
    pub uses_return_slot: bool,
    /// Callee returns `T&&`.
    pub returns_rvalue_reference: bool,
}

/// Payload of every two-operand arithmetic, comparison and compound
/// assignment opcode.
#[derive(Clone, Debug)]
pub struct BinaryOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Left operand (the lvalue for compound assignments).
    pub lhs: TypedValue,
    /// Right operand.
    pub rhs: TypedValue,
}

/// Payload of unary opcodes, increments and `AddressOf`.
#[derive(Clone, Debug)]
pub struct UnaryOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Operand.
    pub operand: TypedValue,
}

/// Payload of `Assignment`.
#[derive(Clone, Debug)]
pub struct AssignmentOp {
    /// Store destination.
    pub lhs: TypedValue,
    /// Stored value.
    pub rhs: TypedValue,
    /// LHS is a temporary holding a pointer; store through it.
    pub is_pointer_store: bool,
    /// Load-through RHS reference variables before storing (default); the
    /// front end clears this when materializing reference binds.
    pub dereference_rhs_references: bool,
}

/// Payload of the conversion opcodes.
#[derive(Clone, Debug)]
pub struct TypeConversionOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Source value.
    pub from: TypedValue,
    /// Target category.
    pub to_type: IrType,
    /// Target width in bits.
    pub to_size_bits: u32,
}

/// Payload of `Label`.
#[derive(Clone, Debug)]
pub struct LabelOp {
    /// Label name, unique within the function.
    pub label: StringId,
}

/// Payload of `Branch`.
#[derive(Clone, Debug)]
pub struct BranchOp {
    /// Target label.
    pub target: StringId,
}

/// Payload of `ConditionalBranch`.
#[derive(Clone, Debug)]
pub struct CondBranchOp {
    /// Condition value; nonzero means true.
    pub condition: TypedValue,
    /// Label taken when true.
    pub true_target: StringId,
    /// Label taken when false.
    pub false_target: StringId,
}

/// Payload of `LoopBegin`; `Break`/`Continue` target these labels.
#[derive(Clone, Debug)]
pub struct LoopBeginOp {
    /// Label just past the loop.
    pub end_label: StringId,
    /// Label of the increment step (`continue` target).
    pub increment_label: StringId,
}

/// Payload of `ArrayAccess` and `ArrayElementAddress`.
#[derive(Clone, Debug)]
pub struct ArrayAccessOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Array base: plain array variable, pointer, or `this`-held member.
    pub array: TypedValue,
    /// Element index.
    pub index: TypedValue,
    /// Element type.
    pub element_type: TypeDesc,
    /// Additional byte offset (member arrays inside objects).
    pub member_offset: u32,
    /// Base holds a pointer to the array rather than the array itself.
    pub is_pointer_to_array: bool,
}

/// Payload of `ArrayStore`.
#[derive(Clone, Debug)]
pub struct ArrayStoreOp {
    /// Array base.
    pub array: TypedValue,
    /// Element index.
    pub index: TypedValue,
    /// Stored value.
    pub value: TypedValue,
    /// Element type.
    pub element_type: TypeDesc,
    /// Additional byte offset.
    pub member_offset: u32,
    /// Base holds a pointer to the array.
    pub is_pointer_to_array: bool,
}

/// Payload of `StringLiteral`.
#[derive(Clone, Debug)]
pub struct StringLiteralOp {
    /// Destination temporary (receives the literal's address).
    pub result: TempVar,
    /// Literal bytes with escapes already processed, no terminator.
    pub bytes: Vec<u8>,
}

/// Payload of `MemberAccess` and `AddressOfMember`.
#[derive(Clone, Debug)]
pub struct MemberAccessOp {
    /// Destination temporary.
    pub result: TempVar,
    /// The object: direct value, pointer, or `this`.
    pub object: TypedValue,
    /// Member byte offset.
    pub member_offset: u32,
    /// Member type.
    pub member_type: TypeDesc,
    /// Object operand holds a pointer to the object.
    pub is_pointer_access: bool,
}

/// Payload of `MemberStore`.
#[derive(Clone, Debug)]
pub struct MemberStoreOp {
    /// The object.
    pub object: TypedValue,
    /// Member byte offset.
    pub member_offset: u32,
    /// Stored value.
    pub value: TypedValue,
    /// Member type.
    pub member_type: TypeDesc,
    /// Object operand holds a pointer to the object.
    pub is_pointer_access: bool,
}

/// Payload of `ComputeAddress`.
#[derive(Clone, Debug)]
pub struct ComputeAddressOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Base lvalue or pointer.
    pub base: TypedValue,
    /// Constant byte offset added to the base address.
    pub byte_offset: i32,
}

/// Payload of `Dereference`.
#[derive(Clone, Debug)]
pub struct DereferenceOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Pointer value.
    pub pointer: TypedValue,
    /// Pointed-to type.
    pub value_type: TypeDesc,
}

/// Payload of `DereferenceStore`.
#[derive(Clone, Debug)]
pub struct DereferenceStoreOp {
    /// Pointer value.
    pub pointer: TypedValue,
    /// Stored value.
    pub value: TypedValue,
}

/// Payload of `ConstructorCall`.
#[derive(Clone, Debug)]
pub struct ConstructorCallOp {
    /// Class being constructed.
    pub struct_name: StringId,
    /// Storage being constructed: a local, a temp holding an address, or
    /// the hidden return slot.
    pub object: TypedValue,
    /// Explicit constructor arguments.
    pub args: Vec<TypedValue>,
    /// Construct directly into the enclosing function's hidden return slot.
    pub use_return_slot: bool,
    /// The object operand is a pointer to heap storage.
    pub is_heap_allocated: bool,
    /// Offset of the base subobject when invoking a base constructor.
    pub base_class_offset: u32,
}

/// Payload of `DestructorCall`.
#[derive(Clone, Debug)]
pub struct DestructorCallOp {
    /// Class being destroyed.
    pub struct_name: StringId,
    /// The object.
    pub object: TypedValue,
    /// The object operand holds a pointer.
    pub object_is_pointer: bool,
}

/// Payload of `VirtualCall`.
#[derive(Clone, Debug)]
pub struct VirtualCallOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Receiver object.
    pub object: TypedValue,
    /// Zero-based vtable slot.
    pub vtable_index: u32,
    /// Explicit arguments, excluding `this`.
    pub args: Vec<TypedValue>,
    /// Receiver operand holds a pointer to the object.
    pub is_pointer_access: bool,
    /// Return type.
    pub return_type: TypeDesc,
}

/// Payload of `HeapAlloc` and `PlacementNew`.
#[derive(Clone, Debug)]
pub struct HeapAllocOp {
    /// Destination temporary (receives the address).
    pub result: TempVar,
    /// Allocation size in bytes (`PlacementNew` ignores it).
    pub size_bytes: u64,
    /// Placement address for `PlacementNew`.
    pub placement: Option<TypedValue>,
}

/// Payload of `HeapAllocArray`.
#[derive(Clone, Debug)]
pub struct HeapAllocArrayOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Per-element size in bytes.
    pub element_size: u64,
    /// Element count.
    pub count: TypedValue,
    /// Prepend an 8-byte element-count cookie (non-trivial destructor).
    pub needs_cookie: bool,
}

/// Payload of `HeapFree` and `HeapFreeArray`.
#[derive(Clone, Debug)]
pub struct HeapFreeOp {
    /// Freed pointer.
    pub pointer: TypedValue,
    /// Step back over the array cookie before freeing.
    pub has_cookie: bool,
}

/// Payload of `Typeid`.
#[derive(Clone, Debug)]
pub struct TypeidOp {
    /// Destination temporary (receives the type-info address).
    pub result: TempVar,
    /// Class name.
    pub type_name: StringId,
}

/// Payload of `DynamicCast`.
#[derive(Clone, Debug)]
pub struct DynamicCastOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Source pointer or reference.
    pub source: TypedValue,
    /// Target class name.
    pub target_type_name: StringId,
    /// Reference cast: failure throws instead of yielding null.
    pub is_reference: bool,
}

/// Payload of `GlobalVariableDecl`.
#[derive(Clone, Debug)]
pub struct GlobalVariableDeclOp {
    /// Symbol name.
    pub var_name: StringId,
    /// Variable type.
    pub ty: TypeDesc,
    /// Element count for arrays; 0 for scalars.
    pub element_count: u32,
    /// Has an initializer (`.data` vs `.bss`).
    pub is_initialized: bool,
    /// Raw initializer bytes (little-endian, zero-padded to size).
    pub init_data: Vec<u8>,
    /// The initializer is the address of another symbol; emit an absolute
    /// relocation at offset 0.
    pub reloc_target: Option<StringId>,
}

/// Payload of `GlobalLoad`.
#[derive(Clone, Debug)]
pub struct GlobalLoadOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Global symbol.
    pub var_name: StringId,
    /// Value type.
    pub ty: TypeDesc,
}

/// Payload of `GlobalStore`.
#[derive(Clone, Debug)]
pub struct GlobalStoreOp {
    /// Global symbol.
    pub var_name: StringId,
    /// Stored value.
    pub value: TypedValue,
    /// Value type.
    pub ty: TypeDesc,
}

/// Payload of `FunctionAddress`.
#[derive(Clone, Debug)]
pub struct FunctionAddressOp {
    /// Destination temporary.
    pub result: TempVar,
    /// Function symbol (mangled).
    pub function_name: StringId,
}

/// Payload of `CatchBegin`.
#[derive(Clone, Debug)]
pub struct CatchBeginOp {
    /// Caught class name; `None` with `builtin == None` means `catch (...)`.
    pub type_name: Option<StringId>,
    /// Caught built-in type, when not a class.
    pub builtin: Option<IrType>,
    /// Name of the catch variable, when bound.
    pub catch_var: Option<StringId>,
    /// Width of the catch variable in bits.
    pub catch_var_size_bits: u32,
}

/// Payload of `Throw`.
#[derive(Clone, Debug)]
pub struct ThrowOp {
    /// Thrown value; `None` only for rethrow.
    pub value: Option<TypedValue>,
}

/// Payload of `SehExceptBegin` and `SehFilterBegin`.
#[derive(Clone, Debug)]
pub struct SehExceptOp {
    /// Constant filter value, when the filter expression folded.
    pub filter_constant: Option<i32>,
}

/// Payload of `SehGetExceptionCode` / `SehSaveExceptionCode`.
#[derive(Clone, Debug)]
pub struct SehCodeOp {
    /// Destination temporary.
    pub result: TempVar,
}

/// The tagged union of all payloads, discriminated by opcode family.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
pub enum IrPayload {
    /// Opcodes with no operands (`TryBegin`, `ScopeEnd`, `Break`, …).
    None,
    FunctionDecl(Box<FunctionDeclOp>),
    VariableDecl(VariableDeclOp),
    Return(ReturnOp),
    Call(Box<CallOp>),
    Binary(BinaryOp),
    Unary(UnaryOp),
    Assignment(AssignmentOp),
    Conversion(TypeConversionOp),
    Label(LabelOp),
    Branch(BranchOp),
    CondBranch(CondBranchOp),
    LoopBegin(LoopBeginOp),
    ArrayAccess(ArrayAccessOp),
    ArrayStore(ArrayStoreOp),
    StringLiteral(StringLiteralOp),
    Member(MemberAccessOp),
    MemberStore(MemberStoreOp),
    ComputeAddress(ComputeAddressOp),
    Dereference(DereferenceOp),
    DereferenceStore(DereferenceStoreOp),
    ConstructorCall(Box<ConstructorCallOp>),
    DestructorCall(DestructorCallOp),
    VirtualCall(Box<VirtualCallOp>),
    HeapAlloc(HeapAllocOp),
    HeapAllocArray(HeapAllocArrayOp),
    HeapFree(HeapFreeOp),
    Typeid(TypeidOp),
    DynamicCast(DynamicCastOp),
    GlobalDecl(Box<GlobalVariableDeclOp>),
    GlobalLoad(GlobalLoadOp),
    GlobalStore(GlobalStoreOp),
    FunctionAddress(FunctionAddressOp),
    CatchBegin(CatchBeginOp),
    Throw(ThrowOp),
    SehExcept(SehExceptOp),
    SehCode(SehCodeOp),
}
