//! Struct layouts, inheritance and vtable shapes.
//!
//! Populated by the front end before code generation; the back end only
//! reads it (member offsets, constructor lookup, vtable slots, RTTI bases).

use crate::interner::StringId;
use crate::types::TypeDesc;
use rustc_hash::FxHashMap;

/// Index of a struct type in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeIndex(pub u32);

/// A data member.
#[derive(Clone, Debug)]
pub struct StructField {
    /// Member name.
    pub name: StringId,
    /// Byte offset within the object.
    pub offset: u32,
    /// Member type.
    pub ty: TypeDesc,
}

/// A direct base class.
#[derive(Clone, Debug)]
pub struct BaseClass {
    /// Base class name.
    pub name: StringId,
    /// Registry index of the base.
    pub type_index: TypeIndex,
    /// Byte offset of the base subobject in the derived object.
    pub offset: u32,
    /// Virtual inheritance.
    pub is_virtual: bool,
    /// Number of bases the base itself contains (for RTTI hierarchies).
    pub num_contained_bases: u32,
}

/// One slot in a vtable.
#[derive(Clone, Debug)]
pub struct VirtualSlot {
    /// Mangled symbol of the final overrider, or `StringId::EMPTY` for a
    /// pure virtual slot (resolved to the platform pure-call handler).
    pub mangled: StringId,
    /// Slot belongs to a pure virtual function.
    pub is_pure: bool,
}

/// A constructor signature, just deep enough for the back end's minimal
/// overload pick (parameter count, copy-constructor preference).
#[derive(Clone, Debug)]
pub struct CtorSig {
    /// Mangled symbol.
    pub mangled: StringId,
    /// Parameter count excluding `this`.
    pub param_count: u32,
    /// Single parameter is a reference to the same struct type.
    pub is_copy: bool,
}

/// Layout and dispatch description of one struct type.
#[derive(Clone, Debug, Default)]
pub struct StructLayout {
    /// Unqualified class name.
    pub name: StringId,
    /// Object size in bytes.
    pub size_bytes: u32,
    /// Data members.
    pub fields: Vec<StructField>,
    /// Direct bases, in declaration order.
    pub base_classes: Vec<BaseClass>,
    /// Vtable slots, empty when the class is not polymorphic.
    pub vtable: Vec<VirtualSlot>,
    /// Platform vtable symbol (`_ZTV…` / `??_7…@@6B@`), empty when none.
    pub vtable_symbol: StringId,
    /// Declared constructors.
    pub constructors: Vec<CtorSig>,
    /// Mangled destructor symbol, when one exists.
    pub destructor: Option<StringId>,
    /// Destructor is non-trivial (drives the array-new cookie).
    pub has_nontrivial_dtor: bool,
}

impl StructLayout {
    /// True when objects of this class carry a vtable pointer.
    pub fn is_polymorphic(&self) -> bool {
        !self.vtable.is_empty()
    }

    /// Pick a constructor for a call with `arg_count` explicit arguments.
    ///
    /// Overload resolution proper happened in the front end; this lookup only
    /// recovers which mangled symbol to call, preferring the copy constructor
    /// when a one-argument call passes the same struct type.
    pub fn select_constructor(&self, arg_count: u32, arg_is_same_struct: bool) -> Option<&CtorSig> {
        if arg_count == 1 && arg_is_same_struct {
            if let Some(copy) = self.constructors.iter().find(|c| c.is_copy) {
                return Some(copy);
            }
        }
        self.constructors.iter().find(|c| c.param_count == arg_count)
    }
}

/// All struct types of the translation unit.
#[derive(Default)]
pub struct TypeRegistry {
    layouts: Vec<StructLayout>,
    by_name: FxHashMap<StringId, TypeIndex>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layout, returning its index. Re-registering a name
    /// replaces the layout (the front end finalizes each type once).
    pub fn define(&mut self, layout: StructLayout) -> TypeIndex {
        if let Some(&idx) = self.by_name.get(&layout.name) {
            log::trace!("redefining struct layout at index {}", idx.0);
            self.layouts[idx.0 as usize] = layout;
            return idx;
        }
        let idx = TypeIndex(self.layouts.len() as u32);
        self.by_name.insert(layout.name, idx);
        self.layouts.push(layout);
        idx
    }

    /// Look up by index.
    pub fn get(&self, idx: TypeIndex) -> &StructLayout {
        &self.layouts[idx.0 as usize]
    }

    /// Look up by class name.
    pub fn by_name(&self, name: StringId) -> Option<&StructLayout> {
        self.by_name.get(&name).map(|&i| &self.layouts[i.0 as usize])
    }

    /// Index for a class name.
    pub fn index_of(&self, name: StringId) -> Option<TypeIndex> {
        self.by_name.get(&name).copied()
    }

    /// Iterate over all layouts.
    pub fn iter(&self) -> impl Iterator<Item = &StructLayout> {
        self.layouts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::Interner;

    #[test]
    fn constructor_selection_prefers_copy_for_same_struct() {
        let mut strings = Interner::new();
        let layout = StructLayout {
            name: strings.intern("S"),
            size_bytes: 8,
            constructors: vec![
                CtorSig {
                    mangled: strings.intern("??0S@@QEAA@H@Z"),
                    param_count: 1,
                    is_copy: false,
                },
                CtorSig {
                    mangled: strings.intern("??0S@@QEAA@AEBU0@@Z"),
                    param_count: 1,
                    is_copy: true,
                },
            ],
            ..Default::default()
        };
        let copy = layout.select_constructor(1, true).unwrap();
        assert!(copy.is_copy);
        let value = layout.select_constructor(1, false).unwrap();
        assert!(!value.is_copy);
    }
}
