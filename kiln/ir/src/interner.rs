//! Instance-owned string interning.

use rustc_hash::FxHashMap;

/// Handle to an interned string.
///
/// Handle 0 is always the empty string, so `StringId::default()` doubles as
/// "no name".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StringId(u32);

impl StringId {
    /// The empty string.
    pub const EMPTY: StringId = StringId(0);

    /// True if this handle names something other than the empty string.
    pub fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Raw index, for dense side tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Append-only string table. Handles are stable for the table's lifetime.
pub struct Interner {
    strings: Vec<Box<str>>,
    map: FxHashMap<Box<str>, StringId>,
}

impl Interner {
    /// Create a table holding only the empty string.
    pub fn new() -> Self {
        let mut table = Self {
            strings: Vec::new(),
            map: FxHashMap::default(),
        };
        table.intern("");
        table
    }

    /// Intern `s`, returning the existing handle if it is already present.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.map.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("interner overflow"));
        let boxed: Box<str> = s.into();
        self.strings.push(boxed.clone());
        self.map.insert(boxed, id);
        id
    }

    /// Resolve a handle.
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.0 as usize]
    }

    /// Look up a string without interning it.
    pub fn lookup(&self, s: &str) -> Option<StringId> {
        self.map.get(s).copied()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_handle_zero() {
        let mut t = Interner::new();
        assert_eq!(t.intern(""), StringId::EMPTY);
        assert!(!StringId::EMPTY.is_some());
    }

    #[test]
    fn interning_is_idempotent() {
        let mut t = Interner::new();
        let a = t.intern("operator()");
        let b = t.intern("operator()");
        assert_eq!(a, b);
        assert_eq!(t.get(a), "operator()");
        assert_eq!(t.lookup("operator()"), Some(a));
        assert_eq!(t.lookup("missing"), None);
    }
}
