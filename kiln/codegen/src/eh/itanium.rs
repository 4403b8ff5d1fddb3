//! Itanium C++ ABI exception tables: the LSDA consumed by
//! `__gxx_personality_v0`, plus filter-value computation for the
//! landing-pad dispatch back-patches.

use super::{CatchHandler, TryBlock};
use crate::lower::{FuncState, Lowerer};
use crate::result::CodegenResult;
use kiln_ir::{CompilationContext, IrType, TypedValue};
use kiln_object::{ObjectKind, RelocKind, SectionRef};

/// Mangled typeinfo symbol for a built-in type.
pub fn builtin_typeinfo(ty: IrType) -> &'static str {
    match ty {
        IrType::Bool => "_ZTIb",
        IrType::Char => "_ZTIc",
        IrType::UnsignedChar => "_ZTIh",
        IrType::Short => "_ZTIs",
        IrType::UnsignedShort => "_ZTIt",
        IrType::Int => "_ZTIi",
        IrType::UnsignedInt => "_ZTIj",
        IrType::Long => "_ZTIl",
        IrType::UnsignedLong => "_ZTIm",
        IrType::Float => "_ZTIf",
        IrType::Double => "_ZTId",
        _ => "_ZTIi",
    }
}

/// Typeinfo symbol for a thrown value.
pub fn typeinfo_symbol_for_type(tv: &TypedValue, ctx: &CompilationContext) -> String {
    if tv.ty == IrType::Struct {
        if let Some(idx) = tv.type_index {
            let name = ctx.str(ctx.types.get(idx).name);
            return format!("_ZTI{}{}", name.len(), name);
        }
    }
    builtin_typeinfo(tv.ty).to_string()
}

/// Typeinfo symbol a handler matches against; `None` for `catch (...)`.
fn handler_typeinfo(h: &CatchHandler) -> Option<String> {
    if h.is_catch_all {
        return None;
    }
    if let Some(class) = &h.class_name {
        return Some(format!("_ZTI{}{}", class.len(), class));
    }
    Some(builtin_typeinfo(h.builtin.unwrap_or(IrType::Int)).to_string())
}

/// The function's type table: deduplicated typeinfo symbols in first
/// appearance order, with one null entry appended when any handler is a
/// catch-all.
fn build_type_table(try_blocks: &[TryBlock]) -> Vec<Option<String>> {
    let mut table: Vec<Option<String>> = Vec::new();
    for tb in try_blocks {
        for h in &tb.handlers {
            if let Some(sym) = handler_typeinfo(h) {
                if !table.iter().any(|e| e.as_deref() == Some(sym.as_str())) {
                    table.push(Some(sym));
                }
            }
        }
    }
    let any_catch_all = try_blocks
        .iter()
        .any(|tb| tb.handlers.iter().any(|h| h.is_catch_all));
    if any_catch_all && !table.contains(&None) {
        table.push(None);
    }
    table
}

/// A handler's filter value: entries count down from the table length, so
/// the entry at index `i` answers to filter `len − i`.
fn filter_for(table: &[Option<String>], h: &CatchHandler) -> i32 {
    let want = handler_typeinfo(h);
    let idx = table
        .iter()
        .position(|e| *e == want)
        .unwrap_or(table.len().saturating_sub(1));
    table.len() as i32 - idx as i32
}

fn uleb(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut b = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            b |= 0x80;
        }
        out.push(b);
        if v == 0 {
            break;
        }
    }
}

fn sleb(out: &mut Vec<u8>, mut v: i64) {
    loop {
        let b = (v & 0x7F) as u8;
        v >>= 7;
        let sign = b & 0x40 != 0;
        if (v == 0 && !sign) || (v == -1 && sign) {
            out.push(b);
            break;
        }
        out.push(b | 0x80);
    }
}

const DW_EH_PE_OMIT: u8 = 0xFF;
const DW_EH_PE_ABSPTR: u8 = 0x00;
const DW_EH_PE_UDATA4: u8 = 0x03;

/// A rendered LSDA: its bytes plus the absolute relocations its type
/// table needs.
pub(crate) struct Lsda {
    pub bytes: Vec<u8>,
    pub type_relocs: Vec<(u32, String)>,
}

/// Build a function's LSDA.
///
/// Landing-pad base is omitted (defaults to the function start), call
/// sites use `udata4`, types are absolute pointers. Call-site entries
/// cover the whole function; ranges outside any try region carry no
/// landing pad.
fn build_lsda(func_len: u32, try_blocks: &[TryBlock], table: &[Option<String>]) -> Lsda {
    // Call-site records, sorted by range start, covering gaps.
    let mut regions: Vec<(u32, u32, u32, u64)> = Vec::new(); // start, len, lp, action
    let mut sorted: Vec<&TryBlock> = try_blocks.iter().collect();
    sorted.sort_by_key(|tb| tb.try_start);

    // Action table layout: one chain per try block, records are two bytes
    // (small sleb filter, one-byte link).
    let mut actions: Vec<u8> = Vec::new();
    let mut action_index: Vec<u64> = Vec::new();
    for tb in &sorted {
        action_index.push(actions.len() as u64 + 1);
        for (j, h) in tb.handlers.iter().enumerate() {
            sleb(&mut actions, filter_for(table, h) as i64);
            if j + 1 < tb.handlers.len() {
                // Self-relative link; the next record starts one byte past
                // this field.
                sleb(&mut actions, 1);
            } else {
                sleb(&mut actions, 0);
            }
        }
    }

    let mut cursor = 0u32;
    for (i, tb) in sorted.iter().enumerate() {
        if tb.try_start > cursor {
            regions.push((cursor, tb.try_start - cursor, 0, 0));
        }
        let lp = tb
            .handlers
            .first()
            .map(|h| h.handler_offset)
            .unwrap_or(0);
        regions.push((
            tb.try_start,
            tb.try_end.saturating_sub(tb.try_start),
            lp,
            action_index[i],
        ));
        cursor = tb.try_end.max(cursor);
    }
    if cursor < func_len {
        regions.push((cursor, func_len - cursor, 0, 0));
    }

    let mut call_sites: Vec<u8> = Vec::new();
    for (start, len, lp, action) in &regions {
        call_sites.extend_from_slice(&start.to_le_bytes());
        call_sites.extend_from_slice(&len.to_le_bytes());
        call_sites.extend_from_slice(&lp.to_le_bytes());
        uleb(&mut call_sites, *action);
    }

    // Assemble with the self-referential TType base offset. The offset is
    // measured from just past its own ULEB; try one-byte then grow.
    let mut bytes = Vec::new();
    let mut type_relocs = Vec::new();
    for ttbase_len in 1u32..=5 {
        bytes.clear();
        type_relocs.clear();
        bytes.push(DW_EH_PE_OMIT);
        if table.is_empty() {
            bytes.push(DW_EH_PE_OMIT);
        } else {
            bytes.push(DW_EH_PE_ABSPTR);
        }
        let mut body = Vec::new();
        body.push(DW_EH_PE_UDATA4);
        uleb(&mut body, call_sites.len() as u64);
        body.extend_from_slice(&call_sites);
        body.extend_from_slice(&actions);

        if table.is_empty() {
            bytes.extend_from_slice(&body);
            break;
        }

        // Type table: 8-aligned, entries in order, base at the end.
        let header_len = bytes.len() as u32 + ttbase_len;
        let mut pad = 0u32;
        while (header_len + body.len() as u32 + pad) % 8 != 0 {
            pad += 1;
        }
        let ttbase_value = body.len() as u32 + pad + table.len() as u32 * 8;
        let mut ttfield = Vec::new();
        uleb(&mut ttfield, ttbase_value as u64);
        if ttfield.len() as u32 != ttbase_len {
            continue;
        }
        bytes.extend_from_slice(&ttfield);
        bytes.extend_from_slice(&body);
        bytes.extend(std::iter::repeat(0).take(pad as usize));
        for entry in table {
            if let Some(sym) = entry {
                type_relocs.push((bytes.len() as u32, sym.clone()));
            }
            bytes.extend_from_slice(&0u64.to_le_bytes());
        }
        break;
    }

    Lsda { bytes, type_relocs }
}

impl<'a, K: ObjectKind> Lowerer<'a, K> {
    /// ELF function finalization: patch landing-pad filter immediates,
    /// render the LSDA into `.gcc_except_table`, and report its offset
    /// for the FDE.
    pub(crate) fn finish_elf_eh(&mut self, fs: &FuncState) -> CodegenResult<Option<u32>> {
        if fs.try_blocks.is_empty() {
            return Ok(None);
        }
        let table = build_type_table(&fs.try_blocks);
        for p in &fs.filter_patches {
            let h = &fs.try_blocks[p.try_index].handlers[p.handler_index];
            let filter = filter_for(&table, h);
            self.buf.patch4(p.patch_offset, filter as u32);
        }
        let func_len = self.buf.data().len() as u32 - fs.start;
        let lsda = build_lsda(func_len, &fs.try_blocks, &table);
        let base = self
            .module
            .append_data(SectionRef::GccExceptTable, &lsda.bytes, 8);
        for (off, sym) in &lsda.type_relocs {
            self.module
                .add_reloc(SectionRef::GccExceptTable, base + off, RelocKind::Abs8, sym, 0)?;
        }
        Ok(Some(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(class: Option<&str>, catch_all: bool) -> CatchHandler {
        CatchHandler {
            class_name: class.map(|s| s.to_string()),
            builtin: if class.is_none() && !catch_all {
                Some(IrType::Int)
            } else {
                None
            },
            is_catch_all: catch_all,
            handler_offset: 0x40,
            catch_obj_offset: -24,
        }
    }

    fn try_block(handlers: Vec<CatchHandler>) -> TryBlock {
        TryBlock {
            try_start: 0x10,
            try_end: 0x30,
            catch_end: 0x60,
            handlers,
            state: 0,
            catch_state: 1,
            parent_state: -1,
        }
    }

    #[test]
    fn filters_count_down_from_table_length() {
        let blocks = vec![try_block(vec![
            handler(Some("B"), false),
            handler(None, false),
            handler(None, true),
        ])];
        let table = build_type_table(&blocks);
        assert_eq!(table.len(), 3);
        assert_eq!(table[2], None);
        assert_eq!(filter_for(&table, &blocks[0].handlers[0]), 3);
        assert_eq!(filter_for(&table, &blocks[0].handlers[1]), 2);
        assert_eq!(filter_for(&table, &blocks[0].handlers[2]), 1);
    }

    #[test]
    fn duplicate_types_share_one_entry() {
        let blocks = vec![
            try_block(vec![handler(None, false)]),
            try_block(vec![handler(None, false)]),
        ];
        let table = build_type_table(&blocks);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn lsda_covers_whole_function() {
        let blocks = vec![try_block(vec![handler(None, false)])];
        let table = build_type_table(&blocks);
        let lsda = build_lsda(0x100, &blocks, &table);
        // Header: LP base omitted, types absolute.
        assert_eq!(lsda.bytes[0], 0xFF);
        assert_eq!(lsda.bytes[1], 0x00);
        // One absolute relocation for _ZTIi, eight-byte aligned.
        assert_eq!(lsda.type_relocs.len(), 1);
        assert_eq!(lsda.type_relocs[0].1, "_ZTIi");
        assert_eq!(lsda.type_relocs[0].0 % 8, 0);
        // The call-site table mentions the try range and the landing pad.
        let cs_enc = lsda.bytes[3];
        assert_eq!(cs_enc, 0x03);
    }

    #[test]
    fn builtin_typeinfo_spellings() {
        assert_eq!(builtin_typeinfo(IrType::Int), "_ZTIi");
        assert_eq!(builtin_typeinfo(IrType::Double), "_ZTId");
        assert_eq!(builtin_typeinfo(IrType::UnsignedLong), "_ZTIm");
    }
}
