//! Vtables and runtime type information.
//!
//! COFF carries the full MSVC chain (`??_R0` type descriptor, `??_R1`
//! base descriptors, `??_R2` base array, `??_R3` hierarchy, `??_R4`
//! complete object locator) with the vtable symbol pointing just past the
//! locator slot. ELF carries Itanium `_ZTS`/`_ZTI` pairs and a vtable
//! whose first two slots are the offset-to-top and the typeinfo pointer.

use crate::lower::Lowerer;
use crate::result::CodegenResult;
use kiln_ir::StructLayout;
use kiln_object::{BinFormat, ObjectKind, RelocKind, SectionRef, SymbolScope};

const ITANIUM_CLASS_TI_VTABLE: &str = "_ZTVN10__cxxabiv117__class_type_infoE";
const ITANIUM_SI_CLASS_TI_VTABLE: &str = "_ZTVN10__cxxabiv120__si_class_type_infoE";
const ITANIUM_VMI_CLASS_TI_VTABLE: &str = "_ZTVN10__cxxabiv121__vmi_class_type_infoE";

impl<'a, K: ObjectKind> Lowerer<'a, K> {
    /// Emit every scheduled vtable with its RTTI records.
    pub(crate) fn emit_vtables(&mut self) -> CodegenResult<()> {
        let pending: Vec<String> = self.vtables.iter().map(|v| v.class_name.clone()).collect();
        for class in pending {
            let Some(name_id) = self.ctx.interner.lookup(&class) else {
                continue;
            };
            let Some(layout) = self.ctx.types.by_name(name_id) else {
                continue;
            };
            let layout = layout.clone();
            match K::FORMAT {
                BinFormat::Coff => self.emit_msvc_vtable(&class, &layout)?,
                BinFormat::Elf => self.emit_itanium_vtable(&class, &layout)?,
            }
        }
        Ok(())
    }

    fn rdata_bytes(&mut self, bytes: &[u8], align: u64) -> u32 {
        self.module.append_data(SectionRef::RData, bytes, align)
    }

    fn rdata_symbol(&mut self, name: &str, offset: u32, size: u32) {
        self.module
            .define_data_symbol(name, SectionRef::RData, offset, size, SymbolScope::Export);
    }

    fn rdata_abs8(&mut self, offset: u32, target: &str) -> CodegenResult<()> {
        self.module
            .add_reloc(SectionRef::RData, offset, RelocKind::Abs8, target, 0)?;
        Ok(())
    }

    fn emit_msvc_vtable(&mut self, class: &str, layout: &StructLayout) -> CodegenResult<()> {
        let mangled_class = format!(".?AV{class}@@");

        // ??_R0: vtable pointer slot, spare pointer, mangled name.
        let td_symbol = format!("??_R0{mangled_class}");
        let mut td = vec![0u8; 16];
        td.extend_from_slice(mangled_class.as_bytes());
        td.push(0);
        let td_off = self.rdata_bytes(&td, 8);
        self.rdata_symbol(&td_symbol, td_off, td.len() as u32);
        self.rdata_abs8(td_off, "??_7type_info@@6B@")?;

        // ??_R1: one self descriptor plus one per base.
        let mut bcd_symbols = Vec::new();
        {
            let self_bcd = format!("??_R1{mangled_class}8");
            let mut data = Vec::new();
            data.extend_from_slice(&[0u8; 8]); // type descriptor (reloc)
            data.extend_from_slice(&(layout.base_classes.len() as u32).to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes()); // mdisp
            data.extend_from_slice(&(-1i32).to_le_bytes()); // pdisp
            data.extend_from_slice(&0u32.to_le_bytes()); // vdisp
            data.extend_from_slice(&0u32.to_le_bytes()); // attributes
            let off = self.rdata_bytes(&data, 8);
            self.rdata_symbol(&self_bcd, off, data.len() as u32);
            self.rdata_abs8(off, &td_symbol)?;
            bcd_symbols.push(self_bcd);
        }
        for base in &layout.base_classes {
            let base_name = self.ctx.str(base.name).to_string();
            let base_mangled = format!(".?AV{base_name}@@");
            let bcd_symbol = format!("??_R1{mangled_class}0{base_mangled}");
            let mut data = Vec::new();
            data.extend_from_slice(&[0u8; 8]);
            data.extend_from_slice(&base.num_contained_bases.to_le_bytes());
            data.extend_from_slice(&base.offset.to_le_bytes());
            let pdisp: i32 = if base.is_virtual { 0 } else { -1 };
            data.extend_from_slice(&pdisp.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            let attributes: u32 = u32::from(base.is_virtual);
            data.extend_from_slice(&attributes.to_le_bytes());
            let off = self.rdata_bytes(&data, 8);
            self.rdata_symbol(&bcd_symbol, off, data.len() as u32);
            self.rdata_abs8(off, &format!("??_R0{base_mangled}"))?;
            bcd_symbols.push(bcd_symbol);
        }

        // ??_R2: pointers to every base class descriptor.
        let bca_symbol = format!("??_R2{mangled_class}8");
        let bca = vec![0u8; bcd_symbols.len() * 8];
        let bca_off = self.rdata_bytes(&bca, 8);
        self.rdata_symbol(&bca_symbol, bca_off, bca.len() as u32);
        for (i, sym) in bcd_symbols.iter().enumerate() {
            self.rdata_abs8(bca_off + i as u32 * 8, sym)?;
        }

        // ??_R3: hierarchy descriptor.
        let chd_symbol = format!("??_R3{mangled_class}8");
        let mut chd = Vec::new();
        chd.extend_from_slice(&0u32.to_le_bytes()); // signature
        chd.extend_from_slice(&0u32.to_le_bytes()); // attributes
        chd.extend_from_slice(&(bcd_symbols.len() as u32).to_le_bytes());
        chd.extend_from_slice(&[0u8; 8]); // base class array (reloc)
        let chd_off = self.rdata_bytes(&chd, 8);
        self.rdata_symbol(&chd_symbol, chd_off, chd.len() as u32);
        self.rdata_abs8(chd_off + 12, &bca_symbol)?;

        // ??_R4: complete object locator.
        let col_symbol = format!("??_R4{mangled_class}6B@");
        let mut col = Vec::new();
        col.extend_from_slice(&1u32.to_le_bytes()); // 64-bit signature
        col.extend_from_slice(&0u32.to_le_bytes()); // offset
        col.extend_from_slice(&0u32.to_le_bytes()); // cdOffset
        col.extend_from_slice(&[0u8; 16]); // type descriptor + hierarchy
        let col_off = self.rdata_bytes(&col, 8);
        self.rdata_symbol(&col_symbol, col_off, col.len() as u32);
        self.rdata_abs8(col_off + 12, &td_symbol)?;
        self.rdata_abs8(col_off + 20, &chd_symbol)?;

        // Vtable: [COL | vfn0 | vfn1 | …]; the public symbol lands past
        // the locator slot.
        let vtable = vec![0u8; (1 + layout.vtable.len()) * 8];
        let vt_off = self.rdata_bytes(&vtable, 8);
        self.rdata_abs8(vt_off, &col_symbol)?;
        let vt_symbol = K::vtable_symbol(class);
        self.module.define_data_symbol(
            &vt_symbol,
            SectionRef::RData,
            vt_off + 8,
            layout.vtable.len() as u32 * 8,
            SymbolScope::Export,
        );
        for (i, slot) in layout.vtable.iter().enumerate() {
            let target = if slot.is_pure {
                K::pure_virtual_symbol().to_string()
            } else {
                self.ctx.str(slot.mangled).to_string()
            };
            if target.is_empty() {
                continue;
            }
            self.rdata_abs8(vt_off + 8 + i as u32 * 8, &target)?;
        }
        Ok(())
    }

    fn emit_itanium_vtable(&mut self, class: &str, layout: &StructLayout) -> CodegenResult<()> {
        // _ZTS: the mangled class name, null-terminated.
        let zts = format!("_ZTS{}{}", class.len(), class);
        let mut name_bytes = format!("{}{}", class.len(), class).into_bytes();
        name_bytes.push(0);
        let zts_off = self.rdata_bytes(&name_bytes, 1);
        self.rdata_symbol(&zts, zts_off, name_bytes.len() as u32);

        // _ZTI: the type_info object. A single non-virtual base uses the
        // __si_class_type_info layout with the base's _ZTI appended;
        // multiple bases take the __vmi layout.
        let zti = format!("_ZTI{}{}", class.len(), class);
        let n_bases = layout.base_classes.len();
        let single_base = n_bases == 1 && !layout.base_classes[0].is_virtual;
        let ti_vtable = match n_bases {
            0 => ITANIUM_CLASS_TI_VTABLE,
            _ if single_base => ITANIUM_SI_CLASS_TI_VTABLE,
            _ => ITANIUM_VMI_CLASS_TI_VTABLE,
        };
        let mut ti = if n_bases == 0 {
            vec![0u8; 16]
        } else if single_base {
            // __si_class_type_info: the base's _ZTI follows the header.
            vec![0u8; 24]
        } else {
            // __vmi_class_type_info: flags, base count, then one
            // (base _ZTI, offset_flags) pair per base.
            let mut ti = vec![0u8; 24 + n_bases * 16];
            ti[20..24].copy_from_slice(&(n_bases as u32).to_le_bytes());
            for (i, base) in layout.base_classes.iter().enumerate() {
                let offset_flags = (u64::from(base.offset) << 8) | 0x2;
                let at = 32 + i * 16;
                ti[at..at + 8].copy_from_slice(&offset_flags.to_le_bytes());
            }
            ti
        };
        if !single_base && n_bases > 1 {
            ti[16..20].copy_from_slice(&0u32.to_le_bytes());
        }
        let ti_len = ti.len();
        let ti_off = self.rdata_bytes(&ti, 8);
        self.rdata_symbol(&zti, ti_off, ti_len as u32);
        // vptr of the typeinfo object: the abi class's vtable, 16 bytes
        // past the two header slots.
        self.module
            .add_reloc(SectionRef::RData, ti_off, RelocKind::Abs8, ti_vtable, 16)?;
        self.rdata_abs8(ti_off + 8, &zts)?;
        if single_base {
            let base = self.ctx.str(layout.base_classes[0].name).to_string();
            self.rdata_abs8(ti_off + 16, &format!("_ZTI{}{}", base.len(), base))?;
        } else {
            for i in 0..n_bases {
                let base = self.ctx.str(layout.base_classes[i].name).to_string();
                self.rdata_abs8(ti_off + 24 + i as u32 * 16, &format!("_ZTI{}{}", base.len(), base))?;
            }
        }

        // Vtable: [offset-to-top | typeinfo | vfn…]; the symbol covers the
        // whole object, objects point 16 bytes in.
        let vtable = vec![0u8; (2 + layout.vtable.len()) * 8];
        let vt_off = self.rdata_bytes(&vtable, 8);
        let vt_symbol = K::vtable_symbol(class);
        self.rdata_symbol(&vt_symbol, vt_off, vtable.len() as u32);
        self.rdata_abs8(vt_off + 8, &zti)?;
        for (i, slot) in layout.vtable.iter().enumerate() {
            let target = if slot.is_pure {
                K::pure_virtual_symbol().to_string()
            } else {
                self.ctx.str(slot.mangled).to_string()
            };
            if target.is_empty() {
                continue;
            }
            self.rdata_abs8(vt_off + 16 + i as u32 * 8, &target)?;
        }
        Ok(())
    }

    /// Synthesize the MSVC `_ThrowInfo` chain for `throw <int>`:
    /// `_TI1H → _CTA1H → _CT??_R0H@84 → ??_R0H@8`, mirroring what MSVC
    /// places in its objects.
    pub(crate) fn ensure_int_throwinfo(&mut self) -> CodegenResult<String> {
        let ti_symbol = "_TI1H".to_string();
        if self.module.has_symbol(&ti_symbol) {
            return Ok(ti_symbol);
        }

        // ??_R0H@8: the type descriptor for int.
        if !self.module.has_symbol("??_R0H@8") {
            let mut td = vec![0u8; 16];
            td.extend_from_slice(b".H\0");
            let off = self.rdata_bytes(&td, 8);
            self.rdata_symbol("??_R0H@8", off, td.len() as u32);
            self.rdata_abs8(off, "??_7type_info@@6B@")?;
        }

        // _CT??_R0H@84: catchable type, 0x24 bytes.
        if !self.module.has_symbol("_CT??_R0H@84") {
            let mut ct = vec![0u8; 0x24];
            ct[0] = 0x01; // simple by-value scalar
            ct[0x0C..0x10].copy_from_slice(&(-1i32).to_le_bytes()); // pdisp
            ct[0x14] = 0x04; // sizeof(int)
            let off = self.rdata_bytes(&ct, 4);
            self.rdata_symbol("_CT??_R0H@84", off, ct.len() as u32);
            self.module.add_reloc(
                SectionRef::RData,
                off + 0x04,
                RelocKind::ImageRel4,
                "??_R0H@8",
                0,
            )?;
        }

        // _CTA1H: one-entry catchable type array.
        if !self.module.has_symbol("_CTA1H") {
            let mut cta = vec![0u8; 0x0C];
            cta[0] = 0x01;
            let off = self.rdata_bytes(&cta, 4);
            self.rdata_symbol("_CTA1H", off, cta.len() as u32);
            self.module.add_reloc(
                SectionRef::RData,
                off + 0x04,
                RelocKind::ImageRel4,
                "_CT??_R0H@84",
                0,
            )?;
        }

        let ti = vec![0u8; 0x1C];
        let off = self.rdata_bytes(&ti, 4);
        self.rdata_symbol(&ti_symbol, off, ti.len() as u32);
        self.module.add_reloc(
            SectionRef::RData,
            off + 0x0C,
            RelocKind::ImageRel4,
            "_CTA1H",
            0,
        )?;
        Ok(ti_symbol)
    }
}
