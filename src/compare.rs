//! The Comparator: classifies every correlated element as SAME or CHANGED,
//! and the ignore-directive / constant-label status overrides that run
//! alongside it.
//!
//! Order matters and mirrors the original pipeline: `.xsplice.ignore.sections`
//! is processed *before* comparison (it needs to mark a string section
//! `include` ahead of the "changed section not shipped" check much later),
//! while the ignore-functions and constant-label passes run after, forcing
//! already-computed statuses back to SAME.

use crate::elf::constants::{SHN_ABS, SHN_UNDEF, SHT_NOBITS, STT_FUNC, STT_OBJECT};
use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::model::{Object, Relocation, SectionId, Status, SymbolId};
use crate::names::{is_constant_label, is_special_static, mangled_eq};
use crate::{bug, diff_fatal};

/// Runs the full comparison stage: section/symbol classification, then the
/// ignore-directive and constant-label overrides.
pub fn compare(base: &mut Object, patched: &mut Object, logger: &Logger) -> Result<()> {
    mark_ignored_sections(patched, base, logger)?;

    compare_sections(patched, base)?;
    compare_symbols(patched, base)?;

    mark_ignored_functions_same(patched, logger)?;
    mark_ignored_sections_same(patched);
    mark_constant_labels_same(patched);

    Ok(())
}

fn read_c_str(data: &[u8], offset: usize) -> Option<String> {
    let slice = data.get(offset..)?;
    let end = slice.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&data[offset..offset + end]).ok().map(str::to_string)
}

/// `.xsplice.ignore.sections` carries one relocation per ignored section,
/// targeting a string literal naming it. The string's own section is forced
/// `include` since the macro invocation itself edits that section's bytes,
/// which would otherwise look like an unexplained change.
fn mark_ignored_sections(patched: &mut Object, base: &mut Object, logger: &Logger) -> Result<()> {
    let sec_id = match patched.find_section_by_name(".xsplice.ignore.sections") {
        Some(id) => id,
        None => return Ok(()),
    };
    let rela_id = patched
        .section(sec_id)
        .rela
        .ok_or_else(|| Error::Internal("missing .rela.xsplice.ignore.sections section".into()))?;
    let relas = patched.section(rela_id).relocations.clone();

    for rela in relas {
        let strsec = patched
            .symbol(rela.symbol)
            .section
            .ok_or_else(|| Error::Internal("expected bundled symbol".into()))?;
        patched.section_mut(strsec).status = Status::Changed;
        patched.section_mut(strsec).include = true;

        let data = patched.section(strsec).data.clone().unwrap_or_default();
        let name = read_c_str(&data, rela.addend as usize)
            .ok_or_else(|| Error::Internal("XSPLICE_IGNORE_SECTION: malformed string".into()))?;

        let mut ignoresec = patched
            .find_section_by_name(&name)
            .ok_or_else(|| Error::Internal(format!("XSPLICE_IGNORE_SECTION: can't find {}", name)))?;
        logger.normal(format_args!("ignoring section: {}", name));

        if patched.section(ignoresec).is_relocation() {
            ignoresec = patched
                .section(ignoresec)
                .base
                .ok_or_else(|| Error::Internal("relocation section missing base".into()))?;
        }
        patched.section_mut(ignoresec).ignore = true;
        if let Some(twin) = patched.section(ignoresec).twin {
            base.section_mut(twin).ignore = true;
        }
    }
    Ok(())
}

fn rela_equal(patched: &Object, base: &Object, r1: &Relocation, r2: &Relocation) -> bool {
    if r1.r_type != r2.r_type || r1.offset != r2.offset {
        return false;
    }
    if let Some(s1) = &r1.string {
        return r2.string.as_deref() == Some(s1.as_str());
    }
    if r1.addend != r2.addend {
        return false;
    }

    let sym1 = patched.symbol(r1.symbol);
    let sym2 = base.symbol(r2.symbol);

    if is_constant_label(&sym1.name, sym1.bind()) && is_constant_label(&sym2.name, sym2.bind()) {
        return true;
    }
    if is_special_static(patched, r1.symbol) {
        return mangled_eq(&sym1.name, &sym2.name);
    }
    sym1.name == sym2.name
}

fn compare_correlated_rela_section(patched: &Object, base: &Object, sec_id: SectionId, twin_id: SectionId) -> Status {
    let relas1 = &patched.section(sec_id).relocations;
    let relas2 = &base.section(twin_id).relocations;
    for (r1, r2) in relas1.iter().zip(relas2.iter()) {
        if !rela_equal(patched, base, r1, r2) {
            return Status::Changed;
        }
    }
    Status::Same
}

fn compare_correlated_section(patched: &mut Object, base: &Object, sec_id: SectionId) -> Result<()> {
    let twin_id = patched.section(sec_id).twin.expect("correlated section has a twin");

    let (name, sh_type, sh_flags, sh_addr, sh_addralign, sh_entsize, sh_size) = {
        let s = patched.section(sec_id);
        (s.name.clone(), s.sh_type, s.sh_flags, s.sh_addr, s.sh_addralign, s.sh_entsize, s.sh_size)
    };
    let twin = base.section(twin_id);
    if sh_type != twin.sh_type || sh_flags != twin.sh_flags || sh_addr != twin.sh_addr || sh_addralign != twin.sh_addralign || sh_entsize != twin.sh_entsize {
        diff_fatal!("{} section header details differ", name);
    }

    let status = if sh_size != twin.sh_size || patched.section(sec_id).data_size() != twin.data_size() {
        Status::Changed
    } else if patched.section(sec_id).is_relocation() {
        compare_correlated_rela_section(patched, base, sec_id, twin_id)
    } else if sh_type == SHT_NOBITS {
        Status::Same
    } else {
        let d1 = patched.section(sec_id).data.as_deref().unwrap_or(&[]);
        let d2 = base.section(twin_id).data.as_deref().unwrap_or(&[]);
        if d1 == d2 {
            Status::Same
        } else {
            Status::Changed
        }
    };

    patched.section_mut(sec_id).status = status;
    Ok(())
}

fn compare_sections(patched: &mut Object, base: &Object) -> Result<()> {
    let ids: Vec<SectionId> = patched.section_ids().collect();

    for &id in &ids {
        if patched.section(id).twin.is_some() {
            compare_correlated_section(patched, base, id)?;
        } else {
            patched.section_mut(id).status = Status::New;
        }
    }

    // Propagate each section's status onto its bundled symbol, which is
    // reached through the base section for a relocation section.
    for id in ids {
        let status = patched.section(id).status;
        let bundled = if patched.section(id).is_relocation() {
            patched.section(id).base.and_then(|b| patched.section(b).bundled)
        } else {
            patched.section(id).bundled
        };
        if let Some(sym) = bundled {
            if patched.symbol(sym).status != Status::Changed {
                patched.symbol_mut(sym).status = status;
            }
        }
    }
    Ok(())
}

fn compare_correlated_symbol(patched: &mut Object, base: &Object, id: SymbolId, twin: SymbolId) -> Result<()> {
    let (name, st_info, st_other, section, st_shndx, sym_type, st_size) = {
        let s = patched.symbol(id);
        (s.name.clone(), s.st_info, s.st_other, s.section, s.st_shndx, s.sym_type(), s.st_size)
    };
    let base_sym = base.symbol(twin);

    if st_info != base_sym.st_info || st_other != base_sym.st_other || section.is_some() != base_sym.section.is_some() {
        diff_fatal!("symbol info mismatch: {}", name);
    }

    if let (Some(sec1), Some(sec2)) = (section, base_sym.section) {
        if patched.section(sec1).twin != Some(sec2) {
            let allowed = match base.section(sec2).twin {
                Some(ptwin) => patched.section(ptwin).ignore,
                None => false,
            };
            if allowed {
                patched.symbol_mut(id).status = Status::Changed;
            } else {
                diff_fatal!("symbol changed sections: {}", name);
            }
        }
    }

    if sym_type == STT_OBJECT && st_size != base_sym.st_size {
        diff_fatal!("object size mismatch: {}", name);
    }

    if st_shndx == SHN_UNDEF || st_shndx == SHN_ABS {
        patched.symbol_mut(id).status = Status::Same;
    }

    Ok(())
}

fn compare_symbols(patched: &mut Object, base: &Object) -> Result<()> {
    let ids: Vec<SymbolId> = patched.symbol_ids().collect();
    for id in ids {
        match patched.symbol(id).twin {
            Some(twin) => compare_correlated_symbol(patched, base, id, twin)?,
            None => patched.symbol_mut(id).status = Status::New,
        }
    }
    Ok(())
}

/// `.xsplice.ignore.functions` carries one relocation per ignored function;
/// forcing it SAME regardless of what the Comparator found.
fn mark_ignored_functions_same(patched: &mut Object, logger: &Logger) -> Result<()> {
    let sec_id = match patched.find_section_by_name(".xsplice.ignore.functions") {
        Some(id) => id,
        None => return Ok(()),
    };
    let rela_id = patched
        .section(sec_id)
        .rela
        .ok_or_else(|| Error::Internal("missing .rela.xsplice.ignore.functions section".into()))?;
    let relas = patched.section(rela_id).relocations.clone();

    for rela in relas {
        let sym = rela.symbol;
        let sec = patched.symbol(sym).section.ok_or_else(|| Error::Internal("expected bundled symbol".into()))?;
        if patched.symbol(sym).sym_type() != STT_FUNC {
            bug!("expected function symbol");
        }

        let name = patched.symbol(sym).name.clone();
        logger.normal(format_args!("ignoring function: {}", name));
        if patched.symbol(sym).status != Status::Changed {
            logger.normal(format_args!("NOTICE: no change detected in function {}, unnecessary ignore directive?", name));
        }

        patched.symbol_mut(sym).status = Status::Same;
        patched.section_mut(sec).status = Status::Same;
        if let Some(secsym) = patched.section(sec).secsym {
            patched.symbol_mut(secsym).status = Status::Same;
        }
        if let Some(rela_sec) = patched.section(sec).rela {
            patched.section_mut(rela_sec).status = Status::Same;
        }
    }
    Ok(())
}

fn mark_ignored_sections_same(patched: &mut Object) {
    let ignored: Vec<SectionId> = patched.section_ids().filter(|&id| patched.section(id).ignore).collect();

    for id in ignored {
        patched.section_mut(id).status = Status::Same;
        if let Some(secsym) = patched.section(id).secsym {
            patched.symbol_mut(secsym).status = Status::Same;
        }
        if let Some(rela) = patched.section(id).rela {
            patched.section_mut(rela).status = Status::Same;
        }

        let owned: Vec<SymbolId> = patched.symbol_ids().filter(|&sid| patched.symbol(sid).section == Some(id)).collect();
        for sid in owned {
            patched.symbol_mut(sid).status = Status::Same;
        }
    }
}

fn mark_constant_labels_same(patched: &mut Object) {
    let ids: Vec<SymbolId> = patched
        .symbol_ids()
        .filter(|&id| {
            let sym = patched.symbol(id);
            is_constant_label(&sym.name, sym.bind())
        })
        .collect();
    for id in ids {
        patched.symbol_mut(id).status = Status::Same;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::constants::*;
    use crate::model::{Section, Symbol};

    fn blank_section(name: &str, sh_type: u32) -> Section {
        Section {
            name: name.to_string(),
            sh_type,
            sh_flags: 0,
            sh_addr: 0,
            sh_size: 4,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
            data: Some(vec![0u8; 4]),
            base: None,
            rela: None,
            secsym: None,
            bundled: None,
            relocations: Vec::new(),
            grouped: false,
            ignore: false,
            include: false,
            twin: None,
            status: Status::Unknown,
            index: 0,
        }
    }

    fn blank_symbol(name: &str, bind: u8, typ: u8) -> Symbol {
        Symbol {
            name: name.to_string(),
            st_info: st_info(bind, typ),
            st_other: 0,
            st_shndx: 0,
            st_value: 0,
            st_size: 0,
            section: None,
            twin: None,
            status: Status::Unknown,
            include: false,
            strip: false,
            index: 0,
        }
    }

    #[test]
    fn identical_sections_compare_same() {
        let mut base = Object::new();
        let mut patched = Object::new();
        let b = base.push_section(blank_section(".text.foo", SHT_PROGBITS));
        let p = patched.push_section(blank_section(".text.foo", SHT_PROGBITS));
        patched.section_mut(p).twin = Some(b);
        base.section_mut(b).twin = Some(p);
        compare_sections(&mut patched, &base).unwrap();
        assert_eq!(patched.section(p).status, Status::Same);
    }

    #[test]
    fn differing_data_marks_changed() {
        let mut base = Object::new();
        let mut patched = Object::new();
        let b = base.push_section(blank_section(".text.foo", SHT_PROGBITS));
        let p = patched.push_section(blank_section(".text.foo", SHT_PROGBITS));
        patched.section_mut(p).data = Some(vec![1, 2, 3, 4]);
        patched.section_mut(p).twin = Some(b);
        compare_sections(&mut patched, &base).unwrap();
        assert_eq!(patched.section(p).status, Status::Changed);
    }

    #[test]
    fn uncorrelated_section_is_new() {
        let mut patched = Object::new();
        let base = Object::new();
        let p = patched.push_section(blank_section(".text.foo", SHT_PROGBITS));
        compare_sections(&mut patched, &base).unwrap();
        assert_eq!(patched.section(p).status, Status::New);
    }

    #[test]
    fn constant_labels_forced_same() {
        let mut patched = Object::new();
        let id = patched.push_symbol(blank_symbol(".LC4", STB_LOCAL, STT_OBJECT));
        patched.symbol_mut(id).status = Status::New;
        mark_constant_labels_same(&mut patched);
        assert_eq!(patched.symbol(id).status, Status::Same);
    }
}
