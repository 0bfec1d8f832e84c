//! The Output assembler: migrates every included element into a fresh
//! Object, synthesizes the patch-metadata sections, and reindexes
//! everything into the order the object-file format requires. The final
//! `.shstrtab`/`.strtab`/`.symtab` byte payloads are left for the writer,
//! which is the only stage that needs to know the on-disk symbol/section
//! table layout.

use std::collections::HashMap;

use scroll::Pwrite;

use crate::diff_fatal;
use crate::elf::constants::*;
use crate::elf::wire::{
    PatchFunc, PATCH_FUNC_NAME_OFFSET, PATCH_FUNC_NEW_ADDR_OFFSET, PATCH_FUNC_PAD, PATCH_INSN_SIZE, SIZEOF_PATCH_FUNC, SIZEOF_RELA,
};
use crate::error::{Error, Result};
use crate::log_debug;
use crate::logger::Logger;
use crate::lookup::SymbolLookup;
use crate::model::{Object, Relocation, Section, SectionId, Status, Symbol, SymbolId};

/// Runs the full assembly sequence and returns the finished output Object,
/// ready for the writer.
pub fn assemble(patched: &mut Object, lookup: &dyn SymbolLookup, resolve: bool, logger: &Logger) -> Result<Object> {
    let mut out = migrate_included_elements(patched)?;

    let hint = find_hint(&out)?;
    log_debug!(logger, "hint = {}", hint);

    create_strings_section(&mut out);
    create_patches_section(&mut out, lookup, &hint, resolve, logger)?;
    build_strings_section_data(&mut out)?;

    rename_local_symbols(&mut out, &hint, logger);
    reorder_symbols(&mut out);
    reindex_elements(&mut out);
    link_rela_sections(&mut out)?;

    Ok(out)
}

/// Moves every `include`d section and symbol out of `patched` into a fresh
/// Object, remapping cross-links to the new arena indices and dropping any
/// link that pointed at something left behind. A symbol whose section was
/// left behind keeps `include` but loses its section, becoming an
/// externally-resolved (UNDEF) reference in the output, the correct
/// outcome for an unchanged function referenced by a changed one.
fn migrate_included_elements(patched: &mut Object) -> Result<Object> {
    let mut out = Object::new();

    let mut section_map: HashMap<usize, SectionId> = HashMap::new();
    for (old_idx, sec) in std::mem::take(&mut patched.sections).into_iter().enumerate() {
        if sec.include {
            section_map.insert(old_idx, out.push_section(sec));
        }
    }

    let mut symbol_map: HashMap<usize, SymbolId> = HashMap::new();
    for (old_idx, sym) in std::mem::take(&mut patched.symbols).into_iter().enumerate() {
        if sym.include {
            symbol_map.insert(old_idx, out.push_symbol(sym));
        }
    }

    let section_ids: Vec<SectionId> = out.section_ids().collect();
    for id in section_ids {
        let base = out.section(id).base.and_then(|b| section_map.get(&b.0).copied());
        let rela = out.section(id).rela.and_then(|r| section_map.get(&r.0).copied());
        let secsym = out.section(id).secsym.and_then(|s| symbol_map.get(&s.0).copied());
        let bundled = out.section(id).bundled.and_then(|s| symbol_map.get(&s.0).copied());

        let relocations: Result<Vec<Relocation>> = out
            .section(id)
            .relocations
            .iter()
            .map(|r| {
                let symbol = symbol_map
                    .get(&r.symbol.0)
                    .copied()
                    .ok_or_else(|| Error::Internal("relocation targets a non-included symbol".into()))?;
                Ok(Relocation { symbol, ..r.clone() })
            })
            .collect();

        let sec = out.section_mut(id);
        sec.base = base;
        sec.rela = rela;
        sec.secsym = secsym;
        sec.bundled = bundled;
        sec.twin = None;
        sec.index = 0;
        sec.relocations = relocations?;
    }

    let symbol_ids: Vec<SymbolId> = out.symbol_ids().collect();
    for id in symbol_ids {
        let section = out.symbol(id).section.and_then(|s| section_map.get(&s.0).copied());
        let sym = out.symbol_mut(id);
        sym.section = section;
        sym.twin = None;
        sym.index = 0;
        sym.strip = false;
    }

    Ok(out)
}

fn find_hint(out: &Object) -> Result<String> {
    out.symbols
        .iter()
        .find(|s| s.is_file())
        .map(|s| s.name.clone())
        .ok_or_else(|| Error::Internal("FILE symbol not found in output. Stripped?".into()))
}

fn create_strings_section(out: &mut Object) {
    let sec_id = out.push_section(Section {
        name: ".xsplice.strings".to_string(),
        sh_type: SHT_PROGBITS,
        sh_flags: SHF_ALLOC,
        sh_addr: 0,
        sh_size: 0,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 1,
        sh_entsize: 1,
        data: Some(Vec::new()),
        base: None,
        rela: None,
        secsym: None,
        bundled: None,
        relocations: Vec::new(),
        grouped: false,
        ignore: false,
        include: true,
        twin: None,
        status: Status::New,
        index: 0,
    });

    let sym_id = out.push_symbol(Symbol {
        name: ".xsplice.strings".to_string(),
        st_info: st_info(STB_LOCAL, STT_SECTION),
        st_other: 0,
        st_shndx: 0,
        st_value: 0,
        st_size: 0,
        section: Some(sec_id),
        twin: None,
        status: Status::New,
        include: true,
        strip: false,
        index: 0,
    });

    out.section_mut(sec_id).secsym = Some(sym_id);
}

/// Interns `name` into the string pool, returning its byte offset; a name
/// already present is reused rather than duplicated.
fn intern_string(strings: &mut Vec<String>, name: &str) -> u32 {
    let mut offset = 0u32;
    for s in strings.iter() {
        if s == name {
            return offset;
        }
        offset += s.len() as u32 + 1;
    }
    strings.push(name.to_string());
    offset
}

fn mangle_local_symbol(hint: &str, name: &str) -> String {
    format!("{}#{}", hint, name)
}

fn push_section_pair(out: &mut Object, name: &str) -> (SectionId, SectionId) {
    let base_id = out.push_section(Section {
        name: name.to_string(),
        sh_type: SHT_PROGBITS,
        sh_flags: SHF_ALLOC,
        sh_addr: 0,
        sh_size: 0,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 8,
        sh_entsize: 0,
        data: Some(Vec::new()),
        base: None,
        rela: None,
        secsym: None,
        bundled: None,
        relocations: Vec::new(),
        grouped: false,
        ignore: false,
        include: true,
        twin: None,
        status: Status::New,
        index: 0,
    });

    let rela_id = out.push_section(Section {
        name: format!(".rela{}", name),
        sh_type: SHT_RELA,
        sh_flags: 0,
        sh_addr: 0,
        sh_size: 0,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 8,
        sh_entsize: SIZEOF_RELA as u64,
        data: None,
        base: Some(base_id),
        rela: None,
        secsym: None,
        bundled: None,
        relocations: Vec::new(),
        grouped: false,
        ignore: false,
        include: true,
        twin: None,
        status: Status::New,
        index: 0,
    });

    out.section_mut(base_id).rela = Some(rela_id);
    (base_id, rela_id)
}

/// Builds `.xsplice.funcs`: one fixed-size record per changed function, plus
/// its two relocations, looking up each function's live address/size
/// through `lookup` and refusing any prologue smaller than the minimum
/// patchable size.
fn create_patches_section(out: &mut Object, lookup: &dyn SymbolLookup, hint: &str, resolve: bool, logger: &Logger) -> Result<()> {
    let strings_sym = out
        .find_symbol_by_name(".xsplice.strings")
        .ok_or_else(|| Error::Internal("can't find .xsplice.strings symbol".into()))?;

    let changed: Vec<SymbolId> = out
        .symbol_ids()
        .filter(|&id| {
            let s = out.symbol(id);
            s.sym_type() == STT_FUNC && s.status == Status::Changed
        })
        .collect();

    let (func_sec, rela_sec) = push_section_pair(out, ".xsplice.funcs");
    out.section_mut(func_sec).sh_entsize = SIZEOF_PATCH_FUNC as u64;

    let mut data = Vec::with_capacity(changed.len() * SIZEOF_PATCH_FUNC);
    let mut relocations = Vec::with_capacity(changed.len() * 2);

    for (index, &sym_id) in changed.iter().enumerate() {
        let (name, bind, new_size) = {
            let s = out.symbol(sym_id);
            (s.name.clone(), s.bind(), s.st_size)
        };

        let result = if bind == STB_LOCAL { lookup.local_symbol(&name, hint)? } else { lookup.global_symbol(&name)? };
        log_debug!(logger, "lookup for {} @ 0x{:016x} len {}", name, result.value, result.size);

        if result.size < PATCH_INSN_SIZE {
            diff_fatal!("{} too small to patch", name);
        }

        let funcname = if bind == STB_LOCAL { mangle_local_symbol(hint, &name) } else { name.clone() };
        let name_offset = intern_string(&mut out.strings, &funcname);

        let record = PatchFunc {
            old_addr: if resolve { result.value } else { 0 },
            old_size: result.size,
            new_addr: 0,
            new_size,
            name: 0,
            pad: [0u8; PATCH_FUNC_PAD],
        };

        let offset = index * SIZEOF_PATCH_FUNC;
        data.resize(offset + SIZEOF_PATCH_FUNC, 0);
        data.pwrite_with(record, offset, scroll::Endian::Little)?;

        relocations.push(Relocation {
            r_type: R_X86_64_64,
            offset: offset as u64 + PATCH_FUNC_NEW_ADDR_OFFSET,
            symbol: sym_id,
            addend: 0,
            string: None,
        });
        relocations.push(Relocation {
            r_type: R_X86_64_64,
            offset: offset as u64 + PATCH_FUNC_NAME_OFFSET,
            symbol: strings_sym,
            addend: name_offset as i64,
            string: None,
        });
    }

    let size = data.len() as u64;
    out.section_mut(func_sec).data = Some(data);
    out.section_mut(func_sec).sh_size = size;
    out.section_mut(rela_sec).relocations = relocations;

    Ok(())
}

fn build_strings_section_data(out: &mut Object) -> Result<()> {
    let sec_id = out
        .find_section_by_name(".xsplice.strings")
        .ok_or_else(|| Error::Internal("can't find .xsplice.strings".into()))?;

    let mut bytes = Vec::new();
    for s in &out.strings {
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
    }
    let size = bytes.len() as u64;

    let sec = out.section_mut(sec_id);
    sec.data = Some(bytes);
    sec.sh_size = size;
    Ok(())
}

/// Renames every included local FUNC/OBJECT symbol (other than the NULL
/// symbol) to `<hint>#<name>`, the format the loader uses to disambiguate
/// identically-named statics across translation units.
fn rename_local_symbols(out: &mut Object, hint: &str, logger: &Logger) {
    let ids: Vec<SymbolId> = out.symbol_ids().collect();
    for id in ids {
        let (is_null, sym_type, bind) = {
            let s = out.symbol(id);
            (s.is_null(), s.sym_type(), s.bind())
        };
        if is_null || bind != STB_LOCAL || (sym_type != STT_FUNC && sym_type != STT_OBJECT) {
            continue;
        }
        let mangled = mangle_local_symbol(hint, &out.symbol(id).name);
        log_debug!(logger, "local symbol mangled to: {}", mangled);
        out.symbol_mut(id).name = mangled;
    }
}

/// Object-file symbol-table order: NULL, FILE, local FUNCs, remaining
/// locals, then globals.
fn reorder_symbols(out: &mut Object) {
    let symbols = std::mem::take(&mut out.symbols);
    let n = symbols.len();

    let mut null_grp = Vec::new();
    let mut file_grp = Vec::new();
    let mut local_func_grp = Vec::new();
    let mut local_grp = Vec::new();
    let mut global_grp = Vec::new();

    for (old_idx, sym) in symbols.into_iter().enumerate() {
        if sym.is_null() {
            null_grp.push((old_idx, sym));
        } else if sym.is_file() {
            file_grp.push((old_idx, sym));
        } else if sym.is_local_func() {
            local_func_grp.push((old_idx, sym));
        } else if sym.is_local() {
            local_grp.push((old_idx, sym));
        } else {
            global_grp.push((old_idx, sym));
        }
    }

    let mut old_to_new = vec![0usize; n];
    let mut ordered = Vec::with_capacity(n);
    for (old_idx, sym) in null_grp.into_iter().chain(file_grp).chain(local_func_grp).chain(local_grp).chain(global_grp) {
        old_to_new[old_idx] = ordered.len();
        ordered.push(sym);
    }
    out.symbols = ordered;

    let section_ids: Vec<SectionId> = out.section_ids().collect();
    for id in section_ids {
        let secsym = out.section(id).secsym.map(|s| SymbolId(old_to_new[s.0]));
        let bundled = out.section(id).bundled.map(|s| SymbolId(old_to_new[s.0]));
        let sec = out.section_mut(id);
        sec.secsym = secsym;
        sec.bundled = bundled;
        for r in sec.relocations.iter_mut() {
            r.symbol = SymbolId(old_to_new[r.symbol.0]);
        }
    }
}

/// Assigns final 1-based section indices and 0-based symbol indices in list
/// order, then resolves each symbol's `st_shndx` against its (possibly now
/// absent) section.
fn reindex_elements(out: &mut Object) {
    let section_ids: Vec<SectionId> = out.section_ids().collect();
    for (i, id) in section_ids.into_iter().enumerate() {
        out.section_mut(id).index = (i + 1) as u32;
    }

    let symbol_ids: Vec<SymbolId> = out.symbol_ids().collect();
    for (i, id) in symbol_ids.into_iter().enumerate() {
        out.symbol_mut(id).index = i as u32;
        let section = out.symbol(id).section;
        match section {
            Some(sec_id) => {
                let new_idx = out.section(sec_id).index as u16;
                out.symbol_mut(id).st_shndx = new_idx;
            }
            None => {
                if out.symbol(id).st_shndx != SHN_ABS {
                    out.symbol_mut(id).st_shndx = SHN_UNDEF;
                }
            }
        }
    }
}

fn link_rela_sections(out: &mut Object) -> Result<()> {
    let symtab = out.find_section_by_name(".symtab").ok_or_else(|| Error::Internal("missing .symtab section".into()))?;
    let symtab_index = out.section(symtab).index;

    let ids: Vec<SectionId> = out.section_ids().collect();
    for id in ids {
        if !out.section(id).is_relocation() {
            continue;
        }
        let base = out.section(id).base.ok_or_else(|| Error::Internal("rela section missing base".into()))?;
        let base_index = out.section(base).index;
        let sec = out.section_mut(id);
        sec.sh_link = symtab_index;
        sec.sh_info = base_index;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::test_support::FakeLookup;
    use crate::lookup::LookupResult;

    fn blank_section(name: &str, include: bool) -> Section {
        Section {
            name: name.to_string(),
            sh_type: SHT_PROGBITS,
            sh_flags: 0,
            sh_addr: 0,
            sh_size: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
            data: Some(Vec::new()),
            base: None,
            rela: None,
            secsym: None,
            bundled: None,
            relocations: Vec::new(),
            grouped: false,
            ignore: false,
            include,
            twin: None,
            status: Status::Unknown,
            index: 0,
        }
    }

    fn blank_symbol(name: &str, bind: u8, typ: u8, include: bool) -> Symbol {
        Symbol {
            name: name.to_string(),
            st_info: st_info(bind, typ),
            st_other: 0,
            st_shndx: 0,
            st_value: 0,
            st_size: 8,
            section: None,
            twin: None,
            status: Status::Unknown,
            include,
            strip: false,
            index: 0,
        }
    }

    #[test]
    fn migrate_drops_links_to_excluded_sections() {
        let mut obj = Object::new();
        obj.push_symbol(blank_symbol("", STB_LOCAL, STT_NOTYPE, true));
        let kept_sec = obj.push_section(blank_section(".text.foo", true));
        let dropped_sec = obj.push_section(blank_section(".text.bar", false));

        let kept_sym = obj.push_symbol(blank_symbol("foo", STB_GLOBAL, STT_FUNC, true));
        obj.symbol_mut(kept_sym).section = Some(kept_sec);

        let dangling_sym = obj.push_symbol(blank_symbol("bar", STB_GLOBAL, STT_FUNC, true));
        obj.symbol_mut(dangling_sym).section = Some(dropped_sec);

        let out = migrate_included_elements(&mut obj).unwrap();
        assert_eq!(out.sections.len(), 1);
        let migrated_bar = out.symbols.iter().find(|s| s.name == "bar").unwrap();
        assert!(migrated_bar.section.is_none());
    }

    #[test]
    fn full_assembly_produces_patch_record_for_changed_function() {
        let mut obj = Object::new();
        obj.push_symbol(blank_symbol("", STB_LOCAL, STT_NOTYPE, true));

        let file_sym = obj.push_symbol(blank_symbol("foo.c", STB_LOCAL, STT_FILE, true));
        obj.symbol_mut(file_sym).include = true;

        let sec = obj.push_section(blank_section(".text.changed_fn", true));
        let sym = obj.push_symbol(blank_symbol("changed_fn", STB_GLOBAL, STT_FUNC, true));
        obj.symbol_mut(sym).section = Some(sec);
        obj.symbol_mut(sym).status = Status::Changed;

        obj.push_section({
            let mut s = blank_section(".symtab", true);
            s.sh_type = SHT_SYMTAB;
            s
        });

        let lookup = FakeLookup::new().with_global("changed_fn", LookupResult { value: 0xdead, size: 64 });
        let logger = Logger::new(false);

        let out = assemble(&mut obj, &lookup, true, &logger).unwrap();

        let funcs_sec = out.find_section_by_name(".xsplice.funcs").unwrap();
        assert_eq!(out.section(funcs_sec).data.as_ref().unwrap().len(), SIZEOF_PATCH_FUNC);

        let rela_sec = out.section(funcs_sec).rela.unwrap();
        let relocations = &out.section(rela_sec).relocations;
        assert_eq!(relocations.len(), 2);
        assert!(relocations.iter().any(|r| r.offset == PATCH_FUNC_NEW_ADDR_OFFSET));
        assert!(relocations.iter().any(|r| r.offset == PATCH_FUNC_NAME_OFFSET));
    }

    #[test]
    fn too_small_to_patch_is_fatal() {
        let mut obj = Object::new();
        obj.push_symbol(blank_symbol("", STB_LOCAL, STT_NOTYPE, true));
        let file_sym = obj.push_symbol(blank_symbol("foo.c", STB_LOCAL, STT_FILE, true));
        obj.symbol_mut(file_sym).include = true;

        let sec = obj.push_section(blank_section(".text.tiny_fn", true));
        let sym = obj.push_symbol(blank_symbol("tiny_fn", STB_GLOBAL, STT_FUNC, true));
        obj.symbol_mut(sym).section = Some(sec);
        obj.symbol_mut(sym).status = Status::Changed;

        obj.push_section({
            let mut s = blank_section(".symtab", true);
            s.sh_type = SHT_SYMTAB;
            s
        });

        let lookup = FakeLookup::new().with_global("tiny_fn", LookupResult { value: 0, size: 2 });
        let logger = Logger::new(false);

        assert!(assemble(&mut obj, &lookup, false, &logger).is_err());
    }
}
