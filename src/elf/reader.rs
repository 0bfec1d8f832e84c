//! Parses an ELF64 relocatable object file's bytes into the element model.
//!
//! Reads in the usual order (header, then section headers, then symbols,
//! then relocations), but builds an [`Object`] arena rather than a borrowed
//! view, since later stages mutate cross-links in place.

use scroll::Pread;

use crate::elf::constants::*;
use crate::elf::strtab::Strtab;
use crate::elf::wire::{Ehdr, Rela, Shdr, Sym, SIZEOF_RELA, SIZEOF_SHDR, SIZEOF_SYM};
use crate::error::{Error, Result};
use crate::model::{Object, ObjectIdentity, Relocation, Section, SectionId, Symbol, SymbolId};

/// Parses a full ELF64 relocatable object from `bytes`.
pub fn parse(bytes: &[u8]) -> Result<Object> {
    let ehdr: Ehdr = bytes.pread_with(0, scroll::Endian::Little)?;

    if ehdr.e_ident[EI_CLASS] != ELFCLASS64 || ehdr.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(Error::DiffFatal("only 64-bit little-endian objects are supported".into()));
    }
    if ehdr.e_type != ET_REL {
        return Err(Error::DiffFatal("expected a relocatable (ET_REL) object".into()));
    }
    if ehdr.e_shentsize as usize != SIZEOF_SHDR {
        return Err(Error::Internal("unexpected section header entry size".into()));
    }

    let identity = ObjectIdentity {
        e_ident: ehdr.e_ident,
        e_type: ehdr.e_type,
        e_machine: ehdr.e_machine,
        e_version: ehdr.e_version,
        e_entry: ehdr.e_entry,
        e_phoff: ehdr.e_phoff,
        e_flags: ehdr.e_flags,
        e_ehsize: ehdr.e_ehsize,
        e_phentsize: ehdr.e_phentsize,
        e_phnum: ehdr.e_phnum,
        e_shentsize: ehdr.e_shentsize,
    };

    let mut shdrs = Vec::with_capacity(ehdr.e_shnum as usize);
    let mut off = ehdr.e_shoff as usize;
    for _ in 0..ehdr.e_shnum {
        let shdr: Shdr = bytes.pread_with(off, scroll::Endian::Little)?;
        shdrs.push(shdr);
        off += SIZEOF_SHDR;
    }

    let shstrtab_shdr = shdrs
        .get(ehdr.e_shstrndx as usize)
        .ok_or_else(|| Error::Internal("e_shstrndx out of range".into()))?;
    let shstrtab = Strtab::new(section_bytes(bytes, shstrtab_shdr)?);

    let mut obj = Object { identity, ..Object::new() };

    // `shdrs[0]` is the mandatory reserved null section header (SHT_NULL);
    // it is never addressed by a real `st_shndx`/`sh_info` value (those use
    // 0 to mean `SHN_UNDEF`), so `Object::sections` omits it entirely and
    // `find_section_by_index` subtracts one to land on the first real entry.
    for shdr in &shdrs[1..] {
        let name = shstrtab.get(shdr.sh_name as usize).to_string();
        let data = if shdr.sh_type == SHT_NOBITS { None } else { Some(section_bytes(bytes, shdr)?.to_vec()) };
        obj.push_section(Section {
            name,
            sh_type: shdr.sh_type,
            sh_flags: shdr.sh_flags,
            sh_addr: shdr.sh_addr,
            sh_size: shdr.sh_size,
            sh_link: shdr.sh_link,
            sh_info: shdr.sh_info,
            sh_addralign: shdr.sh_addralign,
            sh_entsize: shdr.sh_entsize,
            data,
            base: None,
            rela: None,
            secsym: None,
            bundled: None,
            relocations: Vec::new(),
            grouped: false,
            ignore: false,
            include: false,
            twin: None,
            status: Default::default(),
            index: 0,
        });
    }

    let symtab_idx = shdrs.iter().position(|s| s.sh_type == SHT_SYMTAB);
    if let Some(symtab_idx) = symtab_idx {
        let symtab_shdr = &shdrs[symtab_idx];
        let strtab_shdr = shdrs
            .get(symtab_shdr.sh_link as usize)
            .ok_or_else(|| Error::Internal("symtab sh_link out of range".into()))?;
        let strtab = Strtab::new(section_bytes(bytes, strtab_shdr)?);

        let count = symtab_shdr.sh_size as usize / SIZEOF_SYM;
        let mut symoff = symtab_shdr.sh_offset as usize;
        for _ in 0..count {
            let sym: Sym = bytes.pread_with(symoff, scroll::Endian::Little)?;
            symoff += SIZEOF_SYM;

            let name = strtab.get(sym.st_name as usize).to_string();
            let section = obj.find_section_by_index(sym.st_shndx as u32);

            obj.push_symbol(Symbol {
                name,
                st_info: sym.st_info,
                st_other: sym.st_other,
                st_shndx: sym.st_shndx,
                st_value: sym.st_value,
                st_size: sym.st_size,
                section,
                twin: None,
                status: Default::default(),
                include: false,
                strip: false,
                index: 0,
            });
        }
    }

    link_section_symbols(&mut obj);
    link_rela_sections(&mut obj, bytes, &shdrs)?;
    mark_bundled_symbols(&mut obj);
    mark_string_relocations(&mut obj);

    Ok(obj)
}

fn section_bytes<'a>(bytes: &'a [u8], shdr: &Shdr) -> Result<&'a [u8]> {
    let start = shdr.sh_offset as usize;
    let end = start + shdr.sh_size as usize;
    bytes.get(start..end).ok_or_else(|| Error::Internal("section data out of range".into()))
}

/// Points every section at its `STT_SECTION` symbol, if one was emitted.
fn link_section_symbols(obj: &mut Object) {
    let ids: Vec<SymbolId> = obj.symbol_ids().collect();
    for id in ids {
        let (sym_type, section) = {
            let s = obj.symbol(id);
            (s.sym_type(), s.section)
        };
        if sym_type != STT_SECTION {
            continue;
        }
        if let Some(sec_id) = section {
            obj.section_mut(sec_id).secsym = Some(id);
        }
    }
}

/// Builds each `SHT_RELA` section's [`Relocation`] list and wires up its
/// `base`/`rela` cross-links, keyed by the original section-header array so
/// indices line up with `sh_info`/`sh_link` before any sections are added or
/// removed.
fn link_rela_sections(obj: &mut Object, bytes: &[u8], shdrs: &[Shdr]) -> Result<()> {
    for (idx, shdr) in shdrs.iter().enumerate() {
        if idx == 0 || shdr.sh_type != SHT_RELA {
            continue;
        }
        let rela_id = SectionId(idx - 1);
        let base_id = obj
            .find_section_by_index(shdr.sh_info)
            .ok_or_else(|| Error::Internal(format!("relocation section {} has no base section", idx)))?;

        obj.section_mut(rela_id).base = Some(base_id);
        obj.section_mut(base_id).rela = Some(rela_id);

        let count = shdr.sh_size as usize / SIZEOF_RELA;
        let mut off = shdr.sh_offset as usize;
        let mut relocations = Vec::with_capacity(count);
        for _ in 0..count {
            let rela: Rela = bytes.pread_with(off, scroll::Endian::Little)?;
            off += SIZEOF_RELA;

            let symbol = obj
                .find_symbol_by_index(r_sym(rela.r_info))
                .ok_or_else(|| Error::Internal("relocation references out-of-range symbol".into()))?;

            relocations.push(Relocation { r_type: r_type(rela.r_info), offset: rela.r_offset, symbol, addend: rela.r_addend, string: None });
        }
        obj.section_mut(rela_id).relocations = relocations;
    }
    Ok(())
}

/// A non-group section whose only function/object symbol sits at offset 0
/// and spans it entirely is that symbol's exclusive home: per-function and
/// per-data sectioning both produce this shape.
fn mark_bundled_symbols(obj: &mut Object) {
    let ids: Vec<SectionId> = obj.section_ids().collect();
    for sec_id in ids {
        if obj.section(sec_id).is_group() {
            continue;
        }
        let sh_size = obj.section(sec_id).sh_size;

        let mut candidate = None;
        let mut more_than_one = false;
        for sym_id in obj.symbol_ids() {
            let sym = obj.symbol(sym_id);
            if sym.section != Some(sec_id) {
                continue;
            }
            let is_data_or_func = sym.sym_type() == STT_FUNC || sym.sym_type() == STT_OBJECT;
            if !is_data_or_func || sym.st_value != 0 || sym.st_size != sh_size {
                continue;
            }
            if candidate.is_some() {
                more_than_one = true;
                break;
            }
            candidate = Some(sym_id);
        }

        if !more_than_one {
            if let Some(sym_id) = candidate {
                obj.section_mut(sec_id).bundled = Some(sym_id);
            }
        }
    }
}

/// A relocation whose target symbol is the section-symbol of a
/// `SHF_MERGE|SHF_STRINGS` section addresses a string literal by offset;
/// intern the literal so the Comparator can compare content instead of the
/// (meaningless, compiler-assigned) symbol name.
fn mark_string_relocations(obj: &mut Object) {
    let rela_ids: Vec<SectionId> = obj.section_ids().filter(|&id| obj.section(id).is_relocation()).collect();

    for rela_id in rela_ids {
        let len = obj.section(rela_id).relocations.len();
        for i in 0..len {
            let (sym_id, addend) = {
                let r = &obj.section(rela_id).relocations[i];
                (r.symbol, r.addend)
            };
            let target_sec = match obj.symbol(sym_id).section {
                Some(id) => id,
                None => continue,
            };
            let flags = obj.section(target_sec).sh_flags;
            if flags & SHF_MERGE == 0 || flags & SHF_STRINGS == 0 {
                continue;
            }
            let data = match &obj.section(target_sec).data {
                Some(d) => d,
                None => continue,
            };
            if let Some(s) = read_c_str(data, addend as usize) {
                obj.section_mut(rela_id).relocations[i].string = Some(s);
            }
        }
    }
}

fn read_c_str(data: &[u8], offset: usize) -> Option<String> {
    let slice = data.get(offset..)?;
    let end = slice.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&slice[..end]).ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::constants::*;
    use crate::elf::wire::{SIZEOF_EHDR, SIZEOF_SHDR, SIZEOF_SYM};
    use scroll::Pwrite;

    fn push_sym(buf: &mut Vec<u8>, val: Sym) {
        let offset = buf.len();
        buf.resize(offset + SIZEOF_SYM, 0);
        buf.pwrite_with(val, offset, scroll::Endian::Little).unwrap();
    }

    fn push_shdr(buf: &mut Vec<u8>, val: Shdr) {
        let offset = buf.len();
        buf.resize(offset + SIZEOF_SHDR, 0);
        buf.pwrite_with(val, offset, scroll::Endian::Little).unwrap();
    }

    /// Builds a minimal ET_REL object with one `.text.foo` section (holding
    /// a single `nop`), a bundled FUNC symbol, and `.shstrtab`/`.symtab`/
    /// `.strtab` support sections, to exercise the reader end-to-end.
    fn build_minimal_object() -> Vec<u8> {
        let shstrtab_names = "\0.text.foo\0.shstrtab\0.symtab\0.strtab\0";
        let strtab_names = "\0foo\0";

        let text_data = vec![0x90u8; 4];

        let mut bytes = vec![0u8; SIZEOF_EHDR];

        let text_off = bytes.len();
        bytes.extend_from_slice(&text_data);

        let shstrtab_off = bytes.len();
        bytes.extend_from_slice(shstrtab_names.as_bytes());

        let strtab_off = bytes.len();
        bytes.extend_from_slice(strtab_names.as_bytes());

        let symtab_off = bytes.len();
        push_sym(&mut bytes, Sym { st_name: 0, st_info: 0, st_other: 0, st_shndx: 0, st_value: 0, st_size: 0 });
        push_sym(&mut bytes, Sym { st_name: 1, st_info: st_info(STB_GLOBAL, STT_FUNC), st_other: 0, st_shndx: 1, st_value: 0, st_size: 4 });

        let shoff = bytes.len();
        let name_off = |name: &str| shstrtab_names.find(name).unwrap() as u32;

        push_shdr(&mut bytes, Shdr::default());
        push_shdr(
            &mut bytes,
            Shdr {
                sh_name: name_off(".text.foo"),
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_EXECINSTR,
                sh_addr: 0,
                sh_offset: text_off as u64,
                sh_size: text_data.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
            },
        );
        push_shdr(
            &mut bytes,
            Shdr {
                sh_name: name_off(".shstrtab"),
                sh_type: SHT_STRTAB,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: shstrtab_off as u64,
                sh_size: shstrtab_names.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
            },
        );
        push_shdr(
            &mut bytes,
            Shdr {
                sh_name: name_off(".symtab"),
                sh_type: SHT_SYMTAB,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: symtab_off as u64,
                sh_size: (2 * SIZEOF_SYM) as u64,
                sh_link: 4,
                sh_info: 1,
                sh_addralign: 8,
                sh_entsize: SIZEOF_SYM as u64,
            },
        );
        push_shdr(
            &mut bytes,
            Shdr {
                sh_name: name_off(".strtab"),
                sh_type: SHT_STRTAB,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: strtab_off as u64,
                sh_size: strtab_names.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
            },
        );

        let ehdr = Ehdr {
            e_ident: {
                let mut id = [0u8; EI_NIDENT];
                id[EI_CLASS] = ELFCLASS64;
                id[EI_DATA] = ELFDATA2LSB;
                id
            },
            e_type: ET_REL,
            e_machine: 0x3e,
            e_version: 1,
            e_entry: 0,
            e_phoff: 0,
            e_shoff: shoff as u64,
            e_flags: 0,
            e_ehsize: SIZEOF_EHDR as u16,
            e_phentsize: 0,
            e_phnum: 0,
            e_shentsize: SIZEOF_SHDR as u16,
            e_shnum: 5,
            e_shstrndx: 2,
        };
        bytes.pwrite_with(ehdr, 0, scroll::Endian::Little).unwrap();

        bytes
    }

    #[test]
    fn parses_sections_and_symbols() {
        let bytes = build_minimal_object();
        let obj = parse(&bytes).unwrap();

        let text = obj.find_section_by_name(".text.foo").unwrap();
        assert_eq!(obj.section(text).data.as_ref().unwrap().len(), 4);

        let foo = obj.find_symbol_by_name("foo").unwrap();
        assert_eq!(obj.symbol(foo).section, Some(text));
    }

    #[test]
    fn bundles_the_sole_spanning_function_symbol() {
        let bytes = build_minimal_object();
        let obj = parse(&bytes).unwrap();
        let text = obj.find_section_by_name(".text.foo").unwrap();
        let foo = obj.find_symbol_by_name("foo").unwrap();
        assert_eq!(obj.section(text).bundled, Some(foo));
    }

    #[test]
    fn rejects_32_bit_objects() {
        let mut bytes = build_minimal_object();
        bytes[EI_CLASS] = 1;
        assert!(parse(&bytes).is_err());
    }
}
