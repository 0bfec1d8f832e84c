//! Serializes an assembled [`Object`] back to ELF64 relocatable object bytes.
//!
//! A `build()` entry point backed by small dedicated helpers, each
//! `scroll::Pwrite`-ing one piece of the file at a computed offset. It
//! always regenerates `.shstrtab`/`.strtab`/`.symtab` and every relocation
//! section's bytes from the element model. The assembler leaves those
//! sections' `data` stale (or absent) precisely so the writer is the single
//! place that derives on-disk bytes from final indices and names.

use scroll::Pwrite;

use crate::elf::constants::*;
use crate::elf::strtab::StrtabBuilder;
use crate::elf::wire::{Ehdr, Rela, Shdr, Sym, SIZEOF_EHDR, SIZEOF_RELA, SIZEOF_SHDR, SIZEOF_SYM};
use crate::error::{Error, Result};
use crate::model::Object;

/// Serializes `obj` (already migrated, reindexed and reordered by
/// [`crate::assemble::assemble`]) into a full ELF64 relocatable object.
pub fn write(obj: &Object) -> Result<Vec<u8>> {
    let shstrtab_id = obj.find_section_by_name(".shstrtab").ok_or_else(|| Error::Internal("missing .shstrtab".into()))?;
    let strtab_id = obj.find_section_by_name(".strtab").ok_or_else(|| Error::Internal("missing .strtab".into()))?;
    let symtab_id = obj.find_section_by_name(".symtab").ok_or_else(|| Error::Internal("missing .symtab".into()))?;

    let mut shstrtab_builder = StrtabBuilder::new();
    let mut section_name_offsets = vec![0u32; obj.sections.len()];
    for (i, sec) in obj.sections.iter().enumerate() {
        section_name_offsets[i] = shstrtab_builder.add(&sec.name);
    }

    let mut strtab_builder = StrtabBuilder::new();
    let mut symbol_name_offsets = vec![0u32; obj.symbols.len()];
    for (i, sym) in obj.symbols.iter().enumerate() {
        if !sym.is_null() {
            symbol_name_offsets[i] = strtab_builder.add(&sym.name);
        }
    }

    let symtab_data = build_symtab(obj, &symbol_name_offsets)?;
    let strtab_data = strtab_builder.into_bytes();
    let shstrtab_data = shstrtab_builder.into_bytes();

    let first_global = obj.symbols.iter().position(|s| !s.is_local()).unwrap_or(obj.symbols.len()) as u32;
    let strtab_index = obj.section(strtab_id).index;

    // Each section's file bytes, in final section-index order; the writer
    // substitutes freshly-built bytes for the three string/symbol tables and
    // every relocation section, and carries every other section's migrated
    // bytes through unchanged.
    let mut payloads: Vec<Option<Vec<u8>>> = Vec::with_capacity(obj.sections.len());
    for sec in &obj.sections {
        let bytes = if sec.index == obj.section(shstrtab_id).index {
            Some(shstrtab_data.clone())
        } else if sec.index == obj.section(strtab_id).index {
            Some(strtab_data.clone())
        } else if sec.index == obj.section(symtab_id).index {
            Some(symtab_data.clone())
        } else if sec.is_relocation() {
            Some(build_rela_data(obj, sec)?)
        } else {
            sec.data.clone()
        };
        payloads.push(bytes);
    }

    let mut offsets = vec![0u64; obj.sections.len()];
    let mut cursor = SIZEOF_EHDR as u64;
    for (i, sec) in obj.sections.iter().enumerate() {
        let align = if sec.sh_addralign == 0 { 1 } else { sec.sh_addralign };
        cursor = align_up(cursor, align);
        offsets[i] = cursor;
        if let Some(bytes) = &payloads[i] {
            cursor += bytes.len() as u64;
        }
    }

    let shoff = align_up(cursor, 8);

    let mut out = vec![0u8; shoff as usize];
    for (i, payload) in payloads.iter().enumerate() {
        if let Some(bytes) = payload {
            let start = offsets[i] as usize;
            out[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    out.resize(shoff as usize + SIZEOF_SHDR * (obj.sections.len() + 1), 0);

    out.pwrite_with(Shdr::default(), shoff as usize, scroll::Endian::Little)?;
    for (i, sec) in obj.sections.iter().enumerate() {
        let sh_size = match &payloads[i] {
            Some(bytes) => bytes.len() as u64,
            None => sec.sh_size,
        };
        let (sh_link, sh_info) = if sec.index == obj.section(symtab_id).index {
            (strtab_index, first_global)
        } else {
            (sec.sh_link, sec.sh_info)
        };
        let shdr = Shdr {
            sh_name: section_name_offsets[i],
            sh_type: sec.sh_type,
            sh_flags: sec.sh_flags,
            sh_addr: sec.sh_addr,
            sh_offset: offsets[i],
            sh_size,
            sh_link,
            sh_info,
            sh_addralign: sec.sh_addralign,
            sh_entsize: sec.sh_entsize,
        };
        let shdr_offset = shoff as usize + SIZEOF_SHDR * (sec.index as usize);
        out.pwrite_with(shdr, shdr_offset, scroll::Endian::Little)?;
    }

    let identity = obj.identity;
    let ehdr = Ehdr {
        e_ident: identity.e_ident,
        e_type: identity.e_type,
        e_machine: identity.e_machine,
        e_version: identity.e_version,
        e_entry: identity.e_entry,
        e_phoff: identity.e_phoff,
        e_shoff: shoff,
        e_flags: identity.e_flags,
        e_ehsize: identity.e_ehsize,
        e_phentsize: identity.e_phentsize,
        e_phnum: identity.e_phnum,
        e_shentsize: SIZEOF_SHDR as u16,
        e_shnum: (obj.sections.len() + 1) as u16,
        e_shstrndx: obj.section(shstrtab_id).index as u16,
    };
    out.pwrite_with(ehdr, 0, scroll::Endian::Little)?;

    Ok(out)
}

fn align_up(offset: u64, align: u64) -> u64 {
    if align <= 1 {
        offset
    } else {
        (offset + align - 1) / align * align
    }
}

fn build_symtab(obj: &Object, name_offsets: &[u32]) -> Result<Vec<u8>> {
    let mut data = vec![0u8; obj.symbols.len() * SIZEOF_SYM];
    for (i, sym) in obj.symbols.iter().enumerate() {
        let wire = sym.to_wire(name_offsets[i]);
        data.pwrite_with(wire, i * SIZEOF_SYM, scroll::Endian::Little)?;
    }
    Ok(data)
}

fn build_rela_data(obj: &Object, rela_sec: &crate::model::Section) -> Result<Vec<u8>> {
    let mut data = vec![0u8; rela_sec.relocations.len() * SIZEOF_RELA];
    for (i, reloc) in rela_sec.relocations.iter().enumerate() {
        let rela = Rela { r_offset: reloc.offset, r_info: r_info(obj.symbol(reloc.symbol).index, reloc.r_type), r_addend: reloc.addend };
        data.pwrite_with(rela, i * SIZEOF_RELA, scroll::Endian::Little)?;
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::reader;
    use crate::model::{Relocation, Section, Status, Symbol};

    fn blank_section(name: &str, sh_type: u32) -> Section {
        Section {
            name: name.to_string(),
            sh_type,
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
            include: true,
            twin: None,
            status: Status::Same,
            index: 0,
        }
    }

    fn blank_symbol(name: &str, st_info: u8) -> Symbol {
        Symbol {
            name: name.to_string(),
            st_info,
            st_other: 0,
            st_shndx: 0,
            st_value: 0,
            st_size: 0,
            section: None,
            twin: None,
            status: Status::Same,
            include: true,
            strip: false,
            index: 0,
        }
    }

    /// Builds a minimal already-reindexed Object (one `.text.foo` section
    /// bundled to a global function symbol, plus the three support sections)
    /// and checks that `write` followed by `reader::parse` round-trips the
    /// section name, symbol name and relocation target.
    #[test]
    fn round_trips_through_the_reader() {
        let mut obj = Object::new();

        obj.push_symbol(blank_symbol("", 0));

        let text = obj.push_section(blank_section(".text.foo", SHT_PROGBITS));
        obj.section_mut(text).sh_flags = SHF_ALLOC | SHF_EXECINSTR;
        obj.section_mut(text).data = Some(vec![0x90, 0x90, 0x90, 0x90]);
        obj.section_mut(text).sh_size = 4;

        let foo = obj.push_symbol(blank_symbol("foo", st_info(STB_GLOBAL, STT_FUNC)));
        obj.symbol_mut(foo).section = Some(text);
        obj.symbol_mut(foo).st_size = 4;

        let rela_text = obj.push_section(blank_section(".rela.text.foo", SHT_RELA));
        obj.section_mut(rela_text).base = Some(text);
        obj.section_mut(text).rela = Some(rela_text);
        obj.section_mut(rela_text).relocations = vec![Relocation { r_type: R_X86_64_PC32, offset: 1, symbol: foo, addend: -4, string: None }];

        obj.push_section(blank_section(".shstrtab", SHT_STRTAB));
        obj.push_section(blank_section(".strtab", SHT_STRTAB));
        let symtab = obj.push_section(blank_section(".symtab", SHT_SYMTAB));
        obj.section_mut(symtab).sh_entsize = SIZEOF_SYM as u64;

        for (i, id) in obj.section_ids().collect::<Vec<_>>().into_iter().enumerate() {
            obj.section_mut(id).index = (i + 1) as u32;
        }
        for (i, id) in obj.symbol_ids().collect::<Vec<_>>().into_iter().enumerate() {
            obj.symbol_mut(id).index = i as u32;
            let sec = obj.symbol(id).section;
            if let Some(sec_id) = sec {
                let idx = obj.section(sec_id).index as u16;
                obj.symbol_mut(id).st_shndx = idx;
            }
        }
        obj.identity.e_ident[EI_CLASS] = ELFCLASS64;
        obj.identity.e_ident[EI_DATA] = ELFDATA2LSB;
        obj.identity.e_type = ET_REL;

        let bytes = write(&obj).unwrap();
        let reparsed = reader::parse(&bytes).unwrap();

        let reparsed_text = reparsed.find_section_by_name(".text.foo").unwrap();
        assert_eq!(reparsed.section(reparsed_text).data.as_ref().unwrap(), &[0x90, 0x90, 0x90, 0x90]);

        let reparsed_foo = reparsed.find_symbol_by_name("foo").unwrap();
        assert_eq!(reparsed.symbol(reparsed_foo).section, Some(reparsed_text));

        let reparsed_rela = reparsed.section(reparsed_text).rela.unwrap();
        assert_eq!(reparsed.section(reparsed_rela).relocations.len(), 1);
        assert_eq!(reparsed.section(reparsed_rela).relocations[0].symbol, reparsed_foo);
    }
}
