//! The in-memory element model: sections, symbols, relocations and strings,
//! owned by an [`Object`] arena and cross-linked by index rather than by
//! intrusive pointer, per the arena redesign in the design notes (replaces
//! the original's doubly-linked `struct list_head` membership and raw
//! `sec->rela`/`sym->sec`/`rela->sym` pointers).

use crate::elf::constants::*;
use crate::elf::wire::{Rela, Sym};

/// Index of a [`Section`] within its owning [`Object`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SectionId(pub usize);

/// Index of a [`Symbol`] within its owning [`Object`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SymbolId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Status {
    /// Default state before correlation/comparison has run.
    #[default]
    Unknown,
    Same,
    Changed,
    New,
}

/// One relocation entry, belonging to a relocation section.
#[derive(Clone, Debug)]
pub struct Relocation {
    pub r_type: u32,
    pub offset: u64,
    pub symbol: SymbolId,
    pub addend: i64,
    /// Set when this relocation targets a string-merge section; comparison
    /// then compares the interned text rather than the symbol name (see
    /// §4.3's `rela_equal`).
    pub string: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
    /// Absent for `SHT_NOBITS` sections.
    pub data: Option<Vec<u8>>,
    /// Set on a relocation section: the section it relocates.
    pub base: Option<SectionId>,
    /// Set on a relocatable section: its relocation section.
    pub rela: Option<SectionId>,
    /// The `STT_SECTION` symbol describing this section, if one exists.
    pub secsym: Option<SymbolId>,
    /// The function/object symbol that uniquely owns this section under
    /// per-function/per-data sectioning, if any.
    pub bundled: Option<SymbolId>,
    pub relocations: Vec<Relocation>,
    pub grouped: bool,
    pub ignore: bool,
    pub include: bool,
    pub twin: Option<SectionId>,
    pub status: Status,
    /// Assigned late, by the assembler.
    pub index: u32,
}

impl Section {
    pub fn is_relocation(&self) -> bool {
        self.sh_type == SHT_RELA
    }

    pub fn is_debug(&self) -> bool {
        self.name.starts_with(".debug")
    }

    pub fn is_text(&self) -> bool {
        self.sh_flags & SHF_EXECINSTR != 0
    }

    pub fn is_group(&self) -> bool {
        self.sh_type == SHT_GROUP
    }

    pub fn data_size(&self) -> u64 {
        self.data.as_ref().map(|d| d.len() as u64).unwrap_or(self.sh_size)
    }
}

#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
    pub section: Option<SectionId>,
    pub twin: Option<SymbolId>,
    pub status: Status,
    pub include: bool,
    pub strip: bool,
    pub index: u32,
}

impl Symbol {
    pub fn bind(&self) -> u8 {
        st_bind(self.st_info)
    }

    pub fn sym_type(&self) -> u8 {
        st_type(self.st_info)
    }

    pub fn is_null(&self) -> bool {
        self.name.is_empty()
    }

    pub fn is_local_func(&self) -> bool {
        self.bind() == STB_LOCAL && self.sym_type() == STT_FUNC
    }

    pub fn is_local(&self) -> bool {
        self.bind() == STB_LOCAL
    }

    pub fn is_file(&self) -> bool {
        self.sym_type() == STT_FILE
    }

    /// Builds the on-disk `Sym` for this symbol, with `st_shndx` as currently
    /// recorded (the assembler updates it during reindexing).
    pub fn to_wire(&self, st_name: u32) -> Sym {
        Sym {
            st_name,
            st_info: self.st_info,
            st_other: self.st_other,
            st_shndx: self.st_shndx,
            st_value: self.st_value,
            st_size: self.st_size,
        }
    }
}

/// The subset of the ELF header the Correlator's header precheck compares
/// between base and patched (§4.2); kept separately from `Section`/`Symbol`
/// because it describes the object as a whole.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectIdentity {
    pub e_ident: [u8; EI_NIDENT],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
}

/// An owning arena of sections and symbols: one per input object, plus one
/// produced fresh by the assembler for the output.
#[derive(Clone, Debug, Default)]
pub struct Object {
    pub identity: ObjectIdentity,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    /// Strings interned for `.xsplice.strings`, in the order they were
    /// scheduled; cleared/rebuilt only on the output object.
    pub strings: Vec<String>,
}

impl Object {
    pub fn new() -> Self {
        Object::default()
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0]
    }

    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0]
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    pub fn section_ids(&self) -> impl Iterator<Item = SectionId> {
        (0..self.sections.len()).map(SectionId)
    }

    pub fn symbol_ids(&self) -> impl Iterator<Item = SymbolId> {
        (0..self.symbols.len()).map(SymbolId)
    }

    pub fn push_section(&mut self, section: Section) -> SectionId {
        self.sections.push(section);
        SectionId(self.sections.len() - 1)
    }

    pub fn push_symbol(&mut self, symbol: Symbol) -> SymbolId {
        self.symbols.push(symbol);
        SymbolId(self.symbols.len() - 1)
    }

    pub fn find_section_by_name(&self, name: &str) -> Option<SectionId> {
        self.sections.iter().position(|s| s.name == name).map(SectionId)
    }

    /// ELF section indices are 1-based in `st_shndx`/group payloads; index 0
    /// is always `SHN_UNDEF` and never resolves to a stored section.
    pub fn find_section_by_index(&self, index: u32) -> Option<SectionId> {
        if index == 0 || index as usize > self.sections.len() {
            None
        } else {
            Some(SectionId(index as usize - 1))
        }
    }

    pub fn find_symbol_by_name(&self, name: &str) -> Option<SymbolId> {
        self.symbols.iter().position(|s| s.name == name).map(SymbolId)
    }

    /// Symbol-table indices are 0-based and the `STN_UNDEF` null symbol at
    /// index 0 is a real, stored entry (unlike section index 0).
    pub fn find_symbol_by_index(&self, index: u32) -> Option<SymbolId> {
        if (index as usize) < self.symbols.len() {
            Some(SymbolId(index as usize))
        } else {
            None
        }
    }

    /// Every relocation in the relocation section belonging to `section`, if
    /// it has one.
    pub fn relocations_of(&self, section: SectionId) -> &[Relocation] {
        match self.section(section).rela {
            Some(rela) => &self.section(rela).relocations,
            None => &[],
        }
    }

    /// Whether `section` is (or relocates) a debug section; resolves through
    /// a relocation section's `base` link first, so a `.rela.debug_info`
    /// section counts as debug even though its own name doesn't start with
    /// `.debug`.
    pub fn is_debug_section(&self, section: SectionId) -> bool {
        let sec = self.section(section);
        let target = if sec.is_relocation() { sec.base } else { Some(section) };
        match target {
            Some(id) => self.section(id).is_debug(),
            None => sec.is_debug(),
        }
    }
}
