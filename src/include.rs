//! The Inclusion engine: computes the transitive closure of elements that
//! must appear in the output, starting from changed functions and new
//! globals and following relocations outward.

use crate::elf::constants::{STB_GLOBAL, STT_FUNC, STT_SECTION};
use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::log_debug;
use crate::model::{Object, SectionId, Status, SymbolId};

/// Counts produced by the inclusion passes, used afterwards to decide
/// whether the run has anything to ship at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct InclusionSummary {
    pub changed_functions: usize,
    pub new_globals: usize,
}

impl InclusionSummary {
    pub fn has_changes(&self) -> bool {
        self.changed_functions != 0 || self.new_globals != 0
    }
}

/// Runs every inclusion pass over `obj` in order, returning the counts the
/// caller needs to decide whether there is anything to ship.
pub fn include(obj: &mut Object, logger: &Logger) -> Result<InclusionSummary> {
    include_standard_elements(obj);
    let changed_functions = include_changed_functions(obj, logger);
    include_debug_sections(obj)?;
    include_hook_elements(obj, logger)?;
    let new_globals = include_new_globals(obj, logger);

    Ok(InclusionSummary { changed_functions, new_globals })
}

/// Unconditionally included regardless of status: the core ELF string and
/// symbol tables, any merged read-only string section, and the NULL symbol.
fn include_standard_elements(obj: &mut Object) {
    let ids: Vec<SectionId> = obj.section_ids().collect();
    for id in ids {
        let name = obj.section(id).name.clone();
        if name == ".shstrtab" || name == ".strtab" || name == ".symtab" || name.starts_with(".rodata.str1.") {
            obj.section_mut(id).include = true;
            if let Some(secsym) = obj.section(id).secsym {
                obj.symbol_mut(secsym).include = true;
            }
        }
    }
    if !obj.symbols.is_empty() {
        obj.symbol_mut(SymbolId(0)).include = true;
    }
}

/// Marks `sym` included and, unless it's a non-local symbol or an already-
/// included/unchanged base case, pulls in its section, section-symbol, and
/// relocation section, recursing into every symbol that section's
/// relocations target. Termination follows from `section.include` being
/// checked before recursing: once a section is included, walking into it
/// again stops immediately.
fn include_symbol(obj: &mut Object, sym_id: SymbolId, logger: &Logger, level: usize) {
    log_debug!(logger, "{}include_symbol({})", "  ".repeat(level), obj.symbol(sym_id).name);
    obj.symbol_mut(sym_id).include = true;

    let sec_id = match obj.symbol(sym_id).section {
        Some(id) => id,
        None => return,
    };
    if obj.section(sec_id).include {
        return;
    }

    let sym_type = obj.symbol(sym_id).sym_type();
    if sym_type != STT_SECTION && obj.symbol(sym_id).status == Status::Same {
        return;
    }

    obj.section_mut(sec_id).include = true;
    if let Some(secsym) = obj.section(sec_id).secsym {
        if secsym != sym_id {
            obj.symbol_mut(secsym).include = true;
        }
    }

    let rela_id = match obj.section(sec_id).rela {
        Some(id) => id,
        None => return,
    };
    obj.section_mut(rela_id).include = true;

    let targets: Vec<SymbolId> = obj.section(rela_id).relocations.iter().map(|r| r.symbol).collect();
    for target in targets {
        include_symbol(obj, target, logger, level + 1);
    }
}

fn include_changed_functions(obj: &mut Object, logger: &Logger) -> usize {
    let mut changed = 0;
    let ids: Vec<SymbolId> = obj.symbol_ids().collect();
    for id in ids {
        let (status, sym_type) = {
            let s = obj.symbol(id);
            (s.status, s.sym_type())
        };
        if status == Status::Changed && sym_type == STT_FUNC {
            changed += 1;
            include_symbol(obj, id, logger, 0);
        }
        if obj.symbol(id).is_file() {
            obj.symbol_mut(id).include = true;
        }
    }
    changed
}

fn include_debug_sections(obj: &mut Object) -> Result<()> {
    let ids: Vec<SectionId> = obj.section_ids().collect();

    for &id in &ids {
        if obj.is_debug_section(id) {
            obj.section_mut(id).include = true;
            if !obj.section(id).is_relocation() {
                let secsym = obj.section(id).secsym.ok_or_else(|| Error::Internal("expected bundled symbol".into()))?;
                obj.symbol_mut(secsym).include = true;
            }
        }
    }

    for id in ids {
        if !obj.section(id).is_relocation() || !obj.is_debug_section(id) {
            continue;
        }
        let keep: Vec<bool> = obj
            .section(id)
            .relocations
            .iter()
            .map(|r| match obj.symbol(r.symbol).section {
                Some(sec) => obj.section(sec).include,
                None => false,
            })
            .collect();
        let mut keep = keep.into_iter();
        obj.section_mut(id).relocations.retain(|_| keep.next().unwrap());
    }
    Ok(())
}

const HOOK_SECTION_NAMES: &[&str] = &[".xsplice.hooks.load", ".xsplice.hooks.unload", ".rela.xsplice.hooks.load", ".rela.xsplice.hooks.unload"];

/// `.xsplice.hooks.{load,unload}` name a hook function by symbol; the
/// live-patching ABI wants it referenced by section instead, so the hook
/// function is included transitively, then unmarked and retargeted onto its
/// own section-symbol. The temporary pointer objects the hook macros emit
/// are never shipped.
fn include_hook_elements(obj: &mut Object, logger: &Logger) -> Result<()> {
    let ids: Vec<SectionId> = obj.section_ids().filter(|&id| HOOK_SECTION_NAMES.contains(&obj.section(id).name.as_str())).collect();

    for id in ids {
        obj.section_mut(id).include = true;

        if obj.section(id).is_relocation() {
            let first = obj
                .section(id)
                .relocations
                .first()
                .map(|r| r.symbol)
                .ok_or_else(|| Error::Internal("hook relocation section is empty".into()))?;

            let name = obj.symbol(first).name.clone();
            logger.normal(format_args!("found hook: {}", name));
            include_symbol(obj, first, logger, 0);

            obj.symbol_mut(first).include = false;
            let hook_sec = obj.symbol(first).section.ok_or_else(|| Error::Internal("expected bundled symbol".into()))?;
            obj.section_mut(hook_sec).bundled = None;
            let secsym = obj.section(hook_sec).secsym.ok_or_else(|| Error::Internal("expected section symbol".into()))?;
            obj.section_mut(id).relocations[0].symbol = secsym;
        } else if let Some(secsym) = obj.section(id).secsym {
            obj.symbol_mut(secsym).include = true;
        }
    }

    let temp_ids: Vec<SymbolId> = obj
        .symbol_ids()
        .filter(|&id| matches!(obj.symbol(id).name.as_str(), "xsplice_load_data" | "xsplice_unload_data"))
        .collect();
    for id in temp_ids {
        obj.symbol_mut(id).include = false;
    }

    Ok(())
}

fn include_new_globals(obj: &mut Object, logger: &Logger) -> usize {
    let ids: Vec<SymbolId> = obj
        .symbol_ids()
        .filter(|&id| {
            let s = obj.symbol(id);
            s.bind() == STB_GLOBAL && s.section.is_some() && s.status == Status::New
        })
        .collect();
    for &id in &ids {
        include_symbol(obj, id, logger, 0);
    }
    ids.len()
}
