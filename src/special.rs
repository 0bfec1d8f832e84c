//! The Special-section processor: sections whose payload is an array of
//! fixed- or variable-size records (exception tables, bug-frame tables,
//! alternative-instruction patches) can't be diffed element-by-element the
//! way per-function/per-data sections can. Each record is kept or dropped as
//! a whole group, based on whether any relocation in the group still points
//! at an included function.

use crate::elf::constants::STT_FUNC;
use crate::error::Result;
use crate::logger::Logger;
use crate::{bug, log_debug};
use crate::model::{Object, Relocation, Status, SymbolId};

const SPECIAL_SECTIONS: &[&str] =
    &[".bug_frames.0", ".bug_frames.1", ".bug_frames.2", ".bug_frames.3", ".fixup", ".ex_table", ".altinstructions"];

/// Regenerates every known special section's base/rela pair, then includes
/// `.altinstr_replacement` whole, since none of its relocations can target
/// an excluded symbol.
pub fn process(obj: &mut Object, logger: &Logger) -> Result<()> {
    for &name in SPECIAL_SECTIONS {
        regenerate_special_section(obj, name, logger)?;
    }
    include_altinstr_replacement(obj);
    Ok(())
}

fn group_size(obj: &Object, name: &str, offset: u64) -> Result<u64> {
    match name {
        ".bug_frames.0" | ".bug_frames.1" | ".bug_frames.2" => Ok(8),
        ".bug_frames.3" => Ok(16),
        ".ex_table" => Ok(8),
        ".altinstructions" => Ok(12),
        ".fixup" => fixup_group_size(obj, offset),
        other => bug!("no group size function for special section {}", other),
    }
}

/// `.fixup` groups aren't fixed-size; the only record of where one ends is
/// the addend on the `.ex_table` entry that points at its start, compared
/// against the next such entry (or the section's end, for the last group).
fn fixup_group_size(obj: &Object, offset: u64) -> Result<u64> {
    let ex_table = obj
        .find_section_by_name(".rela.ex_table")
        .ok_or_else(|| crate::error::Error::Internal("missing .rela.ex_table section".into()))?;
    let relocations = &obj.section(ex_table).relocations;

    let start = relocations
        .iter()
        .position(|r| obj.symbol(r.symbol).name == ".fixup" && r.addend == offset as i64)
        .ok_or_else(|| crate::error::Error::Internal(format!("can't find .fixup rela group at offset {}", offset)))?;

    let next = relocations[start + 1..].iter().find(|r| obj.symbol(r.symbol).name == ".fixup" && r.addend > offset as i64);

    match next {
        Some(r) => Ok((r.addend - offset as i64) as u64),
        None => {
            let fixup = obj
                .find_section_by_name(".fixup")
                .ok_or_else(|| crate::error::Error::Internal("missing .fixup section".into()))?;
            Ok(obj.section(fixup).data_size() - offset)
        }
    }
}

/// True if any relocation in `[start, start + size)` still targets an
/// included function, meaning the whole record must be kept.
fn should_keep_rela_group(obj: &Object, relocations: &[Relocation], start: u64, size: u64) -> bool {
    relocations.iter().any(|r| {
        r.offset >= start
            && r.offset < start + size
            && obj.symbol(r.symbol).sym_type() == STT_FUNC
            && obj.symbol(r.symbol).section.map_or(false, |s| obj.section(s).include)
    })
}

fn regenerate_special_section(obj: &mut Object, name: &str, logger: &Logger) -> Result<()> {
    let base_id = match obj.find_section_by_name(name) {
        Some(id) => id,
        None => return Ok(()),
    };
    let rela_id = match obj.section(base_id).rela {
        Some(id) => id,
        None => return Ok(()),
    };

    let src = obj.section(base_id).data.clone().unwrap_or_default();
    let align = obj.section(base_id).sh_addralign.max(1);
    let total_len = src.len() as u64;
    let relocations = obj.section(rela_id).relocations.clone();

    let mut dest = Vec::with_capacity(src.len());
    let mut new_relocations: Vec<Relocation> = Vec::new();
    let mut src_offset: u64 = 0;

    while src_offset < total_len {
        let size = group_size(obj, name, src_offset)?;
        if should_keep_rela_group(obj, &relocations, src_offset, size) {
            let dest_offset = dest.len() as u64;
            let keep: Vec<SymbolId> = relocations
                .iter()
                .filter(|r| r.offset >= src_offset && r.offset < src_offset + size)
                .map(|r| {
                    let mut moved = r.clone();
                    moved.offset = moved.offset - src_offset + dest_offset;
                    new_relocations.push(moved);
                    r.symbol
                })
                .collect();
            for sym in keep {
                obj.symbol_mut(sym).include = true;
            }
            let start = src_offset as usize;
            let end = (src_offset + size) as usize;
            dest.extend_from_slice(&src[start..end]);
        }
        src_offset += size;
    }

    let aligned_size = (total_len + align - 1) / align * align;
    if src_offset != aligned_size {
        bug!("group size mismatch for section {}", name);
    }

    if dest.is_empty() {
        obj.section_mut(rela_id).status = Status::Same;
        obj.section_mut(base_id).status = Status::Same;
        obj.section_mut(rela_id).include = false;
        obj.section_mut(base_id).include = false;
        return Ok(());
    }

    log_debug!(logger, "keeping {} of {} bytes in {}", dest.len(), total_len, name);

    obj.section_mut(rela_id).relocations = new_relocations;
    obj.section_mut(rela_id).include = true;
    obj.section_mut(base_id).include = true;
    obj.section_mut(base_id).data = Some(dest);

    Ok(())
}

/// None of `.altinstr_replacement`'s relocations can reference an excluded
/// symbol (the alternative-instruction ABI requires every replacement to
/// stand alone), so the whole section goes in unconditionally.
fn include_altinstr_replacement(obj: &mut Object) {
    let id = match obj.find_section_by_name(".altinstr_replacement") {
        Some(id) => id,
        None => return,
    };
    obj.section_mut(id).include = true;

    let owned: Vec<SymbolId> = obj.symbol_ids().filter(|&s| obj.symbol(s).section == Some(id)).collect();
    for sym in owned {
        obj.symbol_mut(sym).include = true;
    }

    if let Some(rela_id) = obj.section(id).rela {
        obj.section_mut(rela_id).include = true;
        let targets: Vec<SymbolId> = obj.section(rela_id).relocations.iter().map(|r| r.symbol).collect();
        for sym in targets {
            obj.symbol_mut(sym).include = true;
        }
    }
}
