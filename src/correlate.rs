//! The Correlator: pairs base-object elements with patched-object elements
//! by name, type, and structural constraint, ahead of comparison.
//!
//! Stages run in a fixed order (mirrors the original tool's own pipeline):
//! header precheck, group marking, section-symbol substitution, mangled
//! function renaming, section/symbol pairing, then static-local variable
//! correlation, the one stage that may itself rename patched symbols to
//! match their base counterpart.

use crate::elf::constants::{R_X86_64_32S, R_X86_64_64, R_X86_64_PC32, SHT_GROUP, STB_LOCAL, STT_FUNC, STT_OBJECT, STT_SECTION};
use crate::error::{Error, Result};
use crate::insn::InstructionBoundary;
use crate::logger::Logger;
use crate::model::{Object, SectionId, Status, SymbolId};
use crate::names::{is_constant_label, is_special_static, mangled_eq, section_function_name};
use crate::{bug, diff_fatal, log_debug};

/// Runs every correlation stage over `base` and `patched` in the fixed
/// order the engine requires.
pub fn correlate(base: &mut Object, patched: &mut Object, decoder: &dyn InstructionBoundary, logger: &Logger) -> Result<()> {
    header_precheck(base, patched)?;
    check_no_program_headers(base)?;
    check_no_program_headers(patched)?;

    mark_grouped_sections(patched)?;

    replace_section_symbols(base, decoder)?;
    replace_section_symbols(patched, decoder)?;

    rename_mangled_functions(base, patched, logger);

    correlate_sections(base, patched);
    correlate_symbols(base, patched);

    correlate_static_local_variables(base, patched, logger)?;

    Ok(())
}

fn header_precheck(base: &Object, patched: &Object) -> Result<()> {
    let (a, b) = (&base.identity, &patched.identity);
    if a.e_ident != b.e_ident
        || a.e_type != b.e_type
        || a.e_machine != b.e_machine
        || a.e_version != b.e_version
        || a.e_entry != b.e_entry
        || a.e_phoff != b.e_phoff
        || a.e_flags != b.e_flags
        || a.e_ehsize != b.e_ehsize
        || a.e_phentsize != b.e_phentsize
        || a.e_shentsize != b.e_shentsize
    {
        diff_fatal!("ELF headers differ");
    }
    Ok(())
}

fn check_no_program_headers(obj: &Object) -> Result<()> {
    if obj.identity.e_phnum != 0 {
        diff_fatal!("ELF contains program header");
    }
    Ok(())
}

/// Every `SHT_GROUP` section's payload is a flag word followed by a run of
/// 32-bit section indices; each one names a section that must stay bundled
/// with its group and is flagged accordingly.
fn mark_grouped_sections(obj: &mut Object) -> Result<()> {
    let group_ids: Vec<SectionId> = obj.section_ids().filter(|&id| obj.section(id).is_group()).collect();

    for id in group_ids {
        let data = obj.section(id).data.clone().unwrap_or_default();
        let mut offset = 4; // skip the flag word (e.g. GRP_COMDAT)
        while offset + 4 <= data.len() {
            let index = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
            let target = obj
                .find_section_by_index(index)
                .ok_or_else(|| Error::Internal("group section not found".into()))?;
            obj.section_mut(target).grouped = true;
            offset += 4;
        }
    }
    Ok(())
}

/// The compiler sometimes references a local function or object through its
/// section symbol rather than the function/object symbol directly. Retarget
/// those relocations at the real symbol so correlation and comparison work
/// on stable names.
fn replace_section_symbols(obj: &mut Object, decoder: &dyn InstructionBoundary) -> Result<()> {
    let rela_ids: Vec<SectionId> = obj
        .section_ids()
        .filter(|&id| obj.section(id).is_relocation() && !obj.is_debug_section(id))
        .collect();

    for rela_id in rela_ids {
        let base_id = match obj.section(rela_id).base {
            Some(id) => id,
            None => continue,
        };
        let base_data = obj.section(base_id).data.clone().unwrap_or_default();
        let count = obj.section(rela_id).relocations.len();

        for i in 0..count {
            let (sym_id, r_type, offset, addend) = {
                let rela = &obj.section(rela_id).relocations[i];
                (rela.symbol, rela.r_type, rela.offset, rela.addend)
            };

            if obj.symbol(sym_id).sym_type() != STT_SECTION {
                continue;
            }

            let target_section = match obj.symbol(sym_id).section {
                Some(s) => s,
                None => continue,
            };

            if let Some(bundled) = obj.section(target_section).bundled {
                obj.section_mut(rela_id).relocations[i].symbol = bundled;
                continue;
            }

            let add_off: i64 = if r_type == R_X86_64_PC32 {
                let next = decoder.next_instruction_boundary(&base_data, offset as usize)?;
                next as i64 - offset as i64
            } else if r_type == R_X86_64_64 || r_type == R_X86_64_32S {
                0
            } else {
                continue;
            };

            let effective = addend + add_off;
            let mut replacement = None;
            for candidate in obj.symbol_ids() {
                let sym = obj.symbol(candidate);
                if sym.sym_type() == STT_SECTION || sym.section != Some(target_section) {
                    continue;
                }
                let start = sym.st_value as i64;
                let end = start + sym.st_size as i64;
                if effective >= start && effective < end {
                    replacement = Some((candidate, start));
                    break;
                }
            }

            if let Some((candidate, start)) = replacement {
                let rela = &mut obj.section_mut(rela_id).relocations[i];
                rela.symbol = candidate;
                rela.addend -= start;
            }
        }
    }
    Ok(())
}

const MANGLE_MARKERS: &[&str] = &[".isra.", ".constprop.", ".part."];

/// Strips a single trailing compiler-mangling suffix (`.isra.<n>`,
/// `.constprop.<n>`, `.part.<n>`) from `name`, if present. A pure digit-run
/// mangled compare can match two differently-numbered mangled names against
/// each other, but not a mangled name against the plain, unmangled base name
/// it was split from, since the base side has no `.` at all at the point
/// where the two diverge, so lock-step comparison fails even though this is
/// exactly the common case the rename exists to handle.
fn strip_mangle_suffix(name: &str) -> &str {
    for marker in MANGLE_MARKERS {
        if let Some(pos) = name.find(marker) {
            let digits = &name[pos + marker.len()..];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return &name[..pos];
            }
        }
    }
    name
}

/// gcc mangles a function's name when certain optimizations change its
/// calling interface (`foo` becomes `foo.isra.2`); the trailing number is
/// arbitrary and can differ between the base and patched build. Rename any
/// mangled patched function (and its bundled section(s)) back to its base
/// counterpart's name so later stages see a stable identity.
fn rename_mangled_functions(base: &mut Object, patched: &mut Object, logger: &Logger) {
    let candidates: Vec<SymbolId> = patched
        .symbol_ids()
        .filter(|&id| {
            let sym = patched.symbol(id);
            sym.sym_type() == STT_FUNC && (sym.name.contains(".isra.") || sym.name.contains(".constprop.") || sym.name.contains(".part."))
        })
        .collect();

    for sym_id in candidates {
        let patched_name = patched.symbol(sym_id).name.clone();
        let stripped = strip_mangle_suffix(&patched_name);
        let found = base.symbol_ids().find(|&id| {
            let candidate = &base.symbol(id).name;
            mangled_eq(candidate, &patched_name) || candidate == stripped
        });
        let base_id = match found {
            Some(id) => id,
            None => continue,
        };
        let base_name = base.symbol(base_id).name.clone();
        if base_name == patched_name {
            continue;
        }

        log_debug!(logger, "renaming {} to {}", patched_name, base_name);
        patched.symbol_mut(sym_id).name = base_name.clone();

        let sec_id = match patched.symbol(sym_id).section {
            Some(id) => id,
            None => continue,
        };
        if patched.section(sec_id).bundled != Some(sym_id) {
            continue;
        }

        let base_sec_id = match base.symbol(base_id).section {
            Some(id) => id,
            None => continue,
        };
        let base_sec_name = base.section(base_sec_id).name.clone();
        patched.section_mut(sec_id).name = base_sec_name;
        if let (Some(r), Some(br)) = (patched.section(sec_id).rela, base.section(base_sec_id).rela) {
            let name = base.section(br).name.clone();
            patched.section_mut(r).name = name;
        }

        // foo.isra.1 may own a companion .rodata.foo.isra.1 (switch-statement
        // jump tables and the like); carry its rename too when it exists.
        let rodata_name = format!(".rodata.{}", patched_name);
        let rodata_id = match patched.find_section_by_name(&rodata_name) {
            Some(id) => id,
            None => continue,
        };
        let base_rodata_name = format!(".rodata.{}", base_name);
        let base_rodata_id = match base.find_section_by_name(&base_rodata_name) {
            Some(id) => id,
            None => continue,
        };
        let new_name = base.section(base_rodata_id).name.clone();
        patched.section_mut(rodata_id).name = new_name.clone();
        if let Some(secsym) = patched.section(rodata_id).secsym {
            patched.symbol_mut(secsym).name = new_name;
        }
        if let (Some(r), Some(br)) = (patched.section(rodata_id).rela, base.section(base_rodata_id).rela) {
            let name = base.section(br).name.clone();
            patched.section_mut(r).name = name;
        }
    }
}

/// Sections pair by name; special statics are excluded, and a group section
/// additionally requires byte-identical payloads.
fn correlate_sections(base: &mut Object, patched: &mut Object) {
    let base_ids: Vec<SectionId> = base.section_ids().collect();
    let patched_ids: Vec<SectionId> = patched.section_ids().collect();

    for &id1 in &base_ids {
        for &id2 in &patched_ids {
            if base.section(id1).name != patched.section(id2).name {
                continue;
            }

            let secsym = if base.section(id1).is_relocation() {
                base.section(id1).base.and_then(|b| base.section(b).secsym)
            } else {
                base.section(id1).secsym
            };
            if let Some(sym) = secsym {
                if is_special_static(base, sym) {
                    continue;
                }
            }

            if base.section(id1).is_group() {
                if base.section(id1).data != patched.section(id2).data {
                    continue;
                }
            }

            base.section_mut(id1).twin = Some(id2);
            patched.section_mut(id2).twin = Some(id1);
            base.section_mut(id1).status = Status::Same;
            patched.section_mut(id2).status = Status::Same;
            break;
        }
    }
}

/// Symbols pair by (name, type); special statics and constant labels are
/// excluded. A `SECTION`-typed symbol whose section is a group may only pair
/// if that section's twin is the other symbol's section.
fn correlate_symbols(base: &mut Object, patched: &mut Object) {
    let base_ids: Vec<SymbolId> = base.symbol_ids().collect();
    let patched_ids: Vec<SymbolId> = patched.symbol_ids().collect();

    for &id1 in &base_ids {
        for &id2 in &patched_ids {
            let (name_eq, type_eq) = {
                let s1 = base.symbol(id1);
                let s2 = patched.symbol(id2);
                (s1.name == s2.name, s1.sym_type() == s2.sym_type())
            };
            if !name_eq || !type_eq {
                continue;
            }

            if is_special_static(base, id1) {
                continue;
            }
            if is_constant_label(&base.symbol(id1).name, base.symbol(id1).bind()) {
                continue;
            }

            if let Some(sec1) = base.symbol(id1).section {
                if base.section(sec1).sh_type == SHT_GROUP && base.section(sec1).twin != patched.symbol(id2).section {
                    continue;
                }
            }

            base.symbol_mut(id1).twin = Some(id2);
            patched.symbol_mut(id2).twin = Some(id1);
            base.symbol_mut(id1).status = Status::Same;
            patched.symbol_mut(id2).status = Status::Same;
            break;
        }
    }
}

/// Given a static local variable symbol and a relocation section in
/// `patched` that references it, finds the corresponding usage in the
/// section's base twin, enforcing that no other uncorrelated local in
/// either scope also matches under mangled compare.
fn find_static_twin(patched: &Object, base: &Object, sec: SectionId, sym: SymbolId) -> Result<Option<SymbolId>> {
    let twin_sec = match patched.section(sec).twin {
        Some(t) => t,
        None => return Ok(None),
    };

    for rela in &patched.section(sec).relocations {
        if rela.symbol == sym || patched.symbol(rela.symbol).twin.is_some() {
            continue;
        }
        if mangled_eq(&patched.symbol(rela.symbol).name, &patched.symbol(sym).name) {
            bug!(
                "found another static local variable matching {} in patched {}",
                patched.symbol(sym).name,
                section_function_name(patched, sec)
            );
        }
    }

    let mut found: Option<SymbolId> = None;
    for rela in &base.section(twin_sec).relocations {
        if base.symbol(rela.symbol).twin.is_some() {
            continue;
        }
        if !mangled_eq(&base.symbol(rela.symbol).name, &patched.symbol(sym).name) {
            continue;
        }
        if let Some(existing) = found {
            if existing != rela.symbol {
                bug!(
                    "found two static local variables matching {} in orig {}",
                    patched.symbol(sym).name,
                    section_function_name(patched, sec)
                );
            }
        }
        found = Some(rela.symbol);
    }

    Ok(found)
}

/// Static locals receive a compiler-assigned numeric suffix that can change
/// between builds (`count.31452`); rename the patched instance to match its
/// base counterpart and correlate them, using every referencing function's
/// twin as a cross-check.
fn correlate_static_local_variables(base: &mut Object, patched: &mut Object, logger: &Logger) -> Result<()> {
    let candidates: Vec<SymbolId> = patched
        .symbol_ids()
        .filter(|&id| {
            let sym = patched.symbol(id);
            sym.sym_type() == STT_OBJECT && sym.bind() == STB_LOCAL && sym.twin.is_none() && sym.name.contains('.') && !is_special_static(patched, id)
        })
        .collect();

    for sym_id in candidates {
        if patched.symbol(sym_id).twin.is_some() {
            continue;
        }

        let text_rela_secs: Vec<SectionId> = patched
            .section_ids()
            .filter(|&id| {
                let sec = patched.section(id);
                sec.is_relocation() && sec.base.map(|b| patched.section(b).is_text()).unwrap_or(false) && !patched.is_debug_section(id)
            })
            .collect();

        let mut owning_sec: Option<SectionId> = None;
        let mut basesym: Option<SymbolId> = None;

        for tmpsec in text_rela_secs {
            let references = patched.section(tmpsec).relocations.iter().any(|r| r.symbol == sym_id);
            if !references {
                continue;
            }

            let tmpsym = find_static_twin(patched, base, tmpsec, sym_id)?;
            if let (Some(existing), Some(candidate)) = (basesym, tmpsym) {
                if existing != candidate {
                    bug!(
                        "found two twins for static local variable {}: {} and {}",
                        patched.symbol(sym_id).name,
                        base.symbol(existing).name,
                        base.symbol(candidate).name
                    );
                }
            }
            if tmpsym.is_some() && basesym.is_none() {
                basesym = tmpsym;
            }
            owning_sec = Some(tmpsec);
        }

        let owning_sec = match owning_sec {
            Some(s) => s,
            None => bug!("static local variable {} not used", patched.symbol(sym_id).name),
        };

        let basesym = match basesym {
            Some(s) => s,
            None => {
                logger.warn(format_args!(
                    "unable to correlate static local variable {} used by {}, assuming variable is new",
                    patched.symbol(sym_id).name,
                    section_function_name(patched, owning_sec)
                ));
                continue;
            }
        };

        let patched_sec_id = patched.symbol(sym_id).section.ok_or_else(|| Error::Internal("static local variable has no section".into()))?;
        let base_sec_id = base.symbol(basesym).section.ok_or_else(|| Error::Internal("static local variable has no section".into()))?;

        let bundled = patched.section(patched_sec_id).bundled == Some(sym_id);
        let base_bundled = base.section(base_sec_id).bundled == Some(basesym);
        if bundled != base_bundled {
            bug!("bundle mismatch for symbol {}", patched.symbol(sym_id).name);
        }
        if !bundled && patched.section(patched_sec_id).twin != Some(base_sec_id) {
            bug!("sections {} and {} aren't correlated", patched.section(patched_sec_id).name, base.section(base_sec_id).name);
        }

        let base_name = base.symbol(basesym).name.clone();
        log_debug!(logger, "renaming and correlating {} to {}", patched.symbol(sym_id).name, base_name);
        patched.symbol_mut(sym_id).name = base_name;
        patched.symbol_mut(sym_id).twin = Some(basesym);
        base.symbol_mut(basesym).twin = Some(sym_id);
        patched.symbol_mut(sym_id).status = Status::Same;
        base.symbol_mut(basesym).status = Status::Same;

        if bundled {
            patched.section_mut(patched_sec_id).twin = Some(base_sec_id);
            base.section_mut(base_sec_id).twin = Some(patched_sec_id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::constants::*;
    use crate::model::{Section, Symbol};

    fn blank_section(name: &str) -> Section {
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
    fn header_precheck_accepts_identical_headers() {
        let base = Object::new();
        let patched = Object::new();
        assert!(header_precheck(&base, &patched).is_ok());
    }

    #[test]
    fn header_precheck_rejects_entry_mismatch() {
        let base = Object::new();
        let mut patched = Object::new();
        patched.identity.e_entry = 42;
        assert!(header_precheck(&base, &patched).is_err());
    }

    #[test]
    fn program_headers_are_rejected() {
        let mut obj = Object::new();
        obj.identity.e_phnum = 1;
        assert!(check_no_program_headers(&obj).is_err());
    }

    #[test]
    fn sections_correlate_by_name() {
        let mut base = Object::new();
        let mut patched = Object::new();
        base.push_section(blank_section(".text.foo"));
        patched.push_section(blank_section(".text.foo"));
        correlate_sections(&mut base, &mut patched);
        assert_eq!(base.section(SectionId(0)).twin, Some(SectionId(0)));
        assert_eq!(base.section(SectionId(0)).status, Status::Same);
    }

    #[test]
    fn symbols_correlate_by_name_and_type() {
        let mut base = Object::new();
        let mut patched = Object::new();
        base.push_symbol(blank_symbol("foo", STB_GLOBAL, STT_FUNC));
        patched.push_symbol(blank_symbol("foo", STB_GLOBAL, STT_FUNC));
        correlate_symbols(&mut base, &mut patched);
        assert_eq!(base.symbol(SymbolId(0)).twin, Some(SymbolId(0)));
    }

    #[test]
    fn constant_labels_never_correlate() {
        let mut base = Object::new();
        let mut patched = Object::new();
        base.push_symbol(blank_symbol(".LC0", STB_LOCAL, STT_OBJECT));
        patched.push_symbol(blank_symbol(".LC1", STB_LOCAL, STT_OBJECT));
        correlate_symbols(&mut base, &mut patched);
        assert_eq!(base.symbol(SymbolId(0)).twin, None);
    }

    #[test]
    fn mangled_function_renamed_to_base_name() {
        let mut base = Object::new();
        let mut patched = Object::new();
        base.push_symbol(blank_symbol("sysctl_print_dir", STB_LOCAL, STT_FUNC));
        patched.push_symbol(blank_symbol("sysctl_print_dir.isra.2", STB_LOCAL, STT_FUNC));
        let logger = Logger::new(false);
        rename_mangled_functions(&mut base, &mut patched, &logger);
        assert_eq!(patched.symbol(SymbolId(0)).name, "sysctl_print_dir");
    }
}
