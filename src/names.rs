//! Name classification shared by the Correlator and Comparator: mangled-name
//! comparison, special statics, and constant labels. Pulled out of both
//! stages because §4.2 and §4.3 each depend on all three.

use crate::elf::constants::{STB_LOCAL, STT_OBJECT, STT_SECTION};
use crate::model::{Object, SymbolId};

/// Like `strcmp`, but skips over any `.` followed by a run of digits on
/// both sides. Reflexive and symmetric; for names with no `.digit` run it
/// reduces to strict equality (§8 property 8).
pub fn mangled_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);
    loop {
        match (a.get(i), b.get(j)) {
            (None, None) => return true,
            (Some(&ca), Some(&cb)) if ca == cb => {
                if ca == b'.' && i + 1 < a.len() && a[i + 1].is_ascii_digit() {
                    if !(j + 1 < b.len() && b[j + 1].is_ascii_digit()) {
                        return false;
                    }
                    i += 1;
                    while i < a.len() && a[i].is_ascii_digit() {
                        i += 1;
                    }
                    j += 1;
                    while j < b.len() && b[j].is_ascii_digit() {
                        j += 1;
                    }
                } else {
                    i += 1;
                    j += 1;
                }
            }
            _ => return false,
        }
    }
}

/// `.LC<digits>`, local binding: compiler-generated constant data labels.
/// Two constant labels always compare equal by construction even though
/// their names differ (§4.3).
pub fn is_constant_label(name: &str, bind: u8) -> bool {
    if bind != STB_LOCAL {
        return false;
    }
    match name.strip_prefix(".LC") {
        Some(rest) if !rest.is_empty() => rest.bytes().all(|b| b.is_ascii_digit()),
        _ => false,
    }
}

const SPECIAL_STATIC_PREFIXES: &[&str] = &["__key.", "__warned.", "descriptor.", "__func__.", "_rs."];

/// Special static local variables are never correlated and are always
/// included whole if referenced. A `STT_SECTION` symbol is special if it
/// names `__verbose`, or (after indirecting through the section's bundled
/// symbol, if any) if the underlying object symbol matches.
pub fn is_special_static(obj: &Object, sym_id: SymbolId) -> bool {
    let sym = obj.symbol(sym_id);
    if sym.sym_type() == STT_SECTION {
        if sym.name == "__verbose" {
            return true;
        }
        let bundled = match sym.section.and_then(|s| obj.section(s).bundled) {
            Some(b) => b,
            None => return false,
        };
        return is_special_static(obj, bundled);
    }
    if sym.sym_type() != STT_OBJECT || sym.bind() != STB_LOCAL {
        return false;
    }
    SPECIAL_STATIC_PREFIXES.iter().any(|p| sym.name.starts_with(p))
}

/// The name of the function a section (or its relocation section) belongs
/// to, used only in diagnostics (`xsplice_section_function_name`).
pub fn section_function_name<'a>(obj: &'a Object, section: crate::model::SectionId) -> &'a str {
    let sec = obj.section(section);
    let base = if sec.is_relocation() { sec.base } else { Some(section) };
    match base {
        Some(id) => {
            let s = obj.section(id);
            match s.bundled {
                Some(sym) => obj.symbol(sym).name.as_str(),
                None => s.name.as_str(),
            }
        }
        None => sec.name.as_str(),
    }
}
