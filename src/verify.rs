//! The Patchability verifier: a last gate before migration that rejects
//! inclusion decisions the assembler and the running kernel can't safely
//! act on.

use crate::diff_fatal;
use crate::elf::constants::SHT_GROUP;
use crate::error::Result;
use crate::logger::Logger;
use crate::log_normal;
use crate::model::{Object, Status};

/// Checks every section against the four patchability rules and fails with
/// a single `DIFF_FATAL` naming the count, after logging each violation.
pub fn verify_patchability(obj: &Object, logger: &Logger) -> Result<()> {
    let mut errs = 0;

    for id in obj.section_ids() {
        let sec = obj.section(id);

        if sec.status == Status::Changed && !sec.include {
            log_normal!(logger, "changed section {} not selected for inclusion", sec.name);
            errs += 1;
        }

        if sec.status != Status::Same && sec.grouped {
            log_normal!(logger, "changed section {} is part of a section group", sec.name);
            errs += 1;
        }

        if sec.sh_type == SHT_GROUP && sec.status == Status::New {
            log_normal!(logger, "new/changed group sections are not supported");
            errs += 1;
        }

        let is_data_or_bss = sec.name.starts_with(".data") || sec.name.starts_with(".bss");
        if sec.include && sec.status != Status::New && is_data_or_bss && sec.name != ".data.unlikely" {
            log_normal!(logger, "data section {} selected for inclusion", sec.name);
            errs += 1;
        }
    }

    if errs != 0 {
        diff_fatal!("{} unsupported section change(s)", errs);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::constants::*;
    use crate::model::Section;

    fn blank_section(name: &str, status: Status, include: bool) -> Section {
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
            status,
            index: 0,
        }
    }

    #[test]
    fn changed_section_not_included_is_fatal() {
        let mut obj = Object::new();
        obj.push_section(blank_section(".text.foo", Status::Changed, false));
        let logger = Logger::new(false);
        assert!(verify_patchability(&obj, &logger).is_err());
    }

    #[test]
    fn data_unlikely_is_exempt_from_the_data_section_rule() {
        let mut obj = Object::new();
        obj.push_section(blank_section(".data.unlikely", Status::Same, true));
        let logger = Logger::new(false);
        assert!(verify_patchability(&obj, &logger).is_ok());
    }

    #[test]
    fn included_data_section_is_fatal_unless_new() {
        let mut obj = Object::new();
        obj.push_section(blank_section(".data.foo", Status::Changed, true));
        let logger = Logger::new(false);
        assert!(verify_patchability(&obj, &logger).is_err());
    }

    #[test]
    fn new_data_section_is_allowed() {
        let mut obj = Object::new();
        obj.push_section(blank_section(".data.foo", Status::New, true));
        let logger = Logger::new(false);
        assert!(verify_patchability(&obj, &logger).is_ok());
    }

    #[test]
    fn grouped_changed_section_is_fatal() {
        let mut obj = Object::new();
        let mut sec = blank_section(".text.foo", Status::Changed, true);
        sec.grouped = true;
        obj.push_section(sec);
        let logger = Logger::new(false);
        assert!(verify_patchability(&obj, &logger).is_err());
    }
}
