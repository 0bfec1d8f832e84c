//! Orchestrates the full run: parse both inputs, correlate, compare,
//! decide what ships, verify it's patchable, assemble, serialize. Mirrors
//! the original tool's `main()` call order.

use crate::assemble;
use crate::compare;
use crate::correlate;
use crate::elf::{reader, writer};
use crate::error::Result;
use crate::include::{self, InclusionSummary};
use crate::insn::X86_64InstructionBoundary;
use crate::logger::Logger;
use crate::lookup::SymbolLookup;
use crate::special;
use crate::verify;

/// What a run produced: either the finished patch object's bytes, or a
/// confirmation that base and patched carry no patchable difference.
pub enum Outcome {
    NoChanges,
    Patch(Vec<u8>),
}

/// Runs the full differencing pipeline over `base_bytes`/`patched_bytes`,
/// resolving `--resolve`'s kernel addresses through `lookup` when `resolve`
/// is set.
pub fn run(base_bytes: &[u8], patched_bytes: &[u8], lookup: &dyn SymbolLookup, resolve: bool, logger: &Logger) -> Result<Outcome> {
    let mut base = reader::parse(base_bytes)?;
    let mut patched = reader::parse(patched_bytes)?;

    let decoder = X86_64InstructionBoundary;
    correlate::correlate(&mut base, &mut patched, &decoder, logger)?;
    compare::compare(&mut base, &mut patched, logger)?;

    let summary: InclusionSummary = include::include(&mut patched, logger)?;
    if !summary.has_changes() {
        return Ok(Outcome::NoChanges);
    }

    special::process(&mut patched, logger)?;
    verify::verify_patchability(&patched, logger)?;

    let out = assemble::assemble(&mut patched, lookup, resolve, logger)?;
    let bytes = writer::write(&out)?;

    Ok(Outcome::Patch(bytes))
}
