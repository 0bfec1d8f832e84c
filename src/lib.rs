//! Builds a live-patch relocatable object from a base and a patched ELF
//! object: correlate, compare, select what must ship, verify it's
//! patchable, then assemble and serialize the result.

pub mod assemble;
pub mod compare;
pub mod correlate;
pub mod elf;
pub mod error;
pub mod include;
pub mod insn;
pub mod logger;
pub mod lookup;
pub mod model;
pub mod names;
pub mod pipeline;
pub mod special;
pub mod verify;
