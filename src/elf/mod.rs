//! ELF64 byte-level codec: constants, on-disk structures, string tables, and
//! the reader/writer pair that cross the boundary between raw bytes and the
//! element model in [`crate::model`].

pub mod constants;
pub mod reader;
pub mod strtab;
pub mod wire;
pub mod writer;
