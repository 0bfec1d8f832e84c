//! On-disk ELF64 structures, read and written with `scroll`'s derive macros.
//!
//! `#[repr(C)]` structs deriving `Pread`/`Pwrite`/`SizeWith`, collapsed into
//! one file since this engine only ever speaks ELF64 little-endian.

use scroll::{Pread, Pwrite, SizeWith};

use crate::elf::constants::EI_NIDENT;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Default, Pread, Pwrite, SizeWith)]
pub struct Ehdr {
    pub e_ident: [u8; EI_NIDENT],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

pub const SIZEOF_EHDR: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

pub const SIZEOF_SHDR: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

pub const SIZEOF_SYM: usize = 24;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct Rela {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

pub const SIZEOF_RELA: usize = 24;

/// Minimum patchable prologue length: a `jmp rel32` on x86-64, the smallest
/// sequence the kernel's patch loader can overwrite with a trampoline.
pub const PATCH_INSN_SIZE: u64 = 5;

/// Padded so `size_of::<PatchFunc>()` lands on a 32-byte boundary.
pub const PATCH_FUNC_PAD: usize = 24;

pub const SIZEOF_PATCH_FUNC: usize = 64;

/// Byte offset of the `new_addr` field within `PatchFunc`, for the
/// relocation that fills it in at module load time.
pub const PATCH_FUNC_NEW_ADDR_OFFSET: u64 = 16;

/// Byte offset of the `name` field within `PatchFunc`, for the relocation
/// that fills it in at module load time.
pub const PATCH_FUNC_NAME_OFFSET: u64 = 32;

/// One `.xsplice.funcs` record: the ABI the live kernel's patch loader reads.
/// `old_addr`, `new_addr` and `name` are written zero and populated either by
/// `--resolve` (for `old_addr`) or by the two `R_X86_64_64` relocations
/// attached to each record.
#[repr(C)]
#[derive(Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct PatchFunc {
    pub old_addr: u64,
    pub old_size: u64,
    pub new_addr: u64,
    pub new_size: u64,
    pub name: u64,
    pub pad: [u8; PATCH_FUNC_PAD],
}
