//! A byte-offset indexed string table: the `.strtab`/`.shstrtab` format.
//!
//! `Strtab` reads one out of a byte slice; `StrtabBuilder` is the write-side
//! counterpart, interning strings and returning their offsets.

#[inline(always)]
fn get_str(idx: usize, bytes: &[u8]) -> &str {
    if idx >= bytes.len() {
        return "";
    }
    let end = bytes[idx..].iter().position(|&b| b == 0).map(|p| idx + p).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[idx..end]).unwrap_or("")
}

pub struct Strtab<'a> {
    bytes: &'a [u8],
}

impl<'a> Strtab<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Strtab { bytes }
    }

    pub fn get(&self, idx: usize) -> &'a str {
        get_str(idx, self.bytes)
    }
}

/// Builds a fresh, NUL-delimited string table, returning each string's byte
/// offset as it is interned. Byte 0 is always the empty string, matching the
/// ELF convention that string-table offset 0 means "no name".
#[derive(Debug, Default)]
pub struct StrtabBuilder {
    bytes: Vec<u8>,
}

impl StrtabBuilder {
    pub fn new() -> Self {
        StrtabBuilder { bytes: vec![0u8] }
    }

    /// Interns `s`, always appending (the engine does not need de-dup: every
    /// caller site already knows whether it has seen a name before).
    pub fn add(&mut self, s: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        offset
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_embedded_names() {
        let bytes = b"\0printf\0memmove\0busta\0";
        let strtab = Strtab::new(bytes);
        assert_eq!(strtab.get(1), "printf");
        assert_eq!(strtab.get(8), "memmove");
        assert_eq!(strtab.get(16), "busta");
        assert_eq!(strtab.get(0), "");
    }

    #[test]
    fn out_of_range_is_empty() {
        let bytes = b"\0foo\0";
        let strtab = Strtab::new(bytes);
        assert_eq!(strtab.get(100), "");
    }

    #[test]
    fn builder_round_trips_through_parser() {
        let mut builder = StrtabBuilder::new();
        let off_a = builder.add("foo");
        let off_b = builder.add("barbaz");
        let bytes = builder.into_bytes();
        let strtab = Strtab::new(&bytes);
        assert_eq!(strtab.get(off_a as usize), "foo");
        assert_eq!(strtab.get(off_b as usize), "barbaz");
        assert_eq!(strtab.get(0), "");
    }
}
