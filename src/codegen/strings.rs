use std::collections::HashMap;

use crate::ir::{self, IrError};

/// Base linear-memory offset of the string data region.
pub const STRING_BASE: u32 = 65536;

/// One interned string literal: an 8-byte `{ptr, len}` descriptor followed
/// by the decoded bytes plus a NUL terminator.
#[derive(Debug, Clone)]
pub struct StringEntry {
    /// The quoted IR atom this entry was interned from.
    pub token: String,
    pub bytes: Vec<u8>,
    /// Linear-memory offset of the descriptor; this is the value a
    /// `(string …)` expression evaluates to.
    pub desc_addr: u32,
    /// Linear-memory offset of the first byte.
    pub data_addr: u32,
}

/// Insertion-ordered interning table. Populated by a pre-pass over every
/// function body and frozen before emission, so addresses are deterministic.
#[derive(Debug, Default)]
pub struct StringTable {
    entries: Vec<StringEntry>,
    by_token: HashMap<String, usize>,
}

impl StringTable {
    pub fn intern(&mut self, token: &str) -> Result<(), IrError> {
        if self.by_token.contains_key(token) {
            return Ok(());
        }
        let bytes = ir::decode_string_atom(token)?;
        let desc_addr = self
            .entries
            .last()
            .map(|e| align4(e.data_addr + e.bytes.len() as u32 + 1))
            .unwrap_or(STRING_BASE);
        let entry = StringEntry {
            token: token.to_owned(),
            data_addr: desc_addr + 8,
            desc_addr,
            bytes,
        };
        self.by_token.insert(token.to_owned(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Descriptor address of an already-interned literal.
    pub fn address_of(&self, token: &str) -> Option<u32> {
        self.by_token
            .get(token)
            .map(|&idx| self.entries[idx].desc_addr)
    }

    pub fn entries(&self) -> &[StringEntry] {
        &self.entries
    }
}

fn align4(addr: u32) -> u32 {
    (addr + 3) & !3
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_intern_assigns_insertion_order_addresses() {
        let mut table = StringTable::default();
        table.intern("\"hi\"").unwrap();
        table.intern("\"world\"").unwrap();
        table.intern("\"hi\"").unwrap();

        let entries = table.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].desc_addr, STRING_BASE);
        assert_eq!(entries[0].data_addr, STRING_BASE + 8);
        // descriptor + "hi" + NUL, rounded up to 4 bytes
        assert_eq!(entries[1].desc_addr, align4(STRING_BASE + 8 + 3));
        assert_eq!(table.address_of("\"hi\""), Some(STRING_BASE));
    }

    #[test]
    fn test_distinct_decoded_sequences_get_distinct_entries() {
        let mut table = StringTable::default();
        table.intern("\"a\"").unwrap();
        table.intern("\"a\\x00\"").unwrap();
        assert_eq!(table.entries().len(), 2);
    }
}
