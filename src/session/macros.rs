//! Macros (symbols) the MTA defines for the session.
//!
//! The MTA sends batches of symbol/value pairs ahead of the command they
//! belong to. Later stages see everything defined earlier, so the session
//! keeps one accumulating map and attaches a snapshot of it to every command
//! it hands to the application.

/// Insertion-ordered symbol map. Single-byte names and their braced spelling
/// (`i` and `{i}`) are the same key; normalization happens on insert and
/// lookup. Redefinition overwrites the value but keeps the original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroMap {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

fn normalize(symbol: &[u8]) -> &[u8] {
    if symbol.len() > 2 && symbol.first() == Some(&b'{') && symbol.last() == Some(&b'}') {
        &symbol[1..symbol.len() - 1]
    } else {
        symbol
    }
}

impl MacroMap {
    pub fn define(&mut self, symbol: &[u8], value: &[u8]) {
        let symbol = normalize(symbol);
        match self.entries.iter_mut().find(|(k, _)| k.as_slice() == symbol) {
            Some((_, slot)) => *slot = value.to_vec(),
            None => self.entries.push((symbol.to_vec(), value.to_vec())),
        }
    }

    pub fn get(&self, symbol: &[u8]) -> Option<&[u8]> {
        let symbol = normalize(symbol);
        self.entries
            .iter()
            .find(|(k, _)| k.as_slice() == symbol)
            .map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
