//! Parser for the kernel build's `System.map`.
//!
//! One entry per line, `<hex-address> <kind-letter> <symbol>`. A symbol may
//! occur multiple times across translation units, so the table is a
//! multimap. The kind letter's case distinguishes local (lowercase) from
//! global (uppercase) binding.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::{InsightError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMapEntry {
    pub address: u64,
    /// The raw kind letter, e.g. `T`, `t`, `D`, `b`.
    pub kind: u8,
}

impl SystemMapEntry {
    pub fn is_global(&self) -> bool {
        self.kind.is_ascii_uppercase()
    }

    pub fn is_local(&self) -> bool {
        self.kind.is_ascii_lowercase()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemMap {
    entries: HashMap<String, Vec<SystemMapEntry>>,
}

impl SystemMap {
    pub fn load(path: &Path) -> Result<SystemMap> {
        let file = File::open(path)
            .map_err(|_| InsightError::FileNotFound(path.display().to_string()))?;
        Self::parse(BufReader::new(file))
    }

    pub fn parse<R: Read>(reader: BufReader<R>) -> Result<SystemMap> {
        let mut map = SystemMap::default();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let parsed = (|| {
                let addr = u64::from_str_radix(fields.next()?, 16).ok()?;
                let kind = fields.next()?.bytes().next()?;
                let sym = fields.next()?;
                // A fourth field means the line is not in System.map format.
                if fields.next().is_some() {
                    return None;
                }
                Some((addr, kind, sym.to_owned()))
            })();
            match parsed {
                Some((address, kind, sym)) => map
                    .entries
                    .entry(sym)
                    .or_default()
                    .push(SystemMapEntry { address, kind }),
                None => {
                    return Err(InsightError::SymbolParse(format!(
                        "System.map line {} is malformed: \"{}\"",
                        line_no + 1,
                        line
                    )))
                }
            }
        }
        Ok(map)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// First address registered for `symbol`, if any.
    pub fn address_of(&self, symbol: &str) -> Option<u64> {
        self.entries.get(symbol).and_then(|v| v.first()).map(|e| e.address)
    }

    /// All entries for `symbol`.
    pub fn entries_of(&self, symbol: &str) -> &[SystemMapEntry] {
        self.entries.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SystemMapEntry)> {
        self.entries
            .iter()
            .flat_map(|(k, v)| v.iter().map(move |e| (k.as_str(), e)))
    }

    pub fn insert(&mut self, symbol: String, entry: SystemMapEntry) {
        self.entries.entry(symbol).or_default().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    const SAMPLE: &str = "\
ffffffff81000000 T _text
ffffffff81000000 T startup_64
ffffffff8160b000 D init_level4_pgt
ffffffff81001000 t verify_cpu
";

    #[test]
    fn parses_entries() {
        let map = SystemMap::parse(BufReader::new(SAMPLE.as_bytes())).unwrap();
        assert_eq!(map.address_of("_text"), Some(0xffff_ffff_8100_0000));
        assert_eq!(map.entries_of("startup_64").len(), 1);
        assert!(map.entries_of("_text")[0].is_global());
        assert!(map.entries_of("verify_cpu")[0].is_local());
        assert!(!map.contains("nonexistent"));
    }

    #[test]
    fn duplicate_symbols_are_kept() {
        let text = "1000 t foo\n2000 t foo\n";
        let map = SystemMap::parse(BufReader::new(text.as_bytes())).unwrap();
        assert_eq!(map.entries_of("foo").len(), 2);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn malformed_line_is_rejected() {
        let text = "zzzz T _text\n";
        assert!(SystemMap::parse(BufReader::new(text.as_bytes())).is_err());
        let text = "1000 T foo bar\n";
        assert!(SystemMap::parse(BufReader::new(text.as_bytes())).is_err());
    }
}
