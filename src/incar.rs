use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::fs::Fs;

/// An INCAR parameter file: `KEY = value` lines, keys case-insensitive.
/// Keeps the original key order, so edits only touch the lines they change.
/// Comments are not preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Incar {
    entries: Vec<(String, String)>,
}

impl Incar {
    pub fn parse(text: &str) -> Result<Self> {
        let mut incar = Self::default();
        for kv in syntax::parse_key_values(text)? {
            incar.set(kv.key, kv.val);
        }
        Ok(incar)
    }

    pub fn read(fs: &Fs, path: &Path) -> Result<Self> {
        let text = fs.read_to_string(path)?;
        Self::parse(&text).with_context(|| format!("while parsing {:?}", path))
    }

    pub fn write(&self, fs: &Fs, path: &Path) -> Result<()> {
        fs.write_file(path, &self.to_string())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_uppercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The value parsed as `T`; `None` if missing or unparseable.
    /// Fortran-style booleans (`.TRUE.`) are accepted for `bool`.
    pub fn get_as<T: FromStr>(&self, key: &str) -> Option<T> {
        let val = self.get(key)?;
        let val = val.trim_matches('.');
        val.parse()
            .ok()
            .or_else(|| val.to_lowercase().parse().ok())
    }

    /// Set a key, returning its previous value.
    pub fn set(&mut self, key: &str, val: &str) -> Option<String> {
        let key = key.to_uppercase();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, old)) => Some(std::mem::replace(old, val.to_owned())),
            None => {
                self.entries.push((key, val.to_owned()));
                None
            }
        }
    }

    /// Remove a key, returning its value if it was set.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let key = key.to_uppercase();
        let pos = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Incar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, val) in &self.entries {
            writeln!(f, "{key} = {val}")?;
        }
        Ok(())
    }
}
