//! Executable symbol lookup.

use crate::error::{RecorderError, RecorderResult};
use object::{Object, ObjectKind, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Function and data symbols of one executable
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: HashMap<String, u64>,
    position_independent: bool,
}

impl SymbolTable {
    /// Read the static and dynamic symbol tables of an ELF file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not an object file
    pub fn load(path: &Path) -> RecorderResult<Self> {
        let data = std::fs::read(path).map_err(|e| RecorderError::Tracer {
            reason: format!("read {}: {e}", path.display()),
        })?;
        let file = object::File::parse(&*data).map_err(|e| RecorderError::Tracer {
            reason: format!("parse {}: {e}", path.display()),
        })?;

        let mut entries = HashMap::new();
        for symbol in file.symbols().chain(file.dynamic_symbols()) {
            if symbol.address() == 0 || !matches!(symbol.kind(), SymbolKind::Text | SymbolKind::Data) {
                continue;
            }
            if let Ok(name) = symbol.name() {
                entries.entry(name.to_string()).or_insert(symbol.address());
            }
        }
        debug!(path = %path.display(), symbols = entries.len(), "Loaded symbols");
        Ok(Self {
            entries,
            position_independent: file.kind() == ObjectKind::Dynamic,
        })
    }

    /// Table from explicit entries
    #[must_use]
    pub fn from_entries<I, S>(entries: I, position_independent: bool) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(n, a)| (n.into(), a)).collect(),
            position_independent,
        }
    }

    /// Link-time address
    #[must_use]
    pub fn address(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    /// Address in a process that mapped the executable at `load_base`
    #[must_use]
    pub fn runtime_address(&self, name: &str, load_base: u64) -> Option<u64> {
        let addr = self.address(name)?;
        Some(if self.position_independent {
            load_base.wrapping_add(addr)
        } else {
            addr
        })
    }

    /// Number of symbols
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no symbol was found
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
