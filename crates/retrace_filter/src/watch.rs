//! Watched global variables.
//!
//! Syntax is `[*]name[+size]`; a leading star means the global holds a
//! pointer and the pointee is captured instead. Several entries may be
//! joined with commas.

use crate::error::FilterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bytes captured when the size is omitted
pub const DEFAULT_WATCH_SIZE: u32 = 1024;

/// One watched global
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WatchVar {
    /// Symbol name
    pub name: String,
    /// Dereference the global before capturing
    pub deref: bool,
    /// Bytes to capture, a multiple of 4
    pub size: u32,
}

impl WatchVar {
    /// Parse one `[*]name[+size]` entry
    ///
    /// # Errors
    ///
    /// Returns error if the name is empty or not an identifier, or the size
    /// is not a positive integer
    pub fn parse(expr: &str) -> Result<Self, FilterError> {
        let invalid = |reason: &str| FilterError::InvalidWatch {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = expr.trim();
        let (deref, rest) = match trimmed.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (name, size) = match rest.split_once('+') {
            Some((name, size)) => {
                let size: i64 = size.trim().parse().map_err(|_| invalid("size is not an integer"))?;
                if size <= 0 {
                    return Err(invalid("size must be positive"));
                }
                let size = u32::try_from(size).map_err(|_| invalid("size too large"))?;
                (name.trim(), size)
            }
            None => (rest.trim(), DEFAULT_WATCH_SIZE),
        };

        if name.is_empty() {
            return Err(invalid("missing name"));
        }
        if !is_symbol(name) {
            return Err(invalid("name is not a symbol"));
        }

        Ok(Self {
            name: name.to_string(),
            deref,
            size: round_up4(size).ok_or_else(|| invalid("size too large"))?,
        })
    }

    /// Parse a comma-separated list; empty input yields an empty list
    ///
    /// # Errors
    ///
    /// Returns the first entry's error
    pub fn parse_list(list: &str) -> Result<Vec<Self>, FilterError> {
        list.split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

fn round_up4(size: u32) -> Option<u32> {
    size.checked_add(3).map(|s| s & !3)
}

pub(crate) fn is_symbol(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == ':')
}

impl fmt::Display for WatchVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.deref {
            f.write_str("*")?;
        }
        write!(f, "{}+{}", self.name, self.size)
    }
}

impl FromStr for WatchVar {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WatchVar {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WatchVar> for String {
    fn from(var: WatchVar) -> Self {
        var.to_string()
    }
}
