//! Per-category code allow-lists.
//!
//! An empty list admits every code.

use crate::error::FilterError;
use retrace_log::{SyscallGroup, syscall_number};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Syscall allow-list: groups plus explicit numbers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyscallAllow {
    /// Admitted groups
    pub groups: Vec<SyscallGroup>,
    /// Admitted syscall numbers
    pub numbers: Vec<u32>,
}

impl SyscallAllow {
    /// Parse a `--sys` style list: group names, syscall names or numbers
    ///
    /// # Errors
    ///
    /// Returns error on an entry that is neither
    pub fn parse(list: &str) -> Result<Self, FilterError> {
        let mut allow = Self::default();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some(group) = SyscallGroup::parse(entry) {
                allow.groups.push(group);
            } else if let Some(nr) = parse_code(entry).or_else(|| syscall_number(entry)) {
                allow.numbers.push(nr);
            } else {
                return Err(FilterError::InvalidAllowEntry {
                    field: "syscalls",
                    entry: entry.to_string(),
                });
            }
        }
        Ok(allow)
    }

    /// Whether every syscall is admitted
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.groups.is_empty() && self.numbers.is_empty()
    }

    /// Whether syscall `nr` is admitted
    #[must_use]
    pub fn admits(&self, nr: u32) -> bool {
        self.is_all() || self.numbers.contains(&nr) || self.groups.iter().any(|g| g.contains(nr))
    }

    /// Expand to the concrete set of admitted numbers; `None` means all
    #[must_use]
    pub fn expand(&self) -> Option<BTreeSet<u32>> {
        if self.is_all() {
            return None;
        }
        let mut set: BTreeSet<u32> = self.numbers.iter().copied().collect();
        for group in &self.groups {
            set.extend(group.members());
        }
        Some(set)
    }
}

/// Allow-list of signal numbers, X11 event types or D-Bus message types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeAllow(pub Vec<u32>);

impl CodeAllow {
    /// Parse a comma-separated list of decimal or `0x` codes
    ///
    /// # Errors
    ///
    /// Returns error on a non-numeric entry
    pub fn parse(field: &'static str, list: &str) -> Result<Self, FilterError> {
        list.split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(|entry| {
                parse_code(entry).ok_or_else(|| FilterError::InvalidAllowEntry {
                    field,
                    entry: entry.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Whether `code` is admitted
    #[must_use]
    pub fn admits(&self, code: u32) -> bool {
        self.0.is_empty() || self.0.contains(&code)
    }
}

fn parse_code(entry: &str) -> Option<u32> {
    match entry.strip_prefix("0x").or_else(|| entry.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => entry.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_syscall_allow_admits_all() {
        let allow = SyscallAllow::default();
        assert!(allow.is_all());
        assert!(allow.admits(0));
        assert!(allow.admits(9999));
        assert!(allow.expand().is_none());
    }

    #[test]
    fn test_syscall_allow_mixed() {
        let allow = SyscallAllow::parse("network, 60, exit_group").unwrap();
        assert!(allow.admits(42));
        assert!(allow.admits(60));
        assert!(allow.admits(231));
        assert!(!allow.admits(0));
        let set = allow.expand().unwrap();
        assert!(set.contains(&41) && set.contains(&231));
    }

    #[test]
    fn test_syscall_allow_rejects_unknown() {
        let err = SyscallAllow::parse("desc,nonsense").unwrap_err();
        assert_eq!(err.field(), "syscalls");
    }

    #[test]
    fn test_code_allow() {
        let allow = CodeAllow::parse("signals", "15, 0x11").unwrap();
        assert!(allow.admits(15));
        assert!(allow.admits(17));
        assert!(!allow.admits(18));
        assert!(CodeAllow::default().admits(99));
        assert!(CodeAllow::parse("x11", "2,key").is_err());
    }
}
