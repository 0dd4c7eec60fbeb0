//! Query language.
//!
//! ```text
//! list A[,B]               events with index in [A, B]
//! sys  A[,B] [ret OP N]    syscalls numbered A..=B, optionally by result
//! sig  A[,B]               signals A..=B
//! x11  A[,B]               X11 event types A..=B
//! dbus A[,B]               D-Bus message types A..=B
//! tid  N                   events of thread N
//! ```
//!
//! `OP` is one of `<`, `<=`, `==`, `>=`, `>`. Numbers are decimal or `0x`
//! hex. A range end below its start collapses to the start. Syscall and
//! signal bounds may also be names (`sys openat`, `sig SIGSEGV`).

use crate::error::QueryError;
use crate::seek::CmpOp;
use retrace_log::{Category, CategoryMask, EventHeader, signal_number, syscall_number};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a query selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    /// Index range, inclusive
    List {
        /// First index
        first: u64,
        /// Last index
        last: u64,
    },
    /// Code range within one category, inclusive
    Codes {
        /// Category searched
        category: Category,
        /// Lowest code
        first: u32,
        /// Highest code
        last: u32,
    },
    /// One thread
    Thread(u32),
}

/// Parsed query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Selection
    pub selector: Selector,
    /// Result comparison (syscalls only)
    pub result: Option<(CmpOp, i64)>,
}

fn parse_int(text: &str) -> Result<i64, QueryError> {
    let bad = || QueryError::InvalidNumber(text.to_string());
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text),
    };
    // One leading '-' at most; the digits carry no sign of their own.
    if !digits.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(bad());
    }
    match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) if !hex.starts_with(|c: char| c.is_ascii_hexdigit()) => Err(bad()),
        Some(hex) => i64::from_str_radix(&format!("{sign}{hex}"), 16).map_err(|_| bad()),
        None => text.parse::<i64>().map_err(|_| bad()),
    }
}

fn parse_unsigned(text: &str) -> Result<u64, QueryError> {
    u64::try_from(parse_int(text)?).map_err(|_| QueryError::InvalidNumber(text.to_string()))
}

fn parse_code(category: Category, text: &str) -> Result<u32, QueryError> {
    let named = match category {
        Category::Syscall => syscall_number(text),
        Category::Signal => signal_number(text),
        Category::X11 | Category::DBus => None,
    };
    if let Some(code) = named {
        return Ok(code);
    }
    u32::try_from(parse_int(text)?).map_err(|_| QueryError::InvalidNumber(text.to_string()))
}

/// Split `A[,B]`; `B < A` collapses to `A`
fn parse_range<T: Ord + Copy>(
    text: &str,
    parse: impl Fn(&str) -> Result<T, QueryError>,
) -> Result<(T, T), QueryError> {
    let (first, last) = match text.split_once(',') {
        Some((a, b)) => (parse(a.trim())?, parse(b.trim())?),
        None => {
            let a = parse(text.trim())?;
            (a, a)
        }
    };
    Ok((first, last.max(first)))
}

fn parse_comparison(text: &str) -> Result<(CmpOp, i64), QueryError> {
    let text = text.trim();
    let split = text
        .find(|c: char| !matches!(c, '<' | '>' | '='))
        .unwrap_or(text.len());
    let (symbol, value) = text.split_at(split);
    let op = CmpOp::parse(symbol).ok_or_else(|| QueryError::InvalidOperator(symbol.to_string()))?;
    Ok((op, parse_int(value.trim())?))
}

/// Split off a trailing `ret ...` clause; `ret` inside a name is left alone
fn split_condition(rest: &str) -> (&str, Option<&str>) {
    let mut from = 0;
    while let Some(pos) = rest[from..].find("ret") {
        let at = from + pos;
        let after = &rest[at + 3..];
        let word_start = at == 0 || rest[..at].ends_with(char::is_whitespace);
        let word_end = after.is_empty()
            || after.starts_with(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '='));
        if word_start && word_end {
            return (&rest[..at], Some(after));
        }
        from = at + 3;
    }
    (rest, None)
}

impl Query {
    /// Parse one query line
    ///
    /// # Errors
    ///
    /// Returns the first syntax problem
    pub fn parse(text: &str) -> Result<Self, QueryError> {
        let text = text.trim();
        let (command, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
        if command.is_empty() {
            return Err(QueryError::Empty);
        }
        let (range, condition) = split_condition(rest);
        let range = range.trim();
        let name: &'static str = match command {
            "list" => "list",
            "sys" => "sys",
            "sig" => "sig",
            "x11" => "x11",
            "dbus" => "dbus",
            "tid" => "tid",
            other => return Err(QueryError::UnknownCommand(other.to_string())),
        };
        if range.is_empty() {
            return Err(QueryError::MissingParameter(name));
        }
        if condition.is_some() && name != "sys" {
            return Err(QueryError::Trailing(format!("ret{}", condition.unwrap_or_default())));
        }

        let codes = |category: Category| -> Result<Selector, QueryError> {
            let (first, last) = parse_range(range, |t| parse_code(category, t))?;
            Ok(Selector::Codes {
                category,
                first,
                last,
            })
        };
        let selector = match name {
            "list" => {
                let (first, last) = parse_range(range, parse_unsigned)?;
                Selector::List { first, last }
            }
            "sys" => codes(Category::Syscall)?,
            "sig" => codes(Category::Signal)?,
            "x11" => codes(Category::X11)?,
            "dbus" => codes(Category::DBus)?,
            _ => {
                if range.contains(char::is_whitespace) {
                    return Err(QueryError::Trailing(range.to_string()));
                }
                let tid = u32::try_from(parse_unsigned(range)?)
                    .map_err(|_| QueryError::InvalidNumber(range.to_string()))?;
                Selector::Thread(tid)
            }
        };
        let result = condition.map(parse_comparison).transpose()?;
        Ok(Self { selector, result })
    }

    /// Categories the query can match
    #[must_use]
    pub fn mask(&self) -> CategoryMask {
        match self.selector {
            Selector::Codes { category, .. } => CategoryMask::only(category),
            Selector::List { .. } | Selector::Thread(_) => CategoryMask::ALL,
        }
    }

    /// Index range worth scanning in a trace of `len` events
    #[must_use]
    pub fn bounds(&self, len: u64) -> std::ops::Range<u64> {
        match self.selector {
            Selector::List { first, last } => first.min(len)..last.saturating_add(1).min(len),
            Selector::Codes { .. } | Selector::Thread(_) => 0..len,
        }
    }

    /// Whether `header` is selected
    #[must_use]
    pub fn matches(&self, header: &EventHeader) -> bool {
        let selected = match self.selector {
            Selector::List { first, last } => (first..=last).contains(&header.index),
            Selector::Codes {
                category,
                first,
                last,
            } => header.category == category && (first..=last).contains(&header.code),
            Selector::Thread(tid) => header.thread_id == tid,
        };
        selected
            && self
                .result
                .is_none_or(|(op, value)| op.holds(header.result, value))
    }
}

impl FromStr for Query {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.selector {
            Selector::List { first, last } => write!(f, "list {first},{last}")?,
            Selector::Codes {
                category,
                first,
                last,
            } => {
                let command = match category {
                    Category::Syscall => "sys",
                    Category::Signal => "sig",
                    Category::X11 => "x11",
                    Category::DBus => "dbus",
                };
                write!(f, "{command} {first},{last}")?;
            }
            Selector::Thread(tid) => write!(f, "tid {tid}")?,
        }
        if let Some((op, value)) = self.result {
            write!(f, " ret {op} {value}")?;
        }
        Ok(())
    }
}
