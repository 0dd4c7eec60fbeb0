//! Interactive replay shell.
//!
//! One command per line. Movement commands print the event the cursor
//! lands on; query commands print the matching events and keep them as the
//! current view for `order`.

use crate::render;
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use console::style;
use regex::bytes::Regex;
use retrace_core::{CancelToken, MonoTime};
use retrace_log::{Category, CategoryMask, Direction};
use retrace_replay::{CmpOp, Predicate, ReplayController, ReplayError, View};
use retrace_store::OrderKey;
use std::io::{BufRead, Write};

/// Traces above this size get a spinner during scans
const SPINNER_THRESHOLD: u64 = 200_000;

const HELP: &str = "\
h                              show this help
n / p                          next / previous event
<index>                        jump to an event
log 0|1                        1: print state after each move
state [index]                  reconstructed state at index or cursor
list A[,B]                     events with index in [A, B]
sys A[,B] [ret OP N]           syscalls A..=B, OP one of < <= == >= >
sig A[,B]                      signals A..=B
x11 A[,B]                      X11 events A..=B
dbus A[,B]                     D-Bus messages A..=B
tid N                          events of thread N
order KEY [desc]               sort the last listing: index|duration|result|threads
seek time NS | index N         next event at or after a time or index
seek cat NAME | tid N          next event of a category or thread
seek ret OP N | re REGEX       next event by result or payload regex
crash                          show the merged minidump
q                              quit";

/// What the caller should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next command
    Continue,
    /// Leave the shell
    Quit,
}

/// Replay shell over one controller
pub struct Shell {
    controller: ReplayController,
    verbose: bool,
    view: Option<View>,
}

fn parse_index(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| eyre!("invalid number: {text}"))
}

fn parse_predicate(args: &str) -> Result<Predicate> {
    let (kind, rest) = args.trim().split_once(char::is_whitespace).unwrap_or((args.trim(), ""));
    let rest = rest.trim();
    if rest.is_empty() {
        bail!("seek {kind} needs an argument");
    }
    Ok(match kind {
        "time" => Predicate::TimestampAtLeast(MonoTime::from_nanos(parse_index(rest)?)),
        "index" => Predicate::IndexAtLeast(parse_index(rest)?),
        "cat" => {
            let category = Category::parse(rest).ok_or_else(|| eyre!("unknown category: {rest}"))?;
            Predicate::Category(CategoryMask::only(category))
        }
        "tid" => {
            let tid = u32::try_from(parse_index(rest)?).map_err(|_| eyre!("invalid thread id: {rest}"))?;
            Predicate::Thread(tid)
        }
        "ret" => {
            let split = rest
                .find(|c: char| !matches!(c, '<' | '>' | '='))
                .unwrap_or(rest.len());
            let (symbol, value) = rest.split_at(split);
            let op = CmpOp::parse(symbol).ok_or_else(|| eyre!("invalid operator: {symbol}"))?;
            let value: i64 = value.trim().parse().map_err(|_| eyre!("invalid number: {value}"))?;
            Predicate::Result(op, value)
        }
        "re" => Predicate::PayloadRegex(Regex::new(rest)?),
        other => bail!("unknown seek kind: {other}"),
    })
}

impl Shell {
    /// Shell positioned before the first event
    pub fn new(controller: ReplayController) -> Self {
        Self {
            controller,
            verbose: false,
            view: None,
        }
    }

    /// Controller driven by the shell
    #[cfg(test)]
    pub fn controller(&self) -> &ReplayController {
        &self.controller
    }

    fn cancel_token(&self) -> CancelToken {
        CancelToken::new()
    }

    fn with_spinner<T>(&self, message: &str, f: impl FnOnce() -> T) -> T {
        if self.controller.len() < SPINNER_THRESHOLD {
            return f();
        }
        let bar = render::spinner(message.to_string());
        let out = f();
        bar.finish_and_clear();
        out
    }

    fn show_current(&self, out: &mut impl Write) -> Result<()> {
        match self.controller.position() {
            Some(index) => {
                writeln!(out, "{}", self.controller.describe(index)?)?;
                if self.verbose {
                    let state = self.controller.state_at(index, &self.cancel_token())?;
                    write!(out, "{}", render::state(&state))?;
                }
            }
            None => writeln!(out, "before the first event")?,
        }
        Ok(())
    }

    fn show_view(&self, view: &View, out: &mut impl Write) -> Result<()> {
        for &index in view.indices() {
            writeln!(out, "{}", self.controller.describe(index)?)?;
        }
        writeln!(out, "{} events", view.len())?;
        Ok(())
    }

    /// Run one command line
    ///
    /// # Errors
    ///
    /// Returns error on a malformed command or a failed read; the shell
    /// stays usable either way
    pub fn execute(&mut self, line: &str, out: &mut impl Write) -> Result<Flow> {
        let line = line.trim();
        let (command, args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match command {
            "" => {}
            "q" | "quit" => return Ok(Flow::Quit),
            "h" | "help" => writeln!(out, "{HELP}")?,
            "n" => {
                if self.controller.next()?.is_none() {
                    writeln!(out, "reached the end, last index is {}", self.controller.len().saturating_sub(1))?;
                }
                self.show_current(out)?;
            }
            "p" => {
                if self.controller.previous()?.is_none() {
                    writeln!(out, "reached the start")?;
                }
                self.show_current(out)?;
            }
            "log" => {
                self.verbose = args.trim() == "1";
                writeln!(out, "verbose {}", if self.verbose { "on" } else { "off" })?;
            }
            "state" => {
                let cancel = self.cancel_token();
                let state = match args.trim() {
                    "" => self.controller.current_state(&cancel)?,
                    index => {
                        let index = parse_index(index)?;
                        self.with_spinner("reconstructing", || self.controller.state_at(index, &cancel))?
                    }
                };
                write!(out, "{}", render::state(&state))?;
            }
            "list" | "sys" | "sig" | "x11" | "dbus" | "tid" => {
                let cancel = self.cancel_token();
                let view = self.with_spinner("searching", || self.controller.query_str(line, &cancel))?;
                self.show_view(&view, out)?;
                self.view = Some(view);
            }
            "order" => {
                let mut words = args.split_whitespace();
                let key = words.next().unwrap_or("index");
                let key = OrderKey::parse(key).ok_or_else(|| eyre!("unknown order key: {key}"))?;
                let descending = words.next() == Some("desc");
                let cancel = self.cancel_token();
                let view = match self.view.take() {
                    Some(mut view) => {
                        view.reorder(key, descending, &cancel)?;
                        view
                    }
                    None => self.with_spinner("sorting", || {
                        self.controller.ordered(CategoryMask::ALL, key, descending, &cancel)
                    })?,
                };
                self.show_view(&view, out)?;
                self.view = Some(view);
            }
            "seek" => {
                let predicate = parse_predicate(args)?;
                let from = self.controller.position().map_or(0, |p| p + 1);
                let cancel = self.cancel_token();
                let outcome = self.with_spinner("seeking", || {
                    self.controller.seek_from(&predicate, from, Direction::Forward, &cancel)
                })?;
                match outcome.index {
                    Some(index) => {
                        self.controller.goto(index)?;
                        self.show_current(out)?;
                    }
                    None => writeln!(out, "no match after {} comparisons", outcome.comparisons)?,
                }
            }
            "crash" => match self.controller.postmortem() {
                Some(postmortem) => {
                    write!(out, "{}", render::minidump(postmortem.dump()))?;
                    write!(out, "{}", render::correlation(postmortem.correlation()))?;
                }
                None => writeln!(out, "no minidump merged")?,
            },
            _ if command.chars().all(|c| c.is_ascii_digit()) => {
                let index = parse_index(command)?;
                match self.controller.goto(index) {
                    Ok(_) => self.show_current(out)?,
                    Err(ReplayError::Store(_)) if index >= self.controller.len() => {
                        writeln!(out, "index is not valid, last index is {}", self.controller.len().saturating_sub(1))?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            other => writeln!(out, "unknown command {other}, press h for help")?,
        }
        Ok(Flow::Continue)
    }

    /// Read commands from stdin until `q` or end of input
    ///
    /// # Errors
    ///
    /// Returns error if the terminal cannot be read or written
    pub fn interactive(&mut self) -> Result<()> {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        eprintln!(
            "press h for help, last index is {}",
            self.controller.len().saturating_sub(1)
        );
        let mut line = String::new();
        loop {
            eprint!("{} ", style("retrace>").cyan());
            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                return Ok(());
            }
            match self.execute(&line, &mut stdout) {
                Ok(Flow::Quit) => return Ok(()),
                Ok(Flow::Continue) => {}
                Err(e) => eprintln!("{} {e}", style("error:").red()),
            }
            stdout.flush()?;
        }
    }
}
