//! retrace CLI
//!
//! Record a Linux process into a session directory, then replay, inspect,
//! correlate and delete sessions.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod render;
mod shell;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use console::style;
use retrace_core::CancelToken;
use retrace_filter::{FilterConfig, FilterOverrides, load_config};
use retrace_recorder::{Recorder, RecorderNotice, Target};
use retrace_replay::ReplayController;
use retrace_store::{SessionSummary, TraceDir, TraceStore, delete_session, list_sessions};
use shell::Shell;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable naming the sessions directory
const SESSIONS_ENV: &str = "RETRACE_SESSIONS";

/// Link to the most recent recording inside the sessions directory
const LATEST: &str = "latest";

#[derive(Parser)]
#[command(name = "retrace")]
#[command(about = "retrace - record and replay Linux processes", long_about = None)]
struct Cli {
    /// Directory holding sessions (default: $RETRACE_SESSIONS, then ~/.local/share/retrace)
    #[arg(long, global = true)]
    sessions: Option<PathBuf>,
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Filter flags shared by `record` and `config`
#[derive(Debug, Args)]
struct FilterArgs {
    /// Filter config file (default: $RETRACE_CONFIG, then ~/.config/retrace.json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Watched globals: [*]name+size[,...]
    #[arg(long = "var")]
    vars: Option<String>,
    /// Record only after this function returns
    #[arg(long)]
    func: Option<String>,
    /// Syscall allow-list: group, name or number[,...]
    #[arg(long)]
    sys: Option<String>,
    /// Signal allow-list
    #[arg(long)]
    signal: Option<String>,
    /// X11 event types; enables X11 capture
    #[arg(long)]
    x11: Option<String>,
    /// D-Bus message types; enables D-Bus capture
    #[arg(long)]
    dbus: Option<String>,
    /// Stack bytes captured per event
    #[arg(long, allow_hyphen_values = true)]
    stack_size: Option<i64>,
    /// Heap KB captured per event
    #[arg(long, allow_hyphen_values = true)]
    heap_size: Option<i64>,
    /// Bytes captured per buffer argument
    #[arg(long, allow_hyphen_values = true)]
    param_size: Option<i64>,
    /// Record only the originating thread
    #[arg(short = '1', long)]
    current_thread: bool,
}

impl FilterArgs {
    fn overrides(&self) -> FilterOverrides {
        FilterOverrides {
            vars: self.vars.clone(),
            func: self.func.clone(),
            sys: self.sys.clone(),
            signal: self.signal.clone(),
            x11: self.x11.clone(),
            dbus: self.dbus.clone(),
            stack_size: self.stack_size,
            heap_size: self.heap_size,
            param_size: self.param_size,
            current_thread: self.current_thread,
        }
    }

    fn load(&self) -> Result<FilterConfig> {
        let base = load_config(self.config.as_deref())?;
        Ok(self.overrides().apply(base)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Record a new session
    Record {
        #[command(flatten)]
        filter: FilterArgs,
        /// Attach to a running process instead of launching one
        #[arg(short, long, conflicts_with = "command")]
        pid: Option<u32>,
        /// Session directory (default: a new directory under the sessions directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Program and arguments to launch
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Replay a session interactively
    Replay {
        /// Session directory or name (default: latest)
        session: Option<PathBuf>,
        /// Minidump to merge
        #[arg(short, long)]
        minidump: Option<PathBuf>,
        /// Run shell commands and exit instead of reading stdin
        #[arg(short = 'e', long = "exec")]
        exec: Vec<String>,
    },
    /// List recorded sessions
    List,
    /// Show a session summary
    Info {
        /// Session directory or name (default: latest)
        session: Option<PathBuf>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the reconstructed state at an event
    State {
        /// Event index
        index: u64,
        /// Session directory or name (default: latest)
        #[arg(short, long)]
        session: Option<PathBuf>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a minidump
    Dump {
        /// Minidump file
        path: PathBuf,
    },
    /// Place a minidump on a session's timeline
    Correlate {
        /// Minidump file
        minidump: PathBuf,
        /// Session directory or name (default: latest)
        #[arg(short, long)]
        session: Option<PathBuf>,
    },
    /// Delete a session
    Delete {
        /// Session directory or name
        session: PathBuf,
    },
    /// Show the effective filter configuration
    Config {
        #[command(flatten)]
        filter: FilterArgs,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("retrace=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn sessions_root(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(SESSIONS_ENV).filter(|v| !v.is_empty()).map(PathBuf::from))
        .or_else(|| {
            std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("share").join("retrace"))
        })
        .unwrap_or_else(|| PathBuf::from("retrace-sessions"))
}

/// A session path as given, or a name under `root`; `None` means the latest
fn resolve_session(root: &Path, session: Option<&Path>) -> Result<PathBuf> {
    let candidates = match session {
        Some(path) => vec![path.to_path_buf(), root.join(path)],
        None => vec![root.join(LATEST)],
    };
    candidates
        .into_iter()
        .find(|p| TraceDir::new(p).is_session())
        .ok_or_else(|| match session {
            Some(path) => eyre!("no session at {}", path.display()),
            None => eyre!("no recordings yet in {}", root.display()),
        })
}

/// Point `root/latest` at `dir`
fn update_latest(root: &Path, dir: &Path) {
    let link = root.join(LATEST);
    let target = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let _ = std::fs::remove_file(&link);
    if let Err(e) = std::os::unix::fs::symlink(&target, &link) {
        warn!(link = %link.display(), error = %e, "Could not update latest link");
    }
}

fn session_dir_name(target: &Target) -> String {
    let stem = match target {
        Target::Launch { program, .. } => program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string()),
        Target::Pid(pid) => format!("pid{pid}"),
    };
    format!("{stem}-{}", chrono::Local::now().format("%Y%m%d-%H%M%S%.3f"))
}

/// Look a bare program name up on `PATH`
fn resolve_program(program: &str) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(program))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| PathBuf::from(program))
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn make_recorder(config: &FilterConfig) -> Result<Recorder> {
    Ok(Recorder::ptrace(config)?)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn make_recorder(_config: &FilterConfig) -> Result<Recorder> {
    bail!("recording needs Linux on x86_64")
}

async fn record(
    root: &Path,
    filter: &FilterArgs,
    pid: Option<u32>,
    output: Option<PathBuf>,
    command: Vec<String>,
) -> Result<SessionSummary> {
    let config = filter.load().wrap_err("invalid filter configuration")?;
    let target = match (pid, command.split_first()) {
        (Some(pid), None) => Target::Pid(pid),
        (None, Some((program, args))) => Target::launch(resolve_program(program), args.to_vec()),
        (Some(_), Some(_)) => bail!("give either --pid or a command, not both"),
        (None, None) => bail!("nothing to record: give --pid or a command"),
    };
    let default_dir = output.is_none();
    let dir = match output {
        Some(dir) => dir,
        None => {
            std::fs::create_dir_all(root)
                .wrap_err_with(|| format!("cannot create {}", root.display()))?;
            root.join(session_dir_name(&target))
        }
    };

    let recorder = make_recorder(&config)?;
    let mut notices = recorder.subscribe();
    let recording = recorder.start(target, dir.clone()).await?;
    if default_dir {
        update_latest(root, &dir);
    }

    let spinner = render::spinner(format!("recording pid {}", recording.pid()));
    let stop = recording.stop_handle();
    let wait = recording.wait();
    tokio::pin!(wait);
    let mut stopping = false;
    let summary = loop {
        tokio::select! {
            result = &mut wait => break result?,
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                spinner.set_message("stopping");
                stop.stop();
            }
            notice = notices.recv() => match notice {
                Ok(RecorderNotice::Committed { index, .. }) => {
                    spinner.set_message(format!("{} events", index + 1));
                }
                Ok(RecorderNotice::Warning(warning)) => {
                    spinner.println(format!("{} {warning}", style("warning:").yellow()));
                }
                Ok(RecorderNotice::Started { .. } | RecorderNotice::StatusChanged(_))
                | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break (&mut wait).await?,
            },
        }
    };
    spinner.finish_and_clear();
    info!(dir = %dir.display(), events = summary.event_count, "Session saved");
    Ok(summary)
}

fn replay(root: &Path, session: Option<&Path>, minidump: Option<&Path>, exec: &[String]) -> Result<()> {
    let dir = resolve_session(root, session)?;
    let mut controller = ReplayController::open(&dir)?;
    if let Some(path) = minidump {
        controller.attach_minidump(path)?;
    }
    let mut shell = Shell::new(controller);
    if exec.is_empty() {
        return shell.interactive();
    }
    let mut stdout = std::io::stdout();
    for line in exec {
        if shell.execute(line, &mut stdout)? == shell::Flow::Quit {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.log_format);
    let root = sessions_root(cli.sessions);

    match cli.command {
        Commands::Record {
            filter,
            pid,
            output,
            command,
        } => {
            let summary = record(&root, &filter, pid, output, command).await?;
            print!("{}", render::summary(&summary));
        }
        Commands::Replay {
            session,
            minidump,
            exec,
        } => {
            tokio::task::block_in_place(|| replay(&root, session.as_deref(), minidump.as_deref(), &exec))?;
        }
        Commands::List => {
            if !root.is_dir() {
                println!("no sessions in {}", root.display());
                return Ok(());
            }
            let sessions = list_sessions(&root)?;
            print!("{}", render::session_table(&sessions));
        }
        Commands::Info { session, json } => {
            let dir = resolve_session(&root, session.as_deref())?;
            let store = TraceStore::open(&dir)?;
            let spinner = render::spinner("scanning events");
            let summary = SessionSummary::collect(&store, &CancelToken::never());
            spinner.finish_and_clear();
            let summary = summary?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", render::summary(&summary));
            }
        }
        Commands::State {
            index,
            session,
            json,
        } => {
            let dir = resolve_session(&root, session.as_deref())?;
            let controller = ReplayController::open(&dir)?;
            let state = controller.state_at(index, &CancelToken::never())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                print!("{}", render::state(&state));
            }
        }
        Commands::Dump { path } => {
            let dump = retrace_dump::load(&path)?;
            print!("{}", render::minidump(&dump));
        }
        Commands::Correlate { minidump, session } => {
            let dir = resolve_session(&root, session.as_deref())?;
            let store = TraceStore::open(&dir)?;
            let dump = retrace_dump::load(&minidump)?;
            let correlation = retrace_dump::correlate(&dump, &store)?;
            print!("{}", render::correlation(&correlation));
        }
        Commands::Delete { session } => {
            let dir = resolve_session(&root, Some(&session))?;
            delete_session(&dir)?;
            println!("deleted {}", dir.display());
        }
        Commands::Config { filter, json } => {
            let config = filter.load()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                for (key, value) in config.summary() {
                    println!("{key:<20} {value}");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use retrace_store::CreateOptions;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_record_flags() {
        let cli = Cli::parse_from([
            "retrace", "record", "--var", "*g+8", "--sys", "file", "-1", "--stack-size", "64", "--",
            "/bin/ls", "-l",
        ]);
        let Commands::Record { filter, command, pid, .. } = cli.command else {
            panic!("expected record");
        };
        assert_eq!(command, vec!["/bin/ls".to_string(), "-l".to_string()]);
        assert_eq!(pid, None);
        let overrides = filter.overrides();
        assert!(overrides.current_thread);
        assert_eq!(overrides.stack_size, Some(64));
        assert_eq!(overrides.vars.as_deref(), Some("*g+8"));
    }

    #[test]
    fn test_resolve_session() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("demo-1");
        TraceStore::create(&dir, CreateOptions::new("/bin/demo", 1)).unwrap();

        assert_eq!(resolve_session(tmp.path(), Some(Path::new("demo-1"))).unwrap(), dir);
        assert_eq!(resolve_session(tmp.path(), Some(&dir)).unwrap(), dir);
        assert!(resolve_session(tmp.path(), None).is_err());

        update_latest(tmp.path(), &dir);
        let latest = resolve_session(tmp.path(), None).unwrap();
        assert_eq!(latest, tmp.path().join(LATEST));
        assert!(resolve_session(tmp.path(), Some(Path::new("nope"))).is_err());
    }

    #[test]
    fn test_session_dir_name() {
        let name = session_dir_name(&Target::launch("/usr/bin/demo", Vec::new()));
        assert!(name.starts_with("demo-"));
        assert!(session_dir_name(&Target::Pid(42)).starts_with("pid42-"));
    }

    #[test]
    fn test_resolve_program_keeps_paths() {
        assert_eq!(resolve_program("./a.out"), PathBuf::from("./a.out"));
        assert_eq!(resolve_program("/bin/true"), PathBuf::from("/bin/true"));
    }
}
