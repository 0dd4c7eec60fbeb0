//! Recording sessions.
//!
//! [`Recorder::start`] attaches through a [`Backend`], creates the trace
//! directory once the target is held, and then runs three tasks: the tracer
//! thread (blocking, one per target), the optional preload listener and the
//! writer that reorders captured events and appends them to the store. A
//! supervisor joins them and finalizes the session.

use crate::driver::{DriveContext, DriveReport, Termination, drive};
use crate::error::{AttachError, RecorderError, RecorderResult};
use crate::gate::{Gate, SharedGate};
use crate::preload::{EVENT_SOCKET_ENV, ListenerContext, PreloadListener};
use crate::sequencer::{Captured, Sequencer};
use crate::tracer::{Backend, Target, TracePlan};
use retrace_core::{CancelToken, MonoClock, SessionId};
use retrace_filter::{CompiledFilter, FilterConfig};
use retrace_log::{Category, Event};
use retrace_store::{CreateOptions, SessionStatus, SessionSummary, StoreError, TraceStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Progress reported to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderNotice {
    /// Target held and trace directory created
    Started {
        /// New session
        session_id: SessionId,
        /// Traced process
        pid: u32,
    },
    /// Event appended to the trace
    Committed {
        /// Event index
        index: u64,
        /// Event kind
        category: Category,
    },
    /// Non-fatal problem
    Warning(String),
    /// Session status written
    StatusChanged(SessionStatus),
}

/// Starts recordings with one filter and backend
pub struct Recorder {
    filter: Arc<CompiledFilter>,
    backend: Arc<dyn Backend>,
    notices: broadcast::Sender<RecorderNotice>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Compile `config` for `backend`
    ///
    /// # Errors
    ///
    /// Returns error if the filter does not validate
    pub fn new(config: &FilterConfig, backend: Arc<dyn Backend>) -> RecorderResult<Self> {
        let filter = CompiledFilter::compile(config)?;
        let (notices, _) = broadcast::channel(1024);
        Ok(Self {
            filter: Arc::new(filter),
            backend,
            notices,
        })
    }

    /// Recorder using the ptrace backend
    ///
    /// # Errors
    ///
    /// Returns error if the filter does not validate
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn ptrace(config: &FilterConfig) -> RecorderResult<Self> {
        Self::new(config, Arc::new(crate::ptrace::PtraceBackend::new()))
    }

    /// Compiled filter in use
    #[must_use]
    pub fn filter(&self) -> &CompiledFilter {
        &self.filter
    }

    /// Receive progress notices from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderNotice> {
        self.notices.subscribe()
    }

    fn plan(&self, env: Vec<(String, String)>) -> TracePlan {
        TracePlan {
            syscalls: self.filter.enabled(Category::Syscall),
            syscall_set: self.filter.syscall_set().cloned(),
            // fatal signals are needed for crash capture even when the
            // signal category is off
            signals: true,
            trigger: self.filter.trigger.clone(),
            env,
        }
    }

    /// Attach to `target` and record into a new session at `dir`. Nothing
    /// is created on disk if the attach fails or times out.
    ///
    /// # Errors
    ///
    /// Returns an attach error, or a store error if the session directory
    /// cannot be created
    pub async fn start(&self, target: Target, dir: impl Into<PathBuf>) -> RecorderResult<Recording> {
        let dir = dir.into();
        let session_id = SessionId::new();
        let clock = MonoClock::start();
        let abort = CancelToken::new();
        let tunables = self.filter.tunables.clone();

        let listener = if self.filter.needs_preload() {
            let path = std::env::temp_dir().join(format!("retrace-{session_id}.sock"));
            Some(PreloadListener::bind(path)?)
        } else {
            None
        };
        let mut env = Vec::new();
        if let Some(listener) = &listener {
            env.push((
                EVENT_SOCKET_ENV.to_string(),
                listener.path().display().to_string(),
            ));
            if !tunables.preload.is_empty() {
                let libs: Vec<String> = tunables
                    .preload
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                env.push(("LD_PRELOAD".to_string(), libs.join(":")));
            }
        }
        let plan = self.plan(env);

        let (tx, rx) = mpsc::channel::<Captured>(tunables.queue_depth);
        let listener_tx = listener.as_ref().map(|_| tx.clone());
        let (ready_tx, ready_rx) = oneshot::channel();
        let tracer_task = {
            let backend = Arc::clone(&self.backend);
            let filter = Arc::clone(&self.filter);
            let abort = abort.clone();
            let target = target.clone();
            let notices = self.notices.clone();
            tokio::task::spawn_blocking(move || {
                let mut tracer = match backend.attach(&target, &plan, clock) {
                    Ok(tracer) => tracer,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return None;
                    }
                };
                let gate = Gate::new(
                    tracer.pid(),
                    filter.trigger.is_some(),
                    filter.current_thread_only,
                )
                .shared();
                for tid in tracer.threads() {
                    gate.lock().thread_started(tid);
                }
                let ready = (tracer.pid(), tracer.target_path(), Arc::clone(&gate));
                if ready_tx.send(Ok(ready)).is_err() {
                    debug!("Attach finished after the deadline, releasing target");
                    tracer.terminate();
                    return None;
                }
                let ctx = DriveContext {
                    filter,
                    gate,
                    clock,
                    session_id,
                    abort,
                    notices,
                };
                Some(drive(tracer.as_mut(), &ctx, &tx))
            })
        };

        let deadline = Duration::from_millis(tunables.attach_timeout_ms);
        let (pid, target_path, gate): (u32, String, SharedGate) =
            match tokio::time::timeout(deadline, ready_rx).await {
                Err(_) => {
                    abort.cancel();
                    warn!(%target, timeout_ms = tunables.attach_timeout_ms, "Attach timed out");
                    return Err(AttachError::TimedOut {
                        target: target.to_string(),
                        timeout_ms: tunables.attach_timeout_ms,
                    }
                    .into());
                }
                Ok(Err(_)) => {
                    return Err(RecorderError::Task {
                        reason: "tracer thread ended before attaching".to_string(),
                    });
                }
                Ok(Ok(Err(e))) => return Err(e.into()),
                Ok(Ok(Ok(ready))) => ready,
            };

        let options = CreateOptions::new(target_path, pid)
            .with_clock(&clock)
            .with_sync(tunables.sync)
            .with_session_id(session_id);
        let store = match TraceStore::create(&dir, options) {
            Ok(store) => store,
            Err(e) => {
                abort.cancel();
                self.backend.interrupt(pid);
                drop(rx);
                let _ = tracer_task.await;
                return Err(e.into());
            }
        };
        info!(%session_id, pid, dir = %dir.display(), "Recording started");
        let _ = self.notices.send(RecorderNotice::Started { session_id, pid });

        let listener_task = listener.zip(listener_tx).map(|(listener, tx)| {
            let ctx = ListenerContext {
                filter: Arc::clone(&self.filter),
                gate,
                clock,
            };
            tokio::spawn(listener.run(ctx, tx))
        });
        let writer = Writer {
            store: store.clone(),
            sequencer: Sequencer::new(
                tunables.reorder_window_ms.saturating_mul(1_000_000),
                store.len(),
            ),
            clock,
            tick: Duration::from_millis(tunables.reorder_window_ms.max(1)),
            notices: self.notices.clone(),
        };
        let writer_task = tokio::spawn(writer.run(rx));
        let supervisor = tokio::spawn(supervise(Supervision {
            store: store.clone(),
            tracer: tracer_task,
            listener: listener_task,
            writer: writer_task,
            notices: self.notices.clone(),
        }));

        Ok(Recording {
            store,
            session_id,
            pid,
            abort,
            backend: Arc::clone(&self.backend),
            supervisor,
        })
    }
}

/// Reorders captured events and appends them
struct Writer {
    store: TraceStore,
    sequencer: Sequencer,
    clock: MonoClock,
    tick: Duration,
    notices: broadcast::Sender<RecorderNotice>,
}

impl Writer {
    fn commit(&self, events: Vec<Event>) -> Result<(), StoreError> {
        for event in events {
            self.store.append(&event)?;
            let _ = self.notices.send(RecorderNotice::Committed {
                index: event.header.index,
                category: event.header.category,
            });
        }
        Ok(())
    }

    /// Run until every producer is gone; returns the clamped event count
    async fn run(mut self, mut rx: mpsc::Receiver<Captured>) -> Result<u64, StoreError> {
        let mut tick = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(captured) => self.sequencer.push(captured),
                    None => break,
                },
                _ = tick.tick() => {}
            }
            let ready = self.sequencer.drain_ready(self.clock.now());
            self.commit(ready)?;
        }
        let rest = self.sequencer.flush();
        self.commit(rest)?;
        Ok(self.sequencer.clamped())
    }
}

struct Supervision {
    store: TraceStore,
    tracer: JoinHandle<Option<DriveReport>>,
    listener: Option<JoinHandle<()>>,
    writer: JoinHandle<Result<u64, StoreError>>,
    notices: broadcast::Sender<RecorderNotice>,
}

async fn supervise(s: Supervision) -> RecorderResult<SessionSummary> {
    let mut warnings = Vec::new();
    let mut dropped = 0;
    let termination = match s.tracer.await {
        Ok(Some(report)) => {
            dropped = report.dropped;
            report.termination
        }
        Ok(None) => Termination::Lost {
            reason: "target released before recording".to_string(),
        },
        Err(e) => Termination::Lost {
            reason: format!("tracer thread failed: {e}"),
        },
    };
    if let Some(listener) = s.listener {
        listener.abort();
        let _ = listener.await;
    }
    match s.writer.await {
        Ok(Ok(0)) => {}
        Ok(Ok(clamped)) => warnings.push(format!(
            "{clamped} events arrived outside the reorder window and were clamped"
        )),
        Ok(Err(e)) => {
            error!(error = %e, "Trace writer failed");
            warnings.push(format!("trace writer failed: {e}"));
        }
        Err(e) => warnings.push(format!("trace writer task failed: {e}")),
    }

    let status = match &termination {
        Termination::Exited { .. } | Termination::Forced => SessionStatus::Complete,
        Termination::Killed { signo, dump } => {
            if let Some(dump) = dump {
                let bytes = retrace_dump::encode(dump);
                if let Err(e) = s.store.attach_minidump(&bytes) {
                    warnings.push(format!("minidump could not be written: {e}"));
                }
            }
            info!(signo, "Target crashed");
            SessionStatus::Crashed
        }
        Termination::Lost { reason } => {
            warnings.push(format!("tracer lost: {reason}"));
            SessionStatus::Complete
        }
    };
    for warning in &warnings {
        warn!(%warning, "Recording finished with a warning");
        let _ = s.notices.send(RecorderNotice::Warning(warning.clone()));
    }
    s.store.finalize(status)?;
    let _ = s.notices.send(RecorderNotice::StatusChanged(status));

    let mut summary = SessionSummary::collect(&s.store, &CancelToken::never())?;
    for warning in warnings {
        summary.warn(warning);
    }
    // each drop was announced when it happened
    if dropped > 0 {
        summary.warn(format!("{dropped} events dropped: payload could not be encoded"));
    }
    info!(
        events = summary.event_count,
        status = ?status,
        "Recording finished"
    );
    Ok(summary)
}

/// A running recording
pub struct Recording {
    store: TraceStore,
    session_id: SessionId,
    pid: u32,
    abort: CancelToken,
    backend: Arc<dyn Backend>,
    supervisor: JoinHandle<RecorderResult<SessionSummary>>,
}

impl std::fmt::Debug for Recording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recording")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Recording {
    /// Store being written; readers see events as they commit
    #[must_use]
    pub fn store(&self) -> &TraceStore {
        &self.store
    }

    /// Session id
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Traced process
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Handle that can stop the recording while it is being awaited
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            abort: self.abort.clone(),
            backend: Arc::clone(&self.backend),
            pid: self.pid,
        }
    }

    /// Stop recording and release the target
    ///
    /// # Errors
    ///
    /// Returns error if the session could not be finalized
    pub async fn stop(self) -> RecorderResult<SessionSummary> {
        self.stop_handle().stop();
        self.wait().await
    }

    /// Wait for the target to go away
    ///
    /// # Errors
    ///
    /// Returns error if the session could not be finalized
    pub async fn wait(self) -> RecorderResult<SessionSummary> {
        self.supervisor.await.map_err(|e| RecorderError::Task {
            reason: e.to_string(),
        })?
    }
}

/// Requests a stop of a running recording
#[derive(Clone)]
pub struct StopHandle {
    abort: CancelToken,
    backend: Arc<dyn Backend>,
    pid: u32,
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle").field("pid", &self.pid).finish_non_exhaustive()
    }
}

impl StopHandle {
    /// Abort the tracer and interrupt the target; repeated calls do nothing
    pub fn stop(&self) {
        if self.abort.is_cancelled() {
            return;
        }
        info!(pid = self.pid, "Stop requested");
        self.abort.cancel();
        self.backend.interrupt(self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::{ScriptedBackend, ScriptedTracer, Stop};
    use retrace_core::MonoTime;
    use retrace_log::{CategoryMask, Payload, Section};

    fn recorder(config: &FilterConfig, script: ScriptedTracer) -> Recorder {
        Recorder::new(config, Arc::new(ScriptedBackend::new(script))).unwrap()
    }

    fn fast(mut config: FilterConfig) -> FilterConfig {
        config.tunables.reorder_window_ms = 1;
        config
    }

    fn launch() -> Target {
        Target::launch("/bin/demo", Vec::new())
    }

    #[tokio::test]
    async fn test_syscall_only_recording() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast(FilterConfig::default().with_categories(CategoryMask::only(Category::Syscall)));
        let mut script = ScriptedTracer::new(40, "/bin/demo").memory(0x1000, vec![0xAB; 600]);
        for i in 0..5u64 {
            script = script.syscall(40, 1, [1, 0x1000, 600, 0, 0, 0], 600, 10_000 + i * 1_000);
        }
        let script = script.stop(Stop::Exited { code: 0 });

        let rec = recorder(&config, script);
        let recording = rec.start(launch(), tmp.path().join("s1")).await.unwrap();
        let store = recording.store().clone();
        let summary = recording.wait().await.unwrap();

        assert_eq!(summary.event_count, 5);
        assert_eq!(summary.count(Category::Syscall), 5);
        assert_eq!(summary.meta.status, SessionStatus::Complete);
        for i in 0..5 {
            let event = store.read(i).unwrap();
            assert_eq!(event.header.index, i);
            assert_eq!(event.header.category, Category::Syscall);
            let payload = Payload::decode(&event.payload).unwrap();
            assert!(payload.iter().all(|s| s.bytes().is_none_or(|b| b.len() <= 256)));
            assert!(!payload.iter().any(|s| matches!(s, Section::Heap { .. })));
            assert!(payload.iter().any(|s| matches!(s, Section::Memory { .. })));
        }
    }

    #[tokio::test]
    async fn test_trigger_never_fires_records_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast(FilterConfig::default().with_trigger("main"));
        let script = ScriptedTracer::new(50, "/bin/demo")
            .symbol("main", 0x401000)
            .syscall(50, 0, [0; 6], 0, 1_000)
            .syscall(50, 1, [0; 6], 0, 2_000)
            .hold();

        let rec = recorder(&config, script);
        let recording = rec.start(launch(), tmp.path().join("s2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let summary = recording.stop().await.unwrap();

        assert_eq!(summary.event_count, 0);
        assert_eq!(summary.meta.status, SessionStatus::Complete);
    }

    #[tokio::test]
    async fn test_stop_handle_ends_wait() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast(FilterConfig::default().all_threads());
        let script = ScriptedTracer::new(52, "/bin/demo")
            .syscall(52, 0, [0; 6], 0, 1_000)
            .hold();

        let rec = recorder(&config, script);
        let recording = rec.start(launch(), tmp.path().join("sh")).await.unwrap();
        let handle = recording.stop_handle();
        let waiter = tokio::spawn(recording.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();
        handle.stop();
        let summary = waiter.await.unwrap().unwrap();
        assert_eq!(summary.event_count, 1);
        assert_eq!(summary.meta.status, SessionStatus::Complete);
    }

    #[tokio::test]
    async fn test_trigger_opens_gate() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast(FilterConfig::default().with_trigger("main"));
        let script = ScriptedTracer::new(51, "/bin/demo")
            .symbol("main", 0x401000)
            .syscall(51, 0, [0; 6], 0, 1_000)
            .stop(Stop::TriggerReturned {
                tid: 51,
                at: MonoTime::from_nanos(1_500),
            })
            .syscall(51, 1, [0; 6], 0, 2_000)
            .stop(Stop::Exited { code: 0 });

        let summary = recorder(&config, script)
            .start(launch(), tmp.path().join("s"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(summary.event_count, 1);
    }

    #[tokio::test]
    async fn test_exit_before_trigger_is_complete_and_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast(FilterConfig::default().with_trigger("main"));
        let script = ScriptedTracer::new(52, "/bin/demo")
            .symbol("main", 0x401000)
            .syscall(52, 60, [0; 6], 0, 1_000)
            .stop(Stop::Exited { code: 3 });

        let summary = recorder(&config, script)
            .start(launch(), tmp.path().join("s"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(summary.event_count, 0);
        assert_eq!(summary.meta.status, SessionStatus::Complete);
    }

    #[tokio::test]
    async fn test_disabled_category_yields_no_events() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast(FilterConfig::default().with_categories(CategoryMask::only(Category::Signal)));
        let script = ScriptedTracer::new(60, "/bin/demo")
            .syscall(60, 0, [0; 6], 0, 1_000)
            .syscall(60, 1, [0; 6], 0, 2_000)
            .stop(Stop::Exited { code: 0 });

        let summary = recorder(&config, script)
            .start(launch(), tmp.path().join("s"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(summary.event_count, 0);
    }

    #[tokio::test]
    async fn test_current_thread_only() {
        let script = || {
            ScriptedTracer::new(70, "/bin/demo")
                .stop(Stop::ThreadStarted { tid: 71 })
                .syscall(71, 0, [0; 6], 0, 1_000)
                .syscall(70, 1, [0; 6], 0, 2_000)
                .stop(Stop::Exited { code: 0 })
        };
        let tmp = tempfile::tempdir().unwrap();

        let only = recorder(&fast(FilterConfig::default()), script())
            .start(launch(), tmp.path().join("only"))
            .await
            .unwrap();
        let store = only.store().clone();
        let summary = only.wait().await.unwrap();
        assert_eq!(summary.event_count, 1);
        let header = store.read_header(0).unwrap();
        assert_eq!(header.thread_id, 70);
        assert_eq!(header.thread_count, 2);

        let all = recorder(&fast(FilterConfig::default().all_threads()), script())
            .start(launch(), tmp.path().join("all"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(all.event_count, 2);
    }

    #[tokio::test]
    async fn test_crash_writes_linked_minidump() {
        let tmp = tempfile::tempdir().unwrap();
        let script = ScriptedTracer::new(80, "/bin/crashy")
            .thread(80, vec![7; 216], 0x7000)
            .memory(0x7000, vec![0; 64])
            .syscall(80, 1, [0; 6], 0, 1_000)
            .stop(Stop::Signal {
                tid: 80,
                signo: 11,
                code: 1,
                fault_addr: 0x10,
                at: MonoTime::from_nanos(5_000),
            })
            .stop(Stop::Killed { signo: 11 });

        let recording = recorder(&fast(FilterConfig::default()), script)
            .start(launch(), tmp.path().join("crash"))
            .await
            .unwrap();
        let session_id = recording.session_id();
        let store = recording.store().clone();
        let summary = recording.wait().await.unwrap();

        assert_eq!(summary.meta.status, SessionStatus::Crashed);
        assert!(summary.has_minidump);
        assert_eq!(summary.count(Category::Signal), 1);
        let dump = retrace_dump::load(&store.minidump_path().unwrap()).unwrap();
        assert_eq!(dump.session_id, session_id);
        assert_eq!(dump.signal, 11);
        assert_eq!(dump.fault_tid, 80);
    }

    #[tokio::test]
    async fn test_attach_timeout_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = FilterConfig::default();
        config.tunables.attach_timeout_ms = 20;
        let script = ScriptedTracer::new(90, "/bin/slow").attach_delay(Duration::from_millis(200));
        let dir = tmp.path().join("never");

        let err = recorder(&config, script).start(launch(), &dir).await.unwrap_err();
        assert!(matches!(
            err,
            RecorderError::Attach(AttachError::TimedOut { timeout_ms: 20, .. })
        ));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_attach_failure_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = FilterConfig::default().with_trigger("missing_fn");
        let dir = tmp.path().join("never");
        let err = recorder(&config, ScriptedTracer::new(91, "/bin/x"))
            .start(Target::Pid(91), &dir)
            .await
            .unwrap_err();
        assert!(matches!(err, RecorderError::Attach(AttachError::TargetNotFound { .. })));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_notices() {
        let tmp = tempfile::tempdir().unwrap();
        let script = ScriptedTracer::new(95, "/bin/demo")
            .syscall(95, 0, [0; 6], 0, 1_000)
            .syscall(95, 1, [0; 6], 0, 2_000)
            .stop(Stop::Exited { code: 0 });
        let rec = recorder(&fast(FilterConfig::default()), script);
        let mut notices = rec.subscribe();
        rec.start(launch(), tmp.path().join("n"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            seen.push(notice);
        }
        assert!(matches!(seen[0], RecorderNotice::Started { pid: 95, .. }));
        let committed: Vec<u64> = seen
            .iter()
            .filter_map(|n| match n {
                RecorderNotice::Committed { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(committed, vec![0, 1]);
        assert_eq!(
            seen.last(),
            Some(&RecorderNotice::StatusChanged(SessionStatus::Complete))
        );
    }

    #[tokio::test]
    async fn test_zero_ceilings_store_empty_payloads() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast(FilterConfig {
            param_bytes: 0,
            stack_bytes: 0,
            ..FilterConfig::default()
        });
        let script = ScriptedTracer::new(41, "/bin/demo")
            .memory(0x1000, vec![b'x'; 600])
            .thread(41, vec![1; 16], 0x1000)
            .syscall(41, 1, [1, 0x1000, 600, 0, 0, 0], 600, 5_000)
            .stop(Stop::Exited { code: 0 });

        let recording = recorder(&config, script)
            .start(launch(), tmp.path().join("z"))
            .await
            .unwrap();
        let store = recording.store().clone();
        let summary = recording.wait().await.unwrap();

        assert_eq!(summary.event_count, 1);
        let event = store.read(0).unwrap();
        assert_eq!(event.header.code, 1);
        assert_eq!(event.header.result, 600);
        assert!(event.payload.is_empty());
    }

    #[tokio::test]
    async fn test_thread_exit_reaches_trace() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast(FilterConfig {
            stack_bytes: 0,
            ..FilterConfig::default().all_threads()
        });
        let script = ScriptedTracer::new(70, "/bin/demo")
            .stop(Stop::ThreadStarted { tid: 71 })
            .syscall(71, 39, [0; 6], 71, 1_000)
            .stop(Stop::ThreadExited { tid: 71 })
            .syscall(70, 39, [0; 6], 70, 2_000)
            .syscall(70, 39, [0; 6], 70, 3_000)
            .stop(Stop::Exited { code: 0 });

        let recording = recorder(&config, script)
            .start(launch(), tmp.path().join("t"))
            .await
            .unwrap();
        let store = recording.store().clone();
        assert_eq!(recording.wait().await.unwrap().event_count, 3);

        let threads = |i: u64| -> Option<Vec<u32>> {
            let event = store.read(i).unwrap();
            Payload::decode(&event.payload).unwrap().into_iter().find_map(|s| match s {
                Section::Threads { tids } => Some(tids),
                _ => None,
            })
        };
        assert_eq!(threads(0), Some(vec![70, 71]));
        assert_eq!(store.read_header(0).unwrap().thread_count, 2);
        assert_eq!(threads(1), Some(vec![70]));
        assert_eq!(store.read_header(1).unwrap().thread_count, 1);
        assert_eq!(threads(2), None);
    }

    #[tokio::test]
    async fn test_dropped_events_reach_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::create(tmp.path().join("d"), CreateOptions::new("/bin/demo", 1)).unwrap();
        let (notices, _) = broadcast::channel(8);
        let summary = supervise(Supervision {
            store,
            tracer: tokio::spawn(async {
                Some(DriveReport {
                    termination: Termination::Exited { code: 0 },
                    dropped: 2,
                })
            }),
            listener: None,
            writer: tokio::spawn(async { Ok(0) }),
            notices,
        })
        .await
        .unwrap();
        assert_eq!(summary.meta.status, SessionStatus::Complete);
        assert!(
            summary.warnings.iter().any(|w| w.starts_with("2 events dropped")),
            "{:?}",
            summary.warnings
        );
    }
}
