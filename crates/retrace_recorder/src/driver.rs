//! Tracer thread loop.

use crate::capture::{CaptureContext, Detail, Observation, capture};
use crate::crash::{self, Fault};
use crate::gate::SharedGate;
use crate::recorder::RecorderNotice;
use crate::sequencer::Captured;
use crate::tracer::{Stop, Tracer};
use retrace_core::{CancelToken, CoreError, MonoClock, MonoTime, SessionId};
use retrace_dump::Minidump;
use retrace_filter::CompiledFilter;
use retrace_log::Category;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// How the traced process went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Termination {
    /// Exited on its own
    Exited { code: i32 },
    /// Killed by a signal, with the snapshot taken when it was delivered
    Killed { signo: i32, dump: Option<Box<Minidump>> },
    /// Stopped by the recorder
    Forced,
    /// The tracer or the writer failed
    Lost { reason: String },
}

/// What the tracer thread hands back
#[derive(Debug)]
pub(crate) struct DriveReport {
    pub termination: Termination,
    /// Kept events whose payload could not be encoded
    pub dropped: u64,
}

/// Inputs of the tracer thread
pub(crate) struct DriveContext {
    pub filter: Arc<CompiledFilter>,
    pub gate: SharedGate,
    pub clock: MonoClock,
    pub session_id: SessionId,
    pub abort: CancelToken,
    pub notices: broadcast::Sender<RecorderNotice>,
}

impl DriveContext {
    fn keep(&self, category: Category, code: u32, tid: u32, at: MonoTime) -> Option<u16> {
        if !self.filter.admits(category, code) {
            return None;
        }
        let gate = self.gate.lock();
        gate.admits(tid, at).then(|| gate.thread_count())
    }
}

fn send(tx: &mpsc::Sender<Captured>, captured: Captured) -> bool {
    tx.blocking_send(captured).is_ok()
}

fn report_drop(ctx: &DriveContext, observation: &Observation<'_>, error: &CoreError, dropped: &mut u64) {
    *dropped += 1;
    warn!(
        error = %error,
        category = %observation.category,
        code = observation.code,
        tid = observation.tid,
        "Dropping event with unencodable payload"
    );
    let _ = ctx.notices.send(RecorderNotice::Warning(format!(
        "dropped {} event {} on tid {}: {error}",
        observation.category, observation.code, observation.tid
    )));
}

/// Pump stops from `tracer` into the capture queue until the target is gone
pub(crate) fn drive(
    tracer: &mut dyn Tracer,
    ctx: &DriveContext,
    tx: &mpsc::Sender<Captured>,
) -> DriveReport {
    let mut dropped = 0;
    let termination = pump(tracer, ctx, tx, &mut dropped);
    DriveReport {
        termination,
        dropped,
    }
}

fn pump(
    tracer: &mut dyn Tracer,
    ctx: &DriveContext,
    tx: &mpsc::Sender<Captured>,
    dropped: &mut u64,
) -> Termination {
    let mut crash_dump: Option<Minidump> = None;
    // the first kept event after a thread comes or goes lists the live set
    let mut threads_changed = false;
    loop {
        let stop = match tracer.next_stop(&ctx.abort) {
            Ok(Some(stop)) => stop,
            Ok(None) if ctx.abort.is_cancelled() => {
                tracer.terminate();
                info!("Recording stopped on request");
                return Termination::Forced;
            }
            Ok(None) => return Termination::Exited { code: 0 },
            Err(e) => {
                warn!(error = %e, "Tracer failed");
                tracer.terminate();
                return Termination::Lost {
                    reason: e.to_string(),
                };
            }
        };

        let observation = match stop {
            Stop::Syscall {
                tid,
                nr,
                args,
                result,
                entered_at,
                exited_at,
            } => ctx
                .keep(Category::Syscall, nr, tid, exited_at)
                .map(|thread_count| Observation {
                    category: Category::Syscall,
                    code: nr,
                    tid,
                    thread_count,
                    at: exited_at,
                    duration: exited_at.since(entered_at),
                    result,
                    detail: Detail::Syscall { args },
                }),
            Stop::Signal {
                tid,
                signo,
                code,
                fault_addr,
                at,
            } => {
                if crash::is_fatal(signo) {
                    let fault = Fault {
                        tid,
                        signo,
                        fault_addr,
                        at,
                    };
                    crash_dump = Some(crash::snapshot(
                        tracer.inspector(),
                        ctx.session_id,
                        ctx.clock.offset(),
                        fault,
                    ));
                }
                let code_u32 = u32::try_from(signo).unwrap_or(0);
                ctx.keep(Category::Signal, code_u32, tid, at)
                    .map(|thread_count| Observation {
                        category: Category::Signal,
                        code: code_u32,
                        tid,
                        thread_count,
                        at,
                        duration: 0,
                        result: 0,
                        detail: Detail::Signal {
                            signo,
                            code,
                            fault_addr,
                        },
                    })
            }
            Stop::TriggerReturned { tid, at } => {
                ctx.gate.lock().open(tid, at);
                None
            }
            Stop::ThreadStarted { tid } => {
                debug!(tid, "Thread started");
                ctx.gate.lock().thread_started(tid);
                threads_changed = true;
                None
            }
            Stop::ThreadExited { tid } => {
                debug!(tid, "Thread exited");
                ctx.gate.lock().thread_exited(tid);
                threads_changed = true;
                None
            }
            Stop::Exited { code } => {
                info!(code, "Target exited");
                return Termination::Exited { code };
            }
            Stop::Killed { signo } if ctx.abort.is_cancelled() => {
                debug!(signo, "Target killed on request");
                return Termination::Forced;
            }
            Stop::Killed { signo } => {
                info!(signo, "Target killed by signal");
                let dump = crash_dump
                    .take()
                    .filter(|d| i64::from(d.signal) == i64::from(signo))
                    .map(Box::new);
                return Termination::Killed { signo, dump };
            }
        };

        let Some(observation) = observation else {
            continue;
        };
        let capture_ctx = CaptureContext {
            filter: &ctx.filter,
            inspector: Some(tracer.inspector()),
            threads_changed,
        };
        match capture(&capture_ctx, &observation) {
            Ok(captured) => {
                threads_changed = false;
                if !send(tx, captured) {
                    warn!("Capture queue closed, detaching");
                    tracer.terminate();
                    return Termination::Lost {
                        reason: "trace writer stopped".to_string(),
                    };
                }
            }
            Err(e) => report_drop(ctx, &observation, &e, dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Gate;
    use retrace_filter::FilterConfig;
    use retrace_log::Category;

    fn context() -> (DriveContext, broadcast::Receiver<RecorderNotice>) {
        let (notices, rx) = broadcast::channel(8);
        let ctx = DriveContext {
            filter: Arc::new(CompiledFilter::compile(&FilterConfig::default()).unwrap()),
            gate: Gate::new(1, false, true).shared(),
            clock: MonoClock::start(),
            session_id: SessionId::new(),
            abort: CancelToken::new(),
            notices,
        };
        (ctx, rx)
    }

    #[test]
    fn test_dropped_event_is_counted_and_announced() {
        let (ctx, mut rx) = context();
        let obs = Observation {
            category: Category::Syscall,
            code: 1,
            tid: 7,
            thread_count: 1,
            at: MonoTime::from_nanos(10),
            duration: 1,
            result: 0,
            detail: Detail::Syscall { args: [0; 6] },
        };
        let mut dropped = 0;
        report_drop(&ctx, &obs, &CoreError::InvalidEncoding, &mut dropped);
        report_drop(&ctx, &obs, &CoreError::InvalidEncoding, &mut dropped);
        assert_eq!(dropped, 2);
        match rx.try_recv().unwrap() {
            RecorderNotice::Warning(text) => assert!(text.contains("tid 7"), "{text}"),
            other => panic!("unexpected notice {other:?}"),
        }
    }
}
