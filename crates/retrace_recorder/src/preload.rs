//! Preload interceptor channel.
//!
//! X11 and D-Bus events are observed by small libraries preloaded into the
//! target. They report over a Unix datagram socket whose path is exported to
//! the target in [`EVENT_SOCKET_ENV`], one JSON [`Envelope`] per datagram.

use crate::capture::{CaptureContext, Detail, Observation, capture};
use crate::error::{RecorderError, RecorderResult};
use crate::gate::SharedGate;
use crate::sequencer::Captured;
use retrace_core::MonoClock;
use retrace_filter::CompiledFilter;
use retrace_log::Category;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Environment variable carrying the socket path
pub const EVENT_SOCKET_ENV: &str = "RETRACE_EVENT_SOCKET";

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 64 * 1024;

/// One reported event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// `x11` or `dbus`
    pub category: Category,
    /// X11 event type or D-Bus message type
    pub code: u32,
    /// Reporting thread
    pub tid: u32,
    /// Time spent dispatching
    #[serde(default)]
    pub duration_ns: u64,
    /// Status code
    #[serde(default)]
    pub result: i64,
    /// Hex-encoded event struct or message
    #[serde(default)]
    pub data: String,
}

impl Envelope {
    /// Parse one datagram
    ///
    /// # Errors
    ///
    /// Returns error on malformed JSON, a category other than X11 or D-Bus,
    /// or data that is not hex
    pub fn parse(datagram: &[u8]) -> RecorderResult<(Self, Vec<u8>)> {
        let envelope: Self = serde_json::from_slice(datagram).map_err(|e| RecorderError::Preload {
            reason: format!("malformed envelope: {e}"),
        })?;
        if !matches!(envelope.category, Category::X11 | Category::DBus) {
            return Err(RecorderError::Preload {
                reason: format!("category {} cannot arrive by preload", envelope.category),
            });
        }
        let data = hex::decode(&envelope.data).map_err(|e| RecorderError::Preload {
            reason: format!("envelope data: {e}"),
        })?;
        Ok((envelope, data))
    }
}

/// Inputs the listener shares with the tracer thread
#[derive(Clone)]
pub struct ListenerContext {
    /// Compiled filter
    pub filter: Arc<CompiledFilter>,
    /// Recording gate
    pub gate: SharedGate,
    /// Recording clock
    pub clock: MonoClock,
}

impl ListenerContext {
    /// Turn one datagram into a captured event, or `None` if it is filtered
    ///
    /// # Errors
    ///
    /// Returns error if the datagram is malformed
    pub fn accept(&self, datagram: &[u8]) -> RecorderResult<Option<Captured>> {
        let (envelope, data) = Envelope::parse(datagram)?;
        if !self.filter.admits(envelope.category, envelope.code) {
            return Ok(None);
        }
        let at = self.clock.now();
        let thread_count = {
            let gate = self.gate.lock();
            if !gate.admits(envelope.tid, at) {
                return Ok(None);
            }
            gate.thread_count()
        };
        let obs = Observation {
            category: envelope.category,
            code: envelope.code,
            tid: envelope.tid,
            thread_count,
            at,
            duration: envelope.duration_ns,
            result: envelope.result,
            detail: Detail::Message(&data),
        };
        let ctx = CaptureContext {
            filter: &self.filter,
            inspector: None,
            threads_changed: false,
        };
        capture(&ctx, &obs)
            .map(Some)
            .map_err(|e| RecorderError::Preload {
                reason: e.to_string(),
            })
    }
}

/// Bound event socket
#[derive(Debug)]
pub struct PreloadListener {
    socket: UnixDatagram,
    path: PathBuf,
}

impl PreloadListener {
    /// Bind at `path`, replacing a stale socket file
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound
    pub fn bind(path: impl Into<PathBuf>) -> RecorderResult<Self> {
        let path = path.into();
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path).map_err(|e| RecorderError::Preload {
            reason: format!("bind {}: {e}", path.display()),
        })?;
        info!(path = %path.display(), "Preload socket bound");
        Ok(Self { socket, path })
    }

    /// Socket path to export to the target
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receive until the sequencer goes away or the task is aborted
    pub async fn run(self, ctx: ListenerContext, tx: mpsc::Sender<Captured>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = match self.socket.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    warn!(error = %e, "Preload socket receive failed");
                    break;
                }
            };
            match ctx.accept(&buf[..len]) {
                Ok(Some(captured)) => {
                    if tx.send(captured).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Dropping preload datagram"),
            }
        }
        debug!("Preload listener stopped");
    }
}

impl Drop for PreloadListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Gate;
    use retrace_filter::FilterConfig;
    use retrace_log::{Payload, Section};

    fn context(config: FilterConfig) -> ListenerContext {
        ListenerContext {
            filter: Arc::new(CompiledFilter::compile(&config).unwrap()),
            gate: Gate::new(7, false, false).shared(),
            clock: MonoClock::start(),
        }
    }

    fn dbus_config() -> FilterConfig {
        let mut config = FilterConfig::default();
        config.categories.dbus = true;
        config
    }

    #[test]
    fn test_parse_envelope() {
        let (env, data) = Envelope::parse(
            br#"{"category":"dbus","code":1,"tid":7,"duration_ns":120,"result":0,"data":"0a0b"}"#,
        )
        .unwrap();
        assert_eq!(env.category, Category::DBus);
        assert_eq!(data, vec![0x0a, 0x0b]);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Envelope::parse(b"not json").is_err());
        assert!(Envelope::parse(br#"{"category":"syscall","code":1,"tid":7}"#).is_err());
        assert!(Envelope::parse(br#"{"category":"x11","code":2,"tid":7,"data":"zz"}"#).is_err());
    }

    #[test]
    fn test_accept_applies_filter() {
        let ctx = context(FilterConfig::default());
        // D-Bus disabled by default
        let got = ctx
            .accept(br#"{"category":"dbus","code":1,"tid":7,"data":"00"}"#)
            .unwrap();
        assert!(got.is_none());

        let ctx = context(dbus_config());
        let got = ctx
            .accept(br#"{"category":"dbus","code":4,"tid":7,"duration_ns":9,"data":"beef"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(got.category, Category::DBus);
        assert_eq!(got.duration, 9);
        let payload = Payload::decode(&got.payload).unwrap();
        assert_eq!(payload.sections(), &[Section::Message { bytes: vec![0xbe, 0xef] }]);
    }

    #[tokio::test]
    async fn test_listener_forwards_datagrams() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.sock");
        let listener = PreloadListener::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(listener.run(context(dbus_config()), tx));

        let client = UnixDatagram::unbound().unwrap();
        client.send_to(b"garbage", &path).await.unwrap();
        client
            .send_to(br#"{"category":"dbus","code":2,"tid":7,"data":""}"#, &path)
            .await
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.code, 2);
        task.abort();
        let _ = task.await;
        assert!(!path.exists());
    }
}
