//! Trace store.
//!
//! Write protocol per append: payload bytes, then the index entry, then the
//! committed count is published. A reader's snapshot is the committed count
//! at the time it asked, so a half-written event is never visible.

use crate::error::{StoreError, StoreResult};
use crate::index::{
    ENTRY_SIZE, INDEX_HEADER_SIZE, INDEX_MAGIC, IndexEntry, PAYLOAD_HEADER_SIZE, PAYLOAD_MAGIC,
    decode_file_header, encode_file_header,
};
use crate::iter::{EventIter, HeaderIter};
use crate::layout::TraceDir;
use crate::meta::{SessionMeta, SessionStatus};
use crate::order::OrderCache;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::{Mutex, RwLock};
use retrace_core::{ClockOffset, Digest, MonoClock, MonoTime, SessionId, WallTime};
use retrace_filter::SyncPolicy;
use retrace_log::{CategoryMask, Event, EventHeader};
use std::fs::{File, OpenOptions};
use std::ops::{Bound, RangeBounds};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Entries read per chunk while scanning the index
const SCAN_CHUNK: u64 = 4096;

/// Parameters for a new session
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Traced executable
    pub target_path: String,
    /// Traced process id
    pub process_id: u32,
    /// Session-unique key
    pub session_id: SessionId,
    /// Wall time at monotonic zero
    pub clock_offset: ClockOffset,
    /// When to fsync
    pub sync: SyncPolicy,
}

impl CreateOptions {
    /// Options for `target_path` with a fresh id, starting now
    #[must_use]
    pub fn new(target_path: impl Into<String>, process_id: u32) -> Self {
        Self {
            target_path: target_path.into(),
            process_id,
            session_id: SessionId::new(),
            clock_offset: ClockOffset::from_wall(WallTime::now()),
            sync: SyncPolicy::default(),
        }
    }

    /// Builder method: anchor timestamps to a recording clock
    #[must_use]
    pub fn with_clock(mut self, clock: &MonoClock) -> Self {
        self.clock_offset = clock.offset();
        self
    }

    /// Builder method: sync policy
    #[must_use]
    pub fn with_sync(mut self, sync: SyncPolicy) -> Self {
        self.sync = sync;
        self
    }

    /// Builder method: session id
    #[must_use]
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }
}

struct Writer {
    meta_file: Flock<File>,
    payload_end: u64,
    last_timestamp: MonoTime,
    sync: SyncPolicy,
}

struct Inner {
    dir: TraceDir,
    index: File,
    payload: File,
    meta: RwLock<SessionMeta>,
    committed: AtomicU64,
    writer: Mutex<Option<Writer>>,
    orders: OrderCache,
    warnings: Vec<String>,
}

/// Handle to one session's trace; clones share the same files
#[derive(Clone)]
pub struct TraceStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStore")
            .field("dir", &self.inner.dir.root())
            .field("len", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Result of scanning `events.idx`
struct Scan {
    /// Entries that verified, contiguous from zero
    good: u64,
    /// End of the last good payload blob
    payload_end: u64,
    /// Timestamp of the last good entry
    last_timestamp: MonoTime,
    /// Whole entries present in the file
    full: u64,
    /// Trailing bytes that do not form a whole entry
    partial: bool,
    /// First failing entry and why
    bad: Option<(u64, String)>,
}

impl Scan {
    /// A failure with whole entries after it cannot be a torn write
    fn bad_is_interior(&self) -> bool {
        self.bad.as_ref().is_some_and(|(at, _)| at + 1 < self.full)
    }
}

fn lock_exclusive(file: File) -> StoreResult<Flock<File>> {
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| match errno {
        Errno::EWOULDBLOCK => StoreError::Locked,
        other => StoreError::Io {
            operation: "lock session.meta".to_string(),
            reason: other.desc().to_string(),
        },
    })
}

fn write_meta(file: &File, meta: &SessionMeta) -> StoreResult<()> {
    let bytes = meta.encode()?;
    file.write_all_at(&bytes, 0)
        .map_err(|e| StoreError::io("write session.meta", &e))?;
    file.set_len(bytes.len() as u64)
        .map_err(|e| StoreError::io("write session.meta", &e))?;
    file.sync_data()
        .map_err(|e| StoreError::io("sync session.meta", &e))
}

/// Rewrite only the fields that change after creation. A torn update fails
/// the checksum and is salvaged on the next open.
fn update_meta(file: &File, meta: &SessionMeta) -> StoreResult<()> {
    let bytes = meta.encode()?;
    for range in SessionMeta::rewritten_ranges(&bytes) {
        file.write_all_at(&bytes[range.clone()], range.start as u64)
            .map_err(|e| StoreError::io("update session.meta", &e))?;
    }
    file.sync_data()
        .map_err(|e| StoreError::io("sync session.meta", &e))
}

fn file_len(file: &File, name: &str) -> StoreResult<u64> {
    file.metadata()
        .map(|m| m.len())
        .map_err(|e| StoreError::io(format!("stat {name}"), &e))
}

fn read_header_bytes(file: &File, name: &'static str, magic: [u8; 4]) -> StoreResult<u16> {
    let mut buf = [0u8; 16];
    file.read_exact_at(&mut buf, 0)
        .map_err(|_| StoreError::corrupt(format!("{name} header is truncated")))?;
    decode_file_header(name, magic, &buf)
}

impl TraceStore {
    /// Create a new session directory and become its writer
    ///
    /// # Errors
    ///
    /// Returns error if the directory already holds a session or the files
    /// cannot be created
    pub fn create(dir: impl Into<PathBuf>, options: CreateOptions) -> StoreResult<Self> {
        let dir = TraceDir::new(dir);
        if dir.is_session() {
            return Err(StoreError::AlreadyExists(dir.root().display().to_string()));
        }
        std::fs::create_dir_all(dir.root())
            .map_err(|e| StoreError::io("create session directory", &e))?;

        let meta_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.meta())
            .map_err(|e| StoreError::io("create session.meta", &e))?;
        let meta_file = lock_exclusive(meta_file)?;

        let mut meta = SessionMeta::new(
            options.target_path,
            options.process_id,
            WallTime::from_unix_nanos(options.clock_offset.as_nanos()),
        );
        meta.session_id = options.session_id;
        meta.clock_offset = options.clock_offset;
        write_meta(&meta_file, &meta)?;

        let create = |path: PathBuf, name: &str, magic: [u8; 4], extra: u16| {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| StoreError::io(format!("create {name}"), &e))?;
            file.write_all_at(&encode_file_header(magic, extra), 0)
                .map_err(|e| StoreError::io(format!("write {name} header"), &e))?;
            file.sync_data()
                .map_err(|e| StoreError::io(format!("sync {name}"), &e))?;
            Ok::<_, StoreError>(file)
        };
        let index = create(dir.index(), "events.idx", INDEX_MAGIC, ENTRY_SIZE as u16)?;
        let payload = create(dir.payload(), "payload.bin", PAYLOAD_MAGIC, 0)?;

        info!(
            session = %meta.session_id,
            dir = %dir.root().display(),
            target = %meta.target_path,
            "Created trace session"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                index,
                payload,
                meta: RwLock::new(meta),
                committed: AtomicU64::new(0),
                writer: Mutex::new(Some(Writer {
                    meta_file,
                    payload_end: PAYLOAD_HEADER_SIZE,
                    last_timestamp: MonoTime::zero(),
                    sync: options.sync,
                })),
                orders: OrderCache::default(),
                warnings: Vec::new(),
            }),
        })
    }

    /// Open an existing session for reading.
    ///
    /// A `Recording` session whose lock is free lost its writer: its torn
    /// tail is truncated and it is marked `Corrupt`. A `Recording` session
    /// with a live writer opens as a read-only snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if a file is missing or has a bad header, or if an
    /// entry other than the last one fails verification
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = TraceDir::new(dir);
        let meta_bytes =
            std::fs::read(dir.meta()).map_err(|e| StoreError::io("read session.meta", &e))?;
        let (mut meta, torn) = match SessionMeta::decode(&meta_bytes) {
            Ok(meta) => (meta, false),
            Err(StoreError::Corrupt { reason, .. }) => {
                let meta = SessionMeta::salvage(&meta_bytes)?;
                warn!(dir = %dir.root().display(), %reason, "Salvaging torn session.meta");
                (meta, true)
            }
            Err(e) => return Err(e),
        };

        let open = |path: PathBuf, name: &str| {
            File::open(path).map_err(|e| StoreError::io(format!("open {name}"), &e))
        };
        let index = open(dir.index(), "events.idx")?;
        let payload = open(dir.payload(), "payload.bin")?;
        read_header_bytes(&index, "events.idx", INDEX_MAGIC)?;
        read_header_bytes(&payload, "payload.bin", PAYLOAD_MAGIC)?;

        let scan = scan_index(&index, &payload)?;
        let mut warnings = Vec::new();

        let committed = if meta.status == SessionStatus::Recording {
            let meta_file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(dir.meta())
                .map_err(|e| StoreError::io("open session.meta", &e))?;
            match lock_exclusive(meta_file) {
                Ok(lock) => {
                    let (kept, warning) = recover(&dir, &lock, &mut meta, &scan)?;
                    if torn {
                        warnings.push("session.meta was torn; status rebuilt from the index".to_string());
                    }
                    warnings.push(warning);
                    kept
                }
                Err(StoreError::Locked) => {
                    if scan.bad_is_interior() {
                        return Err(interior_corruption(&scan));
                    }
                    debug!(dir = %dir.root().display(), events = scan.good, "Opened live session");
                    scan.good
                }
                Err(e) => return Err(e),
            }
        } else {
            if scan.bad.is_some() || scan.partial {
                return Err(interior_corruption(&scan));
            }
            if scan.good < meta.event_count {
                return Err(StoreError::corrupt(format!(
                    "index holds {} events, metadata records {}",
                    scan.good, meta.event_count
                )));
            }
            meta.event_count
        };

        if meta.has_minidump && !dir.minidump().is_file() {
            warnings.push("session links a minidump but crash.dmp is missing".to_string());
        }

        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                index,
                payload,
                meta: RwLock::new(meta),
                committed: AtomicU64::new(committed),
                writer: Mutex::new(None),
                orders: OrderCache::default(),
                warnings,
            }),
        })
    }

    /// Session directory
    #[must_use]
    pub fn dir(&self) -> &TraceDir {
        &self.inner.dir
    }

    /// Committed events visible to new readers
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.committed.load(Ordering::Acquire)
    }

    /// Whether no event is committed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the session metadata
    #[must_use]
    pub fn meta(&self) -> SessionMeta {
        let mut meta = self.inner.meta.read().clone();
        if meta.status == SessionStatus::Recording {
            meta.event_count = self.len();
        }
        meta
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.inner.meta.read().status
    }

    /// Session-unique key
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.inner.meta.read().session_id
    }

    /// Whether this handle is the session writer
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.inner.writer.lock().is_some()
    }

    /// Problems found while opening
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.inner.warnings
    }

    /// Append the next event
    ///
    /// # Errors
    ///
    /// Returns error if this handle is not the writer, the event's index is
    /// not the next one, its timestamp goes backwards, or a write fails
    pub fn append(&self, event: &Event) -> StoreResult<()> {
        let mut guard = self.inner.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| StoreError::ReadOnly {
            status: self.status().to_string(),
        })?;

        let next = self.len();
        let header = &event.header;
        if header.index != next {
            return Err(StoreError::OutOfOrder {
                reason: format!("expected index {next}, got {}", header.index),
            });
        }
        if header.timestamp < writer.last_timestamp {
            return Err(StoreError::OutOfOrder {
                reason: format!(
                    "timestamp {} before previous {}",
                    header.timestamp, writer.last_timestamp
                ),
            });
        }
        if u32::try_from(event.payload.len()).is_err() {
            return Err(StoreError::OutOfOrder {
                reason: "payload larger than 4 GiB".to_string(),
            });
        }

        let offset = writer.payload_end;
        if !event.payload.is_empty() {
            self.inner
                .payload
                .write_all_at(&event.payload, offset)
                .map_err(|e| StoreError::io("write payload", &e))?;
        }
        let entry = IndexEntry::new(*header, offset, &event.payload);
        self.inner
            .index
            .write_all_at(&entry.encode(), IndexEntry::file_offset(next))
            .map_err(|e| StoreError::io("write index entry", &e))?;

        if writer.sync == SyncPolicy::EveryEvent {
            self.sync_files()?;
        }

        writer.payload_end = entry.payload_end();
        writer.last_timestamp = header.timestamp;
        self.inner.committed.store(next + 1, Ordering::Release);
        debug!(
            index = next,
            category = %header.category,
            code = header.code,
            payload = event.payload.len(),
            "Appended event"
        );
        Ok(())
    }

    fn sync_files(&self) -> StoreResult<()> {
        self.inner
            .payload
            .sync_data()
            .map_err(|e| StoreError::io("sync payload.bin", &e))?;
        self.inner
            .index
            .sync_data()
            .map_err(|e| StoreError::io("sync events.idx", &e))
    }

    /// Read and verify the index entry at `index`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` outside the committed range, or a corruption error
    pub fn read_entry(&self, index: u64) -> StoreResult<IndexEntry> {
        let len = self.len();
        if index >= len {
            return Err(StoreError::NotFound { index, len });
        }
        let mut buf = [0u8; ENTRY_SIZE];
        self.inner
            .index
            .read_exact_at(&mut buf, IndexEntry::file_offset(index))
            .map_err(|e| StoreError::io("read index entry", &e))?;
        let entry = IndexEntry::decode(&buf)?;
        if entry.header.index != index {
            return Err(StoreError::corrupt(format!(
                "entry {index} records index {}",
                entry.header.index
            )));
        }
        Ok(entry)
    }

    /// Read only the fixed-width fields of an event
    ///
    /// # Errors
    ///
    /// See [`Self::read_entry`]
    pub fn read_header(&self, index: u64) -> StoreResult<EventHeader> {
        self.read_entry(index).map(|e| e.header)
    }

    /// Read the payload referenced by `entry`
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be read or fail their digest
    pub fn read_payload(&self, entry: &IndexEntry) -> StoreResult<Vec<u8>> {
        let mut payload = vec![0u8; entry.payload_len as usize];
        if !payload.is_empty() {
            self.inner
                .payload
                .read_exact_at(&mut payload, entry.payload_offset)
                .map_err(|e| StoreError::io("read payload", &e))?;
        }
        if Digest::short(&payload) != entry.payload_digest {
            return Err(StoreError::corrupt(format!(
                "payload of event {} fails its digest",
                entry.header.index
            )));
        }
        Ok(payload)
    }

    /// Read one event
    ///
    /// # Errors
    ///
    /// Returns `NotFound` outside the committed range, or a corruption error
    pub fn read(&self, index: u64) -> StoreResult<Event> {
        let entry = self.read_entry(index)?;
        let payload = self.read_payload(&entry)?;
        Ok(Event::new(entry.header, payload))
    }

    pub(crate) fn resolve_range(&self, range: impl RangeBounds<u64>) -> (u64, u64) {
        let len = self.len();
        let start = match range.start_bound() {
            Bound::Included(s) => *s,
            Bound::Excluded(s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(e) => e.saturating_add(1),
            Bound::Excluded(e) => *e,
            Bound::Unbounded => len,
        };
        let end = end.min(len);
        (start.min(end), end)
    }

    /// Lazy iterator over committed events in `range` whose category is in
    /// `mask`. The snapshot is fixed when the iterator is created.
    #[must_use]
    pub fn iter(&self, range: impl RangeBounds<u64>, mask: CategoryMask) -> EventIter {
        let (start, end) = self.resolve_range(range);
        EventIter::new(self.clone(), start, end, mask)
    }

    /// Like [`Self::iter`] but without reading payloads
    #[must_use]
    pub fn headers(&self, range: impl RangeBounds<u64>, mask: CategoryMask) -> HeaderIter {
        let (start, end) = self.resolve_range(range);
        HeaderIter::new(self.clone(), start, end, mask)
    }

    pub(crate) fn orders(&self) -> &OrderCache {
        &self.inner.orders
    }

    /// Pick up events appended by a writer in another process
    ///
    /// # Errors
    ///
    /// Returns error if the index cannot be read
    pub fn refresh(&self) -> StoreResult<u64> {
        if self.is_writable() || self.status() != SessionStatus::Recording {
            return Ok(self.len());
        }
        let index_len = file_len(&self.inner.index, "events.idx")?;
        let whole = index_len.saturating_sub(INDEX_HEADER_SIZE) / ENTRY_SIZE as u64;
        let payload_len = file_len(&self.inner.payload, "payload.bin")?;
        let mut next = self.len();
        while next < whole {
            let mut buf = [0u8; ENTRY_SIZE];
            if self
                .inner
                .index
                .read_exact_at(&mut buf, IndexEntry::file_offset(next))
                .is_err()
            {
                break;
            }
            match IndexEntry::decode(&buf) {
                Ok(entry) if entry.header.index == next && entry.payload_end() <= payload_len => {
                    next += 1;
                }
                _ => break,
            }
        }
        self.inner.committed.store(next, Ordering::Release);
        Ok(next)
    }

    /// Write `bytes` as the session's minidump and link it
    ///
    /// # Errors
    ///
    /// Returns error if this handle is not the writer or the write fails
    pub fn attach_minidump(&self, bytes: &[u8]) -> StoreResult<()> {
        let guard = self.inner.writer.lock();
        let writer = guard.as_ref().ok_or_else(|| StoreError::ReadOnly {
            status: self.status().to_string(),
        })?;

        let target = self.inner.dir.minidump();
        let tmp = target.with_extension("dmp.tmp");
        std::fs::write(&tmp, bytes).map_err(|e| StoreError::io("write crash.dmp", &e))?;
        std::fs::rename(&tmp, &target).map_err(|e| StoreError::io("link crash.dmp", &e))?;

        let mut meta = self.inner.meta.write();
        meta.has_minidump = true;
        meta.event_count = self.len();
        update_meta(&writer.meta_file, &meta)?;
        info!(bytes = bytes.len(), "Linked minidump");
        Ok(())
    }

    /// Path of the linked minidump, if any
    #[must_use]
    pub fn minidump_path(&self) -> Option<PathBuf> {
        let path = self.inner.dir.minidump();
        (self.inner.meta.read().has_minidump && path.is_file()).then_some(path)
    }

    /// Seal the session with a terminal status and release the writer lock
    ///
    /// # Errors
    ///
    /// Returns error if this handle is not the writer, `status` is
    /// `Recording`, or the final sync fails
    pub fn finalize(&self, status: SessionStatus) -> StoreResult<SessionMeta> {
        if status == SessionStatus::Recording {
            return Err(StoreError::ReadOnly {
                status: "finalize needs a terminal status".to_string(),
            });
        }
        let mut guard = self.inner.writer.lock();
        let writer = guard.take().ok_or_else(|| StoreError::ReadOnly {
            status: self.status().to_string(),
        })?;

        self.sync_files()?;
        let mut meta = self.inner.meta.write();
        meta.status = status;
        meta.end_time = Some(WallTime::now());
        meta.event_count = self.len();
        update_meta(&writer.meta_file, &meta)?;
        info!(
            session = %meta.session_id,
            status = %status,
            events = meta.event_count,
            "Finalized trace session"
        );
        Ok(meta.clone())
    }
}

fn interior_corruption(scan: &Scan) -> StoreError {
    let reason = match &scan.bad {
        Some((at, why)) => format!("entry {at}: {why}"),
        None => "trailing partial entry in a sealed session".to_string(),
    };
    StoreError::Corrupt {
        reason,
        truncated_at: None,
    }
}

fn scan_index(index: &File, payload: &File) -> StoreResult<Scan> {
    let index_len = file_len(index, "events.idx")?;
    let payload_len = file_len(payload, "payload.bin")?;
    let body = index_len.saturating_sub(INDEX_HEADER_SIZE);
    let full = body / ENTRY_SIZE as u64;

    let mut scan = Scan {
        good: 0,
        payload_end: PAYLOAD_HEADER_SIZE,
        last_timestamp: MonoTime::zero(),
        full,
        partial: body % ENTRY_SIZE as u64 != 0,
        bad: None,
    };

    let mut chunk = Vec::new();
    let mut base = 0;
    'outer: while base < full {
        let count = SCAN_CHUNK.min(full - base);
        chunk.resize(count as usize * ENTRY_SIZE, 0);
        index
            .read_exact_at(&mut chunk, IndexEntry::file_offset(base))
            .map_err(|e| StoreError::io("scan events.idx", &e))?;

        for (i, raw) in chunk.chunks_exact(ENTRY_SIZE).enumerate() {
            let at = base + i as u64;
            let entry = match IndexEntry::decode(raw) {
                Ok(entry) => entry,
                Err(e) => {
                    scan.bad = Some((at, e.to_string()));
                    break 'outer;
                }
            };
            let problem = if entry.header.index != at {
                Some(format!("records index {}", entry.header.index))
            } else if entry.header.timestamp < scan.last_timestamp {
                Some("timestamp goes backwards".to_string())
            } else if entry.payload_offset != scan.payload_end {
                Some("payload is not contiguous".to_string())
            } else if entry.payload_end() > payload_len {
                Some("payload extends past payload.bin".to_string())
            } else {
                None
            };
            if let Some(problem) = problem {
                scan.bad = Some((at, problem));
                break 'outer;
            }
            scan.good = at + 1;
            scan.payload_end = entry.payload_end();
            scan.last_timestamp = entry.header.timestamp;
        }
        base += count;
    }
    Ok(scan)
}

/// Verify the last good payload, truncate the torn tail and seal the
/// session as `Corrupt`
fn recover(
    dir: &TraceDir,
    lock: &Flock<File>,
    meta: &mut SessionMeta,
    scan: &Scan,
) -> StoreResult<(u64, String)> {
    if scan.bad_is_interior() {
        return Err(interior_corruption(scan));
    }

    let open_rw = |path: &Path, name: &str| {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(format!("open {name} for recovery"), &e))
    };
    let index = open_rw(&dir.index(), "events.idx")?;
    let payload = open_rw(&dir.payload(), "payload.bin")?;

    let mut good = scan.good;
    let mut payload_end = scan.payload_end;
    if good > 0 {
        let mut buf = [0u8; ENTRY_SIZE];
        index
            .read_exact_at(&mut buf, IndexEntry::file_offset(good - 1))
            .map_err(|e| StoreError::io("read last entry", &e))?;
        let last = IndexEntry::decode(&buf)?;
        let mut bytes = vec![0u8; last.payload_len as usize];
        payload
            .read_exact_at(&mut bytes, last.payload_offset)
            .map_err(|e| StoreError::io("read last payload", &e))?;
        if Digest::short(&bytes) != last.payload_digest {
            good -= 1;
            payload_end = last.payload_offset;
        }
    }

    let index_len = file_len(&index, "events.idx")?;
    let payload_len = file_len(&payload, "payload.bin")?;
    let index_keep = IndexEntry::file_offset(good);
    let dropped = index_len > index_keep || payload_len > payload_end;

    if dropped {
        index
            .set_len(index_keep)
            .map_err(|e| StoreError::io("truncate events.idx", &e))?;
        payload
            .set_len(payload_end)
            .map_err(|e| StoreError::io("truncate payload.bin", &e))?;
        index
            .sync_all()
            .map_err(|e| StoreError::io("sync events.idx", &e))?;
        payload
            .sync_all()
            .map_err(|e| StoreError::io("sync payload.bin", &e))?;
    }

    meta.status = SessionStatus::Corrupt;
    meta.event_count = good;
    meta.truncated_at = dropped.then_some(good);
    meta.has_minidump |= dir.minidump().is_file();
    write_meta(lock, meta)?;

    let warning = if dropped {
        format!("recorder was lost; trace truncated at event {good}")
    } else {
        format!("recorder was lost after event {good}; no data dropped")
    };
    warn!(
        dir = %dir.root().display(),
        kept = good,
        dropped,
        "Recovered session without a writer"
    );
    Ok((good, warning))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{MUTABLE_FIELDS, STATUS_OFFSET};
    use retrace_core::CancelToken;
    use retrace_log::{Category, Payload, Section};

    fn event(index: u64, ts: u64, category: Category) -> Event {
        let header = EventHeader::new(index, MonoTime::from_nanos(ts), category, index as u32)
            .with_thread(100, 1)
            .with_outcome(10, index as i64);
        let payload = Payload::from(vec![Section::Args {
            words: vec![index, ts],
        }]);
        Event::with_sections(header, &payload).unwrap()
    }

    fn filled(dir: &Path, n: u64) -> TraceStore {
        let store = TraceStore::create(dir, CreateOptions::new("/bin/demo", 7)).unwrap();
        for i in 0..n {
            let category = if i % 3 == 0 { Category::Signal } else { Category::Syscall };
            store.append(&event(i, i * 100, category)).unwrap();
        }
        store
    }

    #[test]
    fn test_append_then_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = filled(tmp.path(), 20);
        assert_eq!(store.len(), 20);
        for i in 0..20 {
            let category = store.read_header(i).unwrap().category;
            assert_eq!(store.read(i).unwrap(), event(i, i * 100, category));
        }
        assert!(matches!(store.read(20), Err(StoreError::NotFound { index: 20, len: 20 })));
    }

    #[test]
    fn test_append_rejects_gaps_and_regressions() {
        let tmp = tempfile::tempdir().unwrap();
        let store = filled(tmp.path(), 2);
        assert!(matches!(
            store.append(&event(5, 500, Category::Syscall)),
            Err(StoreError::OutOfOrder { .. })
        ));
        assert!(matches!(
            store.append(&event(2, 50, Category::Syscall)),
            Err(StoreError::OutOfOrder { .. })
        ));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_create_twice_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let _store = filled(tmp.path(), 0);
        assert!(matches!(
            TraceStore::create(tmp.path(), CreateOptions::new("/bin/demo", 7)),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_finalize_and_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let store = filled(tmp.path(), 10);
        let id = store.session_id();
        let meta = store.finalize(SessionStatus::Complete).unwrap();
        assert_eq!(meta.event_count, 10);
        assert!(meta.end_time.is_some());
        assert!(store.append(&event(10, 2000, Category::Syscall)).is_err());
        drop(store);

        let reopened = TraceStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.status(), SessionStatus::Complete);
        assert_eq!(reopened.session_id(), id);
        assert_eq!(reopened.len(), 10);
        assert!(reopened.warnings().is_empty());
        assert_eq!(reopened.read(4).unwrap().header.index, 4);
    }

    #[test]
    fn test_empty_payload_costs_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::create(tmp.path(), CreateOptions::new("/bin/demo", 1)).unwrap();
        let header = EventHeader::new(0, MonoTime::from_nanos(1), Category::Signal, 17);
        store.append(&Event::new(header, Vec::new())).unwrap();
        let entry = store.read_entry(0).unwrap();
        assert_eq!(entry.payload_len, 0);
        assert!(store.read(0).unwrap().payload.is_empty());
    }

    #[test]
    fn test_live_writer_blocks_recovery() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = filled(tmp.path(), 5);
        let reader = TraceStore::open(tmp.path()).unwrap();
        assert_eq!(reader.status(), SessionStatus::Recording);
        assert_eq!(reader.len(), 5);
        assert!(!reader.is_writable());

        writer.append(&event(5, 600, Category::Syscall)).unwrap();
        assert_eq!(reader.len(), 5);
        assert_eq!(reader.refresh().unwrap(), 6);
    }

    #[test]
    fn test_truncated_mid_write_opens_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = filled(tmp.path(), 8);
        drop(store);

        // Torn final entry plus orphan payload bytes.
        let dir = TraceDir::new(tmp.path());
        let index = OpenOptions::new().write(true).open(dir.index()).unwrap();
        let len = index.metadata().unwrap().len();
        index.set_len(len - 20).unwrap();
        let payload = OpenOptions::new().write(true).open(dir.payload()).unwrap();
        let end = payload.metadata().unwrap().len();
        payload.write_all_at(b"orphan", end).unwrap();
        drop((index, payload));

        let store = TraceStore::open(tmp.path()).unwrap();
        assert_eq!(store.status(), SessionStatus::Corrupt);
        assert_eq!(store.len(), 7);
        assert_eq!(store.meta().truncated_at, Some(7));
        assert_eq!(store.warnings().len(), 1);
        for i in 0..7 {
            assert!(store.read(i).is_ok());
        }
        drop(store);

        let again = TraceStore::open(tmp.path()).unwrap();
        assert_eq!(again.status(), SessionStatus::Corrupt);
        assert_eq!(again.len(), 7);
    }

    #[test]
    fn test_lost_writer_without_torn_tail() {
        let tmp = tempfile::tempdir().unwrap();
        drop(filled(tmp.path(), 3));
        let store = TraceStore::open(tmp.path()).unwrap();
        assert_eq!(store.status(), SessionStatus::Corrupt);
        assert_eq!(store.len(), 3);
        assert_eq!(store.meta().truncated_at, None);
    }

    #[test]
    fn test_interior_corruption_is_reported_not_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        drop(filled(tmp.path(), 6));
        let dir = TraceDir::new(tmp.path());
        let index = OpenOptions::new().write(true).open(dir.index()).unwrap();
        index.write_all_at(&[0xAA], IndexEntry::file_offset(2) + 9).unwrap();
        let before = std::fs::read(dir.index()).unwrap();

        let err = TraceStore::open(tmp.path()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert_eq!(std::fs::read(dir.index()).unwrap(), before);
        let meta = SessionMeta::decode(&std::fs::read(dir.meta()).unwrap()).unwrap();
        assert_eq!(meta.status, SessionStatus::Recording);
    }

    #[test]
    fn test_finalize_rewrites_fields_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let store = filled(tmp.path(), 4);
        let dir = TraceDir::new(tmp.path());
        let before = std::fs::read(dir.meta()).unwrap();
        store.finalize(SessionStatus::Complete).unwrap();
        let after = std::fs::read(dir.meta()).unwrap();

        assert_eq!(before.len(), after.len());
        assert_eq!(after[STATUS_OFFSET], SessionStatus::Complete as u8);
        assert_eq!(before[..STATUS_OFFSET], after[..STATUS_OFFSET]);
        assert_eq!(before[STATUS_OFFSET + 1..MUTABLE_FIELDS.start], after[STATUS_OFFSET + 1..MUTABLE_FIELDS.start]);
        assert_eq!(before[MUTABLE_FIELDS.end..after.len() - 4], after[MUTABLE_FIELDS.end..after.len() - 4]);
        assert_eq!(SessionMeta::decode(&after).unwrap().event_count, 4);
    }

    #[test]
    fn test_torn_meta_rewrite_opens_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        drop(filled(tmp.path(), 5));
        // status byte landed, the rest of the rewrite did not
        let dir = TraceDir::new(tmp.path());
        let meta_file = OpenOptions::new().write(true).open(dir.meta()).unwrap();
        meta_file
            .write_all_at(&[SessionStatus::Complete as u8], STATUS_OFFSET as u64)
            .unwrap();
        drop(meta_file);
        assert!(SessionMeta::decode(&std::fs::read(dir.meta()).unwrap()).is_err());

        let store = TraceStore::open(tmp.path()).unwrap();
        assert_eq!(store.status(), SessionStatus::Corrupt);
        assert_eq!(store.len(), 5);
        assert!(store.warnings().iter().any(|w| w.contains("torn")));
        assert_eq!(store.read(4).unwrap().header.index, 4);
        drop(store);

        let meta = SessionMeta::decode(&std::fs::read(dir.meta()).unwrap()).unwrap();
        assert_eq!(meta.status, SessionStatus::Corrupt);
        assert_eq!(meta.event_count, 5);
        let again = TraceStore::open(tmp.path()).unwrap();
        assert!(again.warnings().is_empty());
    }

    #[test]
    fn test_bad_payload_digest_detected_on_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = filled(tmp.path(), 3);
        store.finalize(SessionStatus::Complete).unwrap();
        drop(store);
        let dir = TraceDir::new(tmp.path());
        let payload = OpenOptions::new().write(true).open(dir.payload()).unwrap();
        payload.write_all_at(&[0xFF], PAYLOAD_HEADER_SIZE + 1).unwrap();

        let store = TraceStore::open(tmp.path()).unwrap();
        assert!(matches!(store.read(0), Err(StoreError::Corrupt { .. })));
        assert!(store.read(2).is_ok());
    }

    #[test]
    fn test_attach_minidump() {
        let tmp = tempfile::tempdir().unwrap();
        let store = filled(tmp.path(), 1);
        store.attach_minidump(b"RTMD...").unwrap();
        store.finalize(SessionStatus::Crashed).unwrap();
        let reopened = TraceStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.status(), SessionStatus::Crashed);
        let path = reopened.minidump_path().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"RTMD...");
    }

    #[test]
    fn test_sync_every_event() {
        let tmp = tempfile::tempdir().unwrap();
        let options = CreateOptions::new("/bin/demo", 1).with_sync(SyncPolicy::EveryEvent);
        let store = TraceStore::create(tmp.path(), options).unwrap();
        store.append(&event(0, 0, Category::Syscall)).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_bad_magic() {
        let tmp = tempfile::tempdir().unwrap();
        drop(filled(tmp.path(), 1));
        let dir = TraceDir::new(tmp.path());
        let index = OpenOptions::new().write(true).open(dir.index()).unwrap();
        index.write_all_at(b"NOPE", 0).unwrap();
        assert!(matches!(TraceStore::open(tmp.path()), Err(StoreError::BadMagic { .. })));
    }

    #[test]
    fn test_cancel_token_type_is_shared() {
        let token = CancelToken::new();
        let tmp = tempfile::tempdir().unwrap();
        let store = filled(tmp.path(), 4);
        token.cancel();
        let mut iter = store.iter(.., CategoryMask::ALL).with_cancel(token);
        assert!(matches!(iter.next(), Some(Err(StoreError::Cancelled))));
        assert!(iter.next().is_none());
    }
}
