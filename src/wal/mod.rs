//! Write-Ahead Logging (WAL) Module
//!
//! This module implements a **durable**, **append-only** write-ahead log with
//! group commit, file rotation, checkpointing, and crash recovery.  Every
//! mutation accepted by the storage engine is framed and persisted here
//! *before* it becomes observable in memory.
//!
//! # On-disk layout
//!
//! Log files live in a dedicated directory as `wal_<16-digit-ms>.wal`, zero
//! padded so that plain filename order equals creation order.  Each file is a
//! sequence of frames:
//!
//! ```text
//! [ENTRY_LEN_LE (4 B)][ENTRY_BODY]
//! [ENTRY_LEN_LE (4 B)][ENTRY_BODY]
//! ...
//! ```
//!
//! An entry body is `[u8 kind][u64 seq][u64 ts_ms][u32 key_len][key]
//! [u32 val_len][val]`, little-endian throughout (see [`WalEntry`]).  Delete
//! and checkpoint entries carry an empty value; checkpoints also carry an
//! empty key.
//!
//! # Group commit
//!
//! Appends land in a pending buffer and are flushed to disk by one of three
//! triggers:
//!
//! 1. a background flusher thread on a 1 ms tick,
//! 2. the pending buffer reaching [`MAX_PENDING_ENTRIES`] entries,
//! 3. synchronously, for every delete.
//!
//! A caller does not return from [`Wal::append_put`] until the flush covering
//! its entry has completed, so acknowledged writes are always durable.  When
//! a flush fails, the entries it covered are reported as not durable to every
//! waiter and the in-memory state must not be updated for them.
//!
//! # Recovery
//!
//! [`Wal::open`] scans all log files in filename order and replays their
//! frames.  A short or malformed frame terminates the scan for that file —
//! trailing corruption from a crash mid-write loses at most the unflushed
//! tail.  Entries at or before the last checkpoint are dropped from the
//! replay result; the checkpoint contract guarantees they are reflected in
//! SSTables.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::JoinHandle,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crossbeam::channel::{Sender, bounded, tick};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// File extension for log segments.
const WAL_FILE_EXT: &str = "wal";

/// Interval of the background flusher thread.
const FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Pending-buffer entry count that forces an immediate flush.
pub const MAX_PENDING_ENTRIES: usize = 1000;

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A flush covering this entry failed; the entry is not durable.
    #[error("Entry not durable, flush failed: {0}")]
    FlushFailed(String),

    /// The log was closed before or during this operation.
    #[error("WAL is closed")]
    Closed,

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Entry structures
// ------------------------------------------------------------------------------------------------

/// Kind of a [`WalEntry`], stored as the first byte of the entry body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryKind {
    /// Insert or update of a single key.
    Put = 0,

    /// Point deletion (tombstone) of a single key.
    Delete = 1,

    /// Marker: all prior entries are durably reflected in SSTables.
    Checkpoint = 2,
}

/// One logical record in the write-ahead log.
///
/// Entries are appended on every user write, read back once during
/// recovery, and deleted in bulk by [`Wal::truncate`] after a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    /// What this entry records.
    pub kind: WalEntryKind,

    /// Monotonically increasing sequence number.
    pub seq: u64,

    /// Wall-clock timestamp in milliseconds since the UNIX epoch.
    pub ts_ms: u64,

    /// The affected key (empty for checkpoints).
    pub key: Vec<u8>,

    /// The written value (empty for deletes and checkpoints).
    pub value: Vec<u8>,
}

impl Encode for WalEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.kind as u8).encode_to(buf)?;
        self.seq.encode_to(buf)?;
        self.ts_ms.encode_to(buf)?;
        encoding::encode_bytes(&self.key, buf)?;
        encoding::encode_bytes(&self.value, buf)?;
        Ok(())
    }
}

impl Decode for WalEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (kind_byte, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let kind = match kind_byte {
            0 => WalEntryKind::Put,
            1 => WalEntryKind::Delete,
            2 => WalEntryKind::Checkpoint,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(other),
                    type_name: "WalEntryKind",
                });
            }
        };
        let (seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (ts_ms, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                kind,
                seq,
                ts_ms,
                key,
                value,
            },
            offset,
        ))
    }
}

/// Result of scanning the log directory during [`Wal::open`].
#[derive(Debug)]
pub struct WalRecovery {
    /// Entries newer than the last checkpoint, in sequence order.
    pub entries: Vec<WalEntry>,

    /// Highest sequence number observed across *all* scanned entries,
    /// including those dropped by the checkpoint cut. Zero for a fresh log.
    pub max_seq: u64,
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// State mutated under the [`WalShared`] mutex.
struct WalState {
    /// Active log segment.
    file: File,

    /// Path of the active segment.
    path: PathBuf,

    /// Bytes flushed into the active segment so far.
    file_bytes: u64,

    /// Encoded frames awaiting flush.
    pending: Vec<u8>,

    /// Number of entries in `pending`.
    pending_entries: usize,

    /// Sequence number of the newest pending entry.
    pending_last_seq: u64,

    /// Next sequence number to assign.
    next_seq: u64,

    /// Highest sequence number known durable on disk.
    flushed_seq: u64,

    /// Highest sequence number covered by a *failed* flush.
    failed_through: u64,

    /// Message of the most recent flush failure.
    last_error: Option<String>,

    /// Set once `close()` ran; all further appends are rejected.
    closed: bool,
}

/// Fields shared between the public handle and the flusher thread.
struct WalShared {
    state: Mutex<WalState>,
    flushed: Condvar,
    dir: PathBuf,
    max_file_bytes: u64,
    sync_writes: bool,
}

/// Append-only write-ahead log with group commit and rotation.
///
/// See the [module-level documentation](self) for format, flush triggers,
/// and recovery semantics.
pub struct Wal {
    shared: Arc<WalShared>,
    flusher: Mutex<Option<FlusherHandle>>,
}

struct FlusherHandle {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

impl Wal {
    /// Opens the log directory, replays existing segments, and starts a
    /// fresh active segment plus the background flusher thread.
    ///
    /// # Parameters
    /// - `dir`: Directory holding `*.wal` segments (created if absent).
    /// - `max_file_bytes`: Rotation threshold for the active segment.
    /// - `sync_writes`: Fsync after every flush when `true`.
    ///
    /// # Returns
    /// The ready-to-append [`Wal`] and the [`WalRecovery`] holding every
    /// entry newer than the last checkpoint, for replay into a memtable.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        max_file_bytes: u64,
        sync_writes: bool,
    ) -> Result<(Self, WalRecovery), WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let recovery = Self::scan_dir(&dir)?;
        let next_seq = recovery.max_seq + 1;

        let (file, path) = create_segment(&dir)?;

        info!(
            dir = %dir.display(),
            replayed = recovery.entries.len(),
            max_seq = recovery.max_seq,
            active = %path.display(),
            "WAL opened"
        );

        let shared = Arc::new(WalShared {
            state: Mutex::new(WalState {
                file,
                path,
                file_bytes: 0,
                pending: Vec::new(),
                pending_entries: 0,
                pending_last_seq: 0,
                next_seq,
                flushed_seq: next_seq - 1,
                failed_through: 0,
                last_error: None,
                closed: false,
            }),
            flushed: Condvar::new(),
            dir,
            max_file_bytes,
            sync_writes,
        });

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let flusher_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("vesperdb-wal-flush".into())
            .spawn(move || {
                let ticker = tick(FLUSH_INTERVAL);
                loop {
                    crossbeam::select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let mut state = match flusher_shared.state.lock() {
                                Ok(guard) => guard,
                                Err(_) => break,
                            };
                            if state.closed {
                                break;
                            }
                            if state.pending_entries > 0 {
                                // Failures are recorded in the state and
                                // surfaced to the waiters they covered.
                                let _ = flusher_shared.flush_locked(&mut state);
                            }
                        }
                    }
                }
            })
            .map_err(|e| WalError::Internal(format!("failed to spawn flusher: {e}")))?;

        Ok((
            Self {
                shared,
                flusher: Mutex::new(Some(FlusherHandle {
                    shutdown: shutdown_tx,
                    thread,
                })),
            },
            recovery,
        ))
    }

    /// Appends a `Put` entry and blocks until it is durable.
    ///
    /// Returns the sequence number assigned to the entry.
    pub fn append_put(&self, key: &[u8], value: &[u8]) -> Result<u64, WalError> {
        let mut state = self.lock_state()?;
        if state.closed {
            return Err(WalError::Closed);
        }

        let seq = self.enqueue_locked(&mut state, WalEntryKind::Put, key, value)?;

        if state.pending_entries >= MAX_PENDING_ENTRIES {
            self.shared.flush_locked(&mut state)?;
            return Ok(seq);
        }

        self.wait_durable(state, seq)
    }

    /// Appends a `Delete` entry (tombstone) and flushes synchronously.
    ///
    /// Returns the sequence number assigned to the entry.
    pub fn append_delete(&self, key: &[u8]) -> Result<u64, WalError> {
        let mut state = self.lock_state()?;
        if state.closed {
            return Err(WalError::Closed);
        }

        let seq = self.enqueue_locked(&mut state, WalEntryKind::Delete, key, &[])?;
        self.shared.flush_locked(&mut state)?;
        Ok(seq)
    }

    /// Drains pending entries, appends a checkpoint marker, and rotates to
    /// a fresh segment.
    ///
    /// After a checkpoint, recovery ignores everything written before it.
    pub fn checkpoint(&self) -> Result<(), WalError> {
        let mut state = self.lock_state()?;
        if state.closed {
            return Err(WalError::Closed);
        }

        self.shared.flush_locked(&mut state)?;
        self.enqueue_locked(&mut state, WalEntryKind::Checkpoint, &[], &[])?;
        self.shared.flush_locked(&mut state)?;
        self.shared.rotate_locked(&mut state)?;

        info!(active = %state.path.display(), "WAL checkpoint written");
        Ok(())
    }

    /// Deletes every segment except the active one.
    ///
    /// Callers checkpoint first; the deleted segments' entries are then
    /// durably represented by SSTables.
    pub fn truncate(&self) -> Result<(), WalError> {
        let state = self.lock_state()?;
        let active = state.path.clone();
        // Hold the lock across deletion so rotation cannot race the scan.
        let mut removed = 0usize;
        for path in list_segments(&self.shared.dir)? {
            if path != active {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        drop(state);

        info!(removed, "WAL truncated to active segment");
        Ok(())
    }

    /// Stops the flusher, drains pending entries, and closes the active
    /// segment. Idempotent.
    pub fn close(&self) -> Result<(), WalError> {
        // Stop the background flusher first so it cannot race the drain.
        if let Some(handle) = self
            .flusher
            .lock()
            .map_err(|_| WalError::Internal("flusher mutex poisoned".into()))?
            .take()
        {
            let _ = handle.shutdown.send(());
            let _ = handle.thread.join();
        }

        let mut state = self.lock_state()?;
        if state.closed {
            return Ok(());
        }
        self.shared.flush_locked(&mut state)?;
        state.file.sync_all()?;
        state.closed = true;

        debug!(active = %state.path.display(), "WAL closed");
        Ok(())
    }

    /// Highest sequence number assigned so far (zero before the first append).
    pub fn last_seq(&self) -> u64 {
        match self.shared.state.lock() {
            Ok(state) => state.next_seq - 1,
            Err(_) => 0,
        }
    }

    /// Path of the active segment.
    pub fn active_path(&self) -> Result<PathBuf, WalError> {
        Ok(self.lock_state()?.path.clone())
    }

    /// Flushed size of the active segment in bytes.
    pub fn active_file_bytes(&self) -> Result<u64, WalError> {
        Ok(self.lock_state()?.file_bytes)
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn lock_state(&self) -> Result<MutexGuard<'_, WalState>, WalError> {
        self.shared
            .state
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))
    }

    /// Assigns the next sequence number and frames the entry into the
    /// pending buffer.
    fn enqueue_locked(
        &self,
        state: &mut WalState,
        kind: WalEntryKind,
        key: &[u8],
        value: &[u8],
    ) -> Result<u64, WalError> {
        let seq = state.next_seq;
        let entry = WalEntry {
            kind,
            seq,
            ts_ms: now_ms(),
            key: key.to_vec(),
            value: value.to_vec(),
        };

        let body = encoding::encode_to_vec(&entry)?;
        let body_len = u32::try_from(body.len())
            .map_err(|_| WalError::Internal(format!("entry of {} bytes exceeds frame", body.len())))?;

        state.pending.extend_from_slice(&body_len.to_le_bytes());
        state.pending.extend_from_slice(&body);
        state.pending_entries += 1;
        state.pending_last_seq = seq;
        state.next_seq += 1;

        trace!(seq, kind = ?kind, len = body.len(), "WAL entry enqueued");
        Ok(seq)
    }

    /// Blocks until `seq` is covered by a successful flush, or returns the
    /// recorded failure if the covering flush failed.
    fn wait_durable(
        &self,
        mut state: MutexGuard<'_, WalState>,
        seq: u64,
    ) -> Result<u64, WalError> {
        loop {
            if state.flushed_seq >= seq {
                return Ok(seq);
            }
            if state.failed_through >= seq {
                let cause = state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown flush failure".into());
                return Err(WalError::FlushFailed(cause));
            }
            if state.closed {
                return Err(WalError::Closed);
            }
            state = self
                .shared
                .flushed
                .wait(state)
                .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;
        }
    }

    /// Scans all segments in filename order and collects replayable entries.
    fn scan_dir(dir: &Path) -> Result<WalRecovery, WalError> {
        let mut entries = Vec::new();
        for path in list_segments(dir)? {
            read_segment(&path, &mut entries)?;
        }

        let max_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0);

        // Entries at or before the newest checkpoint are already in SSTables.
        if let Some(pos) = entries
            .iter()
            .rposition(|e| e.kind == WalEntryKind::Checkpoint)
        {
            entries.drain(..=pos);
        }

        Ok(WalRecovery { entries, max_seq })
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.flusher.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.shutdown.send(());
            let _ = handle.thread.join();
        }
        match self.shared.state.lock() {
            Ok(mut state) => {
                if !state.closed {
                    if let Err(e) = self.shared.flush_locked(&mut state) {
                        error!(error = %e, "WAL flush failed on drop");
                    }
                    if let Err(e) = state.file.sync_all() {
                        error!(error = %e, "WAL sync failed on drop");
                    }
                }
            }
            Err(_) => warn!("WAL state poisoned on drop; skipping final sync"),
        }
    }
}

impl WalShared {
    /// Writes the pending buffer to the active segment and wakes waiters.
    ///
    /// On failure the covered entries are marked not-durable; waiters for
    /// them receive [`WalError::FlushFailed`] and the buffer is discarded.
    fn flush_locked(&self, state: &mut WalState) -> Result<(), WalError> {
        if state.pending.is_empty() {
            return Ok(());
        }

        let write_result = (|| -> io::Result<()> {
            state.file.write_all(&state.pending)?;
            if self.sync_writes {
                state.file.sync_all()?;
            }
            Ok(())
        })();

        match write_result {
            Ok(()) => {
                state.file_bytes += state.pending.len() as u64;
                state.flushed_seq = state.pending_last_seq;
                trace!(
                    flushed_seq = state.flushed_seq,
                    entries = state.pending_entries,
                    bytes = state.pending.len(),
                    "WAL flushed"
                );
                state.pending.clear();
                state.pending_entries = 0;
                self.flushed.notify_all();

                if state.file_bytes >= self.max_file_bytes {
                    self.rotate_locked(state)?;
                }
                Ok(())
            }
            Err(e) => {
                state.failed_through = state.pending_last_seq;
                state.last_error = Some(e.to_string());
                state.pending.clear();
                state.pending_entries = 0;
                self.flushed.notify_all();
                error!(error = %e, "WAL flush failed; covered entries not durable");
                Err(WalError::Io(e))
            }
        }
    }

    /// Closes the active segment and opens the next one.
    fn rotate_locked(&self, state: &mut WalState) -> Result<(), WalError> {
        state.file.sync_all()?;
        let (file, path) = create_segment(&self.dir)?;
        info!(
            from = %state.path.display(),
            to = %path.display(),
            bytes = state.file_bytes,
            "WAL segment rotated"
        );
        state.file = file;
        state.path = path;
        state.file_bytes = 0;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Segment file helpers
// ------------------------------------------------------------------------------------------------

/// Creates a new `wal_<16-digit-ms>.wal` segment, bumping the millisecond
/// until the name is free so filename order tracks creation order.
fn create_segment(dir: &Path) -> Result<(File, PathBuf), WalError> {
    let mut ts = now_ms();
    loop {
        let path = dir.join(format!("wal_{ts:016}.{WAL_FILE_EXT}"));
        match OpenOptions::new().create_new(true).append(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => ts += 1,
            Err(e) => return Err(WalError::Io(e)),
        }
    }
}

/// All `*.wal` segments in the directory, sorted by filename.
fn list_segments(dir: &Path) -> Result<Vec<PathBuf>, WalError> {
    let mut segments = Vec::new();
    for dir_entry in fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some(WAL_FILE_EXT) {
            segments.push(path);
        }
    }
    segments.sort();
    Ok(segments)
}

/// Parses one segment's frames into `out`, stopping at the first short or
/// malformed frame.
fn read_segment(path: &Path, out: &mut Vec<WalEntry>) -> Result<(), WalError> {
    let data = fs::read(path)?;
    let mut offset = 0usize;

    while data.len() - offset >= U32_SIZE {
        let len_bytes: [u8; 4] = match data[offset..offset + U32_SIZE].try_into() {
            Ok(b) => b,
            Err(_) => break,
        };
        let frame_len = u32::from_le_bytes(len_bytes) as usize;

        if frame_len == 0 || frame_len > data.len() - offset - U32_SIZE {
            warn!(
                path = %path.display(),
                offset,
                frame_len,
                "truncated WAL frame, stopping replay for this segment"
            );
            return Ok(());
        }

        let body = &data[offset + U32_SIZE..offset + U32_SIZE + frame_len];
        match WalEntry::decode_from(body) {
            Ok((entry, consumed)) if consumed == frame_len => {
                trace!(seq = entry.seq, kind = ?entry.kind, "WAL entry replayed");
                out.push(entry);
                offset += U32_SIZE + frame_len;
            }
            Ok(_) | Err(_) => {
                warn!(
                    path = %path.display(),
                    offset,
                    "malformed WAL frame, stopping replay for this segment"
                );
                return Ok(());
            }
        }
    }

    if offset < data.len() {
        warn!(
            path = %path.display(),
            trailing = data.len() - offset,
            "trailing bytes after last complete WAL frame"
        );
    }
    Ok(())
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}
