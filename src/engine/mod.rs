//! # Hybrid Storage Engine
//!
//! The engine owns the full write and read paths of the store:
//!
//! - **WAL** — every mutation is durable before it is observable.
//! - **Active memtable** — the single mutable in-memory table.
//! - **Immutable queue** — rotated memtables awaiting flush, newest last.
//! - **LSM tree** — leveled on-disk tables fed by flushes.
//!
//! ## Write path
//!
//! All mutations funnel through one **writer thread** (the batch
//! coalescer). Callers enqueue a command with a completion channel and
//! block on it; the writer drains its queue on a timer tick or once the
//! queue reaches the batch trigger, applying each command through the
//! same internal path: WAL append (blocking until durable) → rotate the
//! active memtable if full → memtable update → acknowledge. Coalescing
//! amortizes scheduling overhead only — commands are applied and
//! acknowledged individually, with no cross-command atomicity.
//!
//! Rotation pushes the active table onto the immutable queue; when the
//! queue exceeds its cap the oldest table is flushed to LSM level 0
//! synchronously, before the rotation completes.
//!
//! ## Read path
//!
//! Active memtable → immutable queue (newest first) → LSM levels. The
//! first layer that knows the key decides: a live value is returned, a
//! tombstone short-circuits to "not found".
//!
//! ## Admission
//!
//! A FIFO ticket scheduler bounds in-flight `put`, `delete`, and `get`
//! operations at `max_concurrent_ops`; excess arrivals wait in arrival
//! order.
//!
//! ## Compaction and shutdown
//!
//! `compact` runs on the writer thread so that no WAL append can slip
//! between the flush-everything step and the WAL checkpoint. `close`
//! drains the scheduler and the writer, flushes all in-memory tables,
//! and closes the WAL; afterwards every operation fails with
//! [`EngineError::NotOpen`].

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub(crate) mod scheduler;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::VecDeque,
    fs,
    path::Path,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{Sender, bounded, tick, unbounded};
use thiserror::Error;
use tracing::{debug, info};

use crate::lsm::{LsmError, LsmTree};
use crate::memtable::{Memtable, MemtableGetResult};
use crate::sstable::TableGetResult;
use crate::wal::{Wal, WalEntryKind, WalError};

use scheduler::Scheduler;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// WAL sub-directory under the engine root.
pub const WAL_DIR: &str = "wal";

/// SSTable sub-directory under the engine root.
pub const LSM_DIR: &str = "lsm";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the LSM tree.
    #[error("LSM error: {0}")]
    Lsm(#[from] LsmError),

    /// Operation arrived after shutdown completed.
    #[error("engine is not open")]
    NotOpen,

    /// Operation arrived while shutdown was in progress.
    #[error("engine is shutting down")]
    Busy,

    /// Internal invariant violation (poisoned lock, dead writer, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`HybridEngine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rotate the active memtable once it holds this many bytes.
    pub memtable_size_bytes: usize,

    /// Immutable-queue cap; exceeding it flushes the oldest table
    /// synchronously.
    pub max_immutable_memtables: usize,

    /// WAL segment rotation threshold.
    pub wal_max_file_bytes: u64,

    /// Fsync after every WAL flush.
    pub sync_writes: bool,

    /// Admission limit for concurrent operations.
    pub max_concurrent_ops: usize,

    /// Writer-queue length that triggers an immediate drain.
    pub batch_size: usize,

    /// Writer drain timer period.
    pub batch_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memtable_size_bytes: 4 * 1024 * 1024,
            max_immutable_memtables: 4,
            wal_max_file_bytes: 64 * 1024 * 1024,
            sync_writes: true,
            max_concurrent_ops: 10,
            batch_size: 50,
            batch_interval: Duration::from_millis(5),
        }
    }
}

/// Snapshot of engine state returned by [`HybridEngine::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    /// Entries (tombstones included) in the active memtable.
    pub active_entries: usize,

    /// Approximate bytes in the active memtable.
    pub active_bytes: usize,

    /// Rotated memtables awaiting flush.
    pub immutable_count: usize,

    /// Tables per LSM level, L0 first.
    pub level_sizes: Vec<usize>,

    /// Indexed entries across all tables.
    pub sstable_entries: usize,

    /// Highest WAL sequence number assigned so far.
    pub last_seq: u64,
}

// ------------------------------------------------------------------------------------------------
// Writer commands
// ------------------------------------------------------------------------------------------------

enum WriteCommand {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        done: Sender<Result<u64, EngineError>>,
    },
    Delete {
        key: Vec<u8>,
        done: Sender<Result<u64, EngineError>>,
    },
    Compact {
        done: Sender<Result<(), EngineError>>,
    },
}

struct WriterHandle {
    tx: Sender<WriteCommand>,
    thread: JoinHandle<()>,
}

// ------------------------------------------------------------------------------------------------
// Engine Core
// ------------------------------------------------------------------------------------------------

/// State behind the engine's reader-writer lock.
struct EngineShared {
    /// The single mutable memtable.
    active: Memtable,

    /// Rotated memtables, oldest at the front.
    immutables: VecDeque<Memtable>,

    /// Persistent leveled tables.
    lsm: LsmTree,
}

/// The hybrid storage engine: WAL + memtables + LSM behind a scheduler
/// and a single writer thread.
pub struct HybridEngine {
    shared: Arc<RwLock<EngineShared>>,
    wal: Arc<Wal>,
    scheduler: Arc<Scheduler>,
    writer: Mutex<Option<WriterHandle>>,
    config: EngineConfig,
    closed: AtomicBool,
}

impl HybridEngine {
    /// Opens (or creates) an engine rooted at the given directory,
    /// replaying the WAL into a fresh active memtable.
    pub fn open(root: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(WalError::Io)?;

        let (wal, recovery) = Wal::open(
            root.join(WAL_DIR),
            config.wal_max_file_bytes,
            config.sync_writes,
        )?;
        let lsm = LsmTree::open(root.join(LSM_DIR))?;

        let mut shared = EngineShared {
            active: Memtable::new(config.memtable_size_bytes),
            immutables: VecDeque::new(),
            lsm,
        };

        // Replay in sequence order; the WAL already dropped everything at
        // or before the last checkpoint.
        let replayed = recovery.entries.len();
        for entry in recovery.entries {
            match entry.kind {
                WalEntryKind::Put => {
                    if shared.active.is_full() {
                        rotate_shared(&mut shared, &config)?;
                    }
                    shared.active.put(entry.key, entry.value);
                }
                WalEntryKind::Delete => {
                    if shared.active.is_full() {
                        rotate_shared(&mut shared, &config)?;
                    }
                    shared.active.delete(entry.key);
                }
                WalEntryKind::Checkpoint => {}
            }
        }
        info!(
            root = %root.display(),
            replayed,
            max_seq = recovery.max_seq,
            "engine recovered"
        );

        let shared = Arc::new(RwLock::new(shared));
        let wal = Arc::new(wal);
        let scheduler = Arc::new(Scheduler::new(config.max_concurrent_ops));

        let writer = spawn_writer(Arc::clone(&shared), Arc::clone(&wal), config.clone())?;

        Ok(Self {
            shared,
            wal,
            scheduler,
            writer: Mutex::new(Some(writer)),
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Writes a key-value pair, returning once it is durable and visible.
    ///
    /// Returns the WAL sequence number assigned to the write.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<u64, EngineError> {
        let _permit = self.scheduler.acquire()?;
        let (done_tx, done_rx) = bounded(1);
        self.send_command(WriteCommand::Put {
            key,
            value,
            done: done_tx,
        })?;
        done_rx
            .recv()
            .map_err(|_| EngineError::Internal("writer terminated before acknowledging".into()))?
    }

    /// Deletes a key by writing a tombstone, returning once durable.
    pub fn delete(&self, key: Vec<u8>) -> Result<u64, EngineError> {
        let _permit = self.scheduler.acquire()?;
        let (done_tx, done_rx) = bounded(1);
        self.send_command(WriteCommand::Delete { key, done: done_tx })?;
        done_rx
            .recv()
            .map_err(|_| EngineError::Internal("writer terminated before acknowledging".into()))?
    }

    /// Looks up one key: active memtable → immutables (newest first) →
    /// LSM levels. Returns the stored (post-codec) bytes.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let _permit = self.scheduler.acquire()?;
        let shared = self.read_shared()?;
        get_in_shared(&shared, key)
    }

    /// Looks up many keys under a single admission slot.
    pub fn get_batch(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, EngineError> {
        let _permit = self.scheduler.acquire()?;
        let shared = self.read_shared()?;
        keys.iter().map(|key| get_in_shared(&shared, key)).collect()
    }

    /// Flushes every in-memory table, compacts any over-capacity level,
    /// and checkpoints + truncates the WAL.
    ///
    /// Runs on the writer thread so no write can interleave between the
    /// flush and the checkpoint.
    pub fn compact(&self) -> Result<(), EngineError> {
        let (done_tx, done_rx) = bounded(1);
        self.send_command(WriteCommand::Compact { done: done_tx })?;
        done_rx
            .recv()
            .map_err(|_| EngineError::Internal("writer terminated before acknowledging".into()))?
    }

    /// Gracefully shuts the engine down: refuses new operations, drains
    /// in-flight ones, flushes all memtables, and closes the WAL.
    /// Idempotent.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.scheduler.begin_drain();

        let handle = self
            .writer
            .lock()
            .map_err(|_| EngineError::Internal("writer mutex poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            // Dropping the sender lets the writer drain its queue and exit
            // once every in-flight caller's clone is gone too.
            drop(handle.tx);
            let _ = handle.thread.join();
        }

        self.scheduler.wait_idle();

        {
            let mut shared = self.write_shared()?;
            while let Some(memtable) = shared.immutables.pop_front() {
                shared.lsm.flush(&memtable)?;
            }
            if !shared.active.is_empty() {
                let full = std::mem::replace(
                    &mut shared.active,
                    Memtable::new(self.config.memtable_size_bytes),
                );
                shared.lsm.flush(&full)?;
            }
        }

        // Everything in memory is now in SSTables; the checkpoint lets the
        // next open skip the replay and drop the old segments.
        self.wal.checkpoint()?;
        self.wal.truncate()?;
        self.wal.close()?;
        self.scheduler.mark_closed();
        self.closed.store(true, Ordering::SeqCst);
        info!("engine closed");
        Ok(())
    }

    /// Snapshot of the engine's layer sizes and sequence position.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let shared = self.read_shared()?;
        Ok(EngineStats {
            active_entries: shared.active.len(),
            active_bytes: shared.active.current_bytes(),
            immutable_count: shared.immutables.len(),
            level_sizes: shared.lsm.level_sizes(),
            sstable_entries: shared.lsm.entry_count(),
            last_seq: self.wal.last_seq(),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn send_command(&self, command: WriteCommand) -> Result<(), EngineError> {
        let tx = {
            let writer = self
                .writer
                .lock()
                .map_err(|_| EngineError::Internal("writer mutex poisoned".into()))?;
            match writer.as_ref() {
                Some(handle) => handle.tx.clone(),
                None => return Err(EngineError::NotOpen),
            }
        };
        tx.send(command).map_err(|_| EngineError::NotOpen)
    }

    fn read_shared(&self) -> Result<std::sync::RwLockReadGuard<'_, EngineShared>, EngineError> {
        self.shared
            .read()
            .map_err(|_| EngineError::Internal("engine state poisoned".into()))
    }

    fn write_shared(&self) -> Result<std::sync::RwLockWriteGuard<'_, EngineShared>, EngineError> {
        self.shared
            .write()
            .map_err(|_| EngineError::Internal("engine state poisoned".into()))
    }
}

impl Drop for HybridEngine {
    fn drop(&mut self) {
        // Stop the writer thread even if close() was never called; the WAL
        // has its own Drop-time flush for pending frames.
        if let Ok(mut guard) = self.writer.lock()
            && let Some(handle) = guard.take()
        {
            drop(handle.tx);
            let _ = handle.thread.join();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Writer thread — batch coalescer
// ------------------------------------------------------------------------------------------------

fn spawn_writer(
    shared: Arc<RwLock<EngineShared>>,
    wal: Arc<Wal>,
    config: EngineConfig,
) -> Result<WriterHandle, EngineError> {
    let (tx, rx) = unbounded::<WriteCommand>();

    let thread = std::thread::Builder::new()
        .name("vesperdb-writer".into())
        .spawn(move || {
            let ticker = tick(config.batch_interval);
            let mut pending: Vec<WriteCommand> = Vec::new();
            loop {
                crossbeam::select! {
                    recv(rx) -> msg => match msg {
                        Ok(command) => {
                            pending.push(command);
                            if pending.len() >= config.batch_size {
                                drain(&shared, &wal, &config, &mut pending);
                            }
                        }
                        Err(_) => {
                            // All senders gone: final drain, then exit.
                            drain(&shared, &wal, &config, &mut pending);
                            break;
                        }
                    },
                    recv(ticker) -> _ => {
                        if !pending.is_empty() {
                            drain(&shared, &wal, &config, &mut pending);
                        }
                    }
                }
            }
            debug!("writer thread exited");
        })
        .map_err(|e| EngineError::Internal(format!("failed to spawn writer: {e}")))?;

    Ok(WriterHandle { tx, thread })
}

/// Applies and acknowledges every queued command, in arrival order.
fn drain(
    shared: &RwLock<EngineShared>,
    wal: &Wal,
    config: &EngineConfig,
    pending: &mut Vec<WriteCommand>,
) {
    for command in pending.drain(..) {
        match command {
            WriteCommand::Put { key, value, done } => {
                let result = apply_put(shared, wal, config, key, value);
                let _ = done.send(result);
            }
            WriteCommand::Delete { key, done } => {
                let result = apply_delete(shared, wal, config, key);
                let _ = done.send(result);
            }
            WriteCommand::Compact { done } => {
                let result = apply_compact(shared, wal, config);
                let _ = done.send(result);
            }
        }
    }
}

/// WAL first, then memory: the entry must be durable before the memtable
/// update makes it visible. A WAL failure leaves memory untouched.
fn apply_put(
    shared: &RwLock<EngineShared>,
    wal: &Wal,
    config: &EngineConfig,
    key: Vec<u8>,
    value: Vec<u8>,
) -> Result<u64, EngineError> {
    let seq = wal.append_put(&key, &value)?;

    let mut guard = shared
        .write()
        .map_err(|_| EngineError::Internal("engine state poisoned".into()))?;
    if guard.active.is_full() {
        rotate_shared(&mut guard, config)?;
    }
    guard.active.put(key, value);
    Ok(seq)
}

fn apply_delete(
    shared: &RwLock<EngineShared>,
    wal: &Wal,
    config: &EngineConfig,
    key: Vec<u8>,
) -> Result<u64, EngineError> {
    let seq = wal.append_delete(&key)?;

    let mut guard = shared
        .write()
        .map_err(|_| EngineError::Internal("engine state poisoned".into()))?;
    if guard.active.is_full() {
        rotate_shared(&mut guard, config)?;
    }
    guard.active.delete(key);
    Ok(seq)
}

/// Flush everything in memory, sweep the LSM, then checkpoint + truncate
/// the WAL. Caller is the writer thread, so no append can interleave
/// between the flush and the checkpoint — the checkpoint covers exactly
/// the flushed state.
fn apply_compact(
    shared: &RwLock<EngineShared>,
    wal: &Wal,
    config: &EngineConfig,
) -> Result<(), EngineError> {
    {
        let mut guard = shared
            .write()
            .map_err(|_| EngineError::Internal("engine state poisoned".into()))?;
        while let Some(memtable) = guard.immutables.pop_front() {
            guard.lsm.flush(&memtable)?;
        }
        if !guard.active.is_empty() {
            let full = std::mem::replace(
                &mut guard.active,
                Memtable::new(config.memtable_size_bytes),
            );
            guard.lsm.flush(&full)?;
        }
        guard.lsm.compact()?;
    }

    wal.checkpoint()?;
    wal.truncate()?;
    debug!("compaction finished");
    Ok(())
}

/// Moves the active memtable onto the immutable queue and installs a
/// fresh one, flushing the oldest queued table if the cap is exceeded.
fn rotate_shared(shared: &mut EngineShared, config: &EngineConfig) -> Result<(), EngineError> {
    let full = std::mem::replace(
        &mut shared.active,
        Memtable::new(config.memtable_size_bytes),
    );
    debug!(
        entries = full.len(),
        bytes = full.current_bytes(),
        queued = shared.immutables.len(),
        "memtable rotated"
    );
    shared.immutables.push_back(full);

    if shared.immutables.len() > config.max_immutable_memtables {
        if let Some(oldest) = shared.immutables.pop_front() {
            shared.lsm.flush(&oldest)?;
        }
    }
    Ok(())
}

/// Layered lookup; a tombstone at any layer short-circuits to absent.
fn get_in_shared(shared: &EngineShared, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
    match shared.active.get(key) {
        MemtableGetResult::Value(value) => return Ok(Some(value)),
        MemtableGetResult::Tombstone => return Ok(None),
        MemtableGetResult::NotFound => {}
    }

    for memtable in shared.immutables.iter().rev() {
        match memtable.get(key) {
            MemtableGetResult::Value(value) => return Ok(Some(value)),
            MemtableGetResult::Tombstone => return Ok(None),
            MemtableGetResult::NotFound => {}
        }
    }

    match shared.lsm.get(key)? {
        TableGetResult::Value(value) => Ok(Some(value)),
        TableGetResult::Tombstone => Ok(None),
        TableGetResult::NotFound => Ok(None),
    }
}
