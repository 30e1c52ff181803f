//! # Database Facade
//!
//! The public surface of the store. A [`Database`] wires together the
//! four collaborators and keeps their contracts straight:
//!
//! - the [`HybridEngine`] for durable reads and writes,
//! - the [`MultiLevelCache`] in front of the engine's read path,
//! - the [`ChangeBus`] for post-acknowledgment notifications,
//! - a [`Codec`] transforming values at rest (identity by default).
//!
//! ## Value flow
//!
//! `put` encodes the user value once; the cache and the engine only ever
//! see post-codec bytes. `get` decodes on the way out, whether the bytes
//! came from the cache or the engine. Change events carry the *user*
//! value, not the stored form.
//!
//! ## Error taxonomy
//!
//! [`DbError`] is the crate's user-facing error surface: `NotOpen`,
//! `Io`, `Corrupt`, `InvalidConfig`, `Codec`, `Busy`. Engine-internal
//! errors are classified into it by [`Database`]; locally recovered
//! conditions (truncated WAL tails, unreadable tables) never surface
//! here at all.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fmt, fs, io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use regex::bytes::Regex;
use thiserror::Error;
use tracing::info;

use crate::bus::{ChangeBus, ChangeEvent, ChangeKind};
use crate::cache::{CacheLevel, CacheStats, MultiLevelCache};
use crate::engine::{EngineConfig, EngineError, EngineStats, HybridEngine};
use crate::lsm::LsmError;
use crate::sstable::SSTableError;
use crate::wal::{WalError, now_ms};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// A codec rejected its input (e.g. wrong key material, malformed frame).
#[derive(Debug, Error)]
#[error("codec failure: {0}")]
pub struct CodecError(pub String);

/// User-facing errors of the database surface.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Operation invoked after `close` (or before a successful `open`).
    #[error("database is not open")]
    NotOpen,

    /// Disk read/write failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Database path the failure belongs to.
        path: PathBuf,
        /// Underlying OS error.
        source: io::Error,
    },

    /// Malformed framing that could not be recovered locally.
    #[error("corrupt {region}: {detail}")]
    Corrupt {
        /// Which on-disk region was malformed.
        region: &'static str,
        detail: String,
    },

    /// Nonsensical configuration at open.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The value codec rejected its input.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Operation rejected because shutdown is in progress.
    #[error("database is shutting down")]
    Busy,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Codec seam
// ------------------------------------------------------------------------------------------------

/// Value-at-rest transformation applied below the public surface.
///
/// `decode` must be a total inverse of `encode`: for every byte string
/// `v`, `decode(encode(v)) == v`. The engine and cache store only
/// post-encode bytes.
pub trait Codec: Send + Sync {
    /// Transforms a user value into its stored form.
    fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Inverts [`Codec::encode`].
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// The identity transformation; the default codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// All tunables of a [`Database`], with production defaults.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Rotate the active memtable at this size.
    pub memtable_size_bytes: usize,

    /// Advisory block size; unused by the current read path.
    pub page_size: usize,

    /// Max entries in cache level 1.
    pub l1_cache_size: usize,

    /// Max entries in cache level 2.
    pub l2_cache_size: usize,

    /// Max entries in cache level 3.
    pub l3_cache_size: usize,

    /// Advisory flag for a future compressing codec slot.
    pub compression_enabled: bool,

    /// Fsync after every WAL flush.
    pub sync_writes: bool,

    /// Immutable-memtable queue cap before synchronous flush.
    pub max_immutable_memtables: usize,

    /// WAL segment rotation threshold.
    pub wal_max_file_bytes: u64,

    /// Scheduler admission limit.
    pub max_concurrent_ops: usize,

    /// Write-coalescer drain trigger (queued operations).
    pub batch_size: usize,

    /// Write-coalescer timer period in milliseconds.
    pub batch_interval_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            memtable_size_bytes: 4 * 1024 * 1024,
            page_size: 4096,
            l1_cache_size: 1000,
            l2_cache_size: 10_000,
            l3_cache_size: 100,
            compression_enabled: true,
            sync_writes: true,
            max_immutable_memtables: 4,
            wal_max_file_bytes: 64 * 1024 * 1024,
            max_concurrent_ops: 10,
            batch_size: 50,
            batch_interval_ms: 5,
        }
    }
}

impl DbConfig {
    /// Rejects values the engine would divide by or wait on forever.
    pub fn validate(&self) -> Result<(), DbError> {
        let checks: [(&str, bool); 8] = [
            ("memtable_size_bytes", self.memtable_size_bytes > 0),
            ("l1_cache_size", self.l1_cache_size > 0),
            ("l2_cache_size", self.l2_cache_size > 0),
            ("l3_cache_size", self.l3_cache_size > 0),
            ("max_immutable_memtables", self.max_immutable_memtables > 0),
            ("wal_max_file_bytes", self.wal_max_file_bytes > 0),
            ("max_concurrent_ops", self.max_concurrent_ops > 0),
            ("batch_size", self.batch_size > 0),
        ];
        for (name, ok) in checks {
            if !ok {
                return Err(DbError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.batch_interval_ms == 0 {
            return Err(DbError::InvalidConfig(
                "batch_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            memtable_size_bytes: self.memtable_size_bytes,
            max_immutable_memtables: self.max_immutable_memtables,
            wal_max_file_bytes: self.wal_max_file_bytes,
            sync_writes: self.sync_writes,
            max_concurrent_ops: self.max_concurrent_ops,
            batch_size: self.batch_size,
            batch_interval: Duration::from_millis(self.batch_interval_ms),
        }
    }
}

/// Combined snapshot returned by [`Database::stats`].
#[derive(Debug, Clone)]
pub struct DbStats {
    /// Engine layer sizes and sequence position.
    pub engine: EngineStats,

    /// Cache counters.
    pub cache: CacheStats,
}

// ------------------------------------------------------------------------------------------------
// Database facade
// ------------------------------------------------------------------------------------------------

/// An open database handle.
///
/// Cheap operations (`get` on a cache hit) never touch disk; writes are
/// acknowledged only after WAL durability. Dropping the handle without
/// [`Database::close`] is crash-equivalent and safe — acknowledged
/// writes replay from the WAL on the next open.
pub struct Database {
    name: String,
    root: PathBuf,
    engine: HybridEngine,
    cache: MultiLevelCache,
    bus: ChangeBus,
    codec: Box<dyn Codec>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (or creates) a database named `name` at `./<name>` with the
    /// identity codec.
    pub fn open(name: &str, config: DbConfig) -> Result<Self, DbError> {
        Self::open_with(name, config, None, None)
    }

    /// Opens (or creates) a database with an explicit codec and/or root
    /// path. `path` defaults to `./<name>`.
    pub fn open_with(
        name: &str,
        config: DbConfig,
        codec: Option<Box<dyn Codec>>,
        path: Option<PathBuf>,
    ) -> Result<Self, DbError> {
        config.validate()?;

        let root = path.unwrap_or_else(|| PathBuf::from(name));
        fs::create_dir_all(&root).map_err(|source| DbError::Io {
            path: root.clone(),
            source,
        })?;

        let engine = HybridEngine::open(&root, config.engine_config())
            .map_err(|e| classify_engine_error(&root, e))?;

        let cache = MultiLevelCache::new(
            nonzero(config.l1_cache_size)?,
            nonzero(config.l2_cache_size)?,
            nonzero(config.l3_cache_size)?,
        );

        info!(name, root = %root.display(), "database opened");

        Ok(Self {
            name: name.to_string(),
            root,
            engine,
            cache,
            bus: ChangeBus::new(),
            codec: codec.unwrap_or_else(|| Box::new(IdentityCodec)),
        })
    }

    /// Writes a key-value pair. Returns once the write is durable and
    /// visible; then publishes a `Put` event carrying the user value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        let encoded = self.codec.encode(value)?;

        self.cache.put(key, encoded.clone(), CacheLevel::L1);
        if let Err(e) = self.engine.put(key.to_vec(), encoded) {
            // A write that failed durability must not linger as a hit.
            self.cache.remove(key);
            return Err(self.engine_error(e));
        }

        self.bus.emit(ChangeEvent {
            kind: ChangeKind::Put,
            key: key.to_vec(),
            value: Some(value.to_vec()),
            ts_ms: now_ms(),
        });
        Ok(())
    }

    /// Reads a key: cache first, engine on miss (with L1 insertion).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        if let Some(encoded) = self.cache.get(key) {
            return Ok(Some(self.codec.decode(&encoded)?));
        }

        match self.engine.get(key).map_err(|e| self.engine_error(e))? {
            Some(encoded) => {
                self.cache.put(key, encoded.clone(), CacheLevel::L1);
                Ok(Some(self.codec.decode(&encoded)?))
            }
            None => Ok(None),
        }
    }

    /// Deletes a key, then publishes a `Delete` event.
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.engine
            .delete(key.to_vec())
            .map_err(|e| self.engine_error(e))?;
        self.cache.remove(key);

        self.bus.emit(ChangeEvent {
            kind: ChangeKind::Delete,
            key: key.to_vec(),
            value: None,
            ts_ms: now_ms(),
        });
        Ok(())
    }

    /// Writes several pairs, each applied and published individually in
    /// iteration order. No cross-key atomicity: a failure leaves earlier
    /// pairs written.
    pub fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<(), DbError> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Reads several keys through the cached path.
    pub fn get_batch(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, DbError> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Flushes all in-memory tables to disk, merges over-capacity levels,
    /// and truncates the WAL.
    pub fn compact(&self) -> Result<(), DbError> {
        self.engine.compact().map_err(|e| self.engine_error(e))
    }

    /// Subscribes to every committed change.
    pub fn subscribe_all(&self) -> crossbeam::channel::Receiver<ChangeEvent> {
        self.bus.subscribe_all()
    }

    /// Subscribes to changes whose key matches a literal pattern with an
    /// optional trailing `*` wildcard.
    pub fn subscribe_pattern(&self, pattern: &str) -> crossbeam::channel::Receiver<ChangeEvent> {
        self.bus.subscribe_pattern(pattern)
    }

    /// Removes every cached entry whose key matches `pattern`.
    ///
    /// Purely a cache operation: persistent data is unaffected.
    pub fn invalidate_cache(&self, pattern: &Regex) -> usize {
        self.cache.invalidate_pattern(pattern)
    }

    /// Engine and cache counters.
    pub fn stats(&self) -> Result<DbStats, DbError> {
        Ok(DbStats {
            engine: self.engine.stats().map_err(|e| self.engine_error(e))?,
            cache: self.cache.stats(),
        })
    }

    /// Gracefully shuts down: drains in-flight operations, flushes all
    /// memtables, closes the WAL, and disconnects subscribers.
    /// Idempotent; afterwards every operation fails with
    /// [`DbError::NotOpen`].
    pub fn close(&self) -> Result<(), DbError> {
        self.engine.close().map_err(|e| self.engine_error(e))?;
        self.bus.close();
        self.cache.clear();
        info!(name = %self.name, "database closed");
        Ok(())
    }

    /// The database's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory holding this database's files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn engine_error(&self, error: EngineError) -> DbError {
        classify_engine_error(&self.root, error)
    }
}

// ------------------------------------------------------------------------------------------------
// Error classification
// ------------------------------------------------------------------------------------------------

fn nonzero(value: usize) -> Result<NonZeroUsize, DbError> {
    NonZeroUsize::new(value)
        .ok_or_else(|| DbError::InvalidConfig("cache capacity must be non-zero".into()))
}

/// Folds the engine's nested error types into the user-facing taxonomy.
fn classify_engine_error(root: &Path, error: EngineError) -> DbError {
    match error {
        EngineError::NotOpen => DbError::NotOpen,
        EngineError::Busy => DbError::Busy,
        EngineError::Wal(WalError::Io(source)) => DbError::Io {
            path: root.to_path_buf(),
            source,
        },
        EngineError::Wal(WalError::FlushFailed(detail)) => DbError::Io {
            path: root.to_path_buf(),
            source: io::Error::other(detail),
        },
        EngineError::Wal(WalError::Encoding(e)) => DbError::Corrupt {
            region: "wal",
            detail: e.to_string(),
        },
        EngineError::Wal(WalError::Closed) => DbError::NotOpen,
        EngineError::Wal(e) => DbError::Internal(e.to_string()),
        EngineError::Lsm(LsmError::Io(source)) => DbError::Io {
            path: root.to_path_buf(),
            source,
        },
        EngineError::Lsm(LsmError::Table(SSTableError::Io(source))) => DbError::Io {
            path: root.to_path_buf(),
            source,
        },
        EngineError::Lsm(LsmError::Table(SSTableError::Corrupt(detail))) => DbError::Corrupt {
            region: "sstable",
            detail,
        },
        EngineError::Lsm(LsmError::Table(SSTableError::Encoding(e))) => DbError::Corrupt {
            region: "sstable",
            detail: e.to_string(),
        },
        EngineError::Lsm(e) => DbError::Internal(e.to_string()),
        EngineError::Internal(detail) => DbError::Internal(detail),
    }
}
