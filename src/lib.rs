//! # VesperDB
//!
//! An embeddable, persistent key-value storage core built on a **hybrid
//! Log-Structured Merge (LSM)** architecture: a WAL-backed write path, a
//! three-level read cache, and in-process change notifications. Designed
//! for fast acknowledged writes, cache-hit reads, and crash-safe
//! operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Database                           │
//! │   ┌─────────┐   ┌───────────────────────────────────────┐ │
//! │   │  Codec  │   │            MultiLevelCache            │ │
//! │   └────┬────┘   │      L1 (LRU) → L2 (LRU) → L3 (LFU)   │ │
//! │        │        └───────────────────┬───────────────────┘ │
//! │        ▼                            ▼ miss                │
//! │   ┌───────────────────────────────────────────────────┐   │
//! │   │                  HybridEngine                     │   │
//! │   │  ┌─────────┐  ┌────────────┐  ┌───────────────┐   │   │
//! │   │  │ Active  │  │ Immutable  │  │   LSM levels  │   │   │
//! │   │  │memtable │  │  memtable  │  │  L0 … L6 of   │   │   │
//! │   │  │ + WAL   │  │   queue    │  │   SSTables    │   │   │
//! │   │  └────┬────┘  └─────┬──────┘  └───────┬───────┘   │   │
//! │   │       │ rotate      │ flush           │ compact   │   │
//! │   │       └────────►    └───────►         ▼           │   │
//! │   └───────────────────────────────────────────────────┘   │
//! │   ┌───────────────────────────────────────────────────┐   │
//! │   │        ChangeBus (broadcast + patterns)           │   │
//! │   └───────────────────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Public facade — open, read, write, batches, compact, subscribe |
//! | [`engine`] | Hybrid engine — scheduler, write coalescer, layered reads |
//! | [`wal`] | Append-only durability log with group commit and recovery |
//! | [`memtable`] | Ordered in-memory write buffer with typed tombstones |
//! | [`sstable`] | Immutable on-disk tables with a keyed tail index |
//! | [`lsm`] | Leveled table collection with merge compaction |
//! | [`cache`] | L1/L2 LRU + L3 LFU read cache with promotion |
//! | [`bus`] | Best-effort change-event fan-out |
//! | [`encoding`] | Deterministic little-endian wire encoding |
//!
//! ## Key guarantees
//!
//! - **Durability** — a write is acknowledged only after its WAL entry is
//!   flushed; acknowledged writes survive a crash and replay on open.
//! - **Typed tombstones** — deletions are first-class markers on every
//!   layer, so the empty byte string is a legal value.
//! - **Ordered writes** — one logical writer serializes WAL appends;
//!   sequence numbers are strictly monotone across restarts.
//! - **Transparent caching** — the cache changes read latency, never read
//!   results.
//! - **Best-effort events** — subscribers observe committed changes in
//!   commit order per key; slow subscribers lose events, writers never
//!   block on them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vesperdb::{Database, DbConfig};
//!
//! let db = Database::open("my-db", DbConfig::default()).unwrap();
//!
//! // Watch a key prefix.
//! let users = db.subscribe_pattern("user:*");
//!
//! // Write / read / delete.
//! db.put(b"user:1", b"alice").unwrap();
//! assert_eq!(db.get(b"user:1").unwrap(), Some(b"alice".to_vec()));
//! db.delete(b"user:1").unwrap();
//!
//! // Batches apply per-key, emitting one event each.
//! db.put_batch(&[
//!     (b"user:2".to_vec(), b"bob".to_vec()),
//!     (b"user:3".to_vec(), b"carol".to_vec()),
//! ])
//! .unwrap();
//!
//! while let Ok(event) = users.try_recv() {
//!     println!("{:?} {:?}", event.kind, event.key);
//! }
//!
//! // Fold everything to disk and shut down.
//! db.compact().unwrap();
//! db.close().unwrap();
//! ```

pub mod bus;
pub mod cache;
pub mod db;
pub mod encoding;
pub mod engine;
pub mod lsm;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use bus::{ChangeEvent, ChangeKind};
pub use cache::{CacheLevel, CacheStats, MultiLevelCache};
pub use db::{Codec, CodecError, Database, DbConfig, DbError, DbStats, IdentityCodec};
pub use engine::{EngineConfig, EngineStats, HybridEngine};
