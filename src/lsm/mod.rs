//! # LSM Tree Module
//!
//! A leveled collection of immutable [`SSTable`]s with memtable flushes
//! into level 0 and whole-level merge compaction downwards.
//!
//! ## Level organisation
//!
//! Seven fixed levels. Level 0 holds raw memtable flushes and its tables
//! may overlap arbitrarily in key range; deeper levels hold compaction
//! output. Per-level capacity is 4 tables for L0 and `10 * n` for Ln.
//! Within a level, tables are kept sorted by creation timestamp; reads
//! scan each level newest-first so the most recent write wins.
//!
//! ## Read path
//!
//! A point lookup walks L0..L6. The first table whose index contains the
//! key decides the outcome: a live value is returned, a tombstone
//! short-circuits to "not found" — tombstones must keep masking older
//! levels until compaction resolves them.
//!
//! ## Compaction
//!
//! `compact_level(L)` folds every table of level `L` into a single new
//! table at `L+1` (the top level folds into itself), resolving duplicate
//! keys by greatest creation timestamp. Source files are deleted only
//! after their successor is durably in place; a failed deletion aborts
//! the cascade and is retried by the next compaction. Because the
//! successor carries every record — tombstones included — leftover
//! sources are shadowed, not resurrected, if a retry is ever needed.
//!
//! ## Open-time discovery
//!
//! [`LsmTree::open`] scans the directory for `level_<L>_<ms>.sst` files.
//! A table that fails to load is skipped with a warning; reads may miss
//! the data it contained, but the engine stays available.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::memtable::Memtable;
use crate::sstable::{
    SSTable, SSTableError, TABLE_FILE_EXT, TableBuilder, TableGetResult, table_file_name,
};
use crate::wal::now_ms;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Fixed number of levels.
pub const LEVEL_COUNT: usize = 7;

/// Table-count threshold at which a level is compacted into the next.
pub fn level_capacity(level: usize) -> usize {
    if level == 0 { 4 } else { 10 * level }
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by LSM tree operations.
#[derive(Debug, Error)]
pub enum LsmError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error reading or writing a table.
    #[error("SSTable error: {0}")]
    Table(#[from] SSTableError),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// LSM Core
// ------------------------------------------------------------------------------------------------

/// Leveled set of sorted tables backing the persistent read path.
///
/// Mutation (flush, compaction) requires `&mut self`; the engine
/// serializes these behind its state lock while readers share `&self`.
pub struct LsmTree {
    /// Directory holding all table files.
    dir: PathBuf,

    /// `levels[L]` sorted by creation timestamp ascending.
    levels: Vec<Vec<SSTable>>,
}

impl LsmTree {
    /// Opens the table directory, loading every readable table into its
    /// level.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, LsmError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut levels: Vec<Vec<SSTable>> = (0..LEVEL_COUNT).map(|_| Vec::new()).collect();

        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some(TABLE_FILE_EXT)
            {
                continue;
            }
            match SSTable::open(&path) {
                Ok(table) => {
                    let level = table.level() as usize;
                    if level >= LEVEL_COUNT {
                        warn!(path = %path.display(), level, "table beyond deepest level, skipping");
                        continue;
                    }
                    levels[level].push(table);
                }
                Err(e) => {
                    // Unreadable tables are skipped, not fatal: reads may
                    // silently miss the data they contained.
                    warn!(path = %path.display(), error = %e, "unreadable table skipped");
                }
            }
        }

        for level in &mut levels {
            level.sort_by_key(SSTable::created_at);
        }

        let tree = Self { dir, levels };
        info!(
            dir = %tree.dir.display(),
            tables = tree.table_count(),
            entries = tree.entry_count(),
            "LSM tree opened"
        );
        Ok(tree)
    }

    /// Writes a memtable's entries — tombstones included — to a new level-0
    /// table, compacting if the level is now at capacity.
    pub fn flush(&mut self, memtable: &Memtable) -> Result<(), LsmError> {
        if memtable.is_empty() {
            return Ok(());
        }

        let (path, _) = self.new_table_path(0)?;
        let mut builder = TableBuilder::create(&path)?;
        for (key, value) in memtable.iter() {
            builder.add(key, value)?;
        }
        let entries = builder.len();
        builder.finish()?;

        let table = SSTable::open(&path)?;
        debug!(path = %path.display(), entries, "memtable flushed to level 0");
        self.levels[0].push(table);

        if self.levels[0].len() >= level_capacity(0) {
            self.compact_level(0)?;
        }
        Ok(())
    }

    /// Looks up one key across all levels, newest data first.
    pub fn get(&self, key: &[u8]) -> Result<TableGetResult, LsmError> {
        for level in &self.levels {
            for table in level.iter().rev() {
                match table.get(key)? {
                    TableGetResult::NotFound => continue,
                    decided => return Ok(decided),
                }
            }
        }
        Ok(TableGetResult::NotFound)
    }

    /// Merges every table of `level` into a single successor.
    ///
    /// The successor lands at `level + 1` (the deepest level folds into
    /// itself) and carries all records with duplicate keys resolved by
    /// greatest creation timestamp. Cascades while target levels sit at
    /// capacity.
    pub fn compact_level(&mut self, level: usize) -> Result<(), LsmError> {
        if level >= LEVEL_COUNT {
            return Err(LsmError::Internal(format!("no such level: {level}")));
        }
        let target = if level + 1 < LEVEL_COUNT { level + 1 } else { level };
        if self.levels[level].is_empty() || (target == level && self.levels[level].len() < 2) {
            return Ok(());
        }

        // Tables are sorted by created_at ascending, so inserting in order
        // leaves the newest write for each key in the merge map.
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for table in &self.levels[level] {
            for (key, value) in table.read_all()? {
                merged.insert(key, value);
            }
        }

        let (path, _) = self.new_table_path(target)?;
        let mut builder = TableBuilder::create(&path)?;
        for (key, value) in &merged {
            builder.add(key, value.as_deref())?;
        }
        builder.finish()?;
        let successor = SSTable::open(&path)?;

        info!(
            level,
            target,
            sources = self.levels[level].len(),
            entries = successor.entry_count(),
            "level compacted"
        );

        let old = std::mem::take(&mut self.levels[level]);
        self.levels[target].push(successor);

        let mut delete_failure: Option<io::Error> = None;
        for table in old {
            let path = table.path().to_path_buf();
            drop(table);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to delete compacted table");
                delete_failure.get_or_insert(e);
            }
        }
        if let Some(e) = delete_failure {
            // Abort the cascade; the successor shadows any leftover source,
            // and the next compaction retries the deletion.
            return Err(LsmError::Io(e));
        }

        if target != level && self.levels[target].len() >= level_capacity(target) {
            self.compact_level(target)?;
        }
        Ok(())
    }

    /// Compacts every level currently at or above its capacity.
    pub fn compact(&mut self) -> Result<(), LsmError> {
        for level in 0..LEVEL_COUNT {
            if self.levels[level].len() >= level_capacity(level) {
                self.compact_level(level)?;
            }
        }
        Ok(())
    }

    /// Total number of indexed entries across all tables.
    pub fn entry_count(&self) -> usize {
        self.levels
            .iter()
            .flatten()
            .map(SSTable::entry_count)
            .sum()
    }

    /// Total number of tables across all levels.
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Per-level table counts, L0 first.
    pub fn level_sizes(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }

    /// Sum of all table file sizes in bytes.
    pub fn total_file_bytes(&self) -> u64 {
        self.levels.iter().flatten().map(SSTable::file_size).sum()
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// Picks a fresh `level_<L>_<ms>.sst` path.
    ///
    /// The timestamp is bumped past both existing files and the newest
    /// table already in the level, keeping within-level creation order
    /// monotone even if the wall clock steps backwards.
    fn new_table_path(&self, level: usize) -> Result<(PathBuf, u64), LsmError> {
        let newest = self.levels[level]
            .last()
            .map(|t| t.created_at() + 1)
            .unwrap_or(0);
        let mut ts = now_ms().max(newest);
        loop {
            let path = self.dir.join(table_file_name(level as u8, ts));
            if !path.exists() {
                return Ok((path, ts));
            }
            ts += 1;
        }
    }
}
