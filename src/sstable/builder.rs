//! SSTable writer — builds a complete table file from sorted records.
//!
//! [`TableBuilder`] accepts records in **strictly ascending key order**
//! (the order a memtable or merge map yields them), streams each one to
//! disk while tracking its starting offset, and on [`TableBuilder::finish`]
//! appends the tail index:
//!
//! ```text
//! [ {u32 key_len, key, u64 offset}* ][ u32 entry_count ][ u32 index_len ]
//! ```
//!
//! Tombstones are written with the `u32::MAX` value-length sentinel and no
//! value bytes, so they keep masking older tables after a flush.
//!
//! # Atomicity
//!
//! 1. Write everything to `<path>.tmp`.
//! 2. Flush and fsync.
//! 3. Rename `<path>.tmp` → `<path>`.
//!
//! A crash mid-build cannot produce a half-written table under the final
//! name; leftover `.tmp` files are ignored by the level scan.

use std::{
    fs::{File, OpenOptions, rename},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::encoding::{self, Encode};

use super::{SSTableError, TOMBSTONE_VALUE_LEN};

/// Streaming writer for one table file.
pub struct TableBuilder {
    writer: BufWriter<File>,

    /// Final path the temporary file is renamed to.
    path: PathBuf,

    /// Temporary path being written.
    tmp_path: PathBuf,

    /// Byte offset where the next record will start.
    offset: u64,

    /// Accumulated `(key, offset)` index entries, in insertion order.
    index: Vec<(Vec<u8>, u64)>,

    /// Last key added, for order enforcement.
    last_key: Option<Vec<u8>>,
}

impl TableBuilder {
    /// Starts building a table at `path` (written via `<path>.tmp`).
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            tmp_path,
            offset: 0,
            index: Vec::new(),
            last_key: None,
        })
    }

    /// Appends one record. `None` writes a tombstone.
    ///
    /// Keys must arrive in strictly ascending order; a violation is an
    /// internal error, since every caller feeds from an ordered map.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), SSTableError> {
        if let Some(last) = &self.last_key
            && last.as_slice() >= key
        {
            return Err(SSTableError::Internal(
                "records must be added in strictly ascending key order".into(),
            ));
        }

        let key_len = u32::try_from(key.len())
            .map_err(|_| SSTableError::Internal("key exceeds u32::MAX bytes".into()))?;

        self.index.push((key.to_vec(), self.offset));

        self.writer.write_all(&key_len.to_le_bytes())?;
        self.writer.write_all(key)?;

        let mut written = (size_of::<u32>() + key.len() + size_of::<u32>()) as u64;
        match value {
            Some(value) => {
                // A live value's length must never equal the sentinel.
                let val_len = u32::try_from(value.len())
                    .ok()
                    .filter(|&l| l != TOMBSTONE_VALUE_LEN)
                    .ok_or_else(|| {
                        SSTableError::Internal("value length collides with tombstone sentinel".into())
                    })?;
                self.writer.write_all(&val_len.to_le_bytes())?;
                self.writer.write_all(value)?;
                written += value.len() as u64;
            }
            None => {
                self.writer.write_all(&TOMBSTONE_VALUE_LEN.to_le_bytes())?;
            }
        }

        self.offset += written;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    /// Number of records added so far.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no records have been added yet.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Writes the tail index, fsyncs, and renames the file into place.
    pub fn finish(mut self) -> Result<(), SSTableError> {
        let mut tail = Vec::new();
        for (key, offset) in &self.index {
            encoding::encode_bytes(key, &mut tail)?;
            offset.encode_to(&mut tail)?;
        }

        let entry_count = u32::try_from(self.index.len())
            .map_err(|_| SSTableError::Internal("entry count exceeds u32::MAX".into()))?;
        entry_count.encode_to(&mut tail)?;

        let index_len = u32::try_from(tail.len())
            .map_err(|_| SSTableError::Internal("tail index exceeds u32::MAX bytes".into()))?;
        index_len.encode_to(&mut tail)?;

        self.writer.write_all(&tail)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        rename(&self.tmp_path, &self.path)?;

        debug!(
            path = %self.path.display(),
            entries = self.index.len(),
            bytes = self.offset + tail.len() as u64,
            "SSTable built"
        );
        Ok(())
    }
}
