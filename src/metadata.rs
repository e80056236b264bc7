//! Metadata database for stored files
//!
//! Keys are content hashes, plus a path-alias key (MD5 of the relative
//! full path) per record so a filesystem path can be resolved to its record
//! without re-hashing the file. Writes are applied to sled before returning;
//! there is no compare-and-swap, concurrent writers to one key race and the
//! last one wins.

use crate::digest::path_key;
use crate::error::StorageError;
use crate::record::FileRecord;
use sled::Db;
use std::path::Path;
use tracing::{debug, info};

/// Metadata database
pub struct MetadataDb {
    db: Db,
}

impl MetadataDb {
    /// Open or create metadata database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened metadata database");
        Ok(Self { db })
    }

    /// Temporary database, removed on drop
    #[cfg(test)]
    pub(crate) fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Upsert a record under `key`
    pub fn put(&self, key: &str, record: &FileRecord) -> Result<(), StorageError> {
        let value = rmp_serde::to_vec_named(record)?;
        self.db.insert(key.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    /// Get the record stored under `key`
    pub fn get(&self, key: &str) -> Result<Option<FileRecord>, StorageError> {
        match self.db.get(key.as_bytes())? {
            Some(value) => Ok(Some(rmp_serde::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Delete the record stored under `key`
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.db.remove(key.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Store a record under its content hash and its path alias
    pub fn put_record(&self, record: &FileRecord) -> Result<(), StorageError> {
        self.put(&record.hash, record)?;
        self.put(&path_key(&record.full_path()), record)?;
        debug!(hash = %record.hash, path = %record.full_path(), "Saved file record");
        Ok(())
    }

    /// Resolve a relative full path (`files/.../name`) to its record
    pub fn get_by_path(&self, full_path: &str) -> Result<Option<FileRecord>, StorageError> {
        self.get(&path_key(full_path))
    }

    /// Record that `peer` holds a copy of `hash`.
    ///
    /// Read-modify-write on the latest stored value, without compare-and-swap.
    /// Returns the updated record, or None when the hash is unknown.
    pub fn add_peer(&self, hash: &str, peer: &str) -> Result<Option<FileRecord>, StorageError> {
        let Some(mut record) = self.get(hash)? else {
            return Ok(None);
        };
        if record.add_peer(peer) {
            self.put(hash, &record)?;
        }
        Ok(Some(record))
    }

    /// Number of keys (content hashes and aliases)
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Flush pending writes. Called on shutdown.
    pub async fn close(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        info!("Metadata database flushed");
        Ok(())
    }
}
