//! The commit path shared by uploads, peer pushes and pulls
//!
//! A commit writes the record under its hash and path alias, appends the
//! committed ledger of the record's day and, for a first-time entry, bumps
//! the day counters. The steps are not transactional; a crash in between is
//! healed by the stat rebuild and the next reconciliation sweep.

use crate::config::{Config, FILES_DIR};
use crate::error::StorageError;
use crate::ledger::Ledger;
use crate::metadata::MetadataDb;
use crate::record::{FileRecord, LedgerCategory};
use crate::stats::StatAggregator;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

pub struct Registrar {
    config: Arc<Config>,
    metadata: Arc<MetadataDb>,
    ledger: Arc<Ledger>,
    stats: Arc<StatAggregator>,
}

impl Registrar {
    pub fn new(
        config: Arc<Config>,
        metadata: Arc<MetadataDb>,
        ledger: Arc<Ledger>,
        stats: Arc<StatAggregator>,
    ) -> Self {
        Self {
            config,
            metadata,
            ledger,
            stats,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataDb {
        &self.metadata
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn stats(&self) -> &StatAggregator {
        &self.stats
    }

    /// This node's URL
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Absolute path of a relative storage path
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.config.storage_dir.join(relative)
    }

    /// Absolute path of the file backing `record`
    pub fn local_path(&self, record: &FileRecord) -> PathBuf {
        self.resolve(&record.full_path())
    }

    /// Live record for `key` (content hash or path alias).
    ///
    /// A record whose file has disappeared is deleted and reported absent.
    pub async fn lookup(&self, key: &str) -> Result<Option<FileRecord>, StorageError> {
        let Some(record) = self.metadata.get(key)? else {
            return Ok(None);
        };
        if record.is_empty() {
            return Ok(None);
        }
        if fs::metadata(self.local_path(&record)).await.is_ok() {
            return Ok(Some(record));
        }
        info!(key = %key, path = %record.full_path(), "File gone, evicting record");
        self.metadata.delete(key)?;
        Ok(None)
    }

    /// Whether `dest` already holds the content of `hash`.
    ///
    /// False when nothing is there. A file with other content fails with
    /// `ChecksumMismatch`; it belongs to another record and must not be
    /// replaced.
    pub async fn holds(&self, dest: &Path, hash: &str) -> Result<bool, StorageError> {
        match fs::metadata(dest).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let actual = self.config.hash_algorithm.hash_file(dest).await?;
        if actual.eq_ignore_ascii_case(hash) {
            return Ok(true);
        }
        warn!(path = %dest.display(), expected = %hash, actual = %actual, "Destination holds other content");
        Err(StorageError::ChecksumMismatch {
            expected: hash.to_string(),
            actual,
        })
    }

    /// Persist and log a locally present file. Returns true when this was
    /// the first committed entry for the hash on the record's day.
    pub async fn commit(&self, record: &FileRecord) -> Result<bool, StorageError> {
        self.metadata.put_record(record)?;
        let appended = self.ledger.append(LedgerCategory::Committed, record).await?;
        if appended {
            self.stats.record_commit(&record.ledger_date(), record.size).await;
            debug!(hash = %record.hash, size = record.size, "Committed file");
        }
        Ok(appended)
    }

    /// Log a record to a non-committed ledger
    pub async fn note(
        &self,
        category: LedgerCategory,
        record: &FileRecord,
    ) -> Result<bool, StorageError> {
        self.ledger.append(category, record).await
    }

    pub fn download_path(&self, record: &FileRecord) -> String {
        record.download_path(&self.config.group)
    }

    /// Domain used in returned URLs
    pub fn download_domain(&self) -> String {
        if self.config.download_domain.is_empty() {
            self.config.host.clone()
        } else if self.config.download_domain.starts_with("http") {
            self.config.download_domain.clone()
        } else {
            format!("http://{}", self.config.download_domain)
        }
    }

    /// Public URL of a committed record
    pub fn download_url(&self, record: &FileRecord) -> String {
        format!("{}{}", self.download_domain(), self.download_path(record))
    }
}

/// Records arriving from peers must stay inside `files/`
pub fn validate_record_path(record: &FileRecord) -> Result<(), StorageError> {
    let path = Path::new(&record.path);
    let inside = record.path == FILES_DIR || record.path.starts_with(&format!("{}/", FILES_DIR));
    let escapes = path.components().any(|c| !matches!(c, Component::Normal(_)));
    let bad_name = record.stored_name().is_empty() || record.stored_name().contains(['/', '\\']);
    if record.hash.is_empty() || !inside || escapes || bad_name {
        return Err(StorageError::InvalidRequest(format!(
            "invalid record path: {}",
            record.full_path()
        )));
    }
    Ok(())
}
