//! Daily ledgers
//!
//! One append-only file per (day, category):
//!
//! ```text
//! data/
//! ├── 20261015/
//! │   ├── committed.log    # hash|size|timestamp|path, one line per commit
//! │   ├── queued.log       # references received from peers
//! │   └── errors.log       # pushes waiting for a retry
//! └── 20261016/
//! ```
//!
//! The ledgers are the durable source of truth for the hash sets compared
//! during reconciliation and for rebuilding the day counters. Hash sets are
//! cached in memory per (day, category); a cached set is trusted once
//! non-empty and rebuilt from the file otherwise.

use crate::error::StorageError;
use crate::record::{FileRecord, LedgerCategory};
use chrono::{Local, TimeZone};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type CacheKey = (String, LedgerCategory);

/// Today's date as `yyyymmdd` in local time
pub fn today() -> String {
    Local::now().format("%Y%m%d").to_string()
}

/// `yyyymmdd` of a unix timestamp in local time
pub fn date_of_timestamp(timestamp: i64) -> String {
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(dt) => dt.format("%Y%m%d").to_string(),
        None => today(),
    }
}

/// True for `yyyymmdd`-shaped strings
pub fn is_date(s: &str) -> bool {
    s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit())
}

/// One ledger line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub hash: String,
    pub size: u64,
    pub timestamp: i64,
    pub path: String,
}

impl LedgerEntry {
    pub fn from_record(record: &FileRecord) -> Self {
        Self {
            hash: record.hash.clone(),
            size: record.size,
            timestamp: record.timestamp,
            path: record.full_path(),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{}|{}|{}|{}\n", self.hash, self.size, self.timestamp, self.path)
    }

    /// Parse `hash|size|timestamp[|path]`.
    ///
    /// Lines with fewer than three fields or a non-numeric size are malformed.
    pub fn parse(line: &str) -> Result<Self, StorageError> {
        let cols: Vec<&str> = line.trim_end_matches('\r').splitn(4, '|').collect();
        if cols.len() < 3 || cols[0].is_empty() {
            return Err(StorageError::MalformedLedgerLine(line.to_string()));
        }
        let size = cols[1]
            .parse::<u64>()
            .map_err(|_| StorageError::MalformedLedgerLine(line.to_string()))?;
        Ok(Self {
            hash: cols[0].to_string(),
            size,
            timestamp: cols[2].parse().unwrap_or(0),
            path: cols.get(3).map(|p| p.to_string()).unwrap_or_default(),
        })
    }
}

/// Per-day totals of a committed ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayTotals {
    pub date: String,
    pub file_count: i64,
    pub total_size: i64,
}

/// Append-only ledgers with a hash-set cache
pub struct Ledger {
    data_dir: PathBuf,
    cache: Mutex<HashMap<CacheKey, HashSet<String>>>,
}

impl Ledger {
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).await?;
        info!(path = %data_dir.display(), "Initialized ledgers");
        Ok(Self {
            data_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn ledger_path(&self, date: &str, category: LedgerCategory) -> PathBuf {
        self.data_dir.join(date).join(category.file_name())
    }

    /// Append `record` to the ledger of its day.
    ///
    /// Returns false without writing when the hash is already recorded in
    /// that ledger. The line is flushed before returning.
    pub async fn append(
        &self,
        category: LedgerCategory,
        record: &FileRecord,
    ) -> Result<bool, StorageError> {
        let date = record.ledger_date();
        let key = (date.clone(), category);
        if !self.claim(&key, &record.hash).await? {
            return Ok(false);
        }

        let entry = LedgerEntry::from_record(record);
        if let Err(e) = self.write_line(&date, category, &entry).await {
            if let Some(set) = self.cache.lock().await.get_mut(&key) {
                set.remove(&record.hash);
            }
            return Err(e);
        }

        debug!(hash = %record.hash, date = %date, category = %category, "Ledger append");
        Ok(true)
    }

    async fn write_line(
        &self,
        date: &str,
        category: LedgerCategory,
        entry: &LedgerEntry,
    ) -> Result<(), StorageError> {
        let day_dir = self.data_dir.join(date);
        fs::create_dir_all(&day_dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(day_dir.join(category.file_name()))
            .await?;
        file.write_all(entry.to_line().as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Hashes recorded in a ledger. Served from cache when a non-empty set
    /// is cached, otherwise parsed from the file (missing file = empty).
    pub async fn hash_set(
        &self,
        date: &str,
        category: LedgerCategory,
    ) -> Result<HashSet<String>, StorageError> {
        let key = (date.to_string(), category);
        if let Some(set) = self.cache.lock().await.get(&key) {
            if !set.is_empty() {
                return Ok(set.clone());
            }
        }

        let loaded = self.load_hashes(date, category).await?;
        let mut cache = self.cache.lock().await;
        let cached = cache.entry(key).or_default();
        cached.extend(loaded);
        Ok(cached.clone())
    }

    /// Add `hash` to the cached set of `key`, loading the set from disk
    /// first when it is not cached. False when the hash was already there.
    async fn claim(&self, key: &CacheKey, hash: &str) -> Result<bool, StorageError> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(set) = cache.get_mut(key).filter(|s| !s.is_empty()) {
                return Ok(set.insert(hash.to_string()));
            }
        }

        let loaded = self.load_hashes(&key.0, key.1).await?;
        let mut cache = self.cache.lock().await;
        let set = cache.entry(key.clone()).or_default();
        set.extend(loaded);
        Ok(set.insert(hash.to_string()))
    }

    async fn load_hashes(
        &self,
        date: &str,
        category: LedgerCategory,
    ) -> Result<HashSet<String>, StorageError> {
        let entries = self.read_entries(date, category).await?;
        Ok(entries.into_iter().map(|e| e.hash).collect())
    }

    /// All well-formed entries of a ledger, in file order
    pub async fn read_entries(
        &self,
        date: &str,
        category: LedgerCategory,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        let path = self.ledger_path(date, category);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match LedgerEntry::parse(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping ledger line"),
            }
        }
        Ok(entries)
    }

    /// Size of the cached set, without touching disk
    pub async fn cached_len(&self, date: &str, category: LedgerCategory) -> usize {
        self.cache
            .lock()
            .await
            .get(&(date.to_string(), category))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Drop cached sets of every day except `today`. Returns how many were dropped.
    pub async fn evict_except(&self, today: &str) -> usize {
        let mut cache = self.cache.lock().await;
        let before = cache.len();
        cache.retain(|(date, _), _| date == today);
        before - cache.len()
    }

    /// Days that have a ledger directory, sorted
    pub async fn dates(&self) -> Result<Vec<String>, StorageError> {
        let mut dates = Vec::new();
        let mut entries = fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_date(&name) && entry.file_type().await?.is_dir() {
                dates.push(name);
            }
        }
        dates.sort();
        Ok(dates)
    }

    /// Distinct-hash count and total size of every committed ledger
    pub async fn committed_totals(&self) -> Result<Vec<DayTotals>, StorageError> {
        let mut totals = Vec::new();
        for date in self.dates().await? {
            let entries = match self.read_entries(&date, LedgerCategory::Committed).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(date = %date, error = %e, "Unreadable committed ledger");
                    continue;
                }
            };
            if entries.is_empty() {
                continue;
            }
            let mut seen = HashSet::new();
            let mut day = DayTotals {
                date: date.clone(),
                file_count: 0,
                total_size: 0,
            };
            for entry in entries {
                if seen.insert(entry.hash) {
                    day.file_count += 1;
                    day.total_size += entry.size as i64;
                }
            }
            totals.push(day);
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(hash: &str, size: u64, timestamp: i64) -> FileRecord {
        FileRecord {
            hash: hash.to_string(),
            name: format!("{}.bin", hash),
            path: "files/default/20261016/10/30".to_string(),
            size,
            timestamp,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_lines() {
        let entry = LedgerEntry::parse("abc123|17|1760000000|files/docs/report.pdf").unwrap();
        assert_eq!(entry.hash, "abc123");
        assert_eq!(entry.size, 17);
        assert_eq!(entry.path, "files/docs/report.pdf");

        assert!(LedgerEntry::parse("abc123|17").is_err());
        assert!(LedgerEntry::parse("abc123|big|1760000000|x").is_err());
        assert!(LedgerEntry::parse("").is_err());
    }

    #[tokio::test]
    async fn test_append_is_idempotent_per_hash() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::new(temp_dir.path()).await.unwrap();
        let r = record("abc123", 17, 1_760_000_000);

        assert!(ledger.append(LedgerCategory::Committed, &r).await.unwrap());
        assert!(!ledger.append(LedgerCategory::Committed, &r).await.unwrap());

        let entries = ledger
            .read_entries(&r.ledger_date(), LedgerCategory::Committed)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].to_line(), format!("abc123|17|1760000000|{}\n", r.full_path()));
    }

    #[tokio::test]
    async fn test_append_with_cold_cache_sees_disk() {
        let temp_dir = TempDir::new().unwrap();
        let first = record("h1", 5, 1_760_000_000);
        let date = first.ledger_date();
        {
            let ledger = Ledger::new(temp_dir.path()).await.unwrap();
            assert!(ledger.append(LedgerCategory::Committed, &first).await.unwrap());
        }

        // Fresh instance: nothing cached, h1 only known from the file
        let ledger = Ledger::new(temp_dir.path()).await.unwrap();
        assert!(!ledger.append(LedgerCategory::Committed, &first).await.unwrap());
        assert_eq!(ledger.cached_len(&date, LedgerCategory::Committed).await, 1);

        for hash in ["h2", "h3", "h4"] {
            let r = record(hash, 5, 1_760_000_000);
            assert!(ledger.append(LedgerCategory::Committed, &r).await.unwrap());
            assert!(!ledger.append(LedgerCategory::Committed, &r).await.unwrap());
        }
        assert_eq!(ledger.cached_len(&date, LedgerCategory::Committed).await, 4);
        assert_eq!(
            ledger.read_entries(&date, LedgerCategory::Committed).await.unwrap().len(),
            4
        );
    }

    #[tokio::test]
    async fn test_rebuild_after_eviction_matches() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::new(temp_dir.path()).await.unwrap();
        let ts = 1_500_000_000;
        for hash in ["h1", "h2", "h3"] {
            ledger
                .append(LedgerCategory::Committed, &record(hash, 5, ts))
                .await
                .unwrap();
        }
        let date = date_of_timestamp(ts);
        let before = ledger.hash_set(&date, LedgerCategory::Committed).await.unwrap();

        assert_eq!(ledger.evict_except(&today()).await, 1);
        assert_eq!(ledger.cached_len(&date, LedgerCategory::Committed).await, 0);

        let after = ledger.hash_set(&date, LedgerCategory::Committed).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let day_dir = temp_dir.path().join("20261016");
        std::fs::create_dir_all(&day_dir).unwrap();
        std::fs::write(
            day_dir.join("committed.log"),
            "h1|10|1|files/a\ngarbage\nh2|ten|1|files/b\nh3|30|1|files/c\n",
        )
        .unwrap();

        let ledger = Ledger::new(temp_dir.path()).await.unwrap();
        let set = ledger
            .hash_set("20261016", LedgerCategory::Committed)
            .await
            .unwrap();
        assert_eq!(set, HashSet::from(["h1".to_string(), "h3".to_string()]));

        let totals = ledger.committed_totals().await.unwrap();
        assert_eq!(
            totals,
            vec![DayTotals {
                date: "20261016".to_string(),
                file_count: 2,
                total_size: 40,
            }]
        );
    }

    #[tokio::test]
    async fn test_missing_ledger_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::new(temp_dir.path()).await.unwrap();
        let set = ledger
            .hash_set("20200101", LedgerCategory::TransferError)
            .await
            .unwrap();
        assert!(set.is_empty());
    }
}
