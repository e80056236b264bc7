//! Day counters
//!
//! Counters are keyed `<yyyymmdd>_fileCount` / `<yyyymmdd>_totalSize`, plus the
//! global `fileCount` / `totalSize`. They are bumped on every new committed
//! ledger entry, snapshotted to `stat.json`, and can always be rebuilt by
//! rescanning the committed ledgers.

use crate::error::StorageError;
use crate::ledger::{is_date, Ledger};
use crate::record::DayStat;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const FILE_COUNT_KEY: &str = "fileCount";
pub const TOTAL_SIZE_KEY: &str = "totalSize";

fn count_key(date: &str) -> String {
    format!("{}_{}", date, FILE_COUNT_KEY)
}

fn size_key(date: &str) -> String {
    format!("{}_{}", date, TOTAL_SIZE_KEY)
}

/// In-memory counters with a JSON snapshot
pub struct StatAggregator {
    counters: Mutex<HashMap<String, i64>>,
    snapshot_path: PathBuf,
}

impl StatAggregator {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Load the snapshot, or rebuild from the ledgers when there is none
    pub async fn load_or_rebuild(&self, ledger: &Ledger) -> Result<(), StorageError> {
        match fs::read(&self.snapshot_path).await {
            Ok(data) => {
                let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(&data)?;
                let mut counters = self.counters.lock().await;
                counters.clear();
                for (key, value) in raw {
                    // Older snapshots may hold floats
                    let n = value
                        .as_i64()
                        .or_else(|| value.as_f64().map(|f| f as i64));
                    match n {
                        Some(n) => {
                            counters.insert(key, n);
                        }
                        None => warn!(key = %key, "Ignoring non-numeric counter"),
                    }
                }
                info!(keys = counters.len(), "Loaded counter snapshot");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.rebuild(ledger).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Count one newly committed file of `size` bytes on `date`
    pub async fn record_commit(&self, date: &str, size: u64) {
        let size = size as i64;
        let mut counters = self.counters.lock().await;
        *counters.entry(count_key(date)).or_insert(0) += 1;
        *counters.entry(size_key(date)).or_insert(0) += size;
        *counters.entry(FILE_COUNT_KEY.to_string()).or_insert(0) += 1;
        *counters.entry(TOTAL_SIZE_KEY.to_string()).or_insert(0) += size;
    }

    /// File count of a day; None when the day has no counter at all
    pub async fn file_count(&self, date: &str) -> Option<i64> {
        self.counters.lock().await.get(&count_key(date)).copied()
    }

    /// Per-day rows sorted by date, followed by the `all` row
    pub async fn day_stats(&self) -> Vec<DayStat> {
        let counters = self.counters.lock().await;
        let dates: BTreeSet<&str> = counters
            .keys()
            .filter_map(|k| k.split_once('_').map(|(date, _)| date))
            .filter(|d| is_date(d))
            .collect();

        let mut rows: Vec<DayStat> = dates
            .into_iter()
            .map(|date| DayStat {
                date: date.to_string(),
                total_size: counters.get(&size_key(date)).copied().unwrap_or(0),
                file_count: counters.get(&count_key(date)).copied().unwrap_or(0),
            })
            .collect();

        rows.push(DayStat {
            date: "all".to_string(),
            total_size: counters.get(TOTAL_SIZE_KEY).copied().unwrap_or(0),
            file_count: counters.get(FILE_COUNT_KEY).copied().unwrap_or(0),
        });
        rows
    }

    /// Reset every counter from the committed ledgers and write a snapshot
    pub async fn rebuild(&self, ledger: &Ledger) -> Result<(), StorageError> {
        let totals = ledger.committed_totals().await?;
        {
            let mut counters = self.counters.lock().await;
            counters.clear();
            let mut all_count = 0;
            let mut all_size = 0;
            for day in &totals {
                counters.insert(count_key(&day.date), day.file_count);
                counters.insert(size_key(&day.date), day.total_size);
                all_count += day.file_count;
                all_size += day.total_size;
            }
            counters.insert(FILE_COUNT_KEY.to_string(), all_count);
            counters.insert(TOTAL_SIZE_KEY.to_string(), all_size);
        }
        info!(days = totals.len(), "Rebuilt counters from ledgers");
        self.snapshot().await
    }

    /// Write the counters to the snapshot file (temp file + rename)
    pub async fn snapshot(&self) -> Result<(), StorageError> {
        let data = {
            let counters = self.counters.lock().await;
            serde_json::to_vec_pretty(&*counters)?
        };
        if let Some(parent) = self.snapshot_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.snapshot_path.with_extension("json.tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &self.snapshot_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FileRecord, LedgerCategory};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_commit_and_rows() {
        let temp_dir = TempDir::new().unwrap();
        let stats = StatAggregator::new(temp_dir.path().join("stat.json"));

        stats.record_commit("20261016", 17).await;
        stats.record_commit("20261016", 3).await;
        stats.record_commit("20261015", 5).await;

        assert_eq!(stats.file_count("20261016").await, Some(2));
        assert_eq!(stats.file_count("20261001").await, None);

        let rows = stats.day_stats().await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].date, "20261015");
        assert_eq!(rows[1].total_size, 20);
        assert_eq!(rows[2].date, "all");
        assert_eq!(rows[2].file_count, 3);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::new(temp_dir.path().join("data")).await.unwrap();
        let path = temp_dir.path().join("stat.json");

        let stats = StatAggregator::new(&path);
        stats.record_commit("20261016", 17).await;
        stats.snapshot().await.unwrap();

        let reloaded = StatAggregator::new(&path);
        reloaded.load_or_rebuild(&ledger).await.unwrap();
        assert_eq!(reloaded.day_stats().await, stats.day_stats().await);
    }

    #[tokio::test]
    async fn test_rebuild_from_ledgers() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::new(temp_dir.path().join("data")).await.unwrap();
        for (hash, size) in [("h1", 10u64), ("h2", 20)] {
            let record = FileRecord {
                hash: hash.to_string(),
                name: hash.to_string(),
                path: "files/x".to_string(),
                size,
                timestamp: 1_500_000_000,
                ..Default::default()
            };
            ledger.append(LedgerCategory::Committed, &record).await.unwrap();
        }

        let stats = StatAggregator::new(temp_dir.path().join("stat.json"));
        stats.record_commit("19990101", 1).await;
        stats.load_or_rebuild(&ledger).await.unwrap();

        let date = crate::ledger::date_of_timestamp(1_500_000_000);
        assert_eq!(stats.file_count(&date).await, Some(2));
        assert_eq!(stats.file_count("19990101").await, None);
        assert!(temp_dir.path().join("stat.json").exists());
    }
}
