//! Records exchanged between the store, the ledgers, the queues and peers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata for one stored file, keyed by its content hash.
///
/// `peers` lists node URLs known to hold a copy (this node included once
/// committed). It only grows, except when a forced resync resets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Content hash (hex); empty on the "not found" reply of an existence probe
    #[serde(rename = "md5")]
    pub hash: String,
    /// Name given by the uploader
    pub name: String,
    /// Name on disk when rename-on-store is active
    #[serde(default)]
    pub rename: String,
    /// Folder relative to the storage root, e.g. `files/docs/20261016/10/30`
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Scene (bucket) the file was uploaded to
    #[serde(default)]
    pub scene: String,
    /// Commit time, unix seconds
    #[serde(rename = "timeStamp")]
    pub timestamp: i64,
    /// Node URLs known to hold a copy
    #[serde(default)]
    pub peers: Vec<String>,
}

impl FileRecord {
    /// Name of the file on disk
    pub fn stored_name(&self) -> &str {
        if self.rename.is_empty() {
            &self.name
        } else {
            &self.rename
        }
    }

    /// `<path>/<stored name>`, relative to the storage root
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.path, self.stored_name())
    }

    /// True for the placeholder returned when a peer has no record
    pub fn is_empty(&self) -> bool {
        self.hash.is_empty()
    }

    pub fn has_peer(&self, peer: &str) -> bool {
        self.peers.iter().any(|p| p == peer)
    }

    /// Append a peer unless already present. Returns whether it was added.
    pub fn add_peer(&mut self, peer: &str) -> bool {
        if self.has_peer(peer) {
            return false;
        }
        self.peers.push(peer.to_string());
        true
    }

    /// Day (`yyyymmdd`) the record belongs to in the ledgers
    pub fn ledger_date(&self) -> String {
        crate::ledger::date_of_timestamp(self.timestamp)
    }

    /// `/<group>/<path below files/>/<stored name>`, the URL path a node
    /// serves this file under
    pub fn download_path(&self, group: &str) -> String {
        let below = self
            .path
            .strip_prefix(crate::config::FILES_DIR)
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or(&self.path);
        if below.is_empty() {
            format!("/{}/{}", group, self.stored_name())
        } else {
            format!("/{}/{}/{}", group, below, self.stored_name())
        }
    }
}

/// Per-day aggregate returned by `/stat`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayStat {
    /// `yyyymmdd`, or `all` for the totals row
    pub date: String,
    pub total_size: i64,
    pub file_count: i64,
}

/// Ledger kinds kept per day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerCategory {
    /// Files committed on this node
    Committed,
    /// References received from peers, waiting to be pulled
    QueuedFromPeer,
    /// Pushes that failed and wait for a retry
    TransferError,
}

impl LedgerCategory {
    /// File name of the ledger inside a day directory
    pub fn file_name(self) -> &'static str {
        match self {
            LedgerCategory::Committed => "committed.log",
            LedgerCategory::QueuedFromPeer => "queued.log",
            LedgerCategory::TransferError => "errors.log",
        }
    }
}

impl fmt::Display for LedgerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LedgerCategory::Committed => "committed",
            LedgerCategory::QueuedFromPeer => "queued",
            LedgerCategory::TransferError => "transfer-error",
        };
        f.write_str(name)
    }
}

/// Which way a replication job moves bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Send the local file to every configured peer missing from `peers`
    Push,
    /// Fetch the file. Without a source the first eligible entry of
    /// `record.peers` is used.
    Pull { source: Option<String> },
}

/// A unit of work on one of the replication queues. Never persisted.
#[derive(Debug, Clone)]
pub struct ReplicationJob {
    pub record: FileRecord,
    pub direction: Direction,
}

impl ReplicationJob {
    pub fn push(record: FileRecord) -> Self {
        Self {
            record,
            direction: Direction::Push,
        }
    }

    pub fn pull(record: FileRecord, source: Option<String>) -> Self {
        Self {
            record,
            direction: Direction::Pull { source },
        }
    }
}

/// JSON body returned by `/upload?output=json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadResult {
    pub url: String,
    pub md5: String,
    pub path: String,
    pub domain: String,
    pub scene: String,
}

/// Health blob returned by `/status`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<StatusData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusData {
    pub queue_to_peers: usize,
    pub queue_from_peers: usize,
    pub file_set_size: usize,
    pub queue_set_size: usize,
    pub error_set_size: usize,
    pub auto_repair: bool,
    pub refresh_interval: u64,
    pub peers: Vec<String>,
    pub local: String,
    pub file_stats: Vec<DayStat>,
}
