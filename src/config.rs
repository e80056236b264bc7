//! Configuration for elohim-replica

use crate::digest::HashAlgorithm;
use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory (relative to `storage_dir`) holding committed files
pub const FILES_DIR: &str = "files";

/// Directory (relative to `storage_dir`) holding ledgers and the stat snapshot
pub const DATA_DIR: &str = "data";

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("elohim-replica")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for files, ledgers and the metadata database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP listen address
    #[serde(default = "default_addr")]
    pub addr: String,

    /// This node's own URL as peers see it (derived from `addr` when empty)
    #[serde(default)]
    pub host: String,

    /// Peer node URLs, e.g. `http://10.0.0.2:8080`
    #[serde(default)]
    pub peers: Vec<String>,

    /// Storage group; committed files are served under `/<group>/`
    #[serde(default = "default_group")]
    pub group: String,

    /// Seconds between replays of today's transfer-error ledger
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Seconds between automatic reconciliation sweeps
    #[serde(default = "default_repair_interval")]
    pub repair_interval_secs: u64,

    /// Delay before the first automatic reconciliation sweep
    #[serde(default = "default_repair_initial_delay")]
    pub repair_initial_delay_secs: u64,

    /// Seconds between evictions of cached hash sets for past days
    #[serde(default = "default_ten_minutes")]
    pub cache_eviction_interval_secs: u64,

    /// Seconds between peer health checks
    #[serde(default = "default_ten_minutes")]
    pub health_check_interval_secs: u64,

    /// Seconds between counter snapshots
    #[serde(default = "default_stat_snapshot_interval")]
    pub stat_snapshot_interval_secs: u64,

    /// Store files under a random name instead of the uploaded one
    #[serde(default)]
    pub rename_file: bool,

    /// Honour the `path` field on uploads
    #[serde(default = "default_true")]
    pub enable_custom_path: bool,

    /// Scene used when an upload names none
    #[serde(default = "default_scene")]
    pub default_scene: String,

    /// Allowed scenes (empty = any)
    #[serde(default)]
    pub scenes: Vec<String>,

    /// Allow directory listings on the download path
    #[serde(default)]
    pub show_dir: bool,

    /// Domain used in returned download URLs (host is used when empty)
    #[serde(default)]
    pub download_domain: String,

    /// Require `token`/`timestamp` on downloads from non-peers
    #[serde(default)]
    pub download_use_token: bool,

    /// Accepted clock skew for download tokens
    #[serde(default = "default_ten_minutes")]
    pub download_token_expire_secs: u64,

    /// Push only the record to peers and let them pull the bytes,
    /// instead of streaming the file to them
    #[serde(default)]
    pub push_references: bool,

    /// Capacity of each replication queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Workers draining the outbound (push) queue
    #[serde(default = "default_workers")]
    pub push_workers: usize,

    /// Workers draining the inbound (pull) queue
    #[serde(default = "default_workers")]
    pub pull_workers: usize,

    /// Candidate names tried before an upload fails with NameExhausted
    #[serde(default = "default_name_probe_limit")]
    pub name_probe_limit: usize,

    /// Run the reconciliation sweep periodically
    #[serde(default = "default_true")]
    pub auto_repair: bool,

    /// Content hash algorithm
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,

    /// Timeout for control calls (probes, stats, hash sets)
    #[serde(default = "default_control_timeout")]
    pub control_timeout_secs: u64,

    /// Timeout for byte transfers between peers
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

fn default_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_group() -> String {
    "group1".to_string()
}

fn default_refresh_interval() -> u64 {
    1800
}

fn default_repair_interval() -> u64 {
    3600
}

fn default_repair_initial_delay() -> u64 {
    180
}

fn default_ten_minutes() -> u64 {
    600
}

fn default_stat_snapshot_interval() -> u64 {
    60
}

fn default_scene() -> String {
    "default".to_string()
}

fn default_queue_size() -> usize {
    100_000
}

fn default_workers() -> usize {
    50
}

fn default_name_probe_limit() -> usize {
    10_000
}

fn default_control_timeout() -> u64 {
    5
}

fn default_transfer_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            addr: default_addr(),
            host: String::new(),
            peers: Vec::new(),
            group: default_group(),
            refresh_interval_secs: 1800,
            repair_interval_secs: 3600,
            repair_initial_delay_secs: 180,
            cache_eviction_interval_secs: 600,
            health_check_interval_secs: 600,
            stat_snapshot_interval_secs: 60,
            rename_file: false,
            enable_custom_path: true,
            default_scene: default_scene(),
            scenes: Vec::new(),
            show_dir: false,
            download_domain: String::new(),
            download_use_token: false,
            download_token_expire_secs: 600,
            push_references: false,
            queue_size: 100_000,
            push_workers: 50,
            pull_workers: 50,
            name_probe_limit: 10_000,
            auto_repair: true,
            hash_algorithm: HashAlgorithm::default(),
            control_timeout_secs: 5,
            transfer_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Root of committed files
    pub fn files_dir(&self) -> PathBuf {
        self.storage_dir.join(FILES_DIR)
    }

    /// Root of the per-day ledgers
    pub fn data_dir(&self) -> PathBuf {
        self.storage_dir.join(DATA_DIR)
    }

    /// Get metadata database path
    pub fn metadata_db_path(&self) -> PathBuf {
        self.storage_dir.join(DATA_DIR).join("metadata.sled")
    }

    /// Counter snapshot path
    pub fn stat_path(&self) -> PathBuf {
        self.storage_dir.join(DATA_DIR).join("stat.json")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Fill in `host` and clean up `peers`.
    ///
    /// Peers get an `http://` scheme when missing; loopback peers, peers
    /// naming this node and duplicates are dropped.
    pub fn normalize(&mut self) {
        let local_ip = outbound_ip();

        if self.host.is_empty() {
            let port = self.addr.rsplit(':').next().unwrap_or("8080");
            let ip = local_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string());
            self.host = format!("http://{}:{}", ip, port);
        }
        self.host = with_scheme(self.host.trim_end_matches('/'));

        let mut peers: Vec<String> = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let peer = with_scheme(peer.trim().trim_end_matches('/'));
            if peer == self.host || peers.contains(&peer) {
                continue;
            }
            match peer_ip(&peer) {
                Some(ip) if ip.is_loopback() => continue,
                Some(ip) if Some(ip) == local_ip => continue,
                _ => peers.push(peer),
            }
        }
        self.peers = peers;
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.queue_size == 0 {
            return Err(StorageError::Config("queue_size must be at least 1".to_string()));
        }
        if self.name_probe_limit == 0 {
            return Err(StorageError::Config(
                "name_probe_limit must be at least 1".to_string(),
            ));
        }
        if self.group.is_empty() || self.group.contains(['/', '\\']) {
            return Err(StorageError::Config(format!("invalid group: {:?}", self.group)));
        }
        if self.host.is_empty() {
            return Err(StorageError::Config("host is not set".to_string()));
        }
        Ok(())
    }
}

fn with_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// IP literal of a peer URL, if it has one
pub fn peer_ip(peer: &str) -> Option<IpAddr> {
    let rest = peer
        .strip_prefix("http://")
        .or_else(|| peer.strip_prefix("https://"))
        .unwrap_or(peer);
    let authority = rest.split('/').next().unwrap_or(rest);
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    host.trim_matches(|c| c == '[' || c == ']').parse().ok()
}

/// Address of the interface used for outbound traffic. No packets are sent.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_normalization() {
        let mut config = Config {
            host: "http://192.0.2.9:8080".to_string(),
            peers: vec![
                "192.0.2.2:8080".to_string(),
                "http://192.0.2.2:8080/".to_string(),
                "http://127.0.0.1:8080".to_string(),
                "http://192.0.2.9:8080".to_string(),
                "http://192.0.2.3:8080".to_string(),
            ],
            ..Default::default()
        };
        config.normalize();

        assert_eq!(
            config.peers,
            vec!["http://192.0.2.2:8080".to_string(), "http://192.0.2.3:8080".to_string()]
        );
    }

    #[test]
    fn test_peer_ip() {
        assert_eq!(peer_ip("http://192.0.2.2:8080"), "192.0.2.2".parse().ok());
        assert_eq!(peer_ip("http://[::1]:8080/x"), "::1".parse().ok());
        assert_eq!(peer_ip("http://files.example.org"), None);
    }

    #[test]
    fn test_validate() {
        let config = Config {
            host: "http://192.0.2.9:8080".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let zero_queue = Config {
            queue_size: 0,
            ..config.clone()
        };
        assert!(matches!(zero_queue.validate(), Err(StorageError::Config(_))));

        let bad_group = Config {
            group: "a/b".to_string(),
            ..config.clone()
        };
        assert!(matches!(bad_group.validate(), Err(StorageError::Config(_))));

        let no_host = Config {
            host: String::new(),
            ..config
        };
        assert!(no_host.validate().is_err());
    }

    #[test]
    fn test_toml_defaults() {
        let config: Config = toml::from_str(
            r#"
            peers = ["http://192.0.2.2:8080"]
            hash_algorithm = "sha1"
            "#,
        )
        .unwrap();

        assert_eq!(config.queue_size, 100_000);
        assert_eq!(config.push_workers, 50);
        assert_eq!(config.group, "group1");
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha1);
        assert!(config.auto_repair);
    }
}
