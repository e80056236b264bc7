//! Replication workers
//!
//! Outbound jobs push a local file to every configured peer not yet in its
//! peer list; inbound jobs pull a file a peer told us about. Both are
//! idempotent: a peer that already has the hash is just recorded, and a
//! pull for a hash we already hold is skipped. Failed pushes land in the
//! transfer-error ledger and are retried by the periodic resync, never inline.

use crate::config::peer_ip;
use crate::error::StorageError;
use crate::record::{Direction, FileRecord, LedgerCategory, ReplicationJob};
use crate::registry::{validate_record_path, Registrar};
use crate::transport::PeerTransport;
use async_channel::Receiver;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

pub struct Replicator {
    registrar: Arc<Registrar>,
    transport: Arc<dyn PeerTransport>,
}

impl Replicator {
    pub fn new(registrar: Arc<Registrar>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            registrar,
            transport,
        }
    }

    /// Worker loop: process jobs until the queue is closed and drained
    pub async fn drain(&self, worker: usize, rx: Receiver<ReplicationJob>) {
        while let Ok(job) = rx.recv().await {
            if let Err(e) = self.process(&job).await {
                if e.is_transient() {
                    debug!(worker, hash = %job.record.hash, error = %e, "Replication job failed");
                } else {
                    warn!(worker, hash = %job.record.hash, error = %e, "Replication job failed");
                }
            }
        }
        debug!(worker, "Replication worker stopped");
    }

    pub async fn process(&self, job: &ReplicationJob) -> Result<(), StorageError> {
        match &job.direction {
            Direction::Push => self.push(&job.record).await.map(|_| ()),
            Direction::Pull { source } => self.pull(&job.record, source.as_deref()).await.map(|_| ()),
        }
    }

    /// Push `record` to each configured peer missing from its peer list.
    ///
    /// Returns the number of peers recorded as holding the file afterwards.
    /// A failure towards one peer is logged to the transfer-error ledger and
    /// does not stop the others.
    pub async fn push(&self, record: &FileRecord) -> Result<usize, StorageError> {
        let config = self.registrar.config();
        let local = self.registrar.local_path(record);
        if fs::metadata(&local).await.is_err() {
            debug!(hash = %record.hash, path = %local.display(), "Local file gone, nothing to push");
            return Ok(0);
        }

        let mut confirmed = 0;
        let mut failed = false;
        for peer in config.peers.iter().filter(|p| !record.has_peer(p)) {
            match self.push_to(peer, record, &local).await {
                Ok(()) => {
                    self.registrar.metadata().add_peer(&record.hash, peer)?;
                    confirmed += 1;
                }
                Err(e) => {
                    warn!(peer = %peer, hash = %record.hash, error = %e, "Push failed");
                    failed = true;
                }
            }
        }
        if failed {
            self.registrar.note(LedgerCategory::TransferError, record).await?;
        }
        Ok(confirmed)
    }

    async fn push_to(&self, peer: &str, record: &FileRecord, local: &Path) -> Result<(), StorageError> {
        if let Some(existing) = self.transport.check_file_exist(peer, &record.hash).await? {
            debug!(peer = %peer, hash = %existing.hash, "Peer already has file");
            return Ok(());
        }
        if self.registrar.config().push_references {
            // The peer pulls from the first holder it finds in the list
            let mut reference = record.clone();
            reference.add_peer(self.registrar.host());
            self.transport.push_reference(peer, &reference).await?;
            info!(peer = %peer, hash = %record.hash, "Sent file reference to peer");
        } else {
            self.transport.push_file(peer, record, local).await?;
            info!(peer = %peer, hash = %record.hash, size = record.size, "Replicated file to peer");
        }
        Ok(())
    }

    /// Pull `record` from `source`, or from the first eligible entry of its
    /// peer list. Returns true when a new file was committed.
    ///
    /// A file already at the record's path is adopted when its content
    /// matches and left alone otherwise; the pull then fails with
    /// `ChecksumMismatch`.
    pub async fn pull(&self, record: &FileRecord, source: Option<&str>) -> Result<bool, StorageError> {
        validate_record_path(record)?;
        let host = self.registrar.host();
        let source = match source {
            Some(s) => s.to_string(),
            None => match record.peers.iter().find(|p| is_eligible_source(p, host)) {
                Some(p) => p.clone(),
                None => {
                    debug!(hash = %record.hash, "No peer to pull from");
                    return Ok(false);
                }
            },
        };

        if self.registrar.lookup(&record.hash).await?.is_some() {
            debug!(hash = %record.hash, "Already stored, skipping pull");
            return Ok(false);
        }

        let dest = self.registrar.local_path(record);
        if self.registrar.holds(&dest, &record.hash).await? {
            debug!(hash = %record.hash, path = %dest.display(), "Content already on disk, adopting");
        } else if !self.fetch(&source, record, &dest).await? {
            return Ok(false);
        }

        let mut stored = record.clone();
        stored.add_peer(&source);
        stored.add_peer(host);
        self.registrar.commit(&stored).await?;
        info!(peer = %source, hash = %record.hash, path = %stored.full_path(), "Pulled file from peer");
        Ok(true)
    }

    /// Download into a sibling `.part` file and move it to `dest`.
    /// False when the download came up short and was discarded.
    async fn fetch(&self, source: &str, record: &FileRecord, dest: &Path) -> Result<bool, StorageError> {
        let partial = partial_path(dest);
        let written = match self.transport.download(source, record, &partial).await {
            Ok(n) => n,
            Err(e) => {
                remove_if_present(&partial).await;
                return Err(e);
            }
        };
        if written == 0 || written != record.size {
            remove_if_present(&partial).await;
            warn!(peer = %source, hash = %record.hash, expected = record.size, written, "Discarding incomplete download");
            return Ok(false);
        }

        // Something may have landed at `dest` while downloading
        match self.registrar.holds(dest, &record.hash).await {
            Ok(true) => remove_if_present(&partial).await,
            Ok(false) => fs::rename(&partial, dest).await?,
            Err(e) => {
                remove_if_present(&partial).await;
                return Err(e);
            }
        }
        Ok(true)
    }
}

/// A pull source must be a remote node
fn is_eligible_source(peer: &str, host: &str) -> bool {
    if peer == host {
        return false;
    }
    !matches!(peer_ip(peer), Some(ip) if ip.is_loopback())
}

/// Sibling path a download is staged under before the rename
fn partial_path(dest: &Path) -> std::path::PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.part", name))
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_source_eligibility() {
        let host = "http://10.0.0.1:8080";
        assert!(!is_eligible_source(host, host));
        assert!(!is_eligible_source("http://127.0.0.1:8080", host));
        assert!(is_eligible_source("http://10.0.0.2:8080", host));
        assert!(is_eligible_source("http://node-b", host));
    }

    #[test]
    fn test_partial_path() {
        let dest = Path::new("/data/files/docs/report.pdf");
        assert_eq!(partial_path(dest), Path::new("/data/files/docs/.report.pdf.part"));
    }
}
