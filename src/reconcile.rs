//! Anti-entropy between peers
//!
//! A sweep against one peer compares the per-day counters first and only
//! exchanges hash sets for days that differ:
//!
//! 1. fetch the peer's day counters
//! 2. a day with no local counter at all is pulled in full
//! 3. a day whose file counts agree is assumed converged (skipped unless forced)
//! 4. otherwise diff the committed hash sets: hashes we lack are pulled from
//!    the peer, hashes the peer lacks are sent to it so it pulls them from us
//!
//! Step 3 trusts count equality as a proxy for set equality. Two replicas
//! that diverged by the same number of files on a day are not repaired by an
//! unforced sweep; `force` bypasses the shortcut.

use crate::error::StorageError;
use crate::ledger::is_date;
use crate::queue::ReplicationQueues;
use crate::record::{FileRecord, LedgerCategory};
use crate::registry::Registrar;
use crate::transport::PeerTransport;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Days compared (counter rows from the peer)
    pub days_checked: usize,
    /// Days whose hash sets were exchanged
    pub days_diffed: usize,
    /// Inbound pulls queued locally
    pub pulls_enqueued: usize,
    /// Hashes reported to the peer as missing there
    pub hashes_notified: usize,
}

impl ReconcileReport {
    fn absorb(&mut self, other: &ReconcileReport) {
        self.days_checked += other.days_checked;
        self.days_diffed += other.days_diffed;
        self.pulls_enqueued += other.pulls_enqueued;
        self.hashes_notified += other.hashes_notified;
    }
}

/// `(local_missing, peer_missing)`, each sorted
pub fn diff_sets(local: &HashSet<String>, remote: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let mut local_missing: Vec<String> = remote.difference(local).cloned().collect();
    let mut peer_missing: Vec<String> = local.difference(remote).cloned().collect();
    local_missing.sort();
    peer_missing.sort();
    (local_missing, peer_missing)
}

pub struct Reconciler {
    registrar: Arc<Registrar>,
    transport: Arc<dyn PeerTransport>,
    queues: ReplicationQueues,
    sweeping: AtomicBool,
}

/// Clears the sweep flag when dropped
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Reconciler {
    pub fn new(
        registrar: Arc<Registrar>,
        transport: Arc<dyn PeerTransport>,
        queues: ReplicationQueues,
    ) -> Self {
        Self {
            registrar,
            transport,
            queues,
            sweeping: AtomicBool::new(false),
        }
    }

    /// True while a repair sweep is running
    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::SeqCst)
    }

    /// Reconcile against every configured peer.
    ///
    /// Returns None when another sweep is already in progress. A failing
    /// peer is logged and skipped.
    pub async fn run_all(&self, force: bool) -> Option<ReconcileReport> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Repair sweep already running");
            return None;
        }
        let _guard = SweepGuard(&self.sweeping);

        let mut total = ReconcileReport::default();
        for peer in &self.registrar.config().peers {
            match self.run_peer(peer, force).await {
                Ok(report) => total.absorb(&report),
                Err(e) => warn!(peer = %peer, error = %e, "Reconciliation failed"),
            }
        }
        info!(
            days = total.days_checked,
            diffed = total.days_diffed,
            pulls = total.pulls_enqueued,
            notified = total.hashes_notified,
            force,
            "Repair sweep finished"
        );
        Some(total)
    }

    /// Reconcile against one peer
    pub async fn run_peer(&self, peer: &str, force: bool) -> Result<ReconcileReport, StorageError> {
        let stats = self.registrar.stats();
        let remote_days = self.transport.day_stats(peer).await?;

        let mut report = ReconcileReport::default();
        for day in remote_days.iter().filter(|d| is_date(&d.date)) {
            report.days_checked += 1;
            let result = match stats.file_count(&day.date).await {
                None => self.full_pull(peer, &day.date).await,
                Some(count) if count == day.file_count && !force => continue,
                Some(_) => self.diff_day(peer, &day.date).await,
            };
            match result {
                Ok(day_report) => report.absorb(&day_report),
                Err(e) => warn!(peer = %peer, date = %day.date, error = %e, "Day reconciliation failed"),
            }
        }
        debug!(peer = %peer, ?report, "Reconciled with peer");
        Ok(report)
    }

    /// First contact for a day: pull everything the peer has that we lack
    async fn full_pull(&self, peer: &str, date: &str) -> Result<ReconcileReport, StorageError> {
        let remote = self.transport.hash_set(peer, date).await?;
        let local = self
            .registrar
            .ledger()
            .hash_set(date, LedgerCategory::Committed)
            .await?;
        let (local_missing, _) = diff_sets(&local, &remote);
        info!(peer = %peer, date = %date, files = local_missing.len(), "Pulling day from peer");

        let mut report = ReconcileReport {
            days_diffed: 1,
            ..Default::default()
        };
        report.pulls_enqueued = self.pull_from(peer, &local_missing).await?;
        Ok(report)
    }

    async fn diff_day(&self, peer: &str, date: &str) -> Result<ReconcileReport, StorageError> {
        let local = self
            .registrar
            .ledger()
            .hash_set(date, LedgerCategory::Committed)
            .await?;
        let remote = self.transport.hash_set(peer, date).await?;
        let (local_missing, peer_missing) = diff_sets(&local, &remote);

        let mut report = ReconcileReport {
            days_diffed: 1,
            ..Default::default()
        };
        if !peer_missing.is_empty() {
            match self
                .transport
                .notify_missing(peer, self.registrar.host(), &peer_missing)
                .await
            {
                Ok(()) => report.hashes_notified = peer_missing.len(),
                Err(e) => warn!(peer = %peer, date = %date, hashes = peer_missing.len(), error = %e, "Missing-hash notice failed"),
            }
        }
        report.pulls_enqueued = self.pull_from(peer, &local_missing).await?;
        if report.pulls_enqueued > 0 || report.hashes_notified > 0 {
            info!(
                peer = %peer,
                date = %date,
                pulls = report.pulls_enqueued,
                notified = report.hashes_notified,
                "Day diverged from peer"
            );
        }
        Ok(report)
    }

    /// Probe `peer` for each hash and queue a pull for every record it has
    async fn pull_from(&self, peer: &str, hashes: &[String]) -> Result<usize, StorageError> {
        let mut enqueued = 0;
        for hash in hashes {
            match self.transport.check_file_exist(peer, hash).await {
                Ok(Some(record)) => {
                    self.queues.enqueue_pull(record, Some(peer.to_string())).await?;
                    enqueued += 1;
                }
                Ok(None) => debug!(peer = %peer, hash = %hash, "Peer no longer has file"),
                Err(e) => warn!(peer = %peer, hash = %hash, error = %e, "Probe failed"),
            }
        }
        Ok(enqueued)
    }

    /// Handle a peer telling us which hashes we lack.
    ///
    /// Each hash is resolved by probing `origin`, or every configured peer
    /// when no origin was given. Returns the number of pulls queued.
    pub async fn receive_missing(
        &self,
        origin: Option<&str>,
        hashes: &[String],
    ) -> Result<usize, StorageError> {
        let candidates: Vec<String> = match origin {
            Some(o) => vec![o.to_string()],
            None => self.registrar.config().peers.clone(),
        };

        let mut enqueued = 0;
        for hash in hashes {
            if self.registrar.lookup(hash).await?.is_some() {
                continue;
            }
            if let Some((peer, record)) = self.locate(&candidates, hash).await {
                self.queues.enqueue_pull(record, Some(peer)).await?;
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// First candidate peer holding `key`, with its record
    pub async fn locate(&self, candidates: &[String], key: &str) -> Option<(String, FileRecord)> {
        for peer in candidates {
            match self.transport.check_file_exist(peer, key).await {
                Ok(Some(record)) => return Some((peer.clone(), record)),
                Ok(None) => {}
                Err(e) => debug!(peer = %peer, key = %key, error = %e, "Probe failed"),
            }
        }
        None
    }

    /// Re-queue a day's records from its ledgers.
    ///
    /// With `force` the committed ledger is replayed with every record's peer
    /// list reset, so each peer is probed again. Without it only the
    /// transfer-error ledger is replayed. References in the queued ledger that
    /// are still missing locally are queued as pulls either way. Returns the
    /// number of jobs queued.
    pub async fn resync(&self, date: &str, force: bool) -> Result<usize, StorageError> {
        let config = self.registrar.config();
        let ledger = self.registrar.ledger();
        let category = if force {
            LedgerCategory::Committed
        } else {
            LedgerCategory::TransferError
        };

        let mut enqueued = 0;
        if !config.peers.is_empty() {
            let mut seen = HashSet::new();
            for entry in ledger.read_entries(date, category).await? {
                if !seen.insert(entry.hash.clone()) {
                    continue;
                }
                let Some(mut record) = self.registrar.lookup(&entry.hash).await? else {
                    debug!(hash = %entry.hash, "No local record, skipping resync");
                    continue;
                };
                if force {
                    record.peers.clear();
                } else if record.peers.len() > config.peers.len() {
                    continue;
                }
                self.queues.enqueue_push(record).await?;
                enqueued += 1;
            }
        }

        let queued: Vec<String> = ledger
            .read_entries(date, LedgerCategory::QueuedFromPeer)
            .await?
            .into_iter()
            .map(|e| e.hash)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if !queued.is_empty() {
            enqueued += self.receive_missing(None, &queued).await?;
        }

        info!(date = %date, category = %category, force, jobs = enqueued, "Resync queued jobs");
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(hashes: &[&str]) -> HashSet<String> {
        hashes.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_diff_sets_symmetric_difference() {
        let (local_missing, peer_missing) =
            diff_sets(&set(&["h1", "h2", "h3"]), &set(&["h2", "h3", "h4"]));
        assert_eq!(local_missing, vec!["h4"]);
        assert_eq!(peer_missing, vec!["h1"]);
    }

    #[test]
    fn test_diff_sets_converged() {
        let (local_missing, peer_missing) = diff_sets(&set(&["a", "b"]), &set(&["b", "a"]));
        assert!(local_missing.is_empty());
        assert!(peer_missing.is_empty());
    }

    #[test]
    fn test_diff_sets_first_contact() {
        let (local_missing, peer_missing) = diff_sets(&HashSet::new(), &set(&["b", "a"]));
        assert_eq!(local_missing, vec!["a", "b"]);
        assert!(peer_missing.is_empty());
    }

    #[test]
    fn test_report_absorb() {
        let mut total = ReconcileReport::default();
        let day = ReconcileReport {
            days_checked: 1,
            days_diffed: 1,
            pulls_enqueued: 2,
            hashes_notified: 3,
        };
        total.absorb(&day);
        total.absorb(&day);
        assert_eq!(total.pulls_enqueued, 4);
        assert_eq!(total.hashes_notified, 6);
    }
}
