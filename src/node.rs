//! A storage node: every service plus its lifecycle
//!
//! `Node::open` builds the services from a `Config`, `start` launches the
//! worker pools and periodic tasks, `shutdown` stops them and flushes state.
//! The methods below `shutdown` are the operations of the peer surface; the
//! HTTP layer and the in-process test transport both call into them.

use crate::config::Config;
use crate::digest::path_key;
use crate::error::StorageError;
use crate::ledger::{today, Ledger};
use crate::metadata::MetadataDb;
use crate::queue::ReplicationQueues;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::record::{DayStat, FileRecord, LedgerCategory, NodeStatus, StatusData};
use crate::registry::{validate_record_path, Registrar};
use crate::replication::Replicator;
use crate::stats::StatAggregator;
use crate::tasks::TaskSupervisor;
use crate::transport::{HttpTransport, PeerTransport};
use crate::upload::{UploadOutcome, UploadPipeline, UploadRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

pub struct Node {
    config: Arc<Config>,
    registrar: Arc<Registrar>,
    queues: ReplicationQueues,
    uploads: UploadPipeline,
    replicator: Arc<Replicator>,
    reconciler: Arc<Reconciler>,
    transport: Arc<dyn PeerTransport>,
    supervisor: TaskSupervisor,
}

impl Node {
    /// Open the stores under `config.storage_dir` and wire the services.
    ///
    /// Fails when the config is unusable or the metadata database cannot
    /// be opened.
    pub async fn open(
        config: Config,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>, StorageError> {
        config.validate()?;
        let config = Arc::new(config);
        fs::create_dir_all(config.files_dir()).await?;

        let metadata = Arc::new(MetadataDb::open(config.metadata_db_path())?);
        let ledger = Arc::new(Ledger::new(config.data_dir()).await?);
        let stats = Arc::new(StatAggregator::new(config.stat_path()));
        stats.load_or_rebuild(&ledger).await?;

        let registrar = Arc::new(Registrar::new(config.clone(), metadata, ledger, stats));
        let queues = ReplicationQueues::new(config.queue_size);
        let uploads = UploadPipeline::new(registrar.clone(), queues.clone());
        let replicator = Arc::new(Replicator::new(registrar.clone(), transport.clone()));
        let reconciler = Arc::new(Reconciler::new(
            registrar.clone(),
            transport.clone(),
            queues.clone(),
        ));

        info!(
            host = %config.host,
            peers = ?config.peers,
            storage = %config.storage_dir.display(),
            records = registrar.metadata().len(),
            algorithm = %config.hash_algorithm,
            "Node opened"
        );

        Ok(Arc::new(Self {
            config,
            registrar,
            queues,
            uploads,
            replicator,
            reconciler,
            transport,
            supervisor: TaskSupervisor::new(),
        }))
    }

    /// Open a node that talks to its peers over HTTP
    pub async fn open_with_http(config: Config) -> Result<Arc<Self>, StorageError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::open(config, transport).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn queues(&self) -> &ReplicationQueues {
        &self.queues
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// This node's URL
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Launch the worker pools and the periodic tasks
    pub fn start(&self) {
        let config = &self.config;
        let secs = Duration::from_secs;

        let replicator = self.replicator.clone();
        let outbound = self.queues.outbound_receiver();
        self.supervisor.spawn_workers("push", config.push_workers.max(1), move |i| {
            let replicator = replicator.clone();
            let rx = outbound.clone();
            async move { replicator.drain(i, rx).await }
        });

        let replicator = self.replicator.clone();
        let inbound = self.queues.inbound_receiver();
        self.supervisor.spawn_workers("pull", config.pull_workers.max(1), move |i| {
            let replicator = replicator.clone();
            let rx = inbound.clone();
            async move { replicator.drain(i, rx).await }
        });

        let reconciler = self.reconciler.clone();
        let refresh = secs(config.refresh_interval_secs.max(1));
        self.supervisor.spawn_periodic("error-retry", refresh, refresh, move || {
            let reconciler = reconciler.clone();
            async move {
                if let Err(e) = reconciler.resync(&today(), false).await {
                    warn!(error = %e, "Error retry failed");
                }
            }
        });

        if config.auto_repair {
            let reconciler = self.reconciler.clone();
            self.supervisor.spawn_periodic(
                "auto-repair",
                secs(config.repair_initial_delay_secs),
                secs(config.repair_interval_secs.max(1)),
                move || {
                    let reconciler = reconciler.clone();
                    async move {
                        reconciler.run_all(false).await;
                    }
                },
            );
        }

        let registrar = self.registrar.clone();
        let eviction = secs(config.cache_eviction_interval_secs.max(1));
        self.supervisor.spawn_periodic("cache-eviction", eviction, eviction, move || {
            let registrar = registrar.clone();
            async move {
                let evicted = registrar.ledger().evict_except(&today()).await;
                debug!(evicted, "Evicted ledger caches");
            }
        });

        let registrar = self.registrar.clone();
        let transport = self.transport.clone();
        let health = secs(config.health_check_interval_secs.max(1));
        self.supervisor.spawn_periodic("health-check", health, health, move || {
            let registrar = registrar.clone();
            let transport = transport.clone();
            async move { check_peers(&registrar, transport.as_ref()).await }
        });

        let registrar = self.registrar.clone();
        let snapshot = secs(config.stat_snapshot_interval_secs.max(1));
        self.supervisor.spawn_periodic("stat-snapshot", snapshot, snapshot, move || {
            let registrar = registrar.clone();
            async move {
                if let Err(e) = registrar.stats().snapshot().await {
                    warn!(error = %e, "Failed to snapshot counters");
                }
            }
        });

        info!(host = %self.config.host, "Node started");
    }

    /// Stop background work and flush durable state. Jobs still queued when
    /// the grace period ends are dropped.
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        self.queues.close();
        self.supervisor.shutdown().await;
        self.registrar.stats().snapshot().await?;
        self.registrar.metadata().close().await?;
        info!(host = %self.config.host, "Node stopped");
        Ok(())
    }

    // ==================== Peer surface ====================

    /// Live record under a content hash or path alias; the empty record when absent
    pub async fn check_file_exist(&self, key: &str) -> Result<FileRecord, StorageError> {
        Ok(self.registrar.lookup(key).await?.unwrap_or_default())
    }

    /// Store a client upload
    pub async fn upload<R>(&self, request: UploadRequest, body: R) -> Result<UploadOutcome, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        self.uploads.store(request, body).await
    }

    /// Accept the bytes of `record` pushed by a peer.
    ///
    /// The content must hash to `record.hash`. An already stored hash is
    /// acknowledged without writing. A different file already at the
    /// record's path is never replaced; the push fails with
    /// `ChecksumMismatch`.
    pub async fn receive_file<R>(&self, record: FileRecord, mut body: R) -> Result<FileRecord, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        validate_record_path(&record)?;
        if let Some(existing) = self.registrar.lookup(&record.hash).await? {
            debug!(hash = %record.hash, "Pushed file already stored");
            return Ok(existing);
        }

        let dest = self.registrar.local_path(&record);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = dest.with_file_name(format!(".{}.sync", record.stored_name()));
        let size = {
            let mut file = fs::File::create(&staging).await?;
            let size = tokio::io::copy(&mut body, &mut file).await;
            file.flush().await?;
            size
        };
        let size = match size {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                return Err(e.into());
            }
        };

        let actual = self.config.hash_algorithm.hash_file(&staging).await?;
        if !actual.eq_ignore_ascii_case(&record.hash) {
            let _ = fs::remove_file(&staging).await;
            return Err(StorageError::ChecksumMismatch {
                expected: record.hash,
                actual,
            });
        }
        match self.registrar.holds(&dest, &record.hash).await {
            Ok(true) => fs::remove_file(&staging).await?,
            Ok(false) => fs::rename(&staging, &dest).await?,
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                return Err(e);
            }
        }

        let mut stored = record;
        stored.size = size;
        stored.add_peer(self.host());
        self.registrar.commit(&stored).await?;
        info!(hash = %stored.hash, size, path = %stored.full_path(), "Received file from peer");
        Ok(stored)
    }

    /// Accept a reference to a file held by a peer and queue a pull for it
    pub async fn receive_reference(&self, record: FileRecord) -> Result<String, StorageError> {
        validate_record_path(&record)?;
        let url = self.registrar.download_url(&record);
        if self.registrar.lookup(&record.hash).await?.is_some() {
            return Ok(url);
        }
        self.registrar.note(LedgerCategory::QueuedFromPeer, &record).await?;
        let queues = self.queues.clone();
        tokio::spawn(async move {
            if let Err(e) = queues.enqueue_pull(record, None).await {
                warn!(error = %e, "Failed to queue pull");
            }
        });
        Ok(url)
    }

    /// Remove the file behind a hash. The record goes on the next lookup.
    pub async fn delete(&self, hash: &str) -> Result<FileRecord, StorageError> {
        let record = self
            .registrar
            .lookup(hash)
            .await?
            .ok_or_else(|| StorageError::NotFound(hash.to_string()))?;
        fs::remove_file(self.registrar.local_path(&record)).await?;
        info!(hash = %hash, path = %record.full_path(), "Deleted file");
        Ok(record)
    }

    /// Per-day counters plus the `all` row
    pub async fn day_stats(&self) -> Vec<DayStat> {
        self.registrar.stats().day_stats().await
    }

    /// Committed hashes of a day
    pub async fn hash_set(&self, date: &str) -> Result<HashSet<String>, StorageError> {
        self.registrar
            .ledger()
            .hash_set(date, LedgerCategory::Committed)
            .await
    }

    /// A peer reports hashes we lack; resolve and queue them in the background
    pub fn receive_missing(&self, origin: Option<String>, hashes: Vec<String>) {
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move {
            match reconciler.receive_missing(origin.as_deref(), &hashes).await {
                Ok(n) => debug!(hashes = hashes.len(), pulls = n, "Handled missing-hash notice"),
                Err(e) => warn!(error = %e, "Failed to handle missing-hash notice"),
            }
        });
    }

    /// Replay a day's ledgers in the background
    pub fn sync(&self, date: String, force: bool) {
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.resync(&date, force).await {
                warn!(date = %date, error = %e, "Resync failed");
            }
        });
    }

    /// Run a repair sweep now and wait for it
    pub async fn repair(&self, force: bool) -> Option<ReconcileReport> {
        self.reconciler.run_all(force).await
    }

    /// Start a repair sweep in the background. False if one is already running.
    pub fn spawn_repair(&self, force: bool) -> bool {
        if self.reconciler.is_sweeping() {
            return false;
        }
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move {
            reconciler.run_all(force).await;
        });
        true
    }

    /// Rebuild every counter from the committed ledgers
    pub async fn repair_stat(&self) -> Result<Vec<DayStat>, StorageError> {
        self.registrar.stats().rebuild(self.registrar.ledger()).await?;
        Ok(self.day_stats().await)
    }

    pub async fn status(&self) -> NodeStatus {
        let ledger = self.registrar.ledger();
        let date = today();
        NodeStatus {
            status: "ok".to_string(),
            message: String::new(),
            data: Some(StatusData {
                queue_to_peers: self.queues.outbound_len(),
                queue_from_peers: self.queues.inbound_len(),
                file_set_size: ledger.cached_len(&date, LedgerCategory::Committed).await,
                queue_set_size: ledger.cached_len(&date, LedgerCategory::QueuedFromPeer).await,
                error_set_size: ledger.cached_len(&date, LedgerCategory::TransferError).await,
                auto_repair: self.config.auto_repair,
                refresh_interval: self.config.refresh_interval_secs,
                peers: self.config.peers.clone(),
                local: self.config.host.clone(),
                file_stats: self.day_stats().await,
            }),
        }
    }

    /// Find a peer holding the file at `full_path` and queue a pull from it.
    /// Returns the peer to redirect the caller to.
    pub async fn locate_remote(&self, full_path: &str) -> Option<String> {
        let key = path_key(full_path);
        let (peer, record) = self.reconciler.locate(&self.config.peers, &key).await?;
        let queues = self.queues.clone();
        let source = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = queues.enqueue_pull(record, Some(source)).await {
                warn!(error = %e, "Failed to queue pull");
            }
        });
        Some(peer)
    }
}

/// Log peers that fail their status query or report trouble
async fn check_peers(registrar: &Registrar, transport: &dyn PeerTransport) {
    for peer in &registrar.config().peers {
        match transport.status(peer).await {
            Ok(status) if status.status == "ok" => debug!(peer = %peer, "Peer healthy"),
            Ok(status) => warn!(peer = %peer, status = %status.status, message = %status.message, "Peer unhealthy"),
            Err(e) => warn!(peer = %peer, error = %e, "Peer unreachable"),
        }
    }
}
