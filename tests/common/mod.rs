//! Shared helpers for the integration tests
//!
//! `LocalTransport` routes peer calls straight into other `Node`s living in
//! the same process, so replication and reconciliation can be exercised
//! without sockets.

#![allow(dead_code)]

use async_trait::async_trait;
use elohim_replica::record::{DayStat, FileRecord, NodeStatus};
use elohim_replica::{Config, Node, PeerTransport, StorageError, UploadRequest};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tempfile::TempDir;

/// Nodes reachable through a `LocalTransport`, by host URL
#[derive(Default)]
pub struct Directory {
    nodes: RwLock<HashMap<String, Weak<Node>>>,
    down: RwLock<HashSet<String>>,
    deaf: RwLock<HashSet<String>>,
    truncating: RwLock<HashSet<String>>,
}

fn toggle(set: &RwLock<HashSet<String>>, host: &str, on: bool) {
    let mut set = set.write().unwrap();
    if on {
        set.insert(host.to_string());
    } else {
        set.remove(host);
    }
}

impl Directory {
    pub fn register(&self, node: &Arc<Node>) {
        self.nodes
            .write()
            .unwrap()
            .insert(node.host().to_string(), Arc::downgrade(node));
    }

    /// Make `host` unreachable (or reachable again)
    pub fn set_down(&self, host: &str, down: bool) {
        toggle(&self.down, host, down);
    }

    /// Make `host` reject missing-hash notices
    pub fn set_deaf(&self, host: &str, deaf: bool) {
        toggle(&self.deaf, host, deaf);
    }

    /// Make downloads from `host` deliver only the first half of each file
    pub fn set_truncating(&self, host: &str, truncating: bool) {
        toggle(&self.truncating, host, truncating);
    }

    fn get(&self, peer: &str) -> Result<Arc<Node>, StorageError> {
        if self.down.read().unwrap().contains(peer) {
            return Err(StorageError::transfer(peer, "connection refused"));
        }
        self.nodes
            .read()
            .unwrap()
            .get(peer)
            .and_then(Weak::upgrade)
            .ok_or_else(|| StorageError::transfer(peer, "unknown peer"))
    }
}

pub struct LocalTransport {
    directory: Arc<Directory>,
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn check_file_exist(
        &self,
        peer: &str,
        key: &str,
    ) -> Result<Option<FileRecord>, StorageError> {
        let record = self.directory.get(peer)?.check_file_exist(key).await?;
        Ok((!record.is_empty()).then_some(record))
    }

    async fn push_file(
        &self,
        peer: &str,
        record: &FileRecord,
        local: &Path,
    ) -> Result<String, StorageError> {
        let node = self.directory.get(peer)?;
        let file = tokio::fs::File::open(local).await?;
        let stored = node.receive_file(record.clone(), file).await?;
        Ok(node.registrar().download_url(&stored))
    }

    async fn push_reference(
        &self,
        peer: &str,
        record: &FileRecord,
    ) -> Result<String, StorageError> {
        self.directory.get(peer)?.receive_reference(record.clone()).await
    }

    async fn download(
        &self,
        peer: &str,
        record: &FileRecord,
        dest: &Path,
    ) -> Result<u64, StorageError> {
        let node = self.directory.get(peer)?;
        let source = node.registrar().local_path(record);
        if !source.exists() {
            return Err(StorageError::NotFound(record.full_path()));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let truncating = self.directory.truncating.read().unwrap().contains(peer);
        if truncating {
            let bytes = tokio::fs::read(&source).await?;
            let half = &bytes[..bytes.len() / 2];
            tokio::fs::write(dest, half).await?;
            return Ok(half.len() as u64);
        }
        Ok(tokio::fs::copy(source, dest).await?)
    }

    async fn day_stats(&self, peer: &str) -> Result<Vec<DayStat>, StorageError> {
        Ok(self.directory.get(peer)?.day_stats().await)
    }

    async fn hash_set(&self, peer: &str, date: &str) -> Result<HashSet<String>, StorageError> {
        self.directory.get(peer)?.hash_set(date).await
    }

    async fn notify_missing(
        &self,
        peer: &str,
        origin: &str,
        hashes: &[String],
    ) -> Result<(), StorageError> {
        let node = self.directory.get(peer)?;
        let deaf = self.directory.deaf.read().unwrap().contains(peer);
        if deaf {
            return Err(StorageError::transfer(peer, "403 Forbidden"));
        }
        node.receive_missing(Some(origin.to_string()), hashes.to_vec());
        Ok(())
    }

    async fn status(&self, peer: &str) -> Result<NodeStatus, StorageError> {
        Ok(self.directory.get(peer)?.status().await)
    }
}

/// A node backed by its own temporary directory
pub struct TestNode {
    pub node: Arc<Node>,
    _dir: TempDir,
}

impl std::ops::Deref for TestNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

/// `http://node-<name>`
pub fn host(name: &str) -> String {
    format!("http://node-{}", name)
}

/// Config for a test node: small pools, background sweeps effectively off
pub fn test_config(dir: &Path, host: &str, peers: Vec<String>) -> Config {
    Config {
        storage_dir: dir.to_path_buf(),
        host: host.to_string(),
        peers,
        queue_size: 64,
        push_workers: 2,
        pull_workers: 2,
        auto_repair: false,
        ..Default::default()
    }
}

/// Open one node per name, each configured with all the others as peers.
/// Nodes are opened but not started.
pub async fn cluster(names: &[&str]) -> (Arc<Directory>, Vec<TestNode>) {
    cluster_with(names, |_| {}).await
}

/// Like `cluster`, with `tweak` applied to every node's config
pub async fn cluster_with<F>(names: &[&str], tweak: F) -> (Arc<Directory>, Vec<TestNode>)
where
    F: Fn(&mut Config),
{
    let directory = Arc::new(Directory::default());
    let mut nodes = Vec::new();
    for name in names {
        let dir = TempDir::new().unwrap();
        let peers = names
            .iter()
            .filter(|n| *n != name)
            .map(|n| host(n))
            .collect();
        let mut config = test_config(dir.path(), &host(name), peers);
        tweak(&mut config);
        let transport = Arc::new(LocalTransport {
            directory: directory.clone(),
        });
        let node = Node::open(config, transport).await.unwrap();
        directory.register(&node);
        nodes.push(TestNode { node, _dir: dir });
    }
    (directory, nodes)
}

pub fn upload_request(name: &str, scene: &str) -> UploadRequest {
    UploadRequest {
        file_name: name.to_string(),
        scene: Some(scene.to_string()),
        ..Default::default()
    }
}

/// Drop every queued job without processing it
pub fn discard_queued(node: &Node) {
    let outbound = node.queues().outbound_receiver();
    while outbound.try_recv().is_ok() {}
    let inbound = node.queues().inbound_receiver();
    while inbound.try_recv().is_ok() {}
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
