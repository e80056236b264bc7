//! Replication queues
//!
//! Two bounded FIFOs: outbound (local files to push to peers) and inbound
//! (references to pull from peers). Enqueue waits while a queue is full, so
//! producers slow down instead of jobs being dropped. Queues live only in
//! memory; whatever is lost on restart is regenerated by reconciliation.

use crate::error::StorageError;
use crate::record::{Direction, FileRecord, ReplicationJob};
use async_channel::{Receiver, Sender};

#[derive(Clone)]
pub struct ReplicationQueues {
    outbound_tx: Sender<ReplicationJob>,
    outbound_rx: Receiver<ReplicationJob>,
    inbound_tx: Sender<ReplicationJob>,
    inbound_rx: Receiver<ReplicationJob>,
}

impl ReplicationQueues {
    /// Create both queues with `capacity` slots each
    pub fn new(capacity: usize) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::bounded(capacity.max(1));
        let (inbound_tx, inbound_rx) = async_channel::bounded(capacity.max(1));
        Self {
            outbound_tx,
            outbound_rx,
            inbound_tx,
            inbound_rx,
        }
    }

    /// Queue a job on the queue matching its direction, waiting for room
    pub async fn enqueue(&self, job: ReplicationJob) -> Result<(), StorageError> {
        let tx = match job.direction {
            Direction::Push => &self.outbound_tx,
            Direction::Pull { .. } => &self.inbound_tx,
        };
        tx.send(job).await.map_err(|_| StorageError::QueueClosed)
    }

    pub async fn enqueue_push(&self, record: FileRecord) -> Result<(), StorageError> {
        self.enqueue(ReplicationJob::push(record)).await
    }

    pub async fn enqueue_pull(
        &self,
        record: FileRecord,
        source: Option<String>,
    ) -> Result<(), StorageError> {
        self.enqueue(ReplicationJob::pull(record, source)).await
    }

    /// Jobs waiting on the outbound queue
    pub fn outbound_len(&self) -> usize {
        self.outbound_tx.len()
    }

    /// Jobs waiting on the inbound queue
    pub fn inbound_len(&self) -> usize {
        self.inbound_tx.len()
    }

    pub fn outbound_receiver(&self) -> Receiver<ReplicationJob> {
        self.outbound_rx.clone()
    }

    pub fn inbound_receiver(&self) -> Receiver<ReplicationJob> {
        self.inbound_rx.clone()
    }

    /// Close both queues; waiting workers exit once drained
    pub fn close(&self) {
        self.outbound_tx.close();
        self.inbound_tx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(hash: &str) -> FileRecord {
        FileRecord {
            hash: hash.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_jobs_routed_by_direction() {
        let queues = ReplicationQueues::new(10);
        queues.enqueue_push(record("h1")).await.unwrap();
        queues
            .enqueue_pull(record("h2"), Some("http://peer".to_string()))
            .await
            .unwrap();

        assert_eq!(queues.outbound_len(), 1);
        assert_eq!(queues.inbound_len(), 1);

        let job = queues.inbound_receiver().recv().await.unwrap();
        assert_eq!(job.record.hash, "h2");
        assert_eq!(
            job.direction,
            Direction::Pull {
                source: Some("http://peer".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_drained() {
        let queues = ReplicationQueues::new(1);
        queues.enqueue_push(record("h1")).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), queues.enqueue_push(record("h2"))).await;
        assert!(blocked.is_err(), "enqueue on a full queue must wait");

        let producer = {
            let queues = queues.clone();
            tokio::spawn(async move { queues.enqueue_push(record("h3")).await })
        };
        let rx = queues.outbound_receiver();
        assert_eq!(rx.recv().await.unwrap().record.hash, "h1");

        producer.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap().record.hash, "h3");
        assert_eq!(queues.outbound_len(), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let queues = ReplicationQueues::new(1);
        queues.close();
        assert!(matches!(
            queues.enqueue_push(record("h1")).await,
            Err(StorageError::QueueClosed)
        ));
    }
}
