//! Ingestion queue feeding the relation index worker.
//!
//! A single worker consumes batches in FIFO order, so materialization
//! happens in submission order. A failed entry is logged and counted, never
//! retried here: tuples stay durable and the index remains rebuildable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RebacConfig;
use crate::error::{RebacError, Result};
use crate::index::IndexController;
use crate::models::RelationEntry;

struct IndexJob {
    entries: Vec<RelationEntry>,
    ack: Option<oneshot::Sender<()>>,
}

/// Counters exposed by the ingestion queue.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pending: Arc<AtomicU64>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl QueueStats {
    /// Batches submitted but not yet fully processed.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    /// Entries materialized since startup.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Entries whose materialization failed and was skipped.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Buffered hand-off between bulk relation writes and the index worker.
pub struct IngestionQueue {
    sender: Mutex<Option<mpsc::Sender<IndexJob>>>,
    stats: QueueStats,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionQueue {
    /// Spawns the worker task; the queue is live as soon as this returns.
    pub fn new(index: Arc<IndexController>, config: &RebacConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let stats = QueueStats::default();
        let worker = tokio::spawn(run_worker(index, receiver, stats.clone()));
        Self {
            sender: Mutex::new(Some(sender)),
            stats,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues a batch without waiting for materialization.
    pub async fn add_relation_index_job(&self, entries: Vec<RelationEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.submit(IndexJob { entries, ack: None }).await
    }

    /// Queues a batch and returns a signal that fires once every entry in it
    /// has been worked through.
    pub async fn add_relation_index_job_acked(
        &self,
        entries: Vec<RelationEntry>,
    ) -> Result<oneshot::Receiver<()>> {
        let (ack, done) = oneshot::channel();
        self.submit(IndexJob {
            entries,
            ack: Some(ack),
        })
        .await?;
        Ok(done)
    }

    /// Waits until every batch queued before this call has been processed.
    /// An empty acked batch rides the FIFO as a barrier.
    pub async fn flush(&self) -> Result<()> {
        let done = self.add_relation_index_job_acked(Vec::new()).await?;
        done.await
            .map_err(|_| RebacError::Internal(anyhow!("index worker exited before draining")))
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.clone()
    }

    /// Stops accepting work, lets the worker drain what is queued, then
    /// joins it.
    pub async fn shutdown(&self) -> Result<()> {
        self.sender.lock().await.take();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|err| RebacError::Internal(anyhow!("index worker task failed: {err}")))?;
        }
        Ok(())
    }

    async fn submit(&self, job: IndexJob) -> Result<()> {
        let guard = self.sender.lock().await;
        let Some(sender) = guard.as_ref() else {
            return Err(RebacError::Internal(anyhow!("ingestion queue is shut down")));
        };
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        if sender.send(job).await.is_err() {
            self.stats.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(RebacError::Internal(anyhow!(
                "index worker is no longer running"
            )));
        }
        Ok(())
    }
}

async fn run_worker(
    index: Arc<IndexController>,
    mut receiver: mpsc::Receiver<IndexJob>,
    stats: QueueStats,
) {
    info!("relation index worker started");
    while let Some(job) = receiver.recv().await {
        for entry in &job.entries {
            match index
                .construct_relation_index(&entry.subject, &entry.relation, &entry.resource)
                .await
            {
                Ok(()) => {
                    stats.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subject = entry.subject.as_str(),
                        relation = entry.relation.as_str(),
                        resource = entry.resource.as_str(),
                        "failed to index relation entry: {err}"
                    );
                }
            }
        }
        stats.pending.fetch_sub(1, Ordering::Relaxed);
        if let Some(ack) = job.ack {
            // The submitter may have stopped waiting; that is fine.
            let _ = ack.send(());
        }
    }
    info!("relation index worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        EntityRef, Relationship, ResourceDefinition, ResourceDefinitionRequest,
    };
    use crate::storage::memory::{
        MemoryDefinitionRepository, MemoryIndexRepository, MemoryRelationshipRepository,
    };
    use crate::storage::{DefinitionRepository, RelationshipRepository};

    struct QueueBed {
        queue: IngestionQueue,
        index: Arc<IndexController>,
        relationships: Arc<MemoryRelationshipRepository>,
    }

    async fn build() -> QueueBed {
        let definitions = Arc::new(MemoryDefinitionRepository::new());
        let relationships = Arc::new(MemoryRelationshipRepository::new());
        let index_store = Arc::new(MemoryIndexRepository::new());
        let index = Arc::new(IndexController::new(
            definitions.clone(),
            relationships.clone(),
            index_store,
        ));
        let queue = IngestionQueue::new(index.clone(), &RebacConfig::default());

        for request in [
            ResourceDefinitionRequest::new("user"),
            ResourceDefinitionRequest::new("document")
                .relation("owner", &["user"])
                .permission("edit", &["owner"]),
        ] {
            definitions
                .insert(ResourceDefinition::from_request(request))
                .await
                .unwrap();
        }

        QueueBed {
            queue,
            index,
            relationships,
        }
    }

    async fn stored_entry(bed: &QueueBed, subject: &str, relation: &str, object: &str) -> RelationEntry {
        let relationship = Relationship::new(
            &EntityRef::parse(subject).unwrap(),
            relation,
            &EntityRef::parse(object).unwrap(),
        );
        let stored = bed.relationships.insert(relationship).await.unwrap();
        RelationEntry::from(&stored)
    }

    #[tokio::test]
    async fn test_flush_is_a_barrier_over_queued_batches() {
        let bed = build().await;
        let first = stored_entry(&bed, "user:5", "owner", "document:1").await;
        let second = stored_entry(&bed, "user:6", "owner", "document:2").await;

        bed.queue
            .add_relation_index_job(vec![first, second])
            .await
            .unwrap();
        bed.queue.flush().await.unwrap();

        assert_eq!(bed.queue.stats().processed(), 2);
        assert_eq!(bed.queue.stats().pending(), 0);
        assert!(bed
            .index
            .check_permission("user:5", "edit", "document:1")
            .await
            .unwrap());
        assert!(bed
            .index
            .check_permission("user:6", "edit", "document:2")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_failed_entries_are_skipped_not_fatal() {
        let bed = build().await;
        let good = stored_entry(&bed, "user:5", "owner", "document:1").await;
        let bad = RelationEntry {
            subject: "user:5".to_string(),
            relation: "owner".to_string(),
            resource: "missing:1".to_string(),
        };

        bed.queue
            .add_relation_index_job(vec![bad, good])
            .await
            .unwrap();
        bed.queue.flush().await.unwrap();

        assert_eq!(bed.queue.stats().failed(), 1);
        assert_eq!(bed.queue.stats().processed(), 1);
        assert!(bed
            .index
            .check_permission("user:5", "edit", "document:1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects_new_work() {
        let bed = build().await;
        let entry = stored_entry(&bed, "user:5", "owner", "document:1").await;

        bed.queue
            .add_relation_index_job(vec![entry.clone()])
            .await
            .unwrap();
        bed.queue.shutdown().await.unwrap();

        assert_eq!(bed.queue.stats().processed(), 1);
        assert!(bed.queue.add_relation_index_job(vec![entry]).await.is_err());
        assert!(bed
            .index
            .check_permission("user:5", "edit", "document:1")
            .await
            .unwrap());
    }
}
