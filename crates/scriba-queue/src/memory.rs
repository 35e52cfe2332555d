// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process fallback queue.
//!
//! Each envelope is executed on a dedicated tokio task the moment it is
//! enqueued. `save_meta` has nothing to persist; readers in the same process
//! observe metadata through the shared map directly.

use crate::{EnqueueRequest, Envelope, JobQueue, JobRunner, QueueError, Timeouts, seed_meta};
use async_trait::async_trait;
use scriba_core::meta::{self, EnvelopeStatus, MetaMap};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Queued,
    Started,
    Finished,
    Failed,
}

/// Envelope owned by the in-process queue.
pub struct MemoryEnvelope {
    id: String,
    function: String,
    argv: Vec<serde_json::Value>,
    timeouts: Timeouts,
    meta: RwLock<MetaMap>,
    task: RwLock<TaskState>,
}

impl MemoryEnvelope {
    async fn mark(&self, state: TaskState) {
        *self.task.write().await = state;
    }
}

#[async_trait]
impl Envelope for MemoryEnvelope {
    fn id(&self) -> &str {
        &self.id
    }

    fn function(&self) -> &str {
        &self.function
    }

    fn argv(&self) -> &[serde_json::Value] {
        &self.argv
    }

    fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    async fn refresh(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn status(&self) -> EnvelopeStatus {
        // Terminal metadata wins over the raw task state, mirroring a worker
        // that marked the envelope failed before returning cleanly.
        let from_meta = meta::status_of(&*self.meta.read().await);
        if from_meta.is_terminal() {
            return from_meta;
        }
        match *self.task.read().await {
            TaskState::Queued => EnvelopeStatus::Queued,
            TaskState::Started => from_meta,
            TaskState::Finished => EnvelopeStatus::Completed,
            TaskState::Failed => EnvelopeStatus::Failed,
        }
    }

    async fn meta(&self) -> MetaMap {
        self.meta.read().await.clone()
    }

    async fn update_meta(&self, patch: MetaMap) -> Result<(), QueueError> {
        meta::apply_patch(&mut *self.meta.write().await, patch, chrono::Utc::now());
        Ok(())
    }

    async fn save_meta(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// In-process [`JobQueue`] executing envelopes on background tasks.
pub struct MemoryQueue {
    envelopes: Arc<RwLock<HashMap<String, Arc<MemoryEnvelope>>>>,
    runner: Arc<dyn JobRunner>,
}

impl MemoryQueue {
    /// Create a queue dispatching to `runner`.
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            envelopes: Arc::new(RwLock::new(HashMap::new())),
            runner,
        }
    }

    /// Test helper: wait until every envelope has settled or `timeout`
    /// elapses.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut running = 0usize;
            for envelope in self.envelopes.read().await.values() {
                if !envelope.status().await.is_terminal() {
                    running += 1;
                }
            }
            if running == 0 || tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Arc<dyn Envelope>, QueueError> {
        let envelope = Arc::new(MemoryEnvelope {
            id: Uuid::new_v4().to_string(),
            function: request.function,
            argv: request.argv,
            timeouts: request.timeouts,
            meta: RwLock::new(seed_meta(request.meta)),
            task: RwLock::new(TaskState::Queued),
        });
        self.envelopes
            .write()
            .await
            .insert(envelope.id.clone(), envelope.clone());

        let runner = self.runner.clone();
        let job = envelope.clone();
        tokio::spawn(async move {
            job.mark(TaskState::Started).await;
            let handle: Arc<dyn Envelope> = job.clone();
            let result = runner.run(handle).await;
            let mut patch = MetaMap::new();
            match &result {
                Ok(()) => {
                    let status = meta::status_of(&job.meta().await);
                    if !status.is_terminal() {
                        patch.insert(
                            meta::STATUS.into(),
                            EnvelopeStatus::Completed.as_str().into(),
                        );
                    }
                }
                Err(err) => {
                    patch.insert(meta::STATUS.into(), EnvelopeStatus::Failed.as_str().into());
                    let current = job.meta().await;
                    if !current.contains_key(meta::ERROR_MESSAGE) {
                        patch.insert(meta::ERROR_MESSAGE.into(), err.to_string().into());
                    }
                }
            }
            if !patch.is_empty() {
                let _ = job.update_meta(patch).await;
            }
            let settled = meta::status_of(&job.meta().await);
            job.mark(if settled == EnvelopeStatus::Failed {
                TaskState::Failed
            } else {
                TaskState::Finished
            })
            .await;
        });

        Ok(envelope)
    }

    async fn fetch(&self, id: &str) -> Result<Option<Arc<dyn Envelope>>, QueueError> {
        Ok(self.envelopes.read().await.get(id).map(|e| {
            let handle: Arc<dyn Envelope> = e.clone();
            handle
        }))
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut pending = 0usize;
        for envelope in self.envelopes.read().await.values() {
            if !envelope.status().await.is_terminal() {
                pending += 1;
            }
        }
        Ok(pending)
    }
}
