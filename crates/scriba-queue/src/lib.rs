// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! scriba-queue
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Broker-backed queue over redis.
pub mod broker;
/// In-process fallback queue.
pub mod memory;

use async_trait::async_trait;
use scriba_config::{QueueBackend, ScribaConfig};
use scriba_core::meta::{EnvelopeStatus, MetaMap};
use std::sync::Arc;
use std::time::Duration;

pub use broker::BrokerQueue;
pub use memory::MemoryQueue;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The broker backend was requested but could not be reached.
    #[error("broker unreachable: {reason}")]
    BrokerUnavailable {
        /// Connection failure detail.
        reason: String,
    },

    /// Broker command failure after a connection was established.
    #[error("broker command failed")]
    Broker(#[from] redis::RedisError),

    /// Envelope payload could not be encoded or decoded.
    #[error("envelope serialization failed")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Optional execution/retention timeouts recorded on the envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    /// Hard cap on the decode; elapse fails the job.
    pub job_timeout: Option<Duration>,
    /// How long a finished envelope is retained.
    pub result_ttl: Option<Duration>,
    /// How long a failed envelope is retained.
    pub failure_ttl: Option<Duration>,
}

/// What to enqueue: a function name, its arguments, and seeded metadata.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    /// Worker function to invoke (e.g. `transcribe_job`).
    pub function: String,
    /// Positional JSON arguments.
    pub argv: Vec<serde_json::Value>,
    /// Metadata seeded by the producer (owner id, quality profile, …).
    pub meta: MetaMap,
    /// Execution/retention timeouts.
    pub timeouts: Timeouts,
}

/// The volatile queue-side record shared between producer and worker.
///
/// Metadata writes come only from the worker that holds the envelope;
/// stream subscribers read concurrently through [`JobQueue::fetch`].
#[async_trait]
pub trait Envelope: Send + Sync {
    /// Envelope id (opaque string).
    fn id(&self) -> &str;

    /// Worker function name.
    fn function(&self) -> &str;

    /// Positional arguments.
    fn argv(&self) -> &[serde_json::Value];

    /// Execution timeouts recorded at enqueue time.
    fn timeouts(&self) -> Timeouts;

    /// Re-read backend state so subsequent [`meta`](Self::meta) calls
    /// observe foreign writes. A no-op for the in-process backend.
    async fn refresh(&self) -> Result<(), QueueError>;

    /// Coarse lifecycle status.
    async fn status(&self) -> EnvelopeStatus;

    /// Snapshot of the metadata map.
    async fn meta(&self) -> MetaMap;

    /// Apply a patch to the local metadata (monotone `progress`, stamped
    /// `updated_at`). Call [`save_meta`](Self::save_meta) to publish.
    async fn update_meta(&self, patch: MetaMap) -> Result<(), QueueError>;

    /// Persist local metadata so other processes observe it. A no-op for
    /// the in-process backend.
    async fn save_meta(&self) -> Result<(), QueueError>;
}

/// Enqueue/fetch contract implemented by both backends.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create an envelope, seed its metadata, and make it runnable.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Arc<dyn Envelope>, QueueError>;

    /// Look up an envelope by id.
    async fn fetch(&self, id: &str) -> Result<Option<Arc<dyn Envelope>>, QueueError>;

    /// Number of envelopes not yet finished.
    async fn len(&self) -> Result<usize, QueueError>;
}

/// Seeds the initial metadata every backend stamps at enqueue time.
pub(crate) fn seed_meta(user_meta: MetaMap) -> MetaMap {
    use scriba_core::meta;
    let now = chrono::Utc::now().to_rfc3339();
    let mut map = MetaMap::new();
    map.insert(meta::STATUS.into(), EnvelopeStatus::Queued.as_str().into());
    map.insert(meta::PROGRESS.into(), serde_json::json!(0));
    map.insert(meta::SEGMENT.into(), serde_json::json!(0));
    map.insert(meta::QUEUED_AT.into(), now.clone().into());
    map.insert(meta::UPDATED_AT.into(), now.into());
    for (key, value) in user_meta {
        map.insert(key, value);
    }
    map
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Work dispatched to in-process envelopes.
///
/// The broker backend never calls this; its envelopes are executed by a
/// separate worker loop popping ids off the broker list.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Execute the envelope to completion. Errors mark it failed.
    async fn run(&self, envelope: Arc<dyn Envelope>) -> anyhow::Result<()>;
}

/// Build the queue selected by configuration.
///
/// * `memory`: always the in-process queue.
/// * `broker`: ping the broker, where unreachable is a hard error.
/// * `auto`: try the broker once, fall back to memory for the process
///   lifetime (logged once).
pub async fn select_queue(
    config: &ScribaConfig,
    runner: Arc<dyn JobRunner>,
) -> Result<Arc<dyn JobQueue>, QueueError> {
    match config.queue_backend {
        QueueBackend::Memory => Ok(Arc::new(MemoryQueue::new(runner))),
        QueueBackend::Broker => {
            let queue = BrokerQueue::connect(&config.broker_url).await?;
            Ok(Arc::new(queue))
        }
        QueueBackend::Auto => match BrokerQueue::connect(&config.broker_url).await {
            Ok(queue) => Ok(Arc::new(queue)),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "broker unreachable, using in-process queue for this process"
                );
                Ok(Arc::new(MemoryQueue::new(runner)))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriba_core::meta;

    #[test]
    fn seed_meta_stamps_defaults_then_user_keys() {
        let mut user = MetaMap::new();
        user.insert(meta::USER_ID.into(), "u-1".into());
        user.insert(meta::PROGRESS.into(), serde_json::json!(7));

        let seeded = seed_meta(user);
        assert_eq!(
            seeded.get(meta::STATUS).and_then(|v| v.as_str()),
            Some("queued")
        );
        // User-seeded keys overwrite the defaults.
        assert_eq!(seeded.get(meta::PROGRESS).and_then(|v| v.as_i64()), Some(7));
        assert_eq!(
            seeded.get(meta::USER_ID).and_then(|v| v.as_str()),
            Some("u-1")
        );
        assert!(seeded.contains_key(meta::QUEUED_AT));
        assert!(seeded.contains_key(meta::UPDATED_AT));
    }
}
