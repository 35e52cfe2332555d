// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broker-backed queue over redis.
//!
//! Envelopes live as hashes under `scriba:job:{id}` with the pending ids in
//! the `scriba:queue` list. `save_meta` persists the metadata JSON so worker
//! processes and stream subscribers in other processes observe updates;
//! `refresh` re-reads it.

use crate::{EnqueueRequest, Envelope, JobQueue, QueueError, Timeouts, seed_meta};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use scriba_core::meta::{self, EnvelopeStatus, MetaMap};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

const JOB_KEY_PREFIX: &str = "scriba:job:";
const PENDING_LIST: &str = "scriba:queue";

fn job_key(id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{id}")
}

#[derive(serde::Serialize, serde::Deserialize, Default)]
struct StoredTimeouts {
    job_timeout_secs: Option<u64>,
    result_ttl_secs: Option<u64>,
    failure_ttl_secs: Option<u64>,
}

impl From<Timeouts> for StoredTimeouts {
    fn from(t: Timeouts) -> Self {
        Self {
            job_timeout_secs: t.job_timeout.map(|d| d.as_secs()),
            result_ttl_secs: t.result_ttl.map(|d| d.as_secs()),
            failure_ttl_secs: t.failure_ttl.map(|d| d.as_secs()),
        }
    }
}

impl From<StoredTimeouts> for Timeouts {
    fn from(t: StoredTimeouts) -> Self {
        Self {
            job_timeout: t.job_timeout_secs.map(Duration::from_secs),
            result_ttl: t.result_ttl_secs.map(Duration::from_secs),
            failure_ttl: t.failure_ttl_secs.map(Duration::from_secs),
        }
    }
}

/// Envelope backed by a redis hash.
pub struct BrokerEnvelope {
    id: String,
    function: String,
    argv: Vec<serde_json::Value>,
    timeouts: Timeouts,
    conn: ConnectionManager,
    cached_meta: RwLock<MetaMap>,
}

#[async_trait]
impl Envelope for BrokerEnvelope {
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
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(job_key(&self.id), "meta").await?;
        if let Some(raw) = raw {
            *self.cached_meta.write().await = serde_json::from_str(&raw)?;
        }
        Ok(())
    }

    async fn status(&self) -> EnvelopeStatus {
        meta::status_of(&*self.cached_meta.read().await)
    }

    async fn meta(&self) -> MetaMap {
        self.cached_meta.read().await.clone()
    }

    async fn update_meta(&self, patch: MetaMap) -> Result<(), QueueError> {
        meta::apply_patch(&mut *self.cached_meta.write().await, patch, chrono::Utc::now());
        Ok(())
    }

    async fn save_meta(&self) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&*self.cached_meta.read().await)?;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(job_key(&self.id), "meta", serialized).await?;
        Ok(())
    }
}

/// Redis-backed [`JobQueue`].
pub struct BrokerQueue {
    conn: ConnectionManager,
}

impl BrokerQueue {
    /// Connect and ping the broker; any failure is `BrokerUnavailable`.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(|e| QueueError::BrokerUnavailable {
            reason: e.to_string(),
        })?;
        let mut conn = client.get_connection_manager().await.map_err(|e| {
            QueueError::BrokerUnavailable {
                reason: e.to_string(),
            }
        })?;
        let pong: String =
            redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::BrokerUnavailable {
                    reason: e.to_string(),
                })?;
        if pong != "PONG" {
            return Err(QueueError::BrokerUnavailable {
                reason: format!("unexpected ping reply: {pong}"),
            });
        }
        Ok(Self { conn })
    }

    /// Block up to `timeout` for the next pending envelope id.
    ///
    /// Worker processes call this in a loop and execute the fetched
    /// envelope; a `None` means the timeout elapsed with an empty list.
    pub async fn pop_pending(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .blpop(PENDING_LIST, timeout.as_secs_f64())
            .await?;
        Ok(popped.map(|(_, id)| id))
    }
}

#[async_trait]
impl JobQueue for BrokerQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Arc<dyn Envelope>, QueueError> {
        let id = Uuid::new_v4().to_string();
        let meta_map = seed_meta(request.meta);
        let serialized_meta = serde_json::to_string(&meta_map)?;
        let serialized_argv = serde_json::to_string(&request.argv)?;
        let serialized_timeouts = serde_json::to_string(&StoredTimeouts::from(request.timeouts))?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                job_key(&id),
                &[
                    ("function", request.function.as_str()),
                    ("argv", serialized_argv.as_str()),
                    ("meta", serialized_meta.as_str()),
                    ("timeouts", serialized_timeouts.as_str()),
                ],
            )
            .await?;
        let _: () = conn.rpush(PENDING_LIST, &id).await?;

        Ok(Arc::new(BrokerEnvelope {
            id,
            function: request.function,
            argv: request.argv,
            timeouts: request.timeouts,
            conn: self.conn.clone(),
            cached_meta: RwLock::new(meta_map),
        }))
    }

    async fn fetch(&self, id: &str) -> Result<Option<Arc<dyn Envelope>>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let function = fields.get("function").cloned().unwrap_or_default();
        let argv: Vec<serde_json::Value> = fields
            .get("argv")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or_default();
        let meta_map: MetaMap = fields
            .get("meta")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or_default();
        let timeouts: Timeouts = fields
            .get("timeouts")
            .map(|raw| serde_json::from_str::<StoredTimeouts>(raw))
            .transpose()?
            .unwrap_or_default()
            .into();

        Ok(Some(Arc::new(BrokerEnvelope {
            id: id.to_string(),
            function,
            argv,
            timeouts,
            conn: self.conn.clone(),
            cached_meta: RwLock::new(meta_map),
        })))
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(PENDING_LIST).await?;
        Ok(len)
    }
}
