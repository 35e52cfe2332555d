// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! scriba-worker
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use scriba_catalog::{Catalog, CatalogError, JobPatch};
use scriba_config::ScribaConfig;
use scriba_core::meta::{self, EnvelopeStatus, MetaMap};
use scriba_core::{JobState, QualityProfile, TokenEvent};
use scriba_engine::adapter::AdapterSettings;
use scriba_engine::{DecodeOptions, EngineCache, EngineResult, TokenSink};
use scriba_queue::{BrokerQueue, Envelope, JobRunner, QueueError};
use scriba_store::{ArtifactStore, StoreError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Worker function name recorded on every transcription envelope.
pub const TRANSCRIBE_FUNCTION: &str = "transcribe_job";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the worker before they are flattened into the
/// envelope's terminal `failed` state.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Envelope argv did not carry valid job arguments.
    #[error("invalid job arguments: {0}")]
    InvalidArgs(String),

    /// Artifact download or upload failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Catalog read or transition failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Envelope metadata persistence failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The engine failed beyond its own recovery.
    #[error("engine failed: {0}")]
    Engine(String),

    /// The decode exceeded the configured job timeout.
    #[error("timeout")]
    Timeout,
}

// ---------------------------------------------------------------------------
// Job arguments
// ---------------------------------------------------------------------------

/// Arguments carried in the envelope's argv (one JSON object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobArgs {
    /// Artifact key of the uploaded audio.
    pub audio_key: String,
    /// Language hint, if any.
    pub language: Option<String>,
    /// Owning user.
    pub owner_id: Uuid,
    /// Quality tier the job was submitted with.
    pub quality_profile: QualityProfile,
}

impl JobArgs {
    /// Encode into the argv vector stored on the envelope.
    pub fn to_argv(&self) -> Result<Vec<serde_json::Value>, serde_json::Error> {
        Ok(vec![serde_json::to_value(self)?])
    }

    /// Decode from an envelope's argv.
    pub fn from_argv(argv: &[serde_json::Value]) -> Result<Self, WorkerError> {
        let first = argv
            .first()
            .ok_or_else(|| WorkerError::InvalidArgs("empty argv".into()))?;
        serde_json::from_value(first.clone())
            .map_err(|e| WorkerError::InvalidArgs(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Context & runner
// ---------------------------------------------------------------------------

/// Everything a worker needs to execute jobs. Cheap to clone.
#[derive(Clone)]
pub struct WorkerContext {
    /// Job catalog handle.
    pub catalog: Catalog,
    /// Artifact store.
    pub store: Arc<dyn ArtifactStore>,
    /// Process-wide engine adapter cache.
    pub engines: Arc<EngineCache>,
    /// Runtime configuration.
    pub config: Arc<ScribaConfig>,
}

/// [`JobRunner`] executing transcription envelopes; plugged into the
/// in-process queue and reused verbatim by the broker worker loop.
pub struct TranscribeRunner {
    ctx: WorkerContext,
}

impl TranscribeRunner {
    /// Wrap a context.
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl JobRunner for TranscribeRunner {
    async fn run(&self, envelope: Arc<dyn Envelope>) -> anyhow::Result<()> {
        match envelope.function() {
            TRANSCRIBE_FUNCTION => {
                transcribe_job(&self.ctx, envelope).await?;
            }
            // Exports are validated and queued here; delivery belongs to
            // the integration worker, so the envelope just settles.
            other => {
                info!(function = %other, envelope_id = %envelope.id(), "acknowledged envelope");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Token sink plumbing
// ---------------------------------------------------------------------------

enum SinkEvent {
    Token(TokenEvent),
    Debug { stage: String, message: String },
}

/// Bridges the blocking engine decode to the async envelope writer.
struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl TokenSink for ChannelSink {
    fn on_token(&mut self, token: TokenEvent) {
        let _ = self.tx.send(SinkEvent::Token(token));
    }

    fn on_debug(&mut self, stage: &str, message: &str) {
        let _ = self.tx.send(SinkEvent::Debug {
            stage: stage.to_string(),
            message: message.to_string(),
        });
    }
}

/// Applies token events to the envelope: `last_token`, monotone `progress`,
/// latest `segment`, and the accumulated `transcript_so_far`, persisted
/// after every token.
async fn forward_tokens(
    envelope: Arc<dyn Envelope>,
    mut rx: mpsc::UnboundedReceiver<SinkEvent>,
) {
    let mut transcript = String::new();
    let mut token_count: i64 = 0;
    while let Some(event) = rx.recv().await {
        match event {
            SinkEvent::Token(token) => {
                token_count += 1;
                if !transcript.is_empty() && !token.text.is_empty() {
                    transcript.push(' ');
                }
                transcript.push_str(&token.text);

                let mut patch = MetaMap::new();
                match serde_json::to_string(&token) {
                    Ok(serialized) => {
                        patch.insert(meta::LAST_TOKEN.into(), serialized.into());
                    }
                    Err(err) => {
                        warn!(error = %err, "token serialization failed");
                    }
                }
                patch.insert(meta::PROGRESS.into(), token_count.min(100).into());
                patch.insert(meta::SEGMENT.into(), (token.segment_index as i64).into());
                patch.insert(meta::TRANSCRIPT_SO_FAR.into(), transcript.clone().into());
                if envelope.update_meta(patch).await.is_err() {
                    break;
                }
                if let Err(err) = envelope.save_meta().await {
                    warn!(error = %err, "token meta persistence failed");
                }
            }
            SinkEvent::Debug { stage, message } => {
                tracing::debug!(stage = %stage, message = %message, "engine event");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The job
// ---------------------------------------------------------------------------

/// Execute one transcription envelope to its terminal state.
///
/// Always resolves the envelope to `completed` or `failed`; the returned
/// error mirrors what was recorded for the caller's logs.
pub async fn transcribe_job(
    ctx: &WorkerContext,
    envelope: Arc<dyn Envelope>,
) -> Result<(), WorkerError> {
    let args = match JobArgs::from_argv(envelope.argv()) {
        Ok(args) => args,
        Err(err) => {
            fail_envelope(ctx, &envelope, &err.to_string()).await;
            return Err(err);
        }
    };

    info!(
        envelope_id = %envelope.id(),
        audio_key = %args.audio_key,
        profile = %args.quality_profile,
        "transcription job started"
    );

    match run_transcription(ctx, &envelope, &args).await {
        Ok(result) => {
            info!(
                envelope_id = %envelope.id(),
                duration = ?result.duration,
                device = %result.device,
                "transcription job completed"
            );
            Ok(())
        }
        Err(err) => {
            error!(envelope_id = %envelope.id(), error = %err, "transcription job failed");
            fail_envelope(ctx, &envelope, &err.to_string()).await;
            Err(err)
        }
    }
}

/// Resolve the catalog row backing an envelope: by the seeded
/// `transcript_id` when present, by envelope id otherwise.
async fn resolve_job(
    ctx: &WorkerContext,
    envelope: &Arc<dyn Envelope>,
) -> Result<Option<scriba_core::Job>, CatalogError> {
    let snapshot = envelope.meta().await;
    if let Some(id) = snapshot
        .get(meta::TRANSCRIPT_ID)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
    {
        if let Some(job) = ctx.catalog.fetch_job_unscoped(id).await? {
            return Ok(Some(job));
        }
    }
    ctx.catalog.fetch_job_by_envelope(envelope.id()).await
}

async fn run_transcription(
    ctx: &WorkerContext,
    envelope: &Arc<dyn Envelope>,
    args: &JobArgs,
) -> Result<EngineResult, WorkerError> {
    ctx.store.ensure_buckets().await?;

    // Surface the state change before the (slow) download and decode.
    let mut patch = MetaMap::new();
    patch.insert(
        meta::STATUS.into(),
        EnvelopeStatus::Transcribing.as_str().into(),
    );
    patch.insert(
        meta::QUALITY_PROFILE.into(),
        args.quality_profile.as_str().into(),
    );
    envelope.update_meta(patch).await?;
    envelope.save_meta().await?;

    if let Some(job) = resolve_job(ctx, envelope).await? {
        ctx.catalog
            .transition(job.id, JobState::Running, JobPatch::default())
            .await?;
    }

    // Scoped temp dir: cleaned up on every exit path.
    let workdir = tempfile::tempdir().map_err(StoreError::Io)?;
    let filename = Path::new(&args.audio_key)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio.bin".to_string());
    let audio_path = workdir.path().join(filename);
    ctx.store.download_audio(&args.audio_key, &audio_path).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_tokens(envelope.clone(), rx));

    let adapter = ctx.engines.get_or_create(AdapterSettings {
        variant: match ctx.config.engine_variant {
            scriba_config::EngineVariantChoice::Primary => scriba_engine::EngineVariant::Primary,
            scriba_config::EngineVariantChoice::Fallback => scriba_engine::EngineVariant::Fallback,
            scriba_config::EngineVariantChoice::Stub => scriba_engine::EngineVariant::Stub,
        },
        model_size: ctx.config.model_size.clone(),
        device: ctx.config.engine_device,
        force_accelerator: ctx.config.engine_force_accelerator,
        vad: ctx.config.engine_vad,
    });

    let precision = args.quality_profile.precision();
    let language = args.language.clone();
    let decode_path = audio_path.clone();
    let decode = tokio::task::spawn_blocking(move || {
        let mut sink = ChannelSink { tx };
        adapter.transcribe(
            &decode_path,
            language.as_deref(),
            None,
            DecodeOptions::new(),
            precision,
            &mut sink,
        )
    });

    let job_timeout = envelope
        .timeouts()
        .job_timeout
        .or_else(|| (ctx.config.job_timeout > 0).then(|| Duration::from_secs(ctx.config.job_timeout)));
    let joined = match job_timeout {
        Some(limit) => tokio::time::timeout(limit, decode)
            .await
            .map_err(|_| WorkerError::Timeout)?,
        None => decode.await,
    };
    let result = joined
        .map_err(|e| WorkerError::Engine(e.to_string()))?
        .map_err(|e| WorkerError::Engine(e.to_string()))?;

    // Let the forwarder drain any tokens still in flight.
    forwarder.await.ok();

    let transcript_key = format!("{}.txt", args.audio_key);
    ctx.store
        .upload_transcript(&result.text, &transcript_key)
        .await?;

    let mut patch = MetaMap::new();
    patch.insert(
        meta::STATUS.into(),
        EnvelopeStatus::Completed.as_str().into(),
    );
    patch.insert(meta::TRANSCRIPT_KEY.into(), transcript_key.clone().into());
    patch.insert(meta::PROGRESS.into(), serde_json::json!(100));
    patch.insert(meta::SEGMENT.into(), (result.segments.len() as i64).into());
    if let Some(language) = &result.language {
        patch.insert(meta::LANGUAGE.into(), language.clone().into());
    }
    if let Some(duration) = result.duration {
        patch.insert(meta::DURATION.into(), duration.into());
    }
    match serde_json::to_value(&result.segments) {
        Ok(segments) => {
            patch.insert(meta::SEGMENTS_PARTIAL.into(), segments);
        }
        Err(err) => warn!(error = %err, "segment serialization failed"),
    }
    envelope.update_meta(patch).await?;
    envelope.save_meta().await?;

    if let Some(job) = resolve_job(ctx, envelope).await? {
        let completed = ctx
            .catalog
            .transition(
                job.id,
                JobState::Completed,
                JobPatch {
                    transcript_key: Some(transcript_key),
                    segments: Some(result.segments.clone()),
                    duration_seconds: result.duration,
                    language: result.language.clone(),
                    error_message: None,
                },
            )
            .await?;
        if let Some(duration) = completed.duration_seconds {
            let month = Utc::now().format("%Y-%m").to_string();
            if let Err(err) = ctx.catalog.record_usage(job.owner_id, &month, duration).await {
                warn!(error = %err, "usage metering failed");
            }
        }
    }

    Ok(result)
}

/// Resolve the envelope (and catalog row, when present) to `failed`.
async fn fail_envelope(ctx: &WorkerContext, envelope: &Arc<dyn Envelope>, message: &str) {
    let mut patch = MetaMap::new();
    patch.insert(meta::STATUS.into(), EnvelopeStatus::Failed.as_str().into());
    patch.insert(meta::ERROR_MESSAGE.into(), message.into());
    if envelope.update_meta(patch).await.is_ok() {
        if let Err(err) = envelope.save_meta().await {
            warn!(error = %err, "failure meta persistence failed");
        }
    }

    match resolve_job(ctx, envelope).await {
        Ok(Some(job)) if !job.state.is_terminal() => {
            let result = ctx
                .catalog
                .transition(
                    job.id,
                    JobState::Failed,
                    JobPatch {
                        error_message: Some(message.to_string()),
                        ..JobPatch::default()
                    },
                )
                .await;
            if let Err(err) = result {
                warn!(error = %err, "failed-state transition rejected");
            }
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "catalog lookup failed while failing job"),
    }
}

// ---------------------------------------------------------------------------
// Broker worker loop
// ---------------------------------------------------------------------------

/// Pop envelope ids off the broker list and execute them until `shutdown`
/// flips to `true`. Run one of these per worker process.
pub async fn run_broker_worker(
    ctx: WorkerContext,
    queue: Arc<BrokerQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    use scriba_queue::JobQueue;
    info!("broker worker loop started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            popped = queue.pop_pending(Duration::from_secs(1)) => {
                match popped {
                    Ok(Some(id)) => match queue.fetch(&id).await {
                        Ok(Some(envelope)) => {
                            let _ = transcribe_job(&ctx, envelope).await;
                        }
                        Ok(None) => warn!(envelope_id = %id, "popped envelope vanished"),
                        Err(err) => error!(error = %err, "envelope fetch failed"),
                    },
                    Ok(None) => {}
                    Err(err) => {
                        error!(error = %err, "broker pop failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
    info!("broker worker loop stopped");
}
