// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! scriba-live
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Chunk normalization to canonical PCM.
pub mod audio;
/// Hypothesis deduplication and promotion.
pub mod promote;
/// Rolling PCM ring and the append-only session WAV.
pub mod ring;

use chrono::Utc;
use promote::SegmentAccumulator;
use ring::{PcmRing, RingError};
use scriba_catalog::{Catalog, CatalogError};
use scriba_config::ScribaConfig;
use scriba_core::{Job, JobState, QualityProfile, Segment};
use scriba_engine::adapter::AdapterSettings;
use scriba_engine::{DecodeOptions, EngineCache, EngineVariant, NullSink};
use scriba_store::{ArtifactStore, StoreError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by live-session operations.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// Unknown session id, or a session owned by someone else.
    #[error("live session not found")]
    UnknownSession,

    /// The uploaded chunk carried no bytes.
    #[error("chunk is empty")]
    EmptyChunk,

    /// The session WAV is damaged; the session cannot continue.
    #[error("session audio is corrupt: {0}")]
    CorruptAudio(String),

    /// Finalize called before any audio was captured.
    #[error("no audio captured in this session")]
    NoAudio,

    /// The engine failed beyond its own recovery.
    #[error("live decode failed: {0}")]
    Engine(String),

    /// Artifact persistence failed during finalize.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Catalog write failed during finalize.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Session directory management failed.
    #[error("session io failure")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for live sessions.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Ring length in seconds.
    pub window_seconds: f64,
    /// Re-decode overlap in seconds.
    pub overlap_seconds: f64,
    /// Repeated-hypothesis window in seconds.
    pub repeat_window_seconds: f64,
    /// Repeats tolerated inside the window before dropping.
    pub repeat_max_duplicates: u32,
    /// Directory holding per-session audio.
    pub sessions_root: PathBuf,
    /// Inactivity period after which a session is purged.
    pub session_ttl: Duration,
}

impl LiveConfig {
    /// Derive from the service configuration.
    #[must_use]
    pub fn from_config(config: &ScribaConfig) -> Self {
        Self {
            window_seconds: config.live_window_seconds,
            overlap_seconds: config.live_window_overlap_seconds.max(0.0),
            repeat_window_seconds: config.live_repeat_window_seconds.max(0.0),
            repeat_max_duplicates: config.live_repeat_max_duplicates,
            sessions_root: PathBuf::from(&config.live_sessions_root),
            session_ttl: Duration::from_secs(3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

struct SessionState {
    language: Option<String>,
    beam_size: Option<u32>,
    chunk_count: u64,
    dropped_chunks: u64,
    ring: PcmRing,
    accumulator: SegmentAccumulator,
    last_text: String,
    last_duration: Option<f64>,
    last_runtime: Option<f64>,
    last_activity: Instant,
}

/// One live transcription session. All mutation serializes through the
/// internal mutex.
pub struct LiveSession {
    /// Session id handed to the client.
    pub id: String,
    /// Owning user.
    pub owner_id: Uuid,
    directory: PathBuf,
    audio_path: PathBuf,
    state: Mutex<SessionState>,
}

/// What one chunk did to the session.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    /// Session id.
    pub session_id: String,
    /// Full accumulated transcript text.
    pub text: String,
    /// Highest time covered so far, in seconds.
    pub duration: Option<f64>,
    /// Wall-clock seconds of the last decode.
    pub runtime_seconds: Option<f64>,
    /// Chunks received, including dropped ones.
    pub chunk_count: u64,
    /// Chunks that could not be decoded.
    pub dropped_chunks: u64,
    /// Current language (detected or requested).
    pub language: Option<String>,
    /// Stable segment list.
    pub segments: Vec<Segment>,
    /// Segments promoted by this chunk.
    pub new_segments: Vec<Segment>,
    /// Text of the newly promoted segments, when any.
    pub new_text: Option<String>,
}

/// What finalize produced.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    /// The Completed catalog row.
    pub job: Job,
    /// Full transcript text.
    pub text: String,
    /// Wall-clock seconds of the final decode.
    pub runtime_seconds: f64,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Process-wide table of live sessions. Owned by the composition root;
/// never shared across worker processes.
pub struct LiveSessionManager {
    live: LiveConfig,
    config: Arc<ScribaConfig>,
    catalog: Catalog,
    store: Arc<dyn ArtifactStore>,
    engines: Arc<EngineCache>,
    sessions: RwLock<HashMap<String, Arc<LiveSession>>>,
}

impl LiveSessionManager {
    /// Create an empty manager.
    pub fn new(
        live: LiveConfig,
        config: Arc<ScribaConfig>,
        catalog: Catalog,
        store: Arc<dyn ArtifactStore>,
        engines: Arc<EngineCache>,
    ) -> Self {
        Self {
            live,
            config,
            catalog,
            store,
            engines,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session for `owner`.
    pub async fn create_session(
        &self,
        owner: Uuid,
        language: Option<String>,
        beam_size: Option<u32>,
    ) -> Result<Arc<LiveSession>, LiveError> {
        self.purge_expired().await;

        let id = Uuid::new_v4().simple().to_string();
        let directory = self.live.sessions_root.join(&id);
        tokio::fs::create_dir_all(&directory).await?;

        let session = Arc::new(LiveSession {
            id: id.clone(),
            owner_id: owner,
            audio_path: directory.join("stream.wav"),
            directory,
            state: Mutex::new(SessionState {
                language,
                beam_size,
                chunk_count: 0,
                dropped_chunks: 0,
                ring: PcmRing::new(self.live.window_seconds),
                accumulator: SegmentAccumulator::new(
                    self.live.repeat_window_seconds,
                    self.live.repeat_max_duplicates,
                ),
                last_text: String::new(),
                last_duration: None,
                last_runtime: None,
                last_activity: Instant::now(),
            }),
        });
        self.sessions.write().await.insert(id, session.clone());
        Ok(session)
    }

    /// Number of open sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn session(&self, id: &str, owner: Uuid) -> Result<Arc<LiveSession>, LiveError> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            // Cross-owner access reads as not-found.
            Some(session) if session.owner_id == owner => Ok(session.clone()),
            _ => Err(LiveError::UnknownSession),
        }
    }

    /// Feed one audio chunk into the session.
    pub async fn push_chunk(
        &self,
        id: &str,
        owner: Uuid,
        bytes: Vec<u8>,
        filename: Option<&str>,
    ) -> Result<ChunkOutcome, LiveError> {
        self.purge_expired().await;
        let session = self.session(id, owner).await?;
        if bytes.is_empty() {
            return Err(LiveError::EmptyChunk);
        }

        let mut state = session.state.lock().await;
        state.last_activity = Instant::now();

        let hint = filename
            .and_then(|f| std::path::Path::new(f).extension())
            .map(|e| e.to_string_lossy().into_owned());
        let decoded = tokio::task::spawn_blocking(move || {
            audio::decode_chunk(bytes, hint.as_deref())
        })
        .await
        .map_err(|e| LiveError::Engine(e.to_string()))?;

        let pcm = match decoded {
            Ok(pcm) if !pcm.is_empty() => pcm,
            Ok(_) => return Ok(self.dropped(&session, &mut state)),
            Err(err) => {
                warn!(session_id = %session.id, reason = %err.reason, "undecodable live chunk dropped");
                return Ok(self.dropped(&session, &mut state));
            }
        };

        match ring::append_session_audio(&session.audio_path, &pcm).await {
            Ok(()) => {}
            Err(RingError::CorruptHeader) => {
                return Err(LiveError::CorruptAudio("corrupt wav header".into()));
            }
            Err(RingError::Io(err)) => return Err(LiveError::Io(err)),
            Err(err) => return Err(LiveError::CorruptAudio(err.to_string())),
        }
        state.ring.append(&pcm);

        let window_start =
            (state.accumulator.last_t_end() - self.live.overlap_seconds).max(0.0);
        let window_path = session.directory.join("window.wav");
        let (window_offset, window_end) =
            match state.ring.export_window(window_start, &window_path) {
                Ok(bounds) => bounds,
                Err(RingError::EmptyWindow) => return Ok(self.dropped(&session, &mut state)),
                Err(err) => return Err(LiveError::CorruptAudio(err.to_string())),
            };

        let adapter = self.engines.get_or_create(self.adapter_settings());
        let language = state.language.clone();
        let beam_size = state.beam_size;
        let decode_path = window_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            adapter.transcribe(
                &decode_path,
                language.as_deref(),
                beam_size,
                DecodeOptions::new(),
                QualityProfile::Balanced.precision(),
                &mut NullSink,
            )
        })
        .await
        .map_err(|e| LiveError::Engine(e.to_string()))?
        .map_err(|e| LiveError::Engine(e.to_string()));
        let _ = tokio::fs::remove_file(&window_path).await;
        let result = result?;

        state.chunk_count += 1;
        let promoted = state.accumulator.offer(&result.segments, window_offset);
        let new_text = if promoted.is_empty() {
            None
        } else {
            Some(
                promoted
                    .iter()
                    .map(|s| s.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        };
        if new_text.is_some() {
            state.last_text = state
                .accumulator
                .segments()
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
        }
        state.last_duration = Some(
            state
                .last_duration
                .unwrap_or(0.0)
                .max(window_end)
                .max(state.accumulator.last_t_end()),
        );
        state.last_runtime = Some(result.runtime_seconds);
        if result.language.is_some() {
            state.language = result.language.clone();
        }
        state.last_activity = Instant::now();

        Ok(ChunkOutcome {
            session_id: session.id.clone(),
            text: state.last_text.clone(),
            duration: state.last_duration,
            runtime_seconds: state.last_runtime,
            chunk_count: state.chunk_count,
            dropped_chunks: state.dropped_chunks,
            language: state.language.clone(),
            segments: state.accumulator.segments().to_vec(),
            new_segments: promoted,
            new_text,
        })
    }

    fn dropped(&self, session: &LiveSession, state: &mut SessionState) -> ChunkOutcome {
        state.chunk_count += 1;
        state.dropped_chunks += 1;
        state.last_activity = Instant::now();
        ChunkOutcome {
            session_id: session.id.clone(),
            text: state.last_text.clone(),
            duration: state.last_duration,
            runtime_seconds: state.last_runtime,
            chunk_count: state.chunk_count,
            dropped_chunks: state.dropped_chunks,
            language: state.language.clone(),
            segments: state.accumulator.segments().to_vec(),
            new_segments: Vec::new(),
            new_text: None,
        }
    }

    /// Decode the full accumulated audio at full quality, persist the
    /// artifacts and a Completed catalog row, and destroy the session.
    pub async fn finalize(
        &self,
        id: &str,
        owner: Uuid,
        title: Option<String>,
    ) -> Result<FinalizeOutcome, LiveError> {
        let session = self.session(id, owner).await?;
        let mut state = session.state.lock().await;
        state.last_activity = Instant::now();

        if !tokio::fs::try_exists(&session.audio_path).await? {
            return Err(LiveError::NoAudio);
        }

        let adapter = self.engines.get_or_create(self.adapter_settings());
        let language = state.language.clone();
        let beam_size = state.beam_size;
        let audio_path = session.audio_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            adapter.transcribe(
                &audio_path,
                language.as_deref(),
                beam_size,
                DecodeOptions::new(),
                QualityProfile::Precise.precision(),
                &mut NullSink,
            )
        })
        .await
        .map_err(|e| LiveError::Engine(e.to_string()))?
        .map_err(|e| LiveError::Engine(e.to_string()))?;

        self.store.ensure_buckets().await?;
        let audio_key = format!("{owner}/live-{}.wav", session.id);
        let wav_bytes = tokio::fs::read(&session.audio_path).await?;
        self.store
            .upload_audio(wav_bytes.into(), &audio_key)
            .await?;
        let transcript_key = format!("{audio_key}.txt");
        self.store
            .upload_transcript(&result.text, &transcript_key)
            .await?;

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            owner_id: owner,
            envelope_id: format!("live-{}", session.id),
            state: JobState::Completed,
            quality_profile: QualityProfile::Precise,
            language: result.language.clone(),
            title,
            tags: vec!["live".into()],
            audio_key,
            transcript_key: Some(transcript_key),
            segments: result.segments.clone(),
            duration_seconds: result.duration,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        };
        self.catalog.insert_job(&job).await?;
        if let Some(duration) = job.duration_seconds {
            let month = now.format("%Y-%m").to_string();
            if let Err(err) = self.catalog.record_usage(owner, &month, duration).await {
                warn!(error = %err, "usage metering failed for live session");
            }
        }

        drop(state);
        self.remove_session(&session).await;
        info!(session_id = %session.id, job_id = %job.id, "live session finalized");

        Ok(FinalizeOutcome {
            job,
            text: result.text,
            runtime_seconds: result.runtime_seconds,
        })
    }

    /// Destroy a session without persisting anything.
    pub async fn discard(&self, id: &str, owner: Uuid) -> Result<(), LiveError> {
        let session = self.session(id, owner).await?;
        self.remove_session(&session).await;
        Ok(())
    }

    async fn remove_session(&self, session: &LiveSession) {
        self.sessions.write().await.remove(&session.id);
        if let Err(err) = tokio::fs::remove_dir_all(&session.directory).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id = %session.id, error = %err, "session directory cleanup failed");
            }
        }
    }

    /// Purge sessions idle past the TTL. Called by every live request.
    pub async fn purge_expired(&self) {
        let mut expired = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for session in sessions.values() {
                // A locked session is mid-request, hence not idle.
                if let Ok(state) = session.state.try_lock() {
                    if state.last_activity.elapsed() > self.live.session_ttl {
                        expired.push(session.clone());
                    }
                }
            }
        }
        for session in expired {
            info!(session_id = %session.id, "purging expired live session");
            self.remove_session(&session).await;
        }
    }

    fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            variant: match self.config.engine_variant {
                scriba_config::EngineVariantChoice::Primary => EngineVariant::Primary,
                scriba_config::EngineVariantChoice::Fallback => EngineVariant::Fallback,
                scriba_config::EngineVariantChoice::Stub => EngineVariant::Stub,
            },
            model_size: self.config.model_size.clone(),
            device: self.config.engine_device,
            force_accelerator: self.config.engine_force_accelerator,
            vad: self.config.engine_vad,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriba_engine::StubFactory;
    use scriba_store::MemoryStore;

    async fn manager(root: &std::path::Path, ttl: Duration) -> LiveSessionManager {
        let mut config = ScribaConfig::default();
        config.engine_variant = scriba_config::EngineVariantChoice::Stub;
        let live = LiveConfig {
            window_seconds: 5.0,
            overlap_seconds: 1.0,
            repeat_window_seconds: 2.0,
            repeat_max_duplicates: 3,
            sessions_root: root.to_path_buf(),
            session_ttl: ttl,
        };
        LiveSessionManager::new(
            live,
            Arc::new(config),
            Catalog::connect("sqlite::memory:").await.unwrap(),
            Arc::new(MemoryStore::new()),
            Arc::new(EngineCache::new(Arc::new(StubFactory))),
        )
    }

    fn wav_chunk(seconds: f64) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            let frames = (16_000.0 * seconds) as usize;
            for i in 0..frames {
                let sample = if i % 2 == 0 { 2000i16 } else { -2000i16 };
                writer.write_sample(sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn overlapping_chunks_deduplicate_hypotheses() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Duration::from_secs(3600)).await;
        let owner = Uuid::new_v4();
        let session = manager
            .create_session(owner, Some("es".into()), None)
            .await
            .unwrap();

        let first = manager
            .push_chunk(&session.id, owner, wav_chunk(0.5), Some("a.wav"))
            .await
            .unwrap();
        assert_eq!(first.chunk_count, 1);
        assert_eq!(first.dropped_chunks, 0);
        assert!(!first.new_segments.is_empty());

        let second = manager
            .push_chunk(&session.id, owner, wav_chunk(0.5), Some("b.wav"))
            .await
            .unwrap();
        assert_eq!(second.chunk_count, 2);

        // The overlapped re-decode repeats the first window's hypothesis;
        // the stable list must not contain duplicates at the same offset.
        let texts: Vec<&str> = second.segments.iter().map(|s| s.text.as_str()).collect();
        let mut deduped = texts.clone();
        deduped.dedup();
        assert_eq!(texts, deduped, "adjacent duplicates leaked: {texts:?}");

        // last_t_end is non-decreasing and the timeline reached 1.0 s.
        assert!(second.duration.unwrap() >= 1.0 - 1e-6);
    }

    #[tokio::test]
    async fn undecodable_chunk_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Duration::from_secs(3600)).await;
        let owner = Uuid::new_v4();
        let session = manager.create_session(owner, None, None).await.unwrap();

        let outcome = manager
            .push_chunk(&session.id, owner, b"not audio at all".to_vec(), Some("x.webm"))
            .await
            .unwrap();
        assert_eq!(outcome.chunk_count, 1);
        assert_eq!(outcome.dropped_chunks, 1);
        assert!(outcome.segments.is_empty());
    }

    #[tokio::test]
    async fn empty_chunk_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Duration::from_secs(3600)).await;
        let owner = Uuid::new_v4();
        let session = manager.create_session(owner, None, None).await.unwrap();
        let err = manager
            .push_chunk(&session.id, owner, Vec::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::EmptyChunk));
    }

    #[tokio::test]
    async fn cross_owner_access_reads_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Duration::from_secs(3600)).await;
        let owner = Uuid::new_v4();
        let session = manager.create_session(owner, None, None).await.unwrap();

        let stranger = Uuid::new_v4();
        let err = manager
            .push_chunk(&session.id, stranger, wav_chunk(0.2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::UnknownSession));
    }

    #[tokio::test]
    async fn finalize_persists_job_and_destroys_session() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Duration::from_secs(3600)).await;
        let owner = Uuid::new_v4();
        let session = manager.create_session(owner, Some("es".into()), None).await.unwrap();

        manager
            .push_chunk(&session.id, owner, wav_chunk(1.0), Some("a.wav"))
            .await
            .unwrap();
        manager
            .push_chunk(&session.id, owner, wav_chunk(1.0), Some("b.wav"))
            .await
            .unwrap();

        let outcome = manager
            .finalize(&session.id, owner, Some("en vivo".into()))
            .await
            .unwrap();
        let job = &outcome.job;
        assert_eq!(job.state, JobState::Completed);
        assert!(job.invariants_hold());
        assert!((job.duration_seconds.unwrap() - 2.0).abs() < 0.05);
        assert!(!job.segments.is_empty());
        assert!(!outcome.text.is_empty());

        // Transcript blob exists and the catalog row is owner-readable.
        let stored = manager
            .store
            .download_transcript(job.transcript_key.as_deref().unwrap())
            .await
            .unwrap();
        assert!(stored.is_some());
        let fetched = manager.catalog.fetch_job(job.id, owner).await.unwrap();
        assert!(fetched.is_some());

        // Session directory and table entry are gone.
        assert_eq!(manager.session_count().await, 0);
        assert!(!dir.path().join(&session.id).exists());
        let err = manager
            .push_chunk(&session.id, owner, wav_chunk(0.2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::UnknownSession));
    }

    #[tokio::test]
    async fn finalize_without_audio_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Duration::from_secs(3600)).await;
        let owner = Uuid::new_v4();
        let session = manager.create_session(owner, None, None).await.unwrap();
        let err = manager.finalize(&session.id, owner, None).await.unwrap_err();
        assert!(matches!(err, LiveError::NoAudio));
    }

    #[tokio::test]
    async fn idle_sessions_are_purged_by_later_requests() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Duration::from_millis(50)).await;
        let owner = Uuid::new_v4();
        let stale = manager.create_session(owner, None, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Any subsequent live request runs the sweep.
        let _fresh = manager.create_session(owner, None, None).await.unwrap();

        assert_eq!(manager.session_count().await, 1);
        let err = manager
            .push_chunk(&stale.id, owner, wav_chunk(0.2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::UnknownSession));
    }
}
