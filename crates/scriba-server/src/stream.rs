// SPDX-License-Identifier: MIT OR Apache-2.0
//! The long-lived progress stream.
//!
//! One subscriber per connection tails a job envelope and receives an
//! ordered, finite event sequence: an optional `snapshot` of the transcript
//! so far, `delta` per progress tick, `heartbeat` during quiet stretches,
//! and exactly one terminal `completed` or `error` frame. Ownership is
//! checked against the envelope's `user_id`; any mismatch or miss reads as
//! `job-not-found` so the stream is not an existence oracle.

use crate::auth::CurrentUser;
use crate::{ApiError, AppState};
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderValue};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use futures::Stream;
use scriba_core::meta::{self, EnvelopeStatus};
use scriba_queue::JobQueue;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Progress advance that triggers a fresh snapshot.
const SNAPSHOT_EVERY: u8 = 25;

/// Pacing knobs, overridable in tests.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Delay between envelope polls.
    pub poll_interval: Duration,
    /// Quiet period after which a heartbeat is emitted.
    pub heartbeat_after: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            heartbeat_after: Duration::from_secs(10),
        }
    }
}

/// One frame of the progress stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Transcript-so-far snapshot for late or reconnecting subscribers.
    Snapshot {
        /// Envelope id.
        job_id: String,
        /// Accumulated transcript text.
        text: String,
        /// Progress at snapshot time.
        progress: u8,
        /// Partial segments, when the envelope carries them.
        segments: Option<serde_json::Value>,
    },
    /// The serialized token payload of one progress tick.
    Delta(String),
    /// Liveness signal during quiet stretches.
    Heartbeat {
        /// Envelope id.
        job_id: String,
        /// Current status.
        status: String,
        /// Current progress.
        progress: u8,
    },
    /// Terminal success frame.
    Completed {
        /// Envelope id.
        job_id: String,
        /// Artifact key of the transcript.
        transcript_key: Option<String>,
        /// Detected language.
        language: Option<String>,
        /// Audio duration in seconds.
        duration: Option<f64>,
        /// Quality profile the job ran under.
        quality_profile: Option<String>,
    },
    /// Terminal failure frame.
    Error {
        /// Envelope id.
        job_id: String,
        /// Failure detail; `job-not-found` for misses and foreign jobs.
        detail: String,
    },
}

impl StreamEvent {
    /// SSE event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Snapshot { .. } => "snapshot",
            StreamEvent::Delta(_) => "delta",
            StreamEvent::Heartbeat { .. } => "heartbeat",
            StreamEvent::Completed { .. } => "completed",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// SSE data line. `delta` carries the raw token payload; everything
    /// else is a single-line JSON object.
    #[must_use]
    pub fn data(&self) -> String {
        match self {
            StreamEvent::Snapshot {
                job_id,
                text,
                progress,
                segments,
            } => {
                let mut body = json!({
                    "job_id": job_id,
                    "text": text,
                    "progress": progress,
                });
                if let Some(segments) = segments {
                    body["segments"] = segments.clone();
                }
                body.to_string()
            }
            StreamEvent::Delta(payload) => payload.clone(),
            StreamEvent::Heartbeat {
                job_id,
                status,
                progress,
            } => json!({"job_id": job_id, "status": status, "progress": progress}).to_string(),
            StreamEvent::Completed {
                job_id,
                transcript_key,
                language,
                duration,
                quality_profile,
            } => json!({
                "job_id": job_id,
                "transcript_key": transcript_key,
                "language": language,
                "duration": duration,
                "quality_profile": quality_profile,
            })
            .to_string(),
            StreamEvent::Error { job_id, detail } => {
                json!({"job_id": job_id, "detail": detail}).to_string()
            }
        }
    }

    /// Whether this frame ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed { .. } | StreamEvent::Error { .. })
    }
}

/// Tail `job_id`'s envelope as an ordered, finite event sequence.
///
/// The generator suspends only between poll cycles, so dropping it (client
/// disconnect) terminates within one cycle.
pub fn stream_job(
    queue: Arc<dyn JobQueue>,
    job_id: String,
    owner: Uuid,
    settings: StreamSettings,
) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        let not_found = StreamEvent::Error {
            job_id: job_id.clone(),
            detail: "job-not-found".into(),
        };

        let envelope = match queue.fetch(&job_id).await {
            Ok(Some(envelope)) => envelope,
            _ => {
                yield not_found;
                return;
            }
        };

        let _ = envelope.refresh().await;
        let snapshot_meta = envelope.meta().await;
        // Envelope-side ownership check; mismatches read as not-found so
        // foreign job ids are indistinguishable from unknown ones.
        if let Some(user_id) = snapshot_meta.get(meta::USER_ID).and_then(|v| v.as_str()) {
            if user_id != owner.to_string() {
                yield not_found;
                return;
            }
        }

        let mut last_progress = meta::progress_of(&snapshot_meta);
        // A subscriber arriving mid-flight (transcript already non-empty)
        // gets one catch-up snapshot; one present from the start only gets
        // snapshots at +25 progress advances.
        let subscribed_mid_flight = snapshot_meta
            .get(meta::TRANSCRIPT_SO_FAR)
            .and_then(|v| v.as_str())
            .is_some_and(|t| !t.is_empty());
        let mut snapshot_baseline: Option<u8> =
            (!subscribed_mid_flight).then_some(last_progress);
        let mut last_emit = tokio::time::Instant::now();
        let mut current = snapshot_meta;

        loop {
            let progress = meta::progress_of(&current);
            let status = meta::status_of(&current);

            match status {
                EnvelopeStatus::Completed => {
                    yield StreamEvent::Completed {
                        job_id: job_id.clone(),
                        transcript_key: current
                            .get(meta::TRANSCRIPT_KEY)
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        language: current
                            .get(meta::LANGUAGE)
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        duration: current.get(meta::DURATION).and_then(|v| v.as_f64()),
                        quality_profile: current
                            .get(meta::QUALITY_PROFILE)
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                    };
                    return;
                }
                EnvelopeStatus::Failed => {
                    yield StreamEvent::Error {
                        job_id: job_id.clone(),
                        detail: current
                            .get(meta::ERROR_MESSAGE)
                            .and_then(|v| v.as_str())
                            .unwrap_or("failed")
                            .to_string(),
                    };
                    return;
                }
                EnvelopeStatus::Queued | EnvelopeStatus::Transcribing => {}
            }

            let transcript = current
                .get(meta::TRANSCRIPT_SO_FAR)
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let snapshot_due = match snapshot_baseline {
                None => !transcript.is_empty(),
                Some(baseline) => {
                    !transcript.is_empty() && progress >= baseline.saturating_add(SNAPSHOT_EVERY)
                }
            };
            if snapshot_due {
                snapshot_baseline = Some(progress);
                last_emit = tokio::time::Instant::now();
                yield StreamEvent::Snapshot {
                    job_id: job_id.clone(),
                    text: transcript.to_string(),
                    progress,
                    segments: current.get(meta::SEGMENTS_PARTIAL).cloned(),
                };
            }

            if progress > last_progress {
                if let Some(token) = current.get(meta::LAST_TOKEN).and_then(|v| v.as_str()) {
                    // last_progress advances only here; heartbeats never
                    // move it.
                    last_progress = progress;
                    last_emit = tokio::time::Instant::now();
                    yield StreamEvent::Delta(token.to_string());
                }
            }

            if last_emit.elapsed() >= settings.heartbeat_after {
                last_emit = tokio::time::Instant::now();
                yield StreamEvent::Heartbeat {
                    job_id: job_id.clone(),
                    status: status.to_string(),
                    progress,
                };
            }

            tokio::time::sleep(settings.poll_interval).await;
            let _ = envelope.refresh().await;
            current = envelope.meta().await;
        }
    }
}

/// `GET /transcribe/{job_id}`, the SSE endpoint.
pub async fn stream_transcription(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    CurrentUser(owner): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let events = stream_job(
        state.queue.clone(),
        job_id,
        owner,
        StreamSettings::default(),
    );
    let sse_stream = futures::StreamExt::map(events, |event| {
        Ok::<_, Infallible>(SseEvent::default().event(event.name()).data(event.data()))
    });

    let headers = [
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (
            header::HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ),
    ];
    // Heartbeat frames are the liveness mechanism; no SSE comment
    // keep-alive on top.
    Ok((headers, Sse::new(sse_stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use scriba_core::meta::MetaMap;
    use scriba_queue::{EnqueueRequest, Envelope, JobRunner, MemoryQueue};
    use serde_json::json;

    fn fast() -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(5),
            heartbeat_after: Duration::from_millis(120),
        }
    }

    async fn collect(
        queue: Arc<dyn JobQueue>,
        job_id: &str,
        owner: Uuid,
        settings: StreamSettings,
    ) -> Vec<StreamEvent> {
        stream_job(queue, job_id.to_string(), owner, settings)
            .collect::<Vec<_>>()
            .await
    }

    /// Runner scripting a short decode: two tokens, then completion.
    struct ScriptedJob {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl JobRunner for ScriptedJob {
        async fn run(&self, envelope: Arc<dyn Envelope>) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                let mut patch = MetaMap::new();
                patch.insert(meta::STATUS.into(), json!("failed"));
                patch.insert(meta::ERROR_MESSAGE.into(), json!("decode exploded"));
                envelope.update_meta(patch).await?;
                return Ok(());
            }

            for (index, word) in ["hola", "mundo"].iter().enumerate() {
                let token = json!({
                    "text": word,
                    "t_start": index as f64 * 0.5,
                    "t_end": (index as f64 + 1.0) * 0.5,
                    "segment_index": index,
                })
                .to_string();
                let mut patch = MetaMap::new();
                patch.insert(meta::STATUS.into(), json!("transcribing"));
                patch.insert(meta::PROGRESS.into(), json!(index as i64 + 1));
                patch.insert(meta::LAST_TOKEN.into(), json!(token));
                patch.insert(meta::TRANSCRIPT_SO_FAR.into(), json!("hola mundo"[..4 + index * 6].trim()));
                envelope.update_meta(patch).await?;
                tokio::time::sleep(Duration::from_millis(30)).await;
            }

            let mut patch = MetaMap::new();
            patch.insert(meta::STATUS.into(), json!("completed"));
            patch.insert(meta::PROGRESS.into(), json!(100));
            patch.insert(meta::TRANSCRIPT_KEY.into(), json!("u/a.wav.txt"));
            patch.insert(meta::LANGUAGE.into(), json!("es"));
            patch.insert(meta::DURATION.into(), json!(1.0));
            patch.insert(meta::QUALITY_PROFILE.into(), json!("balanced"));
            envelope.update_meta(patch).await?;
            Ok(())
        }
    }

    async fn enqueue_for(
        owner: Uuid,
        fail: bool,
    ) -> (Arc<MemoryQueue>, String) {
        let queue = Arc::new(MemoryQueue::new(Arc::new(ScriptedJob { fail })));
        let mut seeded = MetaMap::new();
        seeded.insert(meta::USER_ID.into(), json!(owner.to_string()));
        let envelope = queue
            .enqueue(EnqueueRequest {
                function: "transcribe_job".into(),
                meta: seeded,
                ..EnqueueRequest::default()
            })
            .await
            .unwrap();
        (queue, envelope.id().to_string())
    }

    #[tokio::test]
    async fn unknown_job_yields_single_not_found_error() {
        let queue = Arc::new(MemoryQueue::new(Arc::new(ScriptedJob { fail: false })));
        let events = collect(queue, "missing", Uuid::new_v4(), fast()).await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            StreamEvent::Error {
                job_id: "missing".into(),
                detail: "job-not-found".into()
            }
        );
    }

    #[tokio::test]
    async fn foreign_owner_gets_the_same_not_found() {
        let owner = Uuid::new_v4();
        let (queue, job_id) = enqueue_for(owner, false).await;
        let stranger = Uuid::new_v4();
        let events = collect(queue, &job_id, stranger, fast()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Error { detail, .. } if detail == "job-not-found"
        ));
    }

    #[tokio::test]
    async fn deltas_then_exactly_one_terminal_completed() {
        let owner = Uuid::new_v4();
        let (queue, job_id) = enqueue_for(owner, false).await;
        let events = collect(queue, &job_id, owner, fast()).await;

        let deltas: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Delta(_)))
            .collect();
        assert!(!deltas.is_empty(), "expected at least one delta: {events:?}");

        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1, "exactly one terminal event");
        assert!(
            events.last().unwrap().is_terminal(),
            "terminal frame must be last"
        );
        match events.last().unwrap() {
            StreamEvent::Completed {
                transcript_key,
                language,
                quality_profile,
                ..
            } => {
                assert_eq!(transcript_key.as_deref(), Some("u/a.wav.txt"));
                assert_eq!(language.as_deref(), Some("es"));
                assert_eq!(quality_profile.as_deref(), Some("balanced"));
            }
            other => panic!("expected completed, got {other:?}"),
        }

        // Delta payloads decode back to token objects.
        for delta in deltas {
            if let StreamEvent::Delta(payload) = delta {
                let token: serde_json::Value = serde_json::from_str(payload).unwrap();
                assert!(token.get("text").is_some());
            }
        }
    }

    #[tokio::test]
    async fn failure_surfaces_exactly_once_as_error() {
        let owner = Uuid::new_v4();
        let (queue, job_id) = enqueue_for(owner, true).await;
        let events = collect(queue, &job_id, owner, fast()).await;

        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::Error { detail, .. } if detail == "decode exploded"
        ));
    }

    #[tokio::test]
    async fn quiet_stretch_emits_heartbeat_without_advancing_progress() {
        // A runner that stalls long enough for heartbeats, then finishes.
        struct Staller;
        #[async_trait::async_trait]
        impl JobRunner for Staller {
            async fn run(&self, envelope: Arc<dyn Envelope>) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_millis(400)).await;
                let mut patch = MetaMap::new();
                patch.insert(meta::STATUS.into(), json!("completed"));
                patch.insert(meta::TRANSCRIPT_KEY.into(), json!("k.txt"));
                envelope.update_meta(patch).await?;
                Ok(())
            }
        }

        let queue = Arc::new(MemoryQueue::new(Arc::new(Staller)));
        let envelope = queue
            .enqueue(EnqueueRequest {
                function: "transcribe_job".into(),
                ..EnqueueRequest::default()
            })
            .await
            .unwrap();

        let events = collect(queue, envelope.id(), Uuid::new_v4(), fast()).await;
        let heartbeats = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Heartbeat { .. }))
            .count();
        assert!(heartbeats >= 1, "expected heartbeats: {events:?}");
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn late_subscriber_receives_snapshot_with_text() {
        let owner = Uuid::new_v4();
        let (queue, job_id) = enqueue_for(owner, false).await;

        // Let the job make progress before subscribing, as a reconnecting
        // client would.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let events = collect(queue, &job_id, owner, fast()).await;

        match events.iter().find(|e| matches!(e, StreamEvent::Snapshot { .. })) {
            Some(StreamEvent::Snapshot { text, .. }) => {
                assert!(!text.is_empty(), "snapshot text must be non-empty")
            }
            _ => panic!("expected a snapshot frame: {events:?}"),
        }
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn event_data_lines_are_single_line() {
        let event = StreamEvent::Snapshot {
            job_id: "j".into(),
            text: "hola".into(),
            progress: 10,
            segments: None,
        };
        assert!(!event.data().contains('\n'));
        assert_eq!(event.name(), "snapshot");
    }
}
