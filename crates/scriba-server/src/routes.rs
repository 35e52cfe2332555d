// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transcript library, job snapshots, downloads, exports, and probes.

use crate::auth::CurrentUser;
use crate::{ApiError, AppState};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::{self, HeaderValue};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use scriba_catalog::JobQuery;
use scriba_core::export::ExportFormat;
use scriba_core::meta;
use scriba_core::{Job, JobState, QualityProfile, Segment};
use scriba_error::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Health & metrics
// ---------------------------------------------------------------------------

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok", "time": Utc::now().to_rfc3339() }))
}

/// `GET /metrics`
pub async fn metrics_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

// ---------------------------------------------------------------------------
// Queue-side job snapshot
// ---------------------------------------------------------------------------

/// `GET /jobs/{job_id}` response.
#[derive(Debug, Serialize)]
pub struct JobSnapshot {
    /// Queue-side job id.
    pub job_id: String,
    /// Envelope status.
    pub status: String,
    /// Progress in `[0, 100]`.
    pub progress: u8,
    /// Latest segment index.
    pub segment: i64,
    /// Catalog row id, when seeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_id: Option<String>,
    /// Quality profile, when seeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_profile: Option<String>,
    /// Last metadata write, RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Failure summary, while the envelope is retained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Presigned transcript URL once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_url: Option<String>,
}

/// `GET /jobs/{job_id}`
pub async fn job_snapshot(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    CurrentUser(owner): CurrentUser,
) -> Result<Json<JobSnapshot>, ApiError> {
    let not_found = || ApiError::new(ErrorKind::NotFound, "job-not-found");

    let envelope = state
        .queue
        .fetch(&job_id)
        .await?
        .ok_or_else(not_found)?;
    let _ = envelope.refresh().await;
    let snapshot = envelope.meta().await;

    if let Some(user_id) = snapshot.get(meta::USER_ID).and_then(|v| v.as_str()) {
        if user_id != owner.to_string() {
            return Err(not_found());
        }
    }

    let transcript_url = match snapshot.get(meta::TRANSCRIPT_KEY).and_then(|v| v.as_str()) {
        Some(key) => state
            .store
            .presigned_url(key, Duration::from_secs(state.config.blob_presigned_ttl))
            .await
            .unwrap_or(None),
        None => None,
    };

    Ok(Json(JobSnapshot {
        job_id,
        status: meta::status_of(&snapshot).to_string(),
        progress: meta::progress_of(&snapshot),
        segment: snapshot
            .get(meta::SEGMENT)
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        transcript_id: snapshot
            .get(meta::TRANSCRIPT_ID)
            .and_then(|v| v.as_str())
            .map(str::to_string),
        quality_profile: snapshot
            .get(meta::QUALITY_PROFILE)
            .and_then(|v| v.as_str())
            .map(str::to_string),
        updated_at: snapshot
            .get(meta::UPDATED_AT)
            .and_then(|v| v.as_str())
            .map(str::to_string),
        error_message: snapshot
            .get(meta::ERROR_MESSAGE)
            .and_then(|v| v.as_str())
            .map(str::to_string),
        transcript_url,
    }))
}

// ---------------------------------------------------------------------------
// Transcript library
// ---------------------------------------------------------------------------

/// Query parameters for `GET /transcripts`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Case-insensitive substring over title, language, and tags.
    pub search: Option<String>,
    /// Exact state filter.
    pub status: Option<String>,
}

/// One row of the transcript listing.
#[derive(Debug, Serialize)]
pub struct TranscriptSummary {
    /// Catalog row id.
    pub id: Uuid,
    /// Queue-side job id.
    pub job_id: String,
    /// Lifecycle state.
    pub status: JobState,
    /// Quality profile.
    pub quality_profile: QualityProfile,
    /// Language, when known.
    pub language: Option<String>,
    /// Display title.
    pub title: Option<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// Duration in seconds, when known.
    pub duration_seconds: Option<f64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time, when terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for TranscriptSummary {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            job_id: job.envelope_id,
            status: job.state,
            quality_profile: job.quality_profile,
            language: job.language,
            title: job.title,
            tags: job.tags,
            duration_seconds: job.duration_seconds,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// `GET /transcripts`
pub async fn list_transcripts(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner): CurrentUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TranscriptSummary>>, ApiError> {
    let state_filter = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            JobState::from_str(raw)
                .map_err(|e| ApiError::new(ErrorKind::Validation, e.to_string()))?,
        ),
    };
    let jobs = state
        .catalog
        .list_jobs(
            owner,
            &JobQuery {
                search: query.search.filter(|s| !s.trim().is_empty()),
                state: state_filter,
            },
        )
        .await?;
    Ok(Json(jobs.into_iter().map(TranscriptSummary::from).collect()))
}

/// `GET /transcripts/{id}` response.
#[derive(Debug, Serialize)]
pub struct TranscriptDetail {
    /// Everything the listing carries.
    #[serde(flatten)]
    pub summary: TranscriptSummary,
    /// Ordered transcript segments.
    pub segments: Vec<Segment>,
    /// Failure summary, when failed.
    pub error_message: Option<String>,
    /// Presigned transcript URL, when completed.
    pub transcript_url: Option<String>,
}

/// `GET /transcripts/{id}`
pub async fn transcript_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    CurrentUser(owner): CurrentUser,
) -> Result<Json<TranscriptDetail>, ApiError> {
    let job = state
        .catalog
        .fetch_job(id, owner)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "transcript not found"))?;

    let transcript_url = match &job.transcript_key {
        Some(key) => state
            .store
            .presigned_url(key, Duration::from_secs(state.config.blob_presigned_ttl))
            .await
            .unwrap_or(None),
        None => None,
    };

    Ok(Json(TranscriptDetail {
        segments: job.segments.clone(),
        error_message: job.error_message.clone(),
        transcript_url,
        summary: TranscriptSummary::from(job),
    }))
}

/// Query parameters for `GET /transcripts/{id}/download`.
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    /// Requested format: txt, md, or srt.
    pub format: Option<String>,
}

/// `GET /transcripts/{id}/download`
pub async fn download_transcript(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    CurrentUser(owner): CurrentUser,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let format = ExportFormat::from_str(query.format.as_deref().unwrap_or("txt"))
        .map_err(|e| ApiError::new(ErrorKind::Validation, e.to_string()))?;

    let job = state
        .catalog
        .fetch_job(id, owner)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "transcript not found"))?;
    let key = job
        .transcript_key
        .as_deref()
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "transcript not ready"))?;
    let text = state
        .store
        .download_transcript(key)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "transcript blob missing"))?;

    let body = scriba_core::export::render(&job, &text, format);
    let disposition = format!(
        "attachment; filename=transcript-{id}.{}",
        format.extension()
    );
    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static(format.content_type()),
            ),
            (
                header::CONTENT_DISPOSITION,
                HeaderValue::from_str(&disposition)
                    .unwrap_or(HeaderValue::from_static("attachment")),
            ),
        ],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

/// Destinations an export can be queued for. Delivery is a separate
/// concern; this endpoint only validates and enqueues.
const EXPORT_DESTINATIONS: &[&str] = &["notion", "trello", "webhook"];

/// `POST /transcripts/{id}/export` payload.
#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    /// Target integration.
    pub destination: String,
    /// Rendered format to deliver.
    pub format: Option<String>,
    /// Free-form note attached to the delivery.
    pub note: Option<String>,
}

/// `POST /transcripts/{id}/export`
pub async fn export_transcript(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    CurrentUser(owner): CurrentUser,
    Json(request): Json<ExportRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let destination = request.destination.trim().to_ascii_lowercase();
    if !EXPORT_DESTINATIONS.contains(&destination.as_str()) {
        return Err(ApiError::new(
            ErrorKind::Validation,
            format!("unknown export destination: {destination}"),
        ));
    }
    let format = ExportFormat::from_str(request.format.as_deref().unwrap_or("txt"))
        .map_err(|e| ApiError::new(ErrorKind::Validation, e.to_string()))?;

    let job = state
        .catalog
        .fetch_job(id, owner)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "transcript not found"))?;
    if job.state != JobState::Completed {
        return Err(ApiError::new(
            ErrorKind::Validation,
            "transcript is not completed yet",
        ));
    }

    let mut seeded = scriba_core::meta::MetaMap::new();
    seeded.insert(meta::USER_ID.into(), json!(owner.to_string()));
    seeded.insert(meta::TRANSCRIPT_ID.into(), json!(id.to_string()));
    let envelope = state
        .queue
        .enqueue(scriba_queue::EnqueueRequest {
            function: "export_transcript".into(),
            argv: vec![json!({
                "transcript_id": id,
                "destination": destination,
                "format": format.extension(),
                "note": request.note,
            })],
            meta: seeded,
            timeouts: Default::default(),
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "queued",
            "export_id": envelope.id(),
            "destination": destination,
            "format": format.extension(),
        })),
    ))
}
