// SPDX-License-Identifier: MIT OR Apache-2.0
//! Live-session endpoints: open, push chunks, finalize, discard.

use crate::auth::CurrentUser;
use crate::{ApiError, AppState};
use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use scriba_core::Segment;
use scriba_error::ErrorKind;
use scriba_live::ChunkOutcome;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// `POST /transcriptions/live/sessions` payload.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    /// Language hint for every decode in this session.
    pub language: Option<String>,
    /// Beam width override.
    pub beam_size: Option<u32>,
}

/// `POST /transcriptions/live/sessions` response.
#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    /// Session id for subsequent chunk/finalize calls.
    pub session_id: String,
    /// Echoed language hint.
    pub language: Option<String>,
    /// Echoed beam width.
    pub beam_size: Option<u32>,
}

/// `POST /transcriptions/live/sessions`
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner): CurrentUser,
    request: Option<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let Json(request) = request.unwrap_or_default();
    let session = state
        .live
        .create_session(owner, request.language.clone(), request.beam_size)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id.clone(),
            language: request.language,
            beam_size: request.beam_size,
        }),
    ))
}

/// Wire form of a chunk's outcome.
#[derive(Debug, Serialize)]
pub struct ChunkResponse {
    /// Session id.
    pub session_id: String,
    /// Full accumulated transcript text.
    pub text: String,
    /// Highest covered time in seconds.
    pub duration: Option<f64>,
    /// Wall-clock seconds of the last decode.
    pub runtime_seconds: Option<f64>,
    /// Chunks received so far.
    pub chunk_count: u64,
    /// Chunks dropped as undecodable.
    pub dropped_chunks: u64,
    /// Current language.
    pub language: Option<String>,
    /// Stable segment list.
    pub segments: Vec<Segment>,
    /// Segments promoted by this chunk.
    pub new_segments: Vec<Segment>,
    /// Text of the newly promoted segments.
    pub new_text: Option<String>,
}

impl From<ChunkOutcome> for ChunkResponse {
    fn from(outcome: ChunkOutcome) -> Self {
        Self {
            session_id: outcome.session_id,
            text: outcome.text,
            duration: outcome.duration,
            runtime_seconds: outcome.runtime_seconds,
            chunk_count: outcome.chunk_count,
            dropped_chunks: outcome.dropped_chunks,
            language: outcome.language,
            segments: outcome.segments,
            new_segments: outcome.new_segments,
            new_text: outcome.new_text,
        }
    }
}

/// `POST /transcriptions/live/sessions/{id}/chunk`
pub async fn push_chunk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    CurrentUser(owner): CurrentUser,
    mut multipart: Multipart,
) -> Result<Json<ChunkResponse>, ApiError> {
    let mut chunk: Option<(Vec<u8>, Option<String>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(ErrorKind::Validation, e.to_string()))?
    {
        if matches!(field.name(), Some("chunk") | Some("file")) {
            let filename = field.file_name().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::new(ErrorKind::PayloadTooLarge, e.to_string()))?;
            chunk = Some((bytes.to_vec(), filename));
        }
    }
    let (bytes, filename) =
        chunk.ok_or_else(|| ApiError::new(ErrorKind::Validation, "missing chunk field"))?;

    let outcome = state
        .live
        .push_chunk(&id, owner, bytes, filename.as_deref())
        .await?;
    Ok(Json(ChunkResponse::from(outcome)))
}

/// `POST /transcriptions/live/sessions/{id}/finalize` payload.
#[derive(Debug, Default, Deserialize)]
pub struct FinalizeRequest {
    /// Title for the resulting catalog row.
    pub title: Option<String>,
}

/// `POST /transcriptions/live/sessions/{id}/finalize`
pub async fn finalize_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    CurrentUser(owner): CurrentUser,
    request: Option<Json<FinalizeRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = request.unwrap_or_default();
    let outcome = state.live.finalize(&id, owner, request.title).await?;
    Ok(Json(json!({
        "session_id": id,
        "transcription_id": outcome.job.id,
        "status": outcome.job.state,
        "text": outcome.text,
        "duration": outcome.job.duration_seconds,
        "runtime_seconds": outcome.runtime_seconds,
        "language": outcome.job.language,
        "segments": outcome.job.segments,
    })))
}

/// `DELETE /transcriptions/live/sessions/{id}`
pub async fn discard_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    CurrentUser(owner): CurrentUser,
) -> Result<StatusCode, ApiError> {
    state.live.discard(&id, owner).await?;
    Ok(StatusCode::NO_CONTENT)
}
