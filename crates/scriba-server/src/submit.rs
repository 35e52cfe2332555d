// SPDX-License-Identifier: MIT OR Apache-2.0
//! Multipart submission: validate the upload, persist the audio blob,
//! insert the catalog row, and enqueue the envelope with seeded metadata.

use crate::auth::CurrentUser;
use crate::{ApiError, AppState};
use axum::Json;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use bytes::Bytes;
use chrono::Utc;
use scriba_core::meta::{self, MetaMap};
use scriba_core::{Job, JobState, QualityProfile};
use scriba_error::ErrorKind;
use scriba_queue::{EnqueueRequest, Timeouts};
use scriba_worker::{JobArgs, TRANSCRIBE_FUNCTION};
use serde::Serialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Extensions accepted without looking at the MIME type.
const ALLOWED_EXTENSIONS: &[&str] = &[
    "aac", "flac", "m4a", "m4v", "mkv", "mov", "mp3", "mp4", "ogg", "wav", "webm", "wma",
];

/// MIME prefixes accepted regardless of extension.
const ALLOWED_MIME_PREFIXES: &[&str] = &["audio/", "video/"];

/// Successful submission response.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    /// Queue-side job id; subscribe to `/transcribe/{job_id}` with it.
    pub job_id: String,
    /// Always `queued`.
    pub status: &'static str,
    /// Resolved quality profile.
    pub quality_profile: QualityProfile,
    /// Catalog row id for the transcript library.
    pub transcript_id: Uuid,
}

struct Upload {
    filename: String,
    content_type: Option<String>,
    bytes: Bytes,
}

#[derive(Default)]
struct Fields {
    upload: Option<Upload>,
    language: Option<String>,
    profile: Option<String>,
    title: Option<String>,
    tags: Option<String>,
    diarization: Option<bool>,
    word_timestamps: Option<bool>,
}

/// `POST /transcribe`
pub async fn create_transcription_job(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner): CurrentUser,
    multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let fields = read_fields(multipart).await?;
    let upload = fields
        .upload
        .ok_or_else(|| ApiError::new(ErrorKind::Validation, "missing file field"))?;

    if !is_supported_media(&upload.filename, upload.content_type.as_deref()) {
        return Err(ApiError::new(
            ErrorKind::Validation,
            "only audio or video files are accepted",
        ));
    }
    if upload.bytes.is_empty() {
        return Err(ApiError::new(ErrorKind::Validation, "uploaded file is empty"));
    }
    let max_bytes = state.config.max_upload_mb * 1024 * 1024;
    if upload.bytes.len() as u64 > max_bytes {
        return Err(ApiError::new(
            ErrorKind::PayloadTooLarge,
            format!("upload exceeds {} MB", state.config.max_upload_mb),
        ));
    }

    // Profile validation happens before any persistence: a bad profile
    // must not leave a catalog row behind.
    let profile_name = fields
        .profile
        .as_deref()
        .unwrap_or(&state.config.quality_profile_default);
    let quality_profile = QualityProfile::from_str(profile_name)
        .map_err(|e| ApiError::new(ErrorKind::Validation, e.to_string()))?;

    let language = fields
        .language
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string);
    let tags: Vec<String> = fields
        .tags
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    let audio_key = format!(
        "{owner}/{}-{}",
        Uuid::new_v4(),
        sanitize_filename(&upload.filename)
    );
    state.store.ensure_buckets().await?;
    state.store.upload_audio(upload.bytes, &audio_key).await?;

    // Insert the row before enqueueing: the in-process backend starts
    // executing immediately and resolves the row via `transcript_id`.
    let transcript_id = Uuid::new_v4();
    let now = Utc::now();
    let job = Job {
        id: transcript_id,
        owner_id: owner,
        envelope_id: transcript_id.to_string(),
        state: JobState::Queued,
        quality_profile,
        language: language.clone(),
        title: fields.title.clone(),
        tags,
        audio_key: audio_key.clone(),
        transcript_key: None,
        segments: vec![],
        duration_seconds: None,
        error_message: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    };
    state.catalog.insert_job(&job).await?;

    let args = JobArgs {
        audio_key,
        language: language.clone(),
        owner_id: owner,
        quality_profile,
    };
    let mut seeded = MetaMap::new();
    seeded.insert(meta::USER_ID.into(), json!(owner.to_string()));
    seeded.insert(meta::TRANSCRIPT_ID.into(), json!(transcript_id.to_string()));
    seeded.insert(
        meta::QUALITY_PROFILE.into(),
        json!(quality_profile.as_str()),
    );
    if let Some(language) = &language {
        seeded.insert(meta::LANGUAGE.into(), json!(language));
    }
    if let Some(diarization) = fields.diarization {
        seeded.insert("diarization".into(), json!(diarization));
    }
    if let Some(word_timestamps) = fields.word_timestamps {
        seeded.insert("word_timestamps".into(), json!(word_timestamps));
    }

    let envelope = state
        .queue
        .enqueue(EnqueueRequest {
            function: TRANSCRIBE_FUNCTION.into(),
            argv: args
                .to_argv()
                .map_err(|e| ApiError::new(ErrorKind::Internal, e.to_string()))?,
            meta: seeded,
            timeouts: Timeouts {
                job_timeout: (state.config.job_timeout > 0)
                    .then(|| Duration::from_secs(state.config.job_timeout)),
                ..Timeouts::default()
            },
        })
        .await?;
    state
        .catalog
        .set_envelope_id(transcript_id, envelope.id())
        .await?;
    state.metrics.record_submission();

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: envelope.id().to_string(),
            status: "queued",
            quality_profile,
            transcript_id,
        }),
    ))
}

async fn read_fields(mut multipart: Multipart) -> Result<Fields, ApiError> {
    let mut fields = Fields::default();
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::new(ErrorKind::Validation, e.to_string()))?;
        let Some(field) = field else { break };
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload.bin").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::new(ErrorKind::PayloadTooLarge, e.to_string()))?;
                fields.upload = Some(Upload {
                    filename,
                    content_type,
                    bytes,
                });
            }
            "language" => fields.language = Some(text(field).await?),
            "profile" => fields.profile = Some(text(field).await?),
            "title" => fields.title = Some(text(field).await?),
            "tags" => fields.tags = Some(text(field).await?),
            "diarization" => fields.diarization = Some(flag(&text(field).await?)),
            "word_timestamps" => fields.word_timestamps = Some(flag(&text(field).await?)),
            _ => {}
        }
    }
    Ok(fields)
}

async fn text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::new(ErrorKind::Validation, e.to_string()))
}

fn flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "on" | "yes")
}

/// Accept by extension table or `audio/` / `video/` MIME prefix.
fn is_supported_media(filename: &str, content_type: Option<&str>) -> bool {
    let by_extension = std::path::Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()));
    let by_mime = content_type.is_some_and(|ct| {
        ALLOWED_MIME_PREFIXES
            .iter()
            .any(|prefix| ct.to_ascii_lowercase().starts_with(prefix))
    });
    by_extension || by_mime
}

/// Keep only filesystem- and URL-safe characters.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(['-', '.']).to_string();
    if trimmed.is_empty() {
        "upload.bin".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_acceptance_by_extension_or_mime() {
        assert!(is_supported_media("clip.WAV", None));
        assert!(is_supported_media("clip.webm", None));
        assert!(is_supported_media("blob", Some("audio/ogg")));
        assert!(is_supported_media("blob", Some("video/mp4")));
        assert!(!is_supported_media("notes.txt", Some("text/plain")));
        assert!(!is_supported_media("archive.zip", None));
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("mi reunión (1).wav"), "mi-reuni-n--1-.wav");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc-passwd");
        assert_eq!(sanitize_filename("???"), "upload.bin");
        assert_eq!(sanitize_filename("ok_file-2.mp3"), "ok_file-2.mp3");
    }

    #[test]
    fn boolean_fields_parse_loosely() {
        assert!(flag("true"));
        assert!(flag(" YES "));
        assert!(flag("1"));
        assert!(!flag("false"));
        assert!(!flag("nope"));
    }
}
