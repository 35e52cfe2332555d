// SPDX-License-Identifier: MIT OR Apache-2.0
//! Recognized envelope metadata keys and the patch helper.
//!
//! The queue-side envelope carries a mutable string-keyed JSON map that the
//! worker writes and stream subscribers read. The key set below is the whole
//! vocabulary; anything else is passed through untouched.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::UnknownVariant;

/// Envelope lifecycle marker (`status` key).
pub const STATUS: &str = "status";
/// Monotone progress integer in `[0, 100]` (`progress` key).
pub const PROGRESS: &str = "progress";
/// Latest segment index reached by the decoder (`segment` key).
pub const SEGMENT: &str = "segment";
/// Serialized [`TokenEvent`](crate::TokenEvent) of the latest token (`last_token` key).
pub const LAST_TOKEN: &str = "last_token";
/// Accumulated transcript snapshot (`transcript_so_far` key).
pub const TRANSCRIPT_SO_FAR: &str = "transcript_so_far";
/// Partial segment list mirrored while decoding (`segments_partial` key).
pub const SEGMENTS_PARTIAL: &str = "segments_partial";
/// Artifact key of the finished transcript (`transcript_key` key).
pub const TRANSCRIPT_KEY: &str = "transcript_key";
/// Detected or requested language (`language` key).
pub const LANGUAGE: &str = "language";
/// Audio duration in seconds (`duration` key).
pub const DURATION: &str = "duration";
/// Quality profile the job runs under (`quality_profile` key).
pub const QUALITY_PROFILE: &str = "quality_profile";
/// Owner id used for stream authorization (`user_id` key).
pub const USER_ID: &str = "user_id";
/// Catalog row id this envelope belongs to (`transcript_id` key).
pub const TRANSCRIPT_ID: &str = "transcript_id";
/// Short failure summary (`error_message` key).
pub const ERROR_MESSAGE: &str = "error_message";
/// Enqueue timestamp, RFC 3339 (`queued_at` key).
pub const QUEUED_AT: &str = "queued_at";
/// Last-write timestamp, RFC 3339 (`updated_at` key).
pub const UPDATED_AT: &str = "updated_at";

/// Mutable envelope metadata mapping.
///
/// `BTreeMap` keeps serialized form deterministic.
pub type MetaMap = BTreeMap<String, Value>;

/// Value of the `status` metadata key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeStatus {
    /// Waiting for a worker.
    Queued,
    /// Decode in progress.
    Transcribing,
    /// Transcript persisted; terminal.
    Completed,
    /// Terminal failure.
    Failed,
}

impl EnvelopeStatus {
    /// Stable lowercase string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeStatus::Queued => "queued",
            EnvelopeStatus::Transcribing => "transcribing",
            EnvelopeStatus::Completed => "completed",
            EnvelopeStatus::Failed => "failed",
        }
    }

    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, EnvelopeStatus::Completed | EnvelopeStatus::Failed)
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(EnvelopeStatus::Queued),
            "transcribing" => Ok(EnvelopeStatus::Transcribing),
            "completed" => Ok(EnvelopeStatus::Completed),
            "failed" => Ok(EnvelopeStatus::Failed),
            other => Err(UnknownVariant {
                field: "envelope status",
                value: other.to_string(),
            }),
        }
    }
}

/// Reads the `status` key, defaulting to `Queued` when absent or malformed.
#[must_use]
pub fn status_of(meta: &MetaMap) -> EnvelopeStatus {
    meta.get(STATUS)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(EnvelopeStatus::Queued)
}

/// Reads the `progress` key clamped to `[0, 100]`, defaulting to 0.
#[must_use]
pub fn progress_of(meta: &MetaMap) -> u8 {
    meta.get(PROGRESS)
        .and_then(Value::as_i64)
        .map(|p| p.clamp(0, 100) as u8)
        .unwrap_or(0)
}

/// Applies `patch` onto `meta`, stamping `updated_at`.
///
/// `progress` is monotone: a patch that would lower the stored value is
/// ignored for that key only. Other keys overwrite.
pub fn apply_patch(meta: &mut MetaMap, patch: MetaMap, now: chrono::DateTime<chrono::Utc>) {
    let current = progress_of(meta);
    for (key, value) in patch {
        if key == PROGRESS {
            let incoming = value.as_i64().unwrap_or(0).clamp(0, 100) as u8;
            if incoming < current {
                continue;
            }
            meta.insert(key, Value::from(i64::from(incoming)));
        } else {
            meta.insert(key, value);
        }
    }
    meta.insert(UPDATED_AT.to_string(), Value::from(now.to_rfc3339()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn status_defaults_to_queued() {
        assert_eq!(status_of(&MetaMap::new()), EnvelopeStatus::Queued);
        let mut meta = MetaMap::new();
        meta.insert(STATUS.into(), json!("transcribing"));
        assert_eq!(status_of(&meta), EnvelopeStatus::Transcribing);
    }

    #[test]
    fn progress_clamps_and_defaults() {
        let mut meta = MetaMap::new();
        assert_eq!(progress_of(&meta), 0);
        meta.insert(PROGRESS.into(), json!(150));
        assert_eq!(progress_of(&meta), 100);
        meta.insert(PROGRESS.into(), json!(-3));
        assert_eq!(progress_of(&meta), 0);
    }

    #[test]
    fn patch_is_monotone_on_progress() {
        let mut meta = MetaMap::new();
        let mut patch = MetaMap::new();
        patch.insert(PROGRESS.into(), json!(40));
        apply_patch(&mut meta, patch, Utc::now());
        assert_eq!(progress_of(&meta), 40);

        let mut regress = MetaMap::new();
        regress.insert(PROGRESS.into(), json!(10));
        regress.insert(SEGMENT.into(), json!(3));
        apply_patch(&mut meta, regress, Utc::now());
        assert_eq!(progress_of(&meta), 40, "lower progress must be ignored");
        assert_eq!(meta.get(SEGMENT), Some(&json!(3)));
    }

    #[test]
    fn patch_stamps_updated_at() {
        let mut meta = MetaMap::new();
        let now = Utc::now();
        apply_patch(&mut meta, MetaMap::new(), now);
        assert_eq!(
            meta.get(UPDATED_AT).and_then(Value::as_str),
            Some(now.to_rfc3339().as_str())
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(EnvelopeStatus::Completed.is_terminal());
        assert!(EnvelopeStatus::Failed.is_terminal());
        assert!(!EnvelopeStatus::Transcribing.is_terminal());
        assert!(!EnvelopeStatus::Queued.is_terminal());
    }
}
