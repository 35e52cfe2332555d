// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! scriba-core
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Export rendering for completed transcripts (txt / md / srt).
pub mod export;
/// Recognized envelope metadata keys and the patch helper.
pub mod meta;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a transcription job.
///
/// Only four transitions are legal: `Queued → Running`,
/// `Running → Completed`, `Running → Failed`, and `Queued → Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted and waiting for a worker.
    Queued,
    /// A worker is decoding the audio.
    Running,
    /// Transcript persisted; terminal.
    Completed,
    /// Decode or storage failure; terminal.
    Failed,
}

impl JobState {
    /// Returns `true` when `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Queued, JobState::Failed)
        )
    }

    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Stable lowercase string form, matching the serde representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(UnknownVariant {
                field: "state",
                value: other.to_string(),
            }),
        }
    }
}

/// A string did not name any variant of the target enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {field}: {value}")]
pub struct UnknownVariant {
    /// Which field was being parsed.
    pub field: &'static str,
    /// The offending input.
    pub value: String,
}

// ---------------------------------------------------------------------------
// Quality profiles
// ---------------------------------------------------------------------------

/// Symbolic decode-quality tier selected at submission time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    /// Lowest latency; int8 weights.
    Fast,
    /// Default trade-off; float16 weights.
    #[default]
    Balanced,
    /// Highest accuracy; float32 weights.
    Precise,
}

impl QualityProfile {
    /// Numeric precision tier this profile maps to.
    #[must_use]
    pub fn precision(self) -> Precision {
        match self {
            QualityProfile::Fast => Precision::Int8,
            QualityProfile::Balanced => Precision::Float16,
            QualityProfile::Precise => Precision::Float32,
        }
    }

    /// Stable lowercase string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QualityProfile::Fast => "fast",
            QualityProfile::Balanced => "balanced",
            QualityProfile::Precise => "precise",
        }
    }
}

impl fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityProfile {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(QualityProfile::Fast),
            "balanced" => Ok(QualityProfile::Balanced),
            "precise" => Ok(QualityProfile::Precise),
            other => Err(UnknownVariant {
                field: "quality profile",
                value: other.to_string(),
            }),
        }
    }
}

/// Numeric weight precision handed to the speech engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// 8-bit integer quantization.
    Int8,
    /// Half-precision floats.
    Float16,
    /// Full-precision floats.
    Float32,
}

impl Precision {
    /// Engine-facing compute-type label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Int8 => "int8",
            Precision::Float16 => "float16",
            Precision::Float32 => "float32",
        }
    }
}

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// One timed span of transcript text, attributed to a speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start offset in seconds from the beginning of the audio.
    pub start: f64,
    /// End offset in seconds; `start <= end`.
    pub end: f64,
    /// Speaker label, e.g. `SPEAKER_00`.
    pub speaker: String,
    /// The transcribed text.
    pub text: String,
}

impl Segment {
    /// Returns `true` when `other` repeats this segment's text at nearly the
    /// same position (both boundaries within half a second).
    #[must_use]
    pub fn near_duplicate(&self, other: &Segment) -> bool {
        self.text == other.text
            && (self.start - other.start).abs() < 0.5
            && (self.end - other.end).abs() < 0.5
    }
}

/// Checks the ordering invariant over a completed job's segment list:
/// non-decreasing start offsets and no adjacent near-duplicates.
#[must_use]
pub fn segments_well_formed(segments: &[Segment]) -> bool {
    segments.windows(2).all(|pair| {
        pair[0].start <= pair[1].start + f64::EPSILON && !pair[0].near_duplicate(&pair[1])
    }) && segments.iter().all(|s| s.start <= s.end)
}

// ---------------------------------------------------------------------------
// Token events
// ---------------------------------------------------------------------------

/// Incremental decode progress emitted by the engine, one per token batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEvent {
    /// Newly decoded text.
    pub text: String,
    /// Start of the covered span, in seconds.
    pub t_start: f64,
    /// End of the covered span, in seconds.
    pub t_end: f64,
    /// Index of the segment this token belongs to.
    pub segment_index: usize,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Durable record of a transcription job as held by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning user.
    pub owner_id: Uuid,
    /// Opaque queue-envelope id tying this row to its envelope.
    pub envelope_id: String,
    /// Lifecycle state.
    pub state: JobState,
    /// Quality tier the job was submitted with.
    pub quality_profile: QualityProfile,
    /// Optional language hint (BCP-47-ish, e.g. `es`).
    pub language: Option<String>,
    /// Display title.
    pub title: Option<String>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Artifact-store key of the uploaded audio.
    pub audio_key: String,
    /// Artifact-store key of the transcript; set exactly at completion.
    pub transcript_key: Option<String>,
    /// Ordered transcript segments; empty until completion.
    pub segments: Vec<Segment>,
    /// Audio duration in seconds, when known.
    pub duration_seconds: Option<f64>,
    /// Short failure summary when `state == Failed`.
    pub error_message: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Terminal-transition time; set exactly when the job completes.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Checks the completion invariants: `transcript_key` and
    /// `completed_at` are present iff the job is `Completed`, and the
    /// segment list is well formed.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        let completed = self.state == JobState::Completed;
        completed == self.transcript_key.is_some()
            && completed == self.completed_at.is_some()
            && segments_well_formed(&self.segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, text: &str) -> Segment {
        Segment {
            start,
            end,
            speaker: "SPEAKER_00".into(),
            text: text.into(),
        }
    }

    // -- State machine ---------------------------------------------------

    #[test]
    fn legal_transitions() {
        assert!(JobState::Queued.can_transition(JobState::Running));
        assert!(JobState::Running.can_transition(JobState::Completed));
        assert!(JobState::Running.can_transition(JobState::Failed));
        assert!(JobState::Queued.can_transition(JobState::Failed));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!JobState::Queued.can_transition(JobState::Completed));
        assert!(!JobState::Completed.can_transition(JobState::Running));
        assert!(!JobState::Failed.can_transition(JobState::Queued));
        assert!(!JobState::Running.can_transition(JobState::Queued));
        assert!(!JobState::Completed.can_transition(JobState::Failed));
    }

    #[test]
    fn state_parse_roundtrip() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    // -- Quality profiles ------------------------------------------------

    #[test]
    fn profile_precision_mapping() {
        assert_eq!(QualityProfile::Fast.precision(), Precision::Int8);
        assert_eq!(QualityProfile::Balanced.precision(), Precision::Float16);
        assert_eq!(QualityProfile::Precise.precision(), Precision::Float32);
    }

    #[test]
    fn profile_rejects_unknown() {
        assert!("ultra".parse::<QualityProfile>().is_err());
        assert_eq!(
            " Balanced ".parse::<QualityProfile>().unwrap(),
            QualityProfile::Balanced
        );
    }

    // -- Segments --------------------------------------------------------

    #[test]
    fn near_duplicate_within_half_second() {
        let a = seg(1.0, 2.0, "hola mundo");
        assert!(a.near_duplicate(&seg(1.3, 2.4, "hola mundo")));
        assert!(!a.near_duplicate(&seg(1.6, 2.0, "hola mundo")));
        assert!(!a.near_duplicate(&seg(1.0, 2.0, "adios")));
    }

    #[test]
    fn well_formed_accepts_ordered_list() {
        let list = vec![seg(0.0, 1.0, "a"), seg(1.0, 2.0, "b"), seg(2.0, 3.5, "c")];
        assert!(segments_well_formed(&list));
    }

    #[test]
    fn well_formed_rejects_adjacent_duplicates() {
        let list = vec![seg(0.0, 1.0, "a"), seg(0.2, 1.1, "a")];
        assert!(!segments_well_formed(&list));
    }

    #[test]
    fn well_formed_rejects_inverted_span() {
        assert!(!segments_well_formed(&[seg(2.0, 1.0, "a")]));
    }

    #[test]
    fn segment_serde_roundtrip() {
        let original = seg(0.5, 2.25, "hola");
        let json = serde_json::to_string(&original).unwrap();
        let back: Segment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    // -- Job invariants --------------------------------------------------

    fn job(state: JobState) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            envelope_id: "env-1".into(),
            state,
            quality_profile: QualityProfile::Balanced,
            language: Some("es".into()),
            title: Some("demo".into()),
            tags: vec![],
            audio_key: "owner/audio.wav".into(),
            transcript_key: None,
            segments: vec![],
            duration_seconds: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn queued_job_invariants() {
        assert!(job(JobState::Queued).invariants_hold());
    }

    #[test]
    fn completed_requires_transcript_key_and_timestamp() {
        let mut completed = job(JobState::Completed);
        assert!(!completed.invariants_hold());
        completed.transcript_key = Some("owner/audio.wav.txt".into());
        assert!(!completed.invariants_hold());
        completed.completed_at = Some(Utc::now());
        assert!(completed.invariants_hold());
    }

    #[test]
    fn non_completed_must_not_carry_transcript_key() {
        let mut running = job(JobState::Running);
        running.transcript_key = Some("k".into());
        assert!(!running.invariants_hold());
    }
}
