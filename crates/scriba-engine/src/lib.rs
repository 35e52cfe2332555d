// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! scriba-engine
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The adapter itself plus the process-wide cache.
pub mod adapter;
/// Deterministic stub decoder and WAV helpers.
pub mod stub;

use scriba_core::{Precision, Segment, TokenEvent};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

pub use adapter::{EngineAdapter, EngineCache};
pub use stub::{StubDecoder, StubFactory, silence_ratio};

// ---------------------------------------------------------------------------
// Variants & capability tables
// ---------------------------------------------------------------------------

/// Which engine implementation an adapter fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineVariant {
    /// Aligned decode with optional diarization.
    Primary,
    /// Single-model decode that is safe on CPU-only hosts.
    Fallback,
    /// Deterministic output for tests and weight-free deployments.
    Stub,
}

impl EngineVariant {
    /// Decode-option keys this variant accepts.
    ///
    /// Keys are declared, not discovered: the table is the variant's whole
    /// option vocabulary, and anything outside it is filtered before the
    /// decoder sees it.
    #[must_use]
    pub fn accepted_options(self) -> &'static [&'static str] {
        match self {
            EngineVariant::Primary => &[
                "batch_size",
                "beam_size",
                "best_of",
                "compression_ratio_threshold",
                "condition_on_previous_text",
                "diarization",
                "initial_prompt",
                "language",
                "log_prob_threshold",
                "no_speech_threshold",
                "patience",
                "suppress_blank",
                "task",
                "temperature",
                "vad_filter",
                "word_timestamps",
            ],
            EngineVariant::Fallback => &[
                "beam_size",
                "best_of",
                "compression_ratio_threshold",
                "condition_on_previous_text",
                "initial_prompt",
                "language",
                "log_prob_threshold",
                "no_speech_threshold",
                "suppress_blank",
                "task",
                "temperature",
                "vad_filter",
                "word_timestamps",
            ],
            EngineVariant::Stub => &["language", "vad_filter"],
        }
    }

    /// Lowercase variant label used in cache keys and log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EngineVariant::Primary => "primary",
            EngineVariant::Fallback => "fallback",
            EngineVariant::Stub => "stub",
        }
    }
}

impl fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective compute device after policy resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host CPU.
    Cpu,
    /// GPU or comparable accelerator.
    Accelerator,
}

impl Device {
    /// Lowercase device label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Accelerator => "accelerator",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decode contract
// ---------------------------------------------------------------------------

/// Free-form decode options after capability filtering.
pub type DecodeOptions = BTreeMap<String, serde_json::Value>;

/// One decode invocation handed to a [`Decoder`].
#[derive(Debug)]
pub struct DecodeRequest<'a> {
    /// Path of the audio to decode.
    pub audio_path: &'a Path,
    /// Language hint, if any.
    pub language: Option<&'a str>,
    /// Beam width, if the caller overrides the engine default.
    pub beam_size: Option<u32>,
    /// Filtered decode options.
    pub options: DecodeOptions,
    /// Weight precision selected by the quality profile.
    pub precision: Precision,
    /// Model identifier.
    pub model_size: &'a str,
}

/// What a decoder returns for one invocation.
#[derive(Debug, Clone, Default)]
pub struct DecodeOutput {
    /// Full transcript text.
    pub text: String,
    /// Detected (or echoed) language.
    pub language: Option<String>,
    /// Audio duration in seconds, when the decoder knows it.
    pub duration: Option<f64>,
    /// Timed transcript segments.
    pub segments: Vec<Segment>,
}

/// Decode failure carrying the engine's message verbatim.
///
/// The adapter classifies messages by substring (accelerator dependency
/// missing, unexpected keyword, VAD rejection) to drive its recovery
/// ladders, so decoders should not rewrite what the runtime reported.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DecodeError {
    /// The engine's error message.
    pub message: String,
}

impl DecodeError {
    /// Wrap an engine message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Receives token progress and debug events during a decode.
pub trait TokenSink: Send {
    /// A token batch was decoded.
    fn on_token(&mut self, token: TokenEvent);

    /// Diagnostic event (e.g. a dropped decode option); `stage` is a short
    /// dotted tag such as `transcribe.option`.
    fn on_debug(&mut self, stage: &str, message: &str) {
        let _ = (stage, message);
    }
}

/// A sink that discards everything; useful for warmup decodes.
pub struct NullSink;

impl TokenSink for NullSink {
    fn on_token(&mut self, _token: TokenEvent) {}
}

/// The opaque speech engine behind the adapter.
pub trait Decoder: Send + Sync {
    /// Decode `request`, streaming tokens into `sink`.
    fn decode(
        &self,
        request: &DecodeRequest<'_>,
        sink: &mut dyn TokenSink,
    ) -> Result<DecodeOutput, DecodeError>;
}

/// Builds decoders, re-invoked when the adapter falls back to CPU.
pub trait DecoderFactory: Send + Sync {
    /// Instantiate a decoder for the given variant, model, and device.
    fn create(
        &self,
        variant: EngineVariant,
        model_size: &str,
        device: Device,
    ) -> Result<Box<dyn Decoder>, DecodeError>;

    /// Whether the runtime reports a usable accelerator.
    fn accelerator_available(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Engine messages that mean the accelerator runtime is missing or broken.
const ACCELERATOR_ERROR_PATTERNS: &[&str] = &[
    "could not locate cudnn",
    "cudnn",
    "cublas",
    "invalid handle",
    "cannot load symbol",
    "no cuda gpus are available",
    "cuda driver",
    "driver library cannot be found",
    "nvidia driver on your system is too old",
];

/// Returns `true` when `message` indicates a missing accelerator dependency
/// (case-insensitive substring match against the known pattern set).
#[must_use]
pub fn is_accelerator_dependency_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    if lowered.is_empty() {
        return false;
    }
    ACCELERATOR_ERROR_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

/// Shortens an accelerator failure into a user-facing summary.
#[must_use]
pub fn summarize_accelerator_error(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return "accelerator unavailable".to_string();
    }
    if trimmed.chars().count() > 160 {
        let head: String = trimmed.chars().take(157).collect();
        return format!("{head}…");
    }
    trimmed.to_string()
}

/// Extracts the option key named by an "unexpected keyword" decode error.
///
/// Matches messages of the shape `… unexpected keyword argument 'vad_filter'`
/// (single or double quotes).
#[must_use]
pub fn unexpected_keyword(message: &str) -> Option<String> {
    // Option keys are lowercase identifiers, so matching and extraction can
    // both run over the lowered message.
    let lowered = message.to_lowercase();
    let tail = &lowered[lowered.find("unexpected keyword")?..];
    let open = tail.find(['\'', '"'])?;
    let quote = tail.as_bytes()[open] as char;
    let rest = &tail[open + 1..];
    let close = rest.find(quote)?;
    let key = rest[..close].trim();
    if key.is_empty() { None } else { Some(key.to_string()) }
}

/// Returns `true` when `message` is the engine rejecting the VAD flag.
#[must_use]
pub fn is_vad_rejection(message: &str) -> bool {
    message.to_lowercase().contains("vad")
}

/// Result of a successful adapter invocation.
#[derive(Debug, Clone)]
pub struct EngineResult {
    /// Full transcript text.
    pub text: String,
    /// Detected (or echoed) language.
    pub language: Option<String>,
    /// Audio duration in seconds.
    pub duration: Option<f64>,
    /// Timed transcript segments.
    pub segments: Vec<Segment>,
    /// Wall-clock decode time in seconds.
    pub runtime_seconds: f64,
    /// The device the decode actually ran on.
    pub device: Device,
}

/// Errors surfaced by the adapter after its recovery ladders are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Decoder construction failed.
    #[error("engine initialization failed: {0}")]
    Init(String),

    /// Decode failed beyond recovery.
    #[error("decode failed: {0}")]
    Decode(String),
}
