// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic stub decoder and small WAV helpers.
//!
//! The stub derives everything from the input file: duration from the WAV
//! header, text from the file stem, one segment per half second. Identical
//! input always produces identical output, which is what the end-to-end
//! tests and weight-free deployments need.

use crate::{
    DecodeError, DecodeOutput, DecodeRequest, Decoder, DecoderFactory, Device, EngineVariant,
    TokenSink,
};
use scriba_core::{Segment, TokenEvent};
use std::path::Path;

/// Canonical sample rate for generated and inspected audio.
pub const SAMPLE_RATE: u32 = 16_000;

/// Samples quieter than this (≈ −40 dBFS) count as silence.
const SILENCE_AMPLITUDE: i16 = 327;

/// Length of one stub segment in seconds.
const SEGMENT_SECONDS: f64 = 0.5;

/// Pause before each emitted token so subscribers can observe progress.
const TOKEN_PACING: std::time::Duration = std::time::Duration::from_millis(60);

// ---------------------------------------------------------------------------
// WAV helpers
// ---------------------------------------------------------------------------

/// Duration of a WAV file in seconds; `None` when the file is not readable
/// as WAV.
#[must_use]
pub fn wav_duration(path: &Path) -> Option<f64> {
    let reader = hound::WavReader::open(path).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return None;
    }
    Some(reader.duration() as f64 / spec.sample_rate as f64)
}

/// Share of samples below the silence threshold, in `[0, 1]`.
///
/// Inputs that cannot be read as WAV report 0.0; the caller then treats
/// them as speech and leaves filtering to the engine.
#[must_use]
pub fn silence_ratio(path: &Path) -> f64 {
    let Ok(mut reader) = hound::WavReader::open(path) else {
        return 0.0;
    };
    let mut total = 0u64;
    let mut silent = 0u64;
    for sample in reader.samples::<i16>() {
        let Ok(sample) = sample else {
            return 0.0;
        };
        total += 1;
        if sample.unsigned_abs() <= SILENCE_AMPLITUDE as u16 {
            silent += 1;
        }
    }
    if total == 0 {
        return 1.0;
    }
    silent as f64 / total as f64
}

/// Write `seconds` of silent 16 kHz mono PCM into a temp WAV file.
pub fn write_silence_wav(seconds: f64) -> Result<tempfile::NamedTempFile, DecodeError> {
    let file = tempfile::Builder::new()
        .suffix(".wav")
        .tempfile()
        .map_err(|e| DecodeError::new(e.to_string()))?;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(file.path(), spec)
        .map_err(|e| DecodeError::new(e.to_string()))?;
    let samples = (seconds.max(0.0) * SAMPLE_RATE as f64) as usize;
    for _ in 0..samples {
        writer
            .write_sample(0i16)
            .map_err(|e| DecodeError::new(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| DecodeError::new(e.to_string()))?;
    Ok(file)
}

// ---------------------------------------------------------------------------
// Stub decoder
// ---------------------------------------------------------------------------

/// Deterministic [`Decoder`] used by the stub variant and by tests.
#[derive(Debug, Default)]
pub struct StubDecoder;

impl Decoder for StubDecoder {
    fn decode(
        &self,
        request: &DecodeRequest<'_>,
        sink: &mut dyn TokenSink,
    ) -> Result<DecodeOutput, DecodeError> {
        let duration = wav_duration(request.audio_path).unwrap_or(1.0);
        let stem = request
            .audio_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let language = request
            .options
            .get("language")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| request.language.map(str::to_string))
            .unwrap_or_else(|| "es".to_string());

        let mut segments = Vec::new();
        let mut t = 0.0f64;
        let mut index = 0usize;
        while t < duration || segments.is_empty() {
            let end = (t + SEGMENT_SECONDS).min(duration.max(SEGMENT_SECONDS));
            let text = format!("transcripción simulada de {stem} (parte {})", index + 1);
            std::thread::sleep(TOKEN_PACING);
            sink.on_token(TokenEvent {
                text: text.clone(),
                t_start: t,
                t_end: end,
                segment_index: index,
            });
            segments.push(Segment {
                start: t,
                end,
                speaker: "SPEAKER_00".into(),
                text,
            });
            index += 1;
            t = end;
            if t >= duration {
                break;
            }
        }

        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(DecodeOutput {
            text,
            language: Some(language),
            duration: Some(duration),
            segments,
        })
    }
}

/// Factory producing [`StubDecoder`]s for every variant.
///
/// This is the default wiring when no real model runtime is linked in; the
/// composition root swaps in a real factory where one is available.
#[derive(Debug, Default)]
pub struct StubFactory;

impl DecoderFactory for StubFactory {
    fn create(
        &self,
        _variant: EngineVariant,
        _model_size: &str,
        _device: Device,
    ) -> Result<Box<dyn Decoder>, DecodeError> {
        Ok(Box::new(StubDecoder))
    }

    fn accelerator_available(&self) -> bool {
        false
    }
}
