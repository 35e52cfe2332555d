// SPDX-License-Identifier: MIT OR Apache-2.0
//! Chunk normalization: arbitrary container/rate/channels in, canonical
//! 16 kHz mono signed-16-bit PCM out.
//!
//! Decoding goes through symphonia with the filename extension as a probe
//! hint; resampling through rubato. Both are CPU-bound, so callers run
//! [`decode_chunk`] on a blocking thread.

use rubato::{FastFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Canonical live-session sample rate.
pub const SAMPLE_RATE: u32 = 16_000;

/// Chunk size rubato processes per call.
const RESAMPLE_CHUNK: usize = 1024;

/// A chunk could not be decoded into PCM.
#[derive(Debug, thiserror::Error)]
#[error("chunk decode failed: {reason}")]
pub struct AudioDecodeError {
    /// What the decoder reported.
    pub reason: String,
}

impl AudioDecodeError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Decode an uploaded chunk into canonical PCM.
///
/// Blocking; run on a blocking thread. Unknown containers and truncated
/// streams are errors the session layer counts as dropped chunks.
pub fn decode_chunk(bytes: Vec<u8>, extension_hint: Option<&str>) -> Result<Vec<i16>, AudioDecodeError> {
    let cursor = std::io::Cursor::new(bytes);
    let stream = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension_hint {
        let trimmed = ext.trim_start_matches('.');
        if !trimmed.is_empty() {
            hint.with_extension(trimmed);
        }
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioDecodeError::new(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioDecodeError::new("no decodable audio track"))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| AudioDecodeError::new("track reports no sample rate"))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(1)
        .max(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioDecodeError::new(e.to_string()))?;

    let mut interleaved: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => return Err(AudioDecodeError::new(err.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let mut buffer =
                    SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                buffer.copy_interleaved_ref(decoded);
                interleaved.extend_from_slice(buffer.samples());
            }
            // Skip malformed packets; the rest of the chunk may be fine.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(err) => return Err(AudioDecodeError::new(err.to_string())),
        }
    }

    let mono = mixdown(&interleaved, channels);
    let resampled = if sample_rate == SAMPLE_RATE {
        mono
    } else {
        resample(&mono, sample_rate)?
    };
    Ok(quantize(&resampled))
}

/// Average interleaved channels down to mono.
fn mixdown(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample mono PCM from `input_rate` to the canonical rate.
fn resample(samples: &[f32], input_rate: u32) -> Result<Vec<f32>, AudioDecodeError> {
    let ratio = f64::from(SAMPLE_RATE) / f64::from(input_rate);
    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        10.0,
        rubato::PolynomialDegree::Septic,
        RESAMPLE_CHUNK,
        1,
    )
    .map_err(|e| AudioDecodeError::new(e.to_string()))?;

    let mut out = Vec::with_capacity((samples.len() as f64 * ratio) as usize + RESAMPLE_CHUNK);
    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in chunks.by_ref() {
        let processed = resampler
            .process(&[chunk], None)
            .map_err(|e| AudioDecodeError::new(e.to_string()))?;
        out.extend_from_slice(&processed[0]);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let processed = resampler
            .process_partial(Some(&[tail]), None)
            .map_err(|e| AudioDecodeError::new(e.to_string()))?;
        out.extend_from_slice(&processed[0]);
    }
    Ok(out)
}

/// Convert f32 PCM in `[-1, 1]` to s16, clamping out-of-range values.
fn quantize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}
