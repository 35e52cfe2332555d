// SPDX-License-Identifier: MIT OR Apache-2.0
//! The rolling PCM ring and the append-only session WAV.
//!
//! The ring keeps the last `W` seconds of canonical PCM for overlap
//! re-decoding. The on-disk WAV holds everything ever received: frames are
//! appended to the data chunk and the RIFF size fields at offsets 4 and 40
//! are rewritten after each append.

use crate::audio::SAMPLE_RATE;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// WAV header length for 16-bit mono PCM.
const HEADER_LEN: u64 = 44;
/// Offset of the RIFF chunk size field.
const RIFF_SIZE_OFFSET: u64 = 4;
/// Offset of the data chunk size field.
const DATA_SIZE_OFFSET: u64 = 40;

/// Errors from the ring or the on-disk WAV.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// The requested export window contains no audio.
    #[error("window contains no audio")]
    EmptyWindow,

    /// The session WAV's header is damaged; the session must abort.
    #[error("corrupt wav header")]
    CorruptHeader,

    /// Filesystem failure.
    #[error("session audio io failure")]
    Io(#[from] std::io::Error),

    /// WAV encoding failure during export.
    #[error("window export failed: {0}")]
    Export(String),
}

// ---------------------------------------------------------------------------
// PcmRing
// ---------------------------------------------------------------------------

/// Bounded rolling buffer over the most recent canonical PCM.
#[derive(Debug)]
pub struct PcmRing {
    samples: VecDeque<i16>,
    max_samples: usize,
    total_samples: u64,
}

impl PcmRing {
    /// Create a ring holding at most `max_duration` seconds.
    #[must_use]
    pub fn new(max_duration: f64) -> Self {
        let max_samples = (max_duration.max(1.0) * SAMPLE_RATE as f64) as usize;
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
            total_samples: 0,
        }
    }

    /// Append PCM, evicting the oldest samples past capacity.
    pub fn append(&mut self, pcm: &[i16]) {
        self.total_samples += pcm.len() as u64;
        for &sample in pcm {
            if self.samples.len() == self.max_samples {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
        }
    }

    /// Seconds currently buffered.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }

    /// Absolute time of the oldest buffered sample: `max(0, T - W)`.
    #[must_use]
    pub fn start(&self) -> f64 {
        self.end() - self.duration()
    }

    /// Total elapsed time `T` across everything ever appended.
    #[must_use]
    pub fn end(&self) -> f64 {
        self.total_samples as f64 / SAMPLE_RATE as f64
    }

    /// Export `[max(start_time, ring.start), ring.end]` as a WAV file.
    ///
    /// Returns the actual window bounds; errors when the window is empty.
    pub fn export_window(&self, start_time: f64, dest: &Path) -> Result<(f64, f64), RingError> {
        if self.samples.is_empty() {
            return Err(RingError::EmptyWindow);
        }
        let actual_start = start_time.max(self.start());
        let offset = ((actual_start - self.start()) * SAMPLE_RATE as f64).round() as usize;
        if offset >= self.samples.len() {
            return Err(RingError::EmptyWindow);
        }

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer =
            hound::WavWriter::create(dest, spec).map_err(|e| RingError::Export(e.to_string()))?;
        for &sample in self.samples.iter().skip(offset) {
            writer
                .write_sample(sample)
                .map_err(|e| RingError::Export(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| RingError::Export(e.to_string()))?;
        Ok((actual_start, self.end()))
    }
}

// ---------------------------------------------------------------------------
// Append-only session WAV
// ---------------------------------------------------------------------------

/// Append canonical PCM frames to the session WAV, creating it on first use
/// and rewriting the RIFF size fields in place afterwards.
pub async fn append_session_audio(path: &Path, pcm: &[i16]) -> Result<(), RingError> {
    if pcm.is_empty() {
        return Ok(());
    }
    let mut frames = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm {
        frames.extend_from_slice(&sample.to_le_bytes());
    }

    if !tokio::fs::try_exists(path).await? {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(&wav_header(frames.len() as u32)).await?;
        file.write_all(&frames).await?;
        file.flush().await?;
        return Ok(());
    }

    let mut file = OpenOptions::new().read(true).write(true).open(path).await?;

    file.seek(SeekFrom::Start(DATA_SIZE_OFFSET)).await?;
    let mut size_bytes = [0u8; 4];
    if file.read_exact(&mut size_bytes).await.is_err() {
        return Err(RingError::CorruptHeader);
    }
    let current_size = u32::from_le_bytes(size_bytes);
    let new_size = current_size
        .checked_add(frames.len() as u32)
        .ok_or(RingError::CorruptHeader)?;

    file.seek(SeekFrom::End(0)).await?;
    file.write_all(&frames).await?;

    file.seek(SeekFrom::Start(RIFF_SIZE_OFFSET)).await?;
    file.write_all(&(36 + new_size).to_le_bytes()).await?;
    file.seek(SeekFrom::Start(DATA_SIZE_OFFSET)).await?;
    file.write_all(&new_size.to_le_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// 44-byte canonical WAV header (PCM, mono, 16 kHz, 16-bit).
fn wav_header(data_len: u32) -> [u8; HEADER_LEN as usize] {
    let byte_rate = SAMPLE_RATE * 2;
    let mut header = [0u8; HEADER_LEN as usize];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes());
    header[22..24].copy_from_slice(&1u16.to_le_bytes());
    header[24..28].copy_from_slice(&SAMPLE_RATE.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&2u16.to_le_bytes());
    header[34..36].copy_from_slice(&16u16.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(seconds: f64, value: i16) -> Vec<i16> {
        vec![value; (seconds * SAMPLE_RATE as f64) as usize]
    }

    // -- Ring ------------------------------------------------------------

    #[test]
    fn ring_tracks_start_and_end() {
        let mut ring = PcmRing::new(2.0);
        ring.append(&pcm(1.0, 1));
        assert_eq!(ring.start(), 0.0);
        assert_eq!(ring.end(), 1.0);

        ring.append(&pcm(3.0, 2));
        assert_eq!(ring.end(), 4.0);
        // Only the last two seconds remain buffered.
        assert!((ring.start() - 2.0).abs() < 1e-9);
        assert!((ring.duration() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn export_window_clamps_to_ring_start() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("window.wav");
        let mut ring = PcmRing::new(2.0);
        ring.append(&pcm(4.0, 7));

        // Requested start predates the buffered region.
        let (start, end) = ring.export_window(0.5, &dest).unwrap();
        assert!((start - 2.0).abs() < 1e-9);
        assert_eq!(end, 4.0);

        let reader = hound::WavReader::open(&dest).unwrap();
        assert_eq!(reader.duration(), 2 * SAMPLE_RATE);
    }

    #[test]
    fn export_window_mid_ring() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("window.wav");
        let mut ring = PcmRing::new(5.0);
        ring.append(&pcm(3.0, 1));

        let (start, end) = ring.export_window(2.0, &dest).unwrap();
        assert_eq!(start, 2.0);
        assert_eq!(end, 3.0);
        let reader = hound::WavReader::open(&dest).unwrap();
        assert_eq!(reader.duration(), SAMPLE_RATE);
    }

    #[test]
    fn export_of_empty_ring_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ring = PcmRing::new(2.0);
        let err = ring
            .export_window(0.0, &dir.path().join("w.wav"))
            .unwrap_err();
        assert!(matches!(err, RingError::EmptyWindow));
    }

    // -- Append-only WAV -------------------------------------------------

    #[tokio::test]
    async fn appends_grow_the_wav_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.wav");

        append_session_audio(&path, &pcm(0.5, 3)).await.unwrap();
        append_session_audio(&path, &pcm(0.25, 4)).await.unwrap();
        append_session_audio(&path, &pcm(0.25, 5)).await.unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, SAMPLE_RATE);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.duration(), SAMPLE_RATE);

        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples[0], 3);
        assert_eq!(samples[samples.len() - 1], 5);
    }

    #[tokio::test]
    async fn truncated_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.wav");
        tokio::fs::write(&path, b"RIFF").await.unwrap();

        let err = append_session_audio(&path, &pcm(0.1, 1)).await.unwrap_err();
        assert!(matches!(err, RingError::CorruptHeader));
    }

    #[tokio::test]
    async fn empty_append_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.wav");
        append_session_audio(&path, &[]).await.unwrap();
        assert!(!path.exists());
    }
}
