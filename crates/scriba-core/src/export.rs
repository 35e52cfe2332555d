// SPDX-License-Identifier: MIT OR Apache-2.0
//! Export rendering for completed transcripts.
//!
//! Three formats are offered for download: plain text, a markdown document
//! with a metadata header, and SubRip subtitles.

use crate::{Job, Segment, UnknownVariant};
use std::fmt;
use std::str::FromStr;

/// Requested download format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    /// Raw UTF-8 transcript text.
    Txt,
    /// Markdown with a metadata header block.
    Md,
    /// SubRip subtitles.
    Srt,
}

impl ExportFormat {
    /// File extension for `Content-Disposition` filenames.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Txt => "txt",
            ExportFormat::Md => "md",
            ExportFormat::Srt => "srt",
        }
    }

    /// MIME type served for this format.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Txt => "text/plain; charset=utf-8",
            ExportFormat::Md => "text/markdown; charset=utf-8",
            ExportFormat::Srt => "application/x-subrip",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "txt" => Ok(ExportFormat::Txt),
            "md" => Ok(ExportFormat::Md),
            "srt" => Ok(ExportFormat::Srt),
            other => Err(UnknownVariant {
                field: "export format",
                value: other.to_string(),
            }),
        }
    }
}

/// Renders the transcript in the requested format.
#[must_use]
pub fn render(job: &Job, transcript: &str, format: ExportFormat) -> String {
    match format {
        ExportFormat::Txt => transcript.to_string(),
        ExportFormat::Md => render_md(job, transcript),
        ExportFormat::Srt => render_srt(&job.segments, transcript),
    }
}

fn render_md(job: &Job, transcript: &str) -> String {
    let title = job.title.as_deref().unwrap_or("Transcripción");
    let language = job.language.as_deref().unwrap_or("desconocido");
    format!(
        "# {title}\n\n- Idioma: {language}\n- Perfil: {profile}\n\n{transcript}",
        profile = job.quality_profile
    )
}

/// Renders SubRip entries from the segment list, one entry per segment.
///
/// A job with no segments still produces a single entry covering the whole
/// transcript so players have something to show.
fn render_srt(segments: &[Segment], transcript: &str) -> String {
    let mut entries = Vec::new();
    for (index, segment) in segments
        .iter()
        .filter(|s| !s.text.trim().is_empty())
        .enumerate()
    {
        entries.push(format!(
            "{}\n{} --> {}\n{}\n",
            index + 1,
            srt_timestamp(segment.start),
            srt_timestamp(segment.end),
            segment.text.trim()
        ));
    }
    if entries.is_empty() {
        entries.push(format!(
            "1\n{} --> {}\n{}\n",
            srt_timestamp(0.0),
            srt_timestamp(5.0),
            transcript.trim()
        ));
    }
    let mut out = entries.join("\n");
    out.push('\n');
    out
}

/// Formats seconds as `HH:MM:SS,mmm`.
#[must_use]
pub fn srt_timestamp(seconds: f64) -> String {
    let total_ms = (seconds * 1000.0).round().max(0.0) as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobState, QualityProfile};
    use chrono::Utc;
    use uuid::Uuid;

    fn completed_job(segments: Vec<Segment>) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            envelope_id: "env".into(),
            state: JobState::Completed,
            quality_profile: QualityProfile::Balanced,
            language: Some("es".into()),
            title: Some("Reunión semanal".into()),
            tags: vec![],
            audio_key: "a.wav".into(),
            transcript_key: Some("a.wav.txt".into()),
            segments,
            duration_seconds: Some(4.0),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        }
    }

    #[test]
    fn txt_is_verbatim() {
        let job = completed_job(vec![]);
        assert_eq!(render(&job, "hola mundo", ExportFormat::Txt), "hola mundo");
    }

    #[test]
    fn md_carries_header_block() {
        let job = completed_job(vec![]);
        let md = render(&job, "hola mundo", ExportFormat::Md);
        assert!(md.starts_with("# Reunión semanal\n\n"));
        assert!(md.contains("- Idioma: es\n"));
        assert!(md.contains("- Perfil: balanced\n"));
        assert!(md.ends_with("hola mundo"));
    }

    #[test]
    fn srt_sequential_indices_and_timestamps() {
        let job = completed_job(vec![
            Segment {
                start: 0.0,
                end: 1.5,
                speaker: "SPEAKER_00".into(),
                text: "hola".into(),
            },
            Segment {
                start: 1.5,
                end: 3.0,
                speaker: "SPEAKER_00".into(),
                text: "mundo".into(),
            },
        ]);
        let srt = render(&job, "hola mundo", ExportFormat::Srt);
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:01,500\nhola\n"));
        assert!(srt.contains("2\n00:00:01,500 --> 00:00:03,000\nmundo\n"));
    }

    #[test]
    fn srt_falls_back_to_whole_transcript() {
        let job = completed_job(vec![]);
        let srt = render(&job, "hola mundo", ExportFormat::Srt);
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:05,000\nhola mundo\n"));
    }

    #[test]
    fn srt_timestamp_rollover() {
        assert_eq!(srt_timestamp(3661.25), "01:01:01,250");
        assert_eq!(srt_timestamp(0.0005), "00:00:00,001");
        assert_eq!(srt_timestamp(-1.0), "00:00:00,000");
    }

    #[test]
    fn format_parse() {
        assert_eq!("SRT".parse::<ExportFormat>().unwrap(), ExportFormat::Srt);
        assert!("pdf".parse::<ExportFormat>().is_err());
    }
}
