// SPDX-License-Identifier: MIT OR Apache-2.0
//! Segment promotion: converging repeated hypotheses into a stable list.
//!
//! Overlap re-decoding means the engine keeps re-reporting spans it has
//! already transcribed. A decoded segment is promoted only when it extends
//! past the covered timeline and is not a repetition of what was just
//! accepted.

use scriba_core::Segment;
use std::collections::VecDeque;

/// Time slack when deciding whether a span is already covered.
const COVERAGE_EPSILON: f64 = 1e-3;

/// Accumulated live-session transcript with deduplication state.
#[derive(Debug)]
pub struct SegmentAccumulator {
    segments: Vec<Segment>,
    last_t_end: f64,
    recent_texts: VecDeque<(String, f64)>,
    repeat_window: f64,
    repeat_max: u32,
}

impl SegmentAccumulator {
    /// Create an accumulator with the given repetition guard settings.
    ///
    /// The recent-text history holds `max(8, repeat_max * 4)` entries.
    #[must_use]
    pub fn new(repeat_window: f64, repeat_max: u32) -> Self {
        let history = (repeat_max.max(1) as usize * 4).max(8);
        Self {
            segments: Vec::new(),
            last_t_end: 0.0,
            recent_texts: VecDeque::with_capacity(history),
            repeat_window: repeat_window.max(0.0),
            repeat_max,
        }
    }

    /// High-water mark of the covered timeline, in seconds.
    #[must_use]
    pub fn last_t_end(&self) -> f64 {
        self.last_t_end
    }

    /// The stable segment list accepted so far.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Consume the accumulator, returning the stable list.
    #[must_use]
    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    /// Offer the segments decoded from one window, whose times are relative
    /// to `window_offset`. Returns the newly promoted segments.
    pub fn offer(&mut self, decoded: &[Segment], window_offset: f64) -> Vec<Segment> {
        let mut promoted = Vec::new();
        for segment in decoded {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            let abs_start = window_offset + segment.start;
            let abs_end = window_offset + segment.end;

            let mut accept = abs_end > self.last_t_end + COVERAGE_EPSILON;

            if accept {
                if let Some(prev) = self.segments.last() {
                    if prev.text == text
                        && (prev.start - abs_start).abs() < 0.5
                        && (prev.end - abs_end).abs() < 0.5
                    {
                        accept = false;
                    }
                }
            }

            if accept && self.repeat_max > 0 {
                let repeats = self
                    .recent_texts
                    .iter()
                    .filter(|(recent, start)| {
                        recent.as_str() == text && abs_start - *start <= self.repeat_window
                    })
                    .count();
                if repeats >= self.repeat_max as usize {
                    accept = false;
                }
            }

            // The timeline advances even for dropped hypotheses so a
            // rejected repeat is not re-offered by the next window.
            self.last_t_end = self.last_t_end.max(abs_end);
            if !accept {
                continue;
            }

            let normalized = Segment {
                start: abs_start,
                end: abs_end,
                speaker: segment.speaker.clone(),
                text: text.to_string(),
            };
            let history = (self.repeat_max.max(1) as usize * 4).max(8);
            if self.recent_texts.len() == history {
                self.recent_texts.pop_front();
            }
            self.recent_texts.push_back((text.to_string(), abs_start));
            self.segments.push(normalized.clone());
            promoted.push(normalized);
        }
        promoted
    }
}
