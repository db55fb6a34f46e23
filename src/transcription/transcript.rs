//! Stored transcripts and export formatters.
//!
//! Supports JSON, SRT, WebVTT and plain text output.

use super::TranscribedSegment;
use crate::db::Speech;
use serde::{Deserialize, Serialize};
use std::fmt::Write as FmtWrite;

/// A speech together with everything that was persisted for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub speech: Speech,
    /// Segments in index order, each with its words in index order
    pub segments: Vec<TranscribedSegment>,
}

impl Transcript {
    /// Get full text (all segments concatenated)
    pub fn full_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Export to the specified format
    pub fn export(&self, format: ExportFormat) -> String {
        match format {
            ExportFormat::Json => serde_json::to_string(self).unwrap_or_default(),
            ExportFormat::JsonPretty => serde_json::to_string_pretty(self).unwrap_or_default(),
            ExportFormat::Srt => self.to_srt(),
            ExportFormat::Vtt => self.to_vtt(),
            ExportFormat::Text => self.to_text(),
        }
    }

    pub fn to_srt(&self) -> String {
        let mut output = String::new();

        for (i, segment) in self.segments.iter().enumerate() {
            let _ = writeln!(output, "{}", i + 1);
            let _ = writeln!(
                output,
                "{} --> {}",
                format_cue_time(segment.start_ms, ','),
                format_cue_time(segment.end_ms, ',')
            );
            let _ = writeln!(output, "{}", segment.text);
            let _ = writeln!(output);
        }

        output
    }

    pub fn to_vtt(&self) -> String {
        let mut output = String::from("WEBVTT\n\n");

        for (i, segment) in self.segments.iter().enumerate() {
            let _ = writeln!(output, "{}", i + 1);
            let _ = writeln!(
                output,
                "{} --> {}",
                format_cue_time(segment.start_ms, '.'),
                format_cue_time(segment.end_ms, '.')
            );
            let _ = writeln!(output, "{}", segment.text);
            let _ = writeln!(output);
        }

        output
    }

    /// Plain text, one `[MM:SS] text` line per segment
    pub fn to_text(&self) -> String {
        let mut output = String::new();

        for segment in &self.segments {
            let _ = writeln!(output, "[{}] {}", format_timestamp(segment.start_ms), segment.text);
        }

        output
    }
}

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Compact JSON
    Json,
    /// Pretty-printed JSON
    JsonPretty,
    /// SubRip subtitle format
    Srt,
    /// WebVTT subtitle format
    Vtt,
    /// Plain text with timestamps
    Text,
}

impl ExportFormat {
    /// Get file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json | ExportFormat::JsonPretty => "json",
            ExportFormat::Srt => "srt",
            ExportFormat::Vtt => "vtt",
            ExportFormat::Text => "txt",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "json-pretty" | "json_pretty" => Ok(ExportFormat::JsonPretty),
            "srt" => Ok(ExportFormat::Srt),
            "vtt" | "webvtt" => Ok(ExportFormat::Vtt),
            "txt" | "text" => Ok(ExportFormat::Text),
            _ => Err(format!("Unknown format: {}. Use json, json-pretty, srt, vtt or text", s)),
        }
    }
}

/// HH:MM:SS<sep>mmm, SRT uses ',' and VTT uses '.'
fn format_cue_time(ms: i64, separator: char) -> String {
    let total_ms = ms.max(0);
    let millis = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    let mins = total_mins % 60;
    let hours = total_mins / 60;

    format!("{:02}:{:02}:{:02}{}{:03}", hours, mins, secs, separator, millis)
}

/// MM:SS, or HH:MM:SS past the first hour
fn format_timestamp(ms: i64) -> String {
    let total_secs = ms.max(0) / 1000;
    let secs = total_secs % 60;
    let mins = total_secs / 60;

    if mins >= 60 {
        format!("{:02}:{:02}:{:02}", mins / 60, mins % 60, secs)
    } else {
        format!("{:02}:{:02}", mins, secs)
    }
}
