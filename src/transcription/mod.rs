//! Transcription module for speech-to-text.
//!
//! The transcription engine itself lives outside this crate. This module
//! defines the shape of its output, the [`Transcriber`] seam the job
//! orchestrator calls through, and the adapters that drive a concrete engine.

#[cfg(feature = "local-whisper")]
pub mod local;
pub mod transcript;
pub mod whisperx;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use transcript::{ExportFormat, Transcript};
pub use whisperx::{WhisperxConfig, WhisperxTranscriber};

#[derive(Error, Debug)]
pub enum TranscribeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to run {program}: {source}")]
    Invocation {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    ExitStatus { program: String, status: std::process::ExitStatus },
    #[error("Transcription output not found: {0}")]
    MissingOutput(PathBuf),
    #[error("Failed to decode transcription output: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Transcription cancelled")]
    Cancelled,
    #[error("Model error: {0}")]
    Model(String),
    #[error("Unsupported audio: {0}")]
    Audio(String),
}

/// A word within a segment. Timings are absent when the engine could not align it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribedWord {
    /// Position within the parent segment
    pub index: u32,
    pub text: String,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

/// A contiguous span of speech
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribedSegment {
    /// Position within the speech, in engine output order
    pub index: u32,
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub words: Vec<TranscribedWord>,
}

/// Everything an engine produced for one media file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub segments: Vec<TranscribedSegment>,
}

impl TranscriptionResult {
    pub fn word_count(&self) -> usize {
        self.segments.iter().map(|s| s.words.len()).sum()
    }
}

/// Turns a media file into timestamped text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe the file at `path`.
    ///
    /// Implementations must stop early and return [`TranscribeError::Cancelled`]
    /// once `cancel` fires.
    async fn transcribe(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<TranscriptionResult, TranscribeError>;
}

/// Convert fractional seconds to whole milliseconds, truncating.
///
/// A tiny epsilon is added before truncation so that values like `0.29`,
/// which are stored as `0.28999...`, land on `290`. Negative and NaN input
/// maps to zero.
pub fn seconds_to_ms(seconds: f64) -> i64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    (seconds * 1000.0 + 1e-6).trunc() as i64
}
