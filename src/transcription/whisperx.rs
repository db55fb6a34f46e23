//! Drives the `whisperx` command line tool and decodes its JSON output.

use super::{
    seconds_to_ms, TranscribeError, TranscribedSegment, TranscribedWord, Transcriber,
    TranscriptionResult,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// whisperx invocation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhisperxConfig {
    /// Program to execute
    pub program: PathBuf,
    /// Model name passed through `--model` (None = whisperx default)
    pub model: Option<String>,
    /// Language code passed through `--language` (None = auto-detect)
    pub language: Option<String>,
    /// Directory holding the per-run scratch directories whisperx writes
    /// its JSON into (None = next to the input file)
    pub output_dir: Option<PathBuf>,
    /// Arguments placed before the input file
    pub extra_args: Vec<String>,
}

impl Default for WhisperxConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("whisperx"),
            model: None,
            language: None,
            output_dir: None,
            extra_args: Vec::new(),
        }
    }
}

impl WhisperxConfig {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    segments: Vec<RawSegment>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    text: String,
    start: f64,
    end: f64,
    #[serde(default)]
    words: Vec<RawWord>,
}

#[derive(Debug, Deserialize)]
struct RawWord {
    word: String,
    #[serde(default)]
    start: Option<f64>,
    #[serde(default)]
    end: Option<f64>,
}

/// Transcriber backed by an external whisperx process
#[derive(Debug, Clone, Default)]
pub struct WhisperxTranscriber {
    config: WhisperxConfig,
}

impl WhisperxTranscriber {
    pub fn new(config: WhisperxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WhisperxConfig {
        &self.config
    }

    fn output_dir_for(&self, input: &Path) -> PathBuf {
        match &self.config.output_dir {
            Some(dir) => dir.clone(),
            None => input
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    fn command(&self, input: &Path, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.extra_args)
            .arg(input)
            .arg("--output_format")
            .arg("json")
            .arg("--output_dir")
            .arg(output_dir);
        if let Some(model) = &self.config.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(language) = &self.config.language {
            cmd.arg("--language").arg(language);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transcriber for WhisperxTranscriber {
    async fn transcribe(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<TranscriptionResult, TranscribeError> {
        let program = self.config.program.display().to_string();
        let base_dir = self.output_dir_for(path);
        tokio::fs::create_dir_all(&base_dir).await?;
        // One directory per run: inputs sharing a stem must not see each
        // other's output, nor leftovers from earlier runs.
        let scratch = tempfile::Builder::new()
            .prefix(".whisperx-")
            .tempdir_in(&base_dir)?;
        let output_dir = scratch.path();

        info!("Running {} on {:?}", program, path);

        let mut child = self
            .command(path, output_dir)
            .spawn()
            .map_err(|source| TranscribeError::Invocation {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(|s| tokio::spawn(relay_lines(s, "stdout")));
        let stderr = child.stderr.take().map(|s| tokio::spawn(relay_lines(s, "stderr")));

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = cancel.cancelled() => None,
        };
        let Some(status) = status else {
            info!("Cancelling {} on {:?}", program, path);
            child.kill().await?;
            return Err(TranscribeError::Cancelled);
        };

        for relay in [stdout, stderr].into_iter().flatten() {
            let _ = relay.await;
        }

        if !status.success() {
            return Err(TranscribeError::ExitStatus { program, status });
        }

        let output_path = output_path(path, output_dir);
        let raw = match tokio::fs::read(&output_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TranscribeError::MissingOutput(output_path));
            }
            Err(e) => return Err(e.into()),
        };

        let result = decode_output(&raw)?;
        info!(
            "{} produced {} segments, {} words for {:?}",
            program,
            result.segments.len(),
            result.word_count(),
            path
        );
        Ok(result)
    }
}

/// whisperx names its output after the input file's stem
fn output_path(input: &Path, output_dir: &Path) -> PathBuf {
    let mut name = input.file_stem().unwrap_or(input.as_os_str()).to_os_string();
    name.push(".json");
    output_dir.join(name)
}

async fn relay_lines<R: AsyncRead + Unpin>(stream: R, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream = name, "whisperx: {}", line);
    }
}

/// Decode whisperx JSON into a [`TranscriptionResult`]
pub fn decode_output(raw: &[u8]) -> Result<TranscriptionResult, TranscribeError> {
    let output: RawOutput = serde_json::from_slice(raw)?;

    let segments = output
        .segments
        .into_iter()
        .enumerate()
        .map(|(i, s)| TranscribedSegment {
            index: i as u32,
            text: s.text.trim().to_string(),
            start_ms: seconds_to_ms(s.start),
            end_ms: seconds_to_ms(s.end),
            words: s
                .words
                .into_iter()
                .enumerate()
                .map(|(j, w)| TranscribedWord {
                    index: j as u32,
                    text: w.word.trim().to_string(),
                    start_ms: w.start.map(seconds_to_ms),
                    end_ms: w.end.map(seconds_to_ms),
                })
                .collect(),
        })
        .collect();

    Ok(TranscriptionResult { segments })
}
