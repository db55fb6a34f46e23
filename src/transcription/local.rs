//! In-process whisper.cpp transcription for WAV files.
//!
//! Models are fetched from Hugging Face on first use. Inference runs on the
//! blocking thread pool; cancellation is observed before and after it, since
//! whisper.cpp cannot be interrupted mid-run.

use super::{TranscribeError, TranscribedSegment, TranscribedWord, Transcriber, TranscriptionResult};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Whisper's required sample rate
pub const WHISPER_SAMPLE_RATE: u32 = 16000;

/// Available Whisper model sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhisperModel {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl WhisperModel {
    pub fn filename(&self) -> &'static str {
        match self {
            WhisperModel::Tiny => "ggml-tiny.bin",
            WhisperModel::Base => "ggml-base.bin",
            WhisperModel::Small => "ggml-small.bin",
            WhisperModel::Medium => "ggml-medium.bin",
            WhisperModel::Large => "ggml-large-v3.bin",
        }
    }

    pub fn hf_url(&self) -> String {
        format!(
            "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/{}",
            self.filename()
        )
    }

    /// Approximate model size in MB
    pub fn size_mb(&self) -> u64 {
        match self {
            WhisperModel::Tiny => 75,
            WhisperModel::Base => 142,
            WhisperModel::Small => 466,
            WhisperModel::Medium => 1500,
            WhisperModel::Large => 3100,
        }
    }
}

impl std::fmt::Display for WhisperModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WhisperModel::Tiny => "tiny",
            WhisperModel::Base => "base",
            WhisperModel::Small => "small",
            WhisperModel::Medium => "medium",
            WhisperModel::Large => "large",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for WhisperModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(WhisperModel::Tiny),
            "base" => Ok(WhisperModel::Base),
            "small" => Ok(WhisperModel::Small),
            "medium" => Ok(WhisperModel::Medium),
            "large" => Ok(WhisperModel::Large),
            _ => Err(format!("Unknown model: {}. Use tiny, base, small, medium, or large", s)),
        }
    }
}

pub fn models_dir() -> PathBuf {
    PathBuf::from("models").join("whisper")
}

pub fn model_path(model: WhisperModel) -> PathBuf {
    models_dir().join(model.filename())
}

/// A model counts as present once at least half its expected size is on disk
pub fn is_model_downloaded(model: WhisperModel) -> bool {
    fs::metadata(model_path(model))
        .map(|m| m.len() >= model.size_mb() * 1024 * 1024 / 2)
        .unwrap_or(false)
}

/// Fetch a model unless it is already present. Blocking.
pub fn download_model(model: WhisperModel) -> Result<PathBuf, TranscribeError> {
    let path = model_path(model);
    if is_model_downloaded(model) {
        info!("Model {} already downloaded at {:?}", model, path);
        return Ok(path);
    }

    fs::create_dir_all(models_dir())?;
    info!("Downloading Whisper {} model (~{}MB)...", model, model.size_mb());

    let url = model.hf_url();
    let mut response = reqwest::blocking::Client::new()
        .get(&url)
        .send()
        .map_err(|e| TranscribeError::Model(format!("HTTP request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(TranscribeError::Model(format!(
            "HTTP {} from {}",
            response.status(),
            url
        )));
    }

    let pb = indicatif::ProgressBar::new(response.content_length().unwrap_or(0));
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .map_err(|e| TranscribeError::Model(e.to_string()))?
            .progress_chars("#>-"),
    );

    let temp_path = path.with_extension("bin.tmp");
    let mut file = pb.wrap_write(File::create(&temp_path)?);
    io::copy(&mut response, &mut file)?;
    pb.finish_with_message("Download complete");

    fs::rename(&temp_path, &path)?;
    info!("Model downloaded to {:?}", path);

    Ok(path)
}

/// whisper.cpp running inside this process
pub struct LocalTranscriber {
    ctx: Arc<WhisperContext>,
    model: WhisperModel,
    language: Option<String>,
    n_threads: i32,
}

impl LocalTranscriber {
    /// Load (downloading if needed) a model. Blocking; call it off the async runtime.
    pub fn new(model: WhisperModel, language: Option<String>) -> Result<Self, TranscribeError> {
        let path = download_model(model)?;
        let path = path
            .to_str()
            .ok_or_else(|| TranscribeError::Model(format!("Non UTF-8 model path {:?}", path)))?;

        info!("Loading Whisper {} model...", model);
        let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| TranscribeError::Model(format!("Failed to load model: {}", e)))?;

        let n_threads = std::thread::available_parallelism()
            .map(|p| p.get() as i32)
            .unwrap_or(4);
        info!("Whisper model loaded (using {} threads)", n_threads);

        Ok(Self {
            ctx: Arc::new(ctx),
            model,
            language,
            n_threads,
        })
    }

    pub fn model(&self) -> WhisperModel {
        self.model
    }
}

#[async_trait]
impl Transcriber for LocalTranscriber {
    async fn transcribe(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<TranscriptionResult, TranscribeError> {
        if cancel.is_cancelled() {
            return Err(TranscribeError::Cancelled);
        }

        let ctx = Arc::clone(&self.ctx);
        let language = self.language.clone();
        let n_threads = self.n_threads;
        let path = path.to_path_buf();

        let inference = tokio::task::spawn_blocking(move || {
            let samples = load_wav(&path)?;
            info!(
                "Transcribing {:?} ({:.1}s of audio)",
                path,
                samples.len() as f32 / WHISPER_SAMPLE_RATE as f32
            );
            run_whisper(&ctx, &samples, language.as_deref(), n_threads)
        });

        tokio::select! {
            joined = inference => joined.map_err(|e| TranscribeError::Model(e.to_string()))?,
            _ = cancel.cancelled() => Err(TranscribeError::Cancelled),
        }
    }
}

fn run_whisper(
    ctx: &WhisperContext,
    samples: &[f32],
    language: Option<&str>,
    n_threads: i32,
) -> Result<TranscriptionResult, TranscribeError> {
    let failed = |what: &str, e: whisper_rs::WhisperError| {
        TranscribeError::Model(format!("{}: {}", what, e))
    };

    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_n_threads(n_threads);
    params.set_language(Some(language.unwrap_or("auto")));
    params.set_translate(false);
    params.set_token_timestamps(true);
    params.set_no_context(true);
    params.set_suppress_non_speech_tokens(true);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);
    params.set_print_special(false);

    let mut state = ctx.create_state().map_err(|e| failed("Failed to create state", e))?;
    state
        .full(params, samples)
        .map_err(|e| failed("Inference failed", e))?;

    let num_segments = state
        .full_n_segments()
        .map_err(|e| failed("Failed to get segments", e))?;

    let mut segments = Vec::new();
    for i in 0..num_segments {
        let text = state
            .full_get_segment_text(i)
            .map_err(|e| failed("Failed to get text", e))?;
        let text = text.trim().to_string();
        if text.is_empty() {
            continue;
        }

        // Timestamps are in centiseconds
        let t0 = state
            .full_get_segment_t0(i)
            .map_err(|e| failed("Failed to get start time", e))?;
        let t1 = state
            .full_get_segment_t1(i)
            .map_err(|e| failed("Failed to get end time", e))?;

        let n_tokens = state
            .full_n_tokens(i)
            .map_err(|e| failed("Failed to get tokens", e))?;
        let mut tokens = Vec::with_capacity(n_tokens as usize);
        for t in 0..n_tokens {
            let token_text = state
                .full_get_token_text(i, t)
                .map_err(|e| failed("Failed to get token text", e))?;
            let data = state
                .full_get_token_data(i, t)
                .map_err(|e| failed("Failed to get token data", e))?;
            tokens.push((token_text, data.t0, data.t1));
        }

        segments.push(TranscribedSegment {
            index: segments.len() as u32,
            text,
            start_ms: t0.max(0) * 10,
            end_ms: t1.max(t0).max(0) * 10,
            words: words_from_tokens(tokens),
        });
    }

    Ok(TranscriptionResult { segments })
}

/// Merge sub-word tokens into words. A token starting with whitespace opens a
/// new word; special tokens (`[_BEG_]`, `<|en|>`, ...) are dropped.
fn words_from_tokens(tokens: Vec<(String, i64, i64)>) -> Vec<TranscribedWord> {
    let mut words: Vec<TranscribedWord> = Vec::new();

    for (text, t0, t1) in tokens {
        if text.starts_with("[_") || text.starts_with("<|") || text.trim().is_empty() {
            continue;
        }

        let start_ms = (t0 >= 0).then_some(t0 * 10);
        let end_ms = (t1 >= 0).then_some(t1.max(t0) * 10);

        if !text.starts_with(char::is_whitespace) {
            if let Some(word) = words.last_mut() {
                word.text.push_str(&text);
                if end_ms.is_some() {
                    word.end_ms = end_ms.max(word.start_ms);
                }
                continue;
            }
        }

        words.push(TranscribedWord {
            index: words.len() as u32,
            text: text.trim_start().to_string(),
            start_ms,
            end_ms,
        });
    }

    words
}

/// Load a WAV file as 16 kHz mono f32
fn load_wav(path: &Path) -> Result<Vec<f32>, TranscribeError> {
    let audio = |e: hound::Error| TranscribeError::Audio(format!("{:?}: {}", path, e));

    let mut reader = hound::WavReader::open(path).map_err(audio)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(audio)?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(audio)?
        }
    };

    let mono = mixdown(&interleaved, spec.channels as usize);
    Ok(resample(&mono, spec.sample_rate, WHISPER_SAMPLE_RATE))
}

/// Average interleaved channels into one
fn mixdown(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear interpolation resampler
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}
