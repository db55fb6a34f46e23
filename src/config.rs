use std::env;
use std::path::PathBuf;
use thiserror::Error;

use crate::transcription::WhisperxConfig;

const DEFAULT_DATABASE_URL: &str = "sqlite:data/speeches.db";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Which engine turns audio into text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// External whisperx program
    Whisperx(WhisperxConfig),
    /// In-process whisper.cpp; the value is the model size name
    Local { model: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub backend: Backend,
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let max_connections = match var("DB_MAX_CONNECTIONS") {
            Some(value) => match value.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "DB_MAX_CONNECTIONS",
                        value,
                    });
                }
            },
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let backend = match var("TRANSCRIBER").as_deref().unwrap_or("whisperx") {
            "whisperx" => {
                let mut whisperx = WhisperxConfig::default();
                if let Some(program) = var("WHISPERX_BIN") {
                    whisperx.program = PathBuf::from(program);
                }
                whisperx.model = var("WHISPERX_MODEL");
                whisperx.language = var("WHISPERX_LANGUAGE");
                whisperx.output_dir = var("WHISPERX_OUTPUT_DIR").map(PathBuf::from);
                Backend::Whisperx(whisperx)
            }
            "local" => Backend::Local {
                model: var("WHISPER_MODEL").unwrap_or_else(|| "base".to_string()),
            },
            other => {
                return Err(ConfigError::Invalid {
                    name: "TRANSCRIBER",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            database_url,
            max_connections,
            backend,
        })
    }
}
