use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use speeches::config::{Backend, Config};
use speeches::db::{self, SpeechStore, SqliteStore};
use speeches::fingerprint::fingerprint_file;
use speeches::jobs::JobOrchestrator;
use speeches::transcription::{ExportFormat, Transcriber, WhisperxTranscriber};

#[derive(Parser)]
#[command(name = "speeches", version, about = "Content-addressed speech transcription")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register media files and transcribe any new content
    Submit {
        /// Media files to submit
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Display name; defaults to each file's stem
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Look up the speech registered for a file's content
    Status { file: PathBuf },
    /// Print a stored transcript
    Show {
        id: i64,
        #[arg(short, long, default_value = "text")]
        format: ExportFormat,
        /// Also write the export under exports/
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Invalid configuration")?;

    let pool = db::init_db(&config.database_url, config.max_connections)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized successfully");
    let store = SqliteStore::new(pool);

    match cli.command {
        Command::Submit { files, name } => submit(store, &config, files, name).await,
        Command::Status { file } => status(&store, &file).await,
        Command::Show { id, format, save } => show(&store, id, format, save).await,
    }
}

async fn submit(
    store: SqliteStore,
    config: &Config,
    files: Vec<PathBuf>,
    name: Option<String>,
) -> anyhow::Result<()> {
    if name.is_some() && files.len() > 1 {
        bail!("--name can only be used with a single file");
    }

    let transcriber = build_transcriber(&config.backend).await?;
    let jobs = JobOrchestrator::new(Arc::new(store), transcriber);

    for file in &files {
        let name = match &name {
            Some(name) => name.clone(),
            None => display_name(file),
        };
        match jobs.submit(&name, file).await {
            Ok(speech) => println!("{}", serde_json::to_string(&speech)?),
            Err(e) => warn!("Failed to submit {:?}: {}", file, e),
        }
    }

    tokio::select! {
        _ = jobs.wait_all() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling {} pending job(s)", jobs.pending_jobs());
            jobs.shutdown().await;
        }
    }

    Ok(())
}

async fn status(store: &SqliteStore, file: &Path) -> anyhow::Result<()> {
    let path = file.to_path_buf();
    let fingerprint = tokio::task::spawn_blocking(move || fingerprint_file(&path))
        .await?
        .with_context(|| format!("Failed to read {:?}", file))?;

    match store.lookup_by_fingerprint(&fingerprint).await? {
        Some(speech) => println!("{}", serde_json::to_string(&speech)?),
        None => bail!("No speech registered for {:?} ({})", file, fingerprint),
    }
    Ok(())
}

async fn show(store: &SqliteStore, id: i64, format: ExportFormat, save: bool) -> anyhow::Result<()> {
    let Some(transcript) = store.transcript(id).await? else {
        bail!("No speech with id {}", id);
    };
    if !transcript.speech.transcribed {
        warn!("Speech {} has not been transcribed yet", id);
    }

    let output = transcript.export(format);
    if save {
        std::fs::create_dir_all("exports").context("Failed to create exports directory")?;
        let path = PathBuf::from("exports").join(format!(
            "{}.{}",
            transcript.speech.name,
            format.extension()
        ));
        std::fs::write(&path, &output).with_context(|| format!("Failed to write {:?}", path))?;
        info!("Saved transcript to {:?}", path);
    }
    println!("{}", output);
    Ok(())
}

fn display_name(file: &Path) -> String {
    file.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}

async fn build_transcriber(backend: &Backend) -> anyhow::Result<Arc<dyn Transcriber>> {
    match backend {
        Backend::Whisperx(config) => {
            info!("Using whisperx at {:?}", config.program);
            Ok(Arc::new(WhisperxTranscriber::new(config.clone())))
        }
        #[cfg(feature = "local-whisper")]
        Backend::Local { model } => {
            use speeches::transcription::local::{LocalTranscriber, WhisperModel};

            let model: WhisperModel = model.parse().map_err(anyhow::Error::msg)?;
            let transcriber = tokio::task::spawn_blocking(move || LocalTranscriber::new(model, None))
                .await?
                .context("Failed to load Whisper model")?;
            Ok(Arc::new(transcriber))
        }
        #[cfg(not(feature = "local-whisper"))]
        Backend::Local { .. } => {
            bail!("TRANSCRIBER=local requires building with the `local-whisper` feature")
        }
    }
}
