//! Submission of media files and background transcription jobs.
//!
//! `submit` fingerprints the file and registers it synchronously. Only the
//! call that created the speech row schedules a transcription job; the job
//! runs on the runtime and commits its result through the store. Jobs are
//! tracked per orchestrator so a process can drain them before exiting.

use crate::db::{Registration, Speech, SpeechStore, StoreError};
use crate::fingerprint::fingerprint_file;
use crate::transcription::Transcriber;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Orchestrator is draining, no new submissions are accepted")]
    Draining,
}

pub struct JobOrchestrator {
    store: Arc<dyn SpeechStore>,
    transcriber: Arc<dyn Transcriber>,
    jobs: TaskTracker,
    cancel: CancellationToken,
}

impl JobOrchestrator {
    pub fn new(store: Arc<dyn SpeechStore>, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            store,
            transcriber,
            jobs: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register `path` under `name` and schedule its transcription if the
    /// content has not been seen before.
    ///
    /// Returns as soon as the speech row exists. A new speech comes back with
    /// `transcribed = false`; its job finishes later. Content that is already
    /// registered returns the existing row and schedules nothing.
    pub async fn submit(&self, name: &str, path: impl AsRef<Path>) -> Result<Speech, SubmitError> {
        // Counts as a pending job until this call returns, so a concurrent
        // `wait_all` cannot finish while the submission is half done.
        let _in_flight = self.jobs.token();
        if self.jobs.is_closed() {
            return Err(SubmitError::Draining);
        }

        let path = path.as_ref().to_path_buf();
        let fingerprint = {
            let file = path.clone();
            tokio::task::spawn_blocking(move || fingerprint_file(&file))
                .await
                .map_err(io::Error::other)
                .and_then(|r| r)
                .map_err(|source| SubmitError::Io {
                    path: path.clone(),
                    source,
                })?
        };

        // Draining may have started while hashing; nothing is persisted yet.
        if self.jobs.is_closed() {
            return Err(SubmitError::Draining);
        }

        let speech = match self.store.create_if_absent(name, &fingerprint).await? {
            Registration::Existing(speech) => {
                info!(
                    "{:?} matches speech {} (transcribed: {}), not scheduling",
                    path, speech.id, speech.transcribed
                );
                return Ok(speech);
            }
            Registration::Created(speech) => speech,
        };

        if self.jobs.is_closed() {
            debug!(
                "Speech {} registered while draining, the drain waits for its job",
                speech.id
            );
        }

        self.schedule(speech.clone(), path);
        Ok(speech)
    }

    fn schedule(&self, speech: Speech, path: PathBuf) {
        let store = Arc::clone(&self.store);
        let transcriber = Arc::clone(&self.transcriber);
        let cancel = self.cancel.child_token();

        info!("Scheduling transcription of speech {} from {:?}", speech.id, path);

        self.jobs.spawn(async move {
            debug!("Transcribing speech {} ({})", speech.id, speech.fingerprint);
            let result = match transcriber.transcribe(&path, &cancel).await {
                Ok(result) => result,
                Err(e) => {
                    error!(
                        "Transcription of speech {} ({}) failed: {}",
                        speech.id, speech.fingerprint, e
                    );
                    return;
                }
            };

            if let Err(e) = store.commit_transcription(speech.id, &result).await {
                error!(
                    "Storing transcription of speech {} ({}) failed: {}",
                    speech.id, speech.fingerprint, e
                );
                return;
            }

            info!(
                "Speech {} transcribed: {} segments, {} words",
                speech.id,
                result.segments.len(),
                result.word_count()
            );
        });
    }

    /// Number of jobs that have not finished yet, counting submissions that
    /// are still registering
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Stop accepting submissions and wait for every scheduled job to end.
    ///
    /// Submissions already past registration finish and their jobs are
    /// waited for too; the rest fail with [`SubmitError::Draining`].
    pub async fn wait_all(&self) {
        self.jobs.close();
        let pending = self.jobs.len();
        if pending > 0 {
            info!("Waiting for {} transcription jobs", pending);
        }
        self.jobs.wait().await;
    }

    /// Cancel running transcriptions, then drain.
    pub async fn shutdown(&self) {
        info!("Shutting down, cancelling {} jobs", self.jobs.len());
        self.cancel.cancel();
        self.wait_all().await;
    }
}
