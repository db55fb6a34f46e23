//! Content-addressed speech transcription.
//!
//! Media files are fingerprinted and registered once per distinct content;
//! new content is transcribed in the background and stored as a
//! speech → segments → words hierarchy in SQLite.

pub mod config;
pub mod db;
pub mod fingerprint;
pub mod jobs;
pub mod transcription;

pub use db::{Speech, SpeechStore, SqliteStore};
pub use jobs::{JobOrchestrator, SubmitError};
