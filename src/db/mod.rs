mod store;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub use store::{Registration, SpeechStore, SqliteStore, StoreError};

pub type DbPool = SqlitePool;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// A submitted media item, keyed by its content fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Speech {
    pub id: i64,
    pub name: String,
    pub fingerprint: String,
    pub transcribed: bool,
}

/// A segment row as stored
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredSegment {
    pub index: i64,
    pub speech_id: i64,
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// A word row as stored
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredWord {
    pub index: i64,
    pub segment_index: i64,
    pub speech_id: i64,
    pub text: String,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

pub async fn init_db(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}
