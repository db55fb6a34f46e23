use super::{DbPool, Speech, StoredSegment, StoredWord};
use crate::transcription::{
    TranscribedSegment, TranscribedWord, Transcript, TranscriptionResult,
};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, info};

/// Rows per multi-row INSERT. Keeps every statement well below SQLite's
/// bound parameter limit (32766) for both tables.
const SEGMENT_BATCH: usize = 1000;
const WORD_BATCH: usize = 1000;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Speech {0} not found")]
    SpeechNotFound(i64),
}

/// Outcome of registering a fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// This call inserted the row
    Created(Speech),
    /// A row with the same fingerprint already existed
    Existing(Speech),
}

impl Registration {
    pub fn speech(&self) -> &Speech {
        match self {
            Registration::Created(s) | Registration::Existing(s) => s,
        }
    }

    pub fn into_speech(self) -> Speech {
        match self {
            Registration::Created(s) | Registration::Existing(s) => s,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

/// Durable home of speeches, segments and words.
///
/// Both mutating operations must be safe under arbitrary concurrent calls.
#[async_trait]
pub trait SpeechStore: Send + Sync {
    async fn lookup_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Speech>, StoreError>;

    /// Insert a pending speech unless one with this fingerprint exists.
    ///
    /// The first writer wins: a conflicting call gets the existing row back,
    /// with its original name and current `transcribed` state.
    async fn create_if_absent(&self, name: &str, fingerprint: &str) -> Result<Registration, StoreError>;

    /// Write all segments and words of `result` and mark the speech
    /// transcribed, all in one transaction.
    async fn commit_transcription(
        &self,
        speech_id: i64,
        result: &TranscriptionResult,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn get_speech(&self, id: i64) -> Result<Option<Speech>, StoreError> {
        let speech = sqlx::query_as::<_, Speech>(
            "SELECT id, name, fingerprint, transcribed FROM speeches WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(speech)
    }

    pub async fn segments(&self, speech_id: i64) -> Result<Vec<StoredSegment>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_segments(&mut *conn, speech_id).await?)
    }

    pub async fn words(&self, speech_id: i64) -> Result<Vec<StoredWord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_words(&mut *conn, speech_id).await?)
    }

    /// Load a speech with its segments and words from one consistent snapshot
    pub async fn transcript(&self, speech_id: i64) -> Result<Option<Transcript>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let speech = sqlx::query_as::<_, Speech>(
            "SELECT id, name, fingerprint, transcribed FROM speeches WHERE id = ?",
        )
        .bind(speech_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(speech) = speech else {
            return Ok(None);
        };

        let segments = fetch_segments(&mut *tx, speech_id).await?;
        let words = fetch_words(&mut *tx, speech_id).await?;
        tx.commit().await?;

        Ok(Some(Transcript {
            speech,
            segments: assemble(segments, words),
        }))
    }
}

#[async_trait]
impl SpeechStore for SqliteStore {
    async fn lookup_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Speech>, StoreError> {
        let speech = sqlx::query_as::<_, Speech>(
            "SELECT id, name, fingerprint, transcribed FROM speeches WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(speech)
    }

    async fn create_if_absent(&self, name: &str, fingerprint: &str) -> Result<Registration, StoreError> {
        let inserted = sqlx::query_as::<_, Speech>(
            r#"
            INSERT INTO speeches (name, fingerprint)
            VALUES (?, ?)
            ON CONFLICT (fingerprint) DO NOTHING
            RETURNING id, name, fingerprint, transcribed
            "#,
        )
        .bind(name)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(speech) = inserted {
            info!("Registered speech {} ('{}')", speech.id, speech.name);
            return Ok(Registration::Created(speech));
        }

        // Rows are never deleted, so the conflicting row is still there.
        let existing = self
            .lookup_by_fingerprint(fingerprint)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        debug!(
            "Fingerprint {} already registered as speech {}",
            fingerprint, existing.id
        );
        Ok(Registration::Existing(existing))
    }

    async fn commit_transcription(
        &self,
        speech_id: i64,
        result: &TranscriptionResult,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        match write_transcription(&mut *tx, speech_id, result).await {
            Ok((segments, words)) => {
                tx.commit().await?;
                info!(
                    "Committed {} segments and {} words for speech {}",
                    segments, words, speech_id
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to commit transcription for speech {}: {}", speech_id, e);
                tx.rollback().await?;
                Err(e)
            }
        }
    }
}

async fn write_transcription(
    conn: &mut SqliteConnection,
    speech_id: i64,
    result: &TranscriptionResult,
) -> Result<(u64, u64), StoreError> {
    let segments = insert_segments(conn, speech_id, &result.segments).await?;
    let words = insert_words(conn, speech_id, &result.segments).await?;

    let updated = sqlx::query("UPDATE speeches SET transcribed = 1 WHERE id = ?")
        .bind(speech_id)
        .execute(&mut *conn)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(StoreError::SpeechNotFound(speech_id));
    }

    Ok((segments, words))
}

async fn insert_segments(
    conn: &mut SqliteConnection,
    speech_id: i64,
    segments: &[TranscribedSegment],
) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;

    for batch in segments.chunks(SEGMENT_BATCH) {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"INSERT INTO segments ("index", speech_id, text, start_ms, end_ms) "#,
        );
        query.push_values(batch, |mut row, segment| {
            row.push_bind(segment.index)
                .push_bind(speech_id)
                .push_bind(segment.text.as_str())
                .push_bind(segment.start_ms)
                .push_bind(segment.end_ms);
        });

        inserted += query.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(inserted)
}

async fn insert_words(
    conn: &mut SqliteConnection,
    speech_id: i64,
    segments: &[TranscribedSegment],
) -> Result<u64, sqlx::Error> {
    let words: Vec<(u32, &TranscribedWord)> = segments
        .iter()
        .flat_map(|s| s.words.iter().map(move |w| (s.index, w)))
        .collect();

    let mut inserted = 0;

    for batch in words.chunks(WORD_BATCH) {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"INSERT INTO words ("index", segment_index, speech_id, text, start_ms, end_ms) "#,
        );
        query.push_values(batch, |mut row, (segment_index, word)| {
            row.push_bind(word.index)
                .push_bind(*segment_index)
                .push_bind(speech_id)
                .push_bind(word.text.as_str())
                .push_bind(word.start_ms)
                .push_bind(word.end_ms);
        });

        inserted += query.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(inserted)
}

async fn fetch_segments(
    conn: &mut SqliteConnection,
    speech_id: i64,
) -> Result<Vec<StoredSegment>, sqlx::Error> {
    sqlx::query_as::<_, StoredSegment>(
        r#"
        SELECT "index", speech_id, text, start_ms, end_ms
        FROM segments
        WHERE speech_id = ?
        ORDER BY "index"
        "#,
    )
    .bind(speech_id)
    .fetch_all(&mut *conn)
    .await
}

async fn fetch_words(
    conn: &mut SqliteConnection,
    speech_id: i64,
) -> Result<Vec<StoredWord>, sqlx::Error> {
    sqlx::query_as::<_, StoredWord>(
        r#"
        SELECT "index", segment_index, speech_id, text, start_ms, end_ms
        FROM words
        WHERE speech_id = ?
        ORDER BY segment_index, "index"
        "#,
    )
    .bind(speech_id)
    .fetch_all(&mut *conn)
    .await
}

/// Nest ordered word rows under their ordered segment rows
fn assemble(segments: Vec<StoredSegment>, words: Vec<StoredWord>) -> Vec<TranscribedSegment> {
    let mut position: HashMap<i64, usize> = HashMap::with_capacity(segments.len());
    let mut assembled: Vec<TranscribedSegment> = Vec::with_capacity(segments.len());

    for segment in segments {
        position.insert(segment.index, assembled.len());
        assembled.push(TranscribedSegment {
            index: segment.index as u32,
            text: segment.text,
            start_ms: segment.start_ms,
            end_ms: segment.end_ms,
            words: Vec::new(),
        });
    }

    for word in words {
        if let Some(&pos) = position.get(&word.segment_index) {
            assembled[pos].words.push(TranscribedWord {
                index: word.index as u32,
                text: word.text,
                start_ms: word.start_ms,
                end_ms: word.end_ms,
            });
        }
    }

    assembled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use tempfile::TempDir;

    async fn test_store() -> (SqliteStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("speeches.db").display());
        let pool = init_db(&url, 5).await.unwrap();
        (SqliteStore::new(pool), dir)
    }

    fn word(index: u32, text: &str, start_ms: Option<i64>, end_ms: Option<i64>) -> TranscribedWord {
        TranscribedWord {
            index,
            text: text.to_string(),
            start_ms,
            end_ms,
        }
    }

    fn segment(index: u32, text: &str, start_ms: i64, end_ms: i64) -> TranscribedSegment {
        let words = text
            .split_whitespace()
            .enumerate()
            .map(|(i, w)| word(i as u32, w, Some(start_ms + i as i64 * 10), None))
            .collect();
        TranscribedSegment {
            index,
            text: text.to_string(),
            start_ms,
            end_ms,
            words,
        }
    }

    async fn count(store: &SqliteStore, table: &str, speech_id: i64) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE speech_id = ?",
            table
        ))
        .bind(speech_id)
        .fetch_one(store.pool())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_if_absent_is_first_writer_wins() {
        let (store, _dir) = test_store().await;

        let first = store.create_if_absent("first", "fp-1").await.unwrap();
        assert!(first.is_created());
        assert!(!first.speech().transcribed);

        let second = store.create_if_absent("second", "fp-1").await.unwrap();
        assert!(!second.is_created());
        assert_eq!(second.speech().id, first.speech().id);
        assert_eq!(second.speech().name, "first");

        let other = store.create_if_absent("other", "fp-2").await.unwrap();
        assert!(other.is_created());
        assert_ne!(other.speech().id, first.speech().id);
    }

    #[tokio::test]
    async fn test_lookup_by_fingerprint() {
        let (store, _dir) = test_store().await;

        assert_eq!(store.lookup_by_fingerprint("missing").await.unwrap(), None);

        let created = store.create_if_absent("talk", "fp").await.unwrap().into_speech();
        let found = store.lookup_by_fingerprint("fp").await.unwrap();
        assert_eq!(found, Some(created));
    }

    #[tokio::test]
    async fn test_existing_row_reports_transcribed_state() {
        let (store, _dir) = test_store().await;

        let speech = store.create_if_absent("talk", "fp").await.unwrap().into_speech();
        store
            .commit_transcription(speech.id, &TranscriptionResult::default())
            .await
            .unwrap();

        let again = store.create_if_absent("talk again", "fp").await.unwrap();
        assert!(!again.is_created());
        assert!(again.speech().transcribed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_creates_one_row() {
        let (store, _dir) = test_store().await;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.create_if_absent(&format!("copy {}", i), "same-bytes").await
                })
            })
            .collect();

        let mut registrations = Vec::new();
        for handle in handles {
            registrations.push(handle.await.unwrap().unwrap());
        }

        let created = registrations.iter().filter(|r| r.is_created()).count();
        assert_eq!(created, 1);

        let id = registrations[0].speech().id;
        assert!(registrations.iter().all(|r| r.speech().id == id));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM speeches")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_commit_preserves_order() {
        let (store, _dir) = test_store().await;
        let speech = store.create_if_absent("demo", "fp").await.unwrap().into_speech();

        let result = TranscriptionResult {
            segments: vec![
                segment(0, "first segment here", 0, 1000),
                segment(1, "second one", 1000, 2000),
                segment(2, "third", 2000, 3000),
            ],
        };
        store.commit_transcription(speech.id, &result).await.unwrap();

        let transcript = store.transcript(speech.id).await.unwrap().unwrap();
        assert!(transcript.speech.transcribed);
        assert_eq!(transcript.segments, result.segments);

        let texts: Vec<String> = store
            .segments(speech.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.text)
            .collect();
        assert_eq!(texts, vec!["first segment here", "second one", "third"]);

        let words = store.words(speech.id).await.unwrap();
        assert_eq!(words.len(), 6);
        assert_eq!(
            (words[0].segment_index, words[0].index, words[0].text.as_str()),
            (0, 0, "first")
        );
        assert_eq!(
            (words[4].segment_index, words[4].index, words[4].text.as_str()),
            (1, 1, "one")
        );
        assert_eq!(words[4].start_ms, Some(1010));
        assert_eq!(words[4].end_ms, None);
    }

    #[tokio::test]
    async fn test_failure_after_segments_rolls_everything_back() {
        let (store, _dir) = test_store().await;
        let speech = store.create_if_absent("demo", "fp").await.unwrap().into_speech();

        // Let the segment insert succeed, then fail the word insert.
        sqlx::query(
            "CREATE TRIGGER fail_words BEFORE INSERT ON words \
             BEGIN SELECT RAISE(ABORT, 'simulated failure'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let result = TranscriptionResult {
            segments: vec![segment(0, "hello world", 0, 1000), segment(1, "again", 1000, 1500)],
        };
        let err = store.commit_transcription(speech.id, &result).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));

        assert_eq!(count(&store, "segments", speech.id).await, 0);
        assert_eq!(count(&store, "words", speech.id).await, 0);
        assert!(!store.get_speech(speech.id).await.unwrap().unwrap().transcribed);

        sqlx::query("DROP TRIGGER fail_words")
            .execute(store.pool())
            .await
            .unwrap();
        store.commit_transcription(speech.id, &result).await.unwrap();
        assert_eq!(count(&store, "segments", speech.id).await, 2);
        assert_eq!(count(&store, "words", speech.id).await, 3);
    }

    #[tokio::test]
    async fn test_duplicate_segment_index_aborts_commit() {
        let (store, _dir) = test_store().await;
        let speech = store.create_if_absent("demo", "fp").await.unwrap().into_speech();

        let result = TranscriptionResult {
            segments: vec![segment(0, "one", 0, 10), segment(0, "clash", 10, 20)],
        };
        assert!(store.commit_transcription(speech.id, &result).await.is_err());

        assert_eq!(count(&store, "segments", speech.id).await, 0);
        assert!(!store.get_speech(speech.id).await.unwrap().unwrap().transcribed);
    }

    #[tokio::test]
    async fn test_inverted_times_abort_commit() {
        let (store, _dir) = test_store().await;
        let speech = store.create_if_absent("demo", "fp").await.unwrap().into_speech();

        let backwards_segment = TranscriptionResult {
            segments: vec![segment(0, "fine", 0, 500), segment(1, "backwards", 900, 800)],
        };
        assert!(store.commit_transcription(speech.id, &backwards_segment).await.is_err());
        assert_eq!(count(&store, "segments", speech.id).await, 0);
        assert!(!store.get_speech(speech.id).await.unwrap().unwrap().transcribed);

        let mut backwards_word = segment(0, "fine", 0, 500);
        backwards_word.words = vec![word(0, "fine", Some(300), Some(100))];
        let result = TranscriptionResult {
            segments: vec![backwards_word],
        };
        assert!(store.commit_transcription(speech.id, &result).await.is_err());
        assert_eq!(count(&store, "segments", speech.id).await, 0);
        assert_eq!(count(&store, "words", speech.id).await, 0);
        assert!(!store.get_speech(speech.id).await.unwrap().unwrap().transcribed);

        // Equal bounds and half-timed words are fine
        let mut edge = segment(0, "edge", 500, 500);
        edge.words = vec![word(0, "edge", Some(500), Some(500)), word(1, "late", None, Some(0))];
        store
            .commit_transcription(speech.id, &TranscriptionResult { segments: vec![edge] })
            .await
            .unwrap();
        assert_eq!(count(&store, "words", speech.id).await, 2);
    }

    #[tokio::test]
    async fn test_commit_for_unknown_speech_fails() {
        let (store, _dir) = test_store().await;

        let err = store
            .commit_transcription(404, &TranscriptionResult::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SpeechNotFound(404)));

        let result = TranscriptionResult {
            segments: vec![segment(0, "orphan", 0, 10)],
        };
        assert!(store.commit_transcription(404, &result).await.is_err());
        assert_eq!(count(&store, "segments", 404).await, 0);
    }

    #[tokio::test]
    async fn test_commit_spans_multiple_batches() {
        let (store, _dir) = test_store().await;
        let speech = store.create_if_absent("long", "fp").await.unwrap().into_speech();

        let segments: Vec<_> = (0..(SEGMENT_BATCH as u32 + 500))
            .map(|i| segment(i, "one two three", i as i64 * 1000, i as i64 * 1000 + 900))
            .collect();
        let total_words: usize = segments.iter().map(|s| s.words.len()).sum();
        assert!(total_words > 2 * WORD_BATCH);

        store
            .commit_transcription(speech.id, &TranscriptionResult { segments })
            .await
            .unwrap();

        assert_eq!(count(&store, "segments", speech.id).await, SEGMENT_BATCH as i64 + 500);
        assert_eq!(count(&store, "words", speech.id).await, total_words as i64);
    }

    #[tokio::test]
    async fn test_transcript_for_unknown_speech() {
        let (store, _dir) = test_store().await;
        assert!(store.transcript(1).await.unwrap().is_none());
        assert!(store.get_speech(1).await.unwrap().is_none());
    }
}
