//! SQLite-backed paste store.
//!
//! Records are kept as JSON next to the columns the store filters on. The
//! `version` column is the compare-and-swap token: conditional updates run in
//! an immediate transaction and only write when the version still matches.
//! Every statement runs on the blocking pool, never on a runtime worker.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Params, TransactionBehavior};

use crate::{
    compute_stats, OwnerId, PasteRecord, PasteStore, RecordMutator, StoreError, StoreStats,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pastes (
    id              TEXT PRIMARY KEY,
    owner           TEXT,
    expires_at      INTEGER,
    burn_after_read INTEGER NOT NULL DEFAULT 0,
    view_count      INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL,
    version         INTEGER NOT NULL DEFAULT 0,
    record          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pastes_owner ON pastes(owner);
CREATE INDEX IF NOT EXISTS idx_pastes_expires_at ON pastes(expires_at);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub struct SqlitePasteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePasteStore {
    /// Opens (or creates) the database file and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `op` against the connection on tokio's blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&mut conn)
        })
        .await
        .map_err(|err| StoreError::Backend(format!("sqlite task failed: {err}")))?
    }
}

fn encode(record: &PasteRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|err| StoreError::Backend(err.to_string()))
}

fn decode(json: &str, version: i64) -> Result<PasteRecord, StoreError> {
    let mut record: PasteRecord =
        serde_json::from_str(json).map_err(|err| StoreError::Backend(err.to_string()))?;
    record.version = version as u64;
    Ok(record)
}

fn millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|ts| ts.timestamp_millis())
}

fn load_records<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<PasteRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut records = Vec::new();
    for row in rows {
        let (json, version) = row?;
        records.push(decode(&json, version)?);
    }
    Ok(records)
}

fn update_versioned(
    conn: &mut Connection,
    id: &str,
    expected_version: u64,
    mutator: RecordMutator,
) -> Result<PasteRecord, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let row: Option<(String, i64)> = tx
        .query_row(
            "SELECT record, version FROM pastes WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((json, actual)) = row else {
        return Err(StoreError::NotFound(id.to_string()));
    };
    if actual as u64 != expected_version {
        return Err(StoreError::Conflict {
            id: id.to_string(),
            expected: expected_version,
            actual: actual as u64,
        });
    }

    let mut next = decode(&json, actual)?;
    mutator(&mut next);
    next.id = id.to_string();
    next.version = expected_version + 1;

    let changed = tx.execute(
        "UPDATE pastes
            SET owner = ?1, expires_at = ?2, burn_after_read = ?3, view_count = ?4,
                version = ?5, record = ?6
          WHERE id = ?7 AND version = ?8",
        params![
            next.owner.as_ref().map(OwnerId::as_str),
            millis(next.expires_at),
            next.burn_after_read,
            next.view_count as i64,
            next.version as i64,
            encode(&next)?,
            id,
            expected_version as i64,
        ],
    )?;
    if changed != 1 {
        return Err(StoreError::Conflict {
            id: id.to_string(),
            expected: expected_version,
            actual: actual as u64,
        });
    }
    tx.commit()?;
    Ok(next)
}

#[async_trait]
impl PasteStore for SqlitePasteStore {
    async fn insert(&self, record: PasteRecord) -> Result<(), StoreError> {
        let json = encode(&record)?;
        self.run(move |conn| {
            let result = conn.execute(
                "INSERT INTO pastes (id, owner, expires_at, burn_after_read, view_count, created_at, version, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.owner.as_ref().map(OwnerId::as_str),
                    millis(record.expires_at),
                    record.burn_after_read,
                    record.view_count as i64,
                    record.created_at.timestamp_millis(),
                    record.version as i64,
                    json,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Duplicate(record.id))
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<PasteRecord>, StoreError> {
        let id = id.to_string();
        self.run(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT record, version FROM pastes WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            row.map(|(json, version)| decode(&json, version)).transpose()
        })
        .await
    }

    async fn conditional_update(
        &self,
        id: &str,
        expected_version: u64,
        mutator: RecordMutator,
    ) -> Result<PasteRecord, StoreError> {
        let id = id.to_string();
        self.run(move |conn| update_versioned(conn, &id, expected_version, mutator))
            .await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.run(move |conn| {
            let removed = conn.execute("DELETE FROM pastes WHERE id = ?1", params![id])?;
            if removed == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<PasteRecord>, StoreError> {
        let owner = owner.clone();
        self.run(move |conn| {
            load_records(
                conn,
                "SELECT record, version FROM pastes WHERE owner = ?1 ORDER BY created_at DESC",
                params![owner.as_str()],
            )
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            // Millisecond columns only narrow the candidates; the record decides.
            let candidates = load_records(
                &tx,
                "SELECT record, version FROM pastes
                  WHERE (expires_at IS NOT NULL AND expires_at <= ?1)
                     OR (burn_after_read = 1 AND view_count > 0)",
                params![now.timestamp_millis()],
            )?;

            let mut removed = 0;
            for record in candidates.iter().filter(|record| !record.is_live(now)) {
                removed += tx.execute("DELETE FROM pastes WHERE id = ?1", params![record.id])?;
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
        self.run(move |conn| {
            let records = load_records(conn, "SELECT record, version FROM pastes", [])?;
            Ok(compute_stats(&records, now))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StoredContent, Visibility};
    use chrono::Duration as ChronoDuration;

    fn record(id: &str, owner: &str, now: DateTime<Utc>) -> PasteRecord {
        PasteRecord {
            id: id.to_string(),
            owner: Some(OwnerId::new(owner)),
            title: "t".into(),
            language: "rust".into(),
            content: StoredContent::Plain {
                text: "fn main() {}".into(),
            },
            visibility: Visibility::Private,
            password_hash: None,
            burn_after_read: false,
            expires_at: None,
            view_count: 0,
            created_at: now,
            updated_at: now,
            folder: Some("snippets".into()),
            version: 0,
        }
    }

    #[tokio::test]
    async fn round_trips_records() {
        let store = SqlitePasteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert(record("r1", "alice", now)).await.unwrap();

        let stored = store.get("r1").await.unwrap().expect("present");
        assert_eq!(stored.title, "t");
        assert_eq!(stored.folder.as_deref(), Some("snippets"));
        assert_eq!(stored.created_at, now);
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_reported() {
        let store = SqlitePasteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert(record("dup", "alice", now)).await.unwrap();
        let err = store.insert(record("dup", "bob", now)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == "dup"));
    }

    #[tokio::test]
    async fn conditional_update_checks_version_column() {
        let store = SqlitePasteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert(record("cas", "alice", now)).await.unwrap();

        let updated = store
            .conditional_update("cas", 0, Box::new(|r| r.view_count += 1))
            .await
            .unwrap();
        assert_eq!((updated.version, updated.view_count), (1, 1));

        let err = store
            .conditional_update("cas", 0, Box::new(|r| r.view_count += 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: 1, .. }));

        let stored = store.get("cas").await.unwrap().unwrap();
        assert_eq!((stored.version, stored.view_count), (1, 1));
        assert!(matches!(
            store
                .conditional_update("missing", 0, Box::new(|_| {}))
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn lists_owner_records_newest_first() {
        let store = SqlitePasteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert(record("old", "alice", now - ChronoDuration::hours(1)))
            .await
            .unwrap();
        store.insert(record("new", "alice", now)).await.unwrap();
        store.insert(record("bobs", "bob", now)).await.unwrap();

        let ids: Vec<String> = store
            .list_by_owner(&OwnerId::new("alice"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    }

    #[tokio::test]
    async fn purge_uses_exact_expiry() {
        let store = SqlitePasteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut stale = record("stale", "alice", now);
        stale.expires_at = Some(now - ChronoDuration::milliseconds(1));
        let mut edge = record("edge", "alice", now);
        edge.expires_at = Some(now);
        let mut burned = record("burned", "alice", now);
        burned.burn_after_read = true;
        burned.view_count = 1;

        for r in [stale, edge, burned, record("keep", "alice", now)] {
            store.insert(r).await.unwrap();
        }

        assert_eq!(store.purge_expired(now).await.unwrap(), 2);
        assert!(store.get("edge").await.unwrap().is_some());
        assert!(store.get("keep").await.unwrap().is_some());
        assert_eq!(store.stats(now).await.unwrap().total_pastes, 2);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!("psti-{}.db", nanoid::nanoid!(8)));
        let now = Utc::now();
        {
            let store = SqlitePasteStore::open(&path).unwrap();
            store.insert(record("kept", "alice", now)).await.unwrap();
        }
        let reopened = SqlitePasteStore::open(&path).unwrap();
        assert!(reopened.get("kept").await.unwrap().is_some());
        drop(reopened);
        let _ = std::fs::remove_file(&path);
    }
}
