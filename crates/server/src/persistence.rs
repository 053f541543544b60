//! Persistence layer - batched SQLite writes for the PR cache
//!
//! The PR cache is the only state that survives a restart. Writes are
//! batched and run on `spawn_blocking`; a failed flush is logged and the
//! in-memory cache keeps working.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::pr_cache::CacheEntry;

/// Commands that can be persisted
#[derive(Debug, Clone)]
pub enum PersistCommand {
    /// Insert or replace a cache entry
    PrCacheUpsert { entry: CacheEntry },

    /// Drop the entry for a worktree path
    PrCacheDelete { path: PathBuf },
}

pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>) {
    mpsc::channel(1024)
}

pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(64),
            batch_size: 50,
            flush_interval: Duration::from_millis(250),
        }
    }

    /// Run the persistence writer (call from tokio::spawn). Returns once
    /// every sender is dropped and the final batch is flushed.
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.writer.started",
            db_path = %self.db_path.display(),
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        self.flush().await;
                        break;
                    };
                    self.batch.push(cmd);
                    if self.batch.len() >= self.batch_size {
                        self.flush().await;
                    }
                }

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    count,
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_panicked",
                    error = %e,
                );
            }
        }
    }
}

fn open(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         CREATE TABLE IF NOT EXISTS pr_cache (
             path TEXT PRIMARY KEY,
             status_json TEXT NOT NULL,
             local_hash TEXT NOT NULL,
             remote_hash TEXT,
             written_at_ms INTEGER NOT NULL
         );",
    )?;
    Ok(conn)
}

fn flush_batch(db_path: &Path, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = open(db_path)?;
    let count = batch.len();

    let tx = conn.unchecked_transaction()?;
    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!(
                component = "persistence",
                event = "persistence.command_failed",
                error = %e,
            );
        }
    }
    tx.commit()?;

    Ok(count)
}

fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::PrCacheUpsert { entry } => {
            let status_json = serde_json::to_string(&entry.status)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            conn.execute(
                "INSERT INTO pr_cache (path, status_json, local_hash, remote_hash, written_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(path) DO UPDATE SET
                    status_json = excluded.status_json,
                    local_hash = excluded.local_hash,
                    remote_hash = excluded.remote_hash,
                    written_at_ms = excluded.written_at_ms",
                params![
                    entry.path.to_string_lossy(),
                    status_json,
                    entry.local_commit_hash,
                    entry.remote_commit_hash,
                    entry.written_at_ms as i64,
                ],
            )?;
        }
        PersistCommand::PrCacheDelete { path } => {
            conn.execute(
                "DELETE FROM pr_cache WHERE path = ?1",
                params![path.to_string_lossy()],
            )?;
        }
    }
    Ok(())
}

/// Load every persisted cache entry. Rows that fail to decode are skipped.
pub fn load_pr_cache(db_path: &Path) -> Result<Vec<CacheEntry>, rusqlite::Error> {
    let conn = open(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT path, status_json, local_hash, remote_hash, written_at_ms FROM pr_cache",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (path, status_json, local_hash, remote_hash, written_at_ms) = row?;
        match serde_json::from_str(&status_json) {
            Ok(status) => entries.push(CacheEntry {
                path: PathBuf::from(path),
                status,
                local_commit_hash: local_hash,
                remote_commit_hash: remote_hash,
                written_at_ms: written_at_ms.max(0) as u64,
            }),
            Err(e) => warn!(
                component = "persistence",
                event = "persistence.row_decode_failed",
                path = %path,
                error = %e,
            ),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_protocol::{ChecksStatus, LoadingStatus, Mergeable, PrState, PrStatus};

    fn entry(path: &str, local: &str) -> CacheEntry {
        CacheEntry {
            path: PathBuf::from(path),
            status: PrStatus {
                number: Some(7),
                state: PrState::Open,
                checks: Some(ChecksStatus::Passing),
                mergeable: Mergeable::Mergeable,
                loading_status: LoadingStatus::Exists,
                url: Some("https://github.com/acme/app/pull/7".into()),
            },
            local_commit_hash: local.into(),
            remote_commit_hash: None,
            written_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("arbor.db");

        flush_batch(
            &db,
            vec![
                PersistCommand::PrCacheUpsert { entry: entry("/wt/a", "1") },
                PersistCommand::PrCacheUpsert { entry: entry("/wt/b", "1") },
                PersistCommand::PrCacheUpsert { entry: entry("/wt/a", "2") },
                PersistCommand::PrCacheDelete { path: PathBuf::from("/wt/b") },
            ],
        )
        .expect("flush");

        let loaded = load_pr_cache(&db).expect("load");
        assert_eq!(loaded, vec![entry("/wt/a", "2")]);
    }

    #[test]
    fn loading_an_empty_database_creates_the_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load_pr_cache(&dir.path().join("fresh.db")).expect("load");
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn writer_flushes_when_senders_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("arbor.db");
        let (tx, rx) = create_persistence_channel();
        let writer = tokio::spawn(PersistenceWriter::new(rx, db.clone()).run());

        tx.send(PersistCommand::PrCacheUpsert { entry: entry("/wt/a", "1") })
            .await
            .expect("send");
        drop(tx);
        writer.await.expect("writer task");

        assert_eq!(load_pr_cache(&db).expect("load").len(), 1);
    }
}
