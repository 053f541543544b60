//! PR status cache keyed by worktree path.
//!
//! An entry stays valid only while the commit fingerprint it was written
//! with (local HEAD, remote-tracking hash) still matches the repository.
//! Elapsed time never validates an entry; it only expires entries whose
//! checks were pending, since CI flips state without new commits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arbor_protocol::{ChecksStatus, PrStatus};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::git::RepositoryInspector;
use crate::persistence::PersistCommand;

pub const PENDING_CHECKS_TTL: Duration = Duration::from_secs(20);

/// (local HEAD hash, remote-tracking hash) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub local: String,
    pub remote: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub status: PrStatus,
    pub local_commit_hash: String,
    pub remote_commit_hash: Option<String>,
    pub written_at_ms: u64,
}

impl CacheEntry {
    fn fingerprint_matches(&self, fingerprint: &Fingerprint) -> bool {
        self.local_commit_hash == fingerprint.local
            && self.remote_commit_hash == fingerprint.remote
    }

    fn pending_expired(&self, now_ms: u64, ttl: Duration) -> bool {
        self.status.checks == Some(ChecksStatus::Pending)
            && now_ms.saturating_sub(self.written_at_ms) >= ttl.as_millis() as u64
    }
}

/// Clones share the same entries.
#[derive(Clone)]
pub struct PrCache {
    inspector: Arc<dyn RepositoryInspector>,
    entries: Arc<Mutex<HashMap<PathBuf, CacheEntry>>>,
    pending_ttl: Duration,
    persist_tx: Option<mpsc::Sender<PersistCommand>>,
}

impl PrCache {
    pub fn new(inspector: Arc<dyn RepositoryInspector>) -> Self {
        Self {
            inspector,
            entries: Arc::new(Mutex::new(HashMap::new())),
            pending_ttl: PENDING_CHECKS_TTL,
            persist_tx: None,
        }
    }

    /// Write entries through to the persistence writer.
    pub fn with_persistence(mut self, persist_tx: mpsc::Sender<PersistCommand>) -> Self {
        self.persist_tx = Some(persist_tx);
        self
    }

    /// Seed from persisted entries. Each entry is still validated on `get`.
    pub fn load(&self, entries: Vec<CacheEntry>) {
        let mut map = self.lock();
        for entry in entries {
            map.insert(entry.path.clone(), entry);
        }
    }

    /// Cached status if the repository still matches the stored fingerprint;
    /// `None` means the caller must refetch.
    pub async fn get(&self, path: &Path) -> Option<PrStatus> {
        let entry = self.lock().get(path).cloned()?;

        if entry.pending_expired(now_ms(), self.pending_ttl) {
            debug!(
                component = "pr_cache",
                event = "pr_cache.pending_expired",
                path = %path.display(),
            );
            self.invalidate(path);
            return None;
        }

        let fingerprint = match self.fingerprint(path).await {
            Some(fingerprint) => fingerprint,
            None => {
                self.invalidate(path);
                return None;
            }
        };

        if !entry.fingerprint_matches(&fingerprint) {
            debug!(
                component = "pr_cache",
                event = "pr_cache.fingerprint_mismatch",
                path = %path.display(),
                stored_local = %entry.local_commit_hash,
                current_local = %fingerprint.local,
            );
            self.invalidate(path);
            return None;
        }

        Some(entry.status)
    }

    /// Store `status` with the fingerprint read right now. Returns false
    /// when nothing was cached (non-terminal status or no local HEAD).
    pub async fn set(&self, path: &Path, status: PrStatus) -> bool {
        if !status.loading_status.is_terminal() {
            return false;
        }

        let Some(fingerprint) = self.fingerprint(path).await else {
            return false;
        };

        let entry = CacheEntry {
            path: path.to_path_buf(),
            status,
            local_commit_hash: fingerprint.local,
            remote_commit_hash: fingerprint.remote,
            written_at_ms: now_ms(),
        };
        self.lock().insert(entry.path.clone(), entry.clone());
        self.persist(PersistCommand::PrCacheUpsert { entry });
        true
    }

    pub async fn is_valid(&self, path: &Path) -> bool {
        self.get(path).await.is_some()
    }

    /// Last stored status without revalidation.
    pub fn peek(&self, path: &Path) -> Option<PrStatus> {
        self.lock().get(path).map(|entry| entry.status.clone())
    }

    pub fn invalidate(&self, path: &Path) {
        if self.lock().remove(path).is_some() {
            self.persist(PersistCommand::PrCacheDelete {
                path: path.to_path_buf(),
            });
        }
    }

    /// Drop every entry whose path `keep` rejects, e.g. worktrees removed
    /// outside Arbor. Returns how many entries were dropped.
    pub fn retain(&self, mut keep: impl FnMut(&Path) -> bool) -> usize {
        let removed: Vec<PathBuf> = {
            let mut map = self.lock();
            let gone: Vec<PathBuf> = map.keys().filter(|path| !keep(path)).cloned().collect();
            for path in &gone {
                map.remove(path);
            }
            gone
        };
        for path in &removed {
            self.persist(PersistCommand::PrCacheDelete { path: path.clone() });
        }
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Local HEAD plus the remote-tracking hash of the current branch. A
    /// missing or unreadable remote degrades to local-only validation.
    async fn fingerprint(&self, path: &Path) -> Option<Fingerprint> {
        let local = match self.inspector.local_commit_hash(path).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!(
                    component = "pr_cache",
                    event = "pr_cache.fingerprint_failed",
                    path = %path.display(),
                    error = %err,
                );
                return None;
            }
        };

        let remote = match self.inspector.current_branch(path).await {
            Ok(branch) => self
                .inspector
                .remote_commit_hash(path, &branch)
                .await
                .unwrap_or(None),
            Err(_) => None,
        };

        Some(Fingerprint { local, remote })
    }

    fn persist(&self, cmd: PersistCommand) {
        if let Some(tx) = &self.persist_tx {
            if tx.try_send(cmd).is_err() {
                warn!(
                    component = "pr_cache",
                    event = "pr_cache.persist_dropped",
                    "Persistence channel full or closed"
                );
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
