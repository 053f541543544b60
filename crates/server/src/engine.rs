//! Snapshot engine: builds the ordered worktree list and publishes it.
//!
//! A refresh runs three passes, each followed by an emit-if-changed check:
//! (a) fresh inventory and sessions over the cached git and PR facts,
//! (b) git facts when the rate limit allows,
//! (c) PR facts for every worktree whose cache entry is no longer valid.
//!
//! Readers never wait on a refresh: the current snapshot lives in an
//! `ArcSwap` and changes are announced on a broadcast channel.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_protocol::{AiStatus, AiTool, PrStatus, Snapshot};
use arc_swap::ArcSwap;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ai_detect::{detect, detect_tool};
use crate::classifier::SessionFacts;
use crate::error::{CommandError, EngineError};
use crate::git::{GitFacts, RepositoryInspector, WorktreeInfo};
use crate::github::{CodeReviewClient, PrFacts};
use crate::pr_cache::PrCache;
use crate::rows::{build_rows, content_hash, ProjectWorktree, RowInputs, WorkspaceInfo};
use crate::tmux::SessionMultiplexer;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum spacing between git-fact refreshes of the whole set.
    pub git_refresh_interval: Duration,
    /// Bound on concurrent subprocess calls within a pass.
    pub concurrency: usize,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            git_refresh_interval: Duration::from_secs(15),
            concurrency: 4,
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Snapshot(Arc<Snapshot>),
    Error(String),
}

/// State owned by whichever refresh holds the lock.
struct RefreshState {
    version: u64,
    last_hash: Vec<u8>,
    git_facts: HashMap<PathBuf, GitFacts>,
    last_git_refresh: Option<Instant>,
    force_git: bool,
    pr_status: HashMap<PathBuf, PrStatus>,
}

impl RefreshState {
    fn git_due(&self, interval: Duration) -> bool {
        self.force_git
            || self
                .last_git_refresh
                .map_or(true, |at| at.elapsed() >= interval)
    }
}

/// Everything pass (a) needs besides cached facts.
struct Inventory {
    worktrees: Vec<ProjectWorktree>,
    workspaces: HashMap<String, WorkspaceInfo>,
    sessions: HashMap<String, SessionFacts>,
    /// False when some project's worktrees could not be listed, so absence
    /// from `worktrees` does not prove a worktree is gone.
    complete: bool,
}

impl Inventory {
    fn contains(&self, path: &Path) -> bool {
        self.worktrees.iter().any(|wt| wt.info.path == path)
    }

    fn paths(&self) -> Vec<PathBuf> {
        self.worktrees.iter().map(|wt| wt.info.path.clone()).collect()
    }
}

/// Worktrees of one project whose PR status must be fetched.
struct PrBatch {
    project: String,
    repo: PathBuf,
    /// (path, branch)
    members: Vec<(PathBuf, String)>,
}

pub struct SnapshotEngine {
    inspector: Arc<dyn RepositoryInspector>,
    multiplexer: Arc<dyn SessionMultiplexer>,
    review: Arc<dyn CodeReviewClient>,
    config: EngineConfig,
    pr_cache: PrCache,
    current: ArcSwap<Snapshot>,
    events: broadcast::Sender<EngineEvent>,
    state: Mutex<RefreshState>,
    /// Set by [`Self::request_refresh`], cleared when a pass starts.
    refresh_requested: AtomicBool,
}

impl SnapshotEngine {
    pub fn new(
        inspector: Arc<dyn RepositoryInspector>,
        multiplexer: Arc<dyn SessionMultiplexer>,
        review: Arc<dyn CodeReviewClient>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let pr_cache = PrCache::new(inspector.clone());
        Self {
            inspector,
            multiplexer,
            review,
            config,
            pr_cache,
            current: ArcSwap::from_pointee(Snapshot::default()),
            events,
            state: Mutex::new(RefreshState {
                version: 0,
                last_hash: content_hash(&[]),
                git_facts: HashMap::new(),
                last_git_refresh: None,
                force_git: false,
                pr_status: HashMap::new(),
            }),
            refresh_requested: AtomicBool::new(false),
        }
    }

    /// Replace the PR cache, e.g. with one wired to persistence.
    pub fn with_pr_cache(mut self, pr_cache: PrCache) -> Self {
        self.pr_cache = pr_cache;
        self
    }

    pub fn pr_cache(&self) -> &PrCache {
        &self.pr_cache
    }

    /// Only emissions after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Run a full refresh, waiting for any refresh already in flight.
    pub async fn refresh(&self) -> Result<bool, EngineError> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await
    }

    /// Run a refresh unless one is in flight, in which case return `None`.
    /// For periodic triggers, where a skipped tick is harmless.
    pub async fn try_refresh(&self) -> Option<Result<bool, EngineError>> {
        let mut state = self.state.try_lock().ok()?;
        Some(self.refresh_locked(&mut state).await)
    }

    /// Refresh for a change that has already happened. If a pass is in
    /// flight, waits for it and then runs one more, unless a pass that
    /// started after this request already covered it. Concurrent requests
    /// therefore collapse into a single trailing pass.
    pub async fn request_refresh(&self) -> Result<bool, EngineError> {
        self.refresh_requested.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if !self.refresh_requested.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.refresh_locked(&mut state).await
    }

    async fn force_refresh(&self) -> Result<bool, EngineError> {
        let mut state = self.state.lock().await;
        state.force_git = true;
        self.refresh_locked(&mut state).await
    }

    async fn refresh_locked(&self, state: &mut RefreshState) -> Result<bool, EngineError> {
        // Everything requested so far is observed by this pass.
        self.refresh_requested.store(false, Ordering::SeqCst);
        let started = Instant::now();

        let inventory = match self.collect_inventory().await {
            Ok(inventory) => inventory,
            Err(err) => {
                warn!(
                    component = "engine",
                    event = "engine.refresh.failed",
                    error = %err,
                    "Keeping last snapshot"
                );
                let _ = self.events.send(EngineEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        state.git_facts.retain(|path, _| inventory.contains(path));
        state.pr_status.retain(|path, _| inventory.contains(path));
        if inventory.complete {
            let pruned = self.pr_cache.retain(|path| inventory.contains(path));
            if pruned > 0 {
                debug!(
                    component = "engine",
                    event = "engine.pr_cache.pruned",
                    entries = pruned,
                );
            }
        }
        for wt in &inventory.worktrees {
            if !state.pr_status.contains_key(&wt.info.path) {
                if let Some(status) = self.pr_cache.peek(&wt.info.path) {
                    state.pr_status.insert(wt.info.path.clone(), status);
                }
            }
        }

        let mut changed = self.emit_if_changed(state, &inventory);

        if state.git_due(self.config.git_refresh_interval) {
            self.refresh_git_facts(state, &inventory).await;
            changed |= self.emit_if_changed(state, &inventory);
        }

        self.refresh_pr_facts(state, &inventory).await;
        changed |= self.emit_if_changed(state, &inventory);

        debug!(
            component = "engine",
            event = "engine.refresh.completed",
            changed,
            version = state.version,
            worktrees = inventory.worktrees.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
        );
        Ok(changed)
    }

    fn concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }

    async fn collect_inventory(&self) -> Result<Inventory, EngineError> {
        let projects = self
            .inspector
            .discover_projects()
            .await
            .map_err(EngineError::Discovery)?;

        let inspector = self.inspector.clone();
        let listed: Vec<_> = stream::iter(projects)
            .map(move |project| list_project(inspector.clone(), project))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        let mut worktrees = Vec::new();
        let mut complete = true;
        for (project, result) in listed {
            match result {
                Ok(infos) => {
                    for info in infos {
                        let session_name = self.multiplexer.session_name(&project, &info.feature);
                        worktrees.push(ProjectWorktree {
                            project: project.clone(),
                            info,
                            session_name,
                        });
                    }
                }
                Err(err) => {
                    complete = false;
                    warn!(
                        component = "engine",
                        event = "engine.worktrees.list_failed",
                        project = %project,
                        error = %err,
                    );
                }
            }
        }

        let features: BTreeSet<&str> = worktrees
            .iter()
            .map(|wt| wt.info.feature.as_str())
            .collect();
        let mut workspaces = HashMap::new();
        for feature in features {
            if let Some(path) = self.inspector.workspace_path(feature) {
                workspaces.insert(
                    feature.to_string(),
                    WorkspaceInfo {
                        path,
                        session_name: self.multiplexer.workspace_session_name(feature),
                    },
                );
            }
        }

        let sessions = self.collect_sessions(&worktrees, &workspaces).await;

        Ok(Inventory {
            worktrees,
            workspaces,
            sessions,
            complete,
        })
    }

    /// Facts for every live session a row refers to.
    async fn collect_sessions(
        &self,
        worktrees: &[ProjectWorktree],
        workspaces: &HashMap<String, WorkspaceInfo>,
    ) -> HashMap<String, SessionFacts> {
        let alive: HashSet<String> = match self.multiplexer.list_sessions().await {
            Ok(sessions) => sessions.into_iter().collect(),
            Err(err) => {
                warn!(
                    component = "engine",
                    event = "engine.sessions.list_failed",
                    error = %err,
                );
                return HashMap::new();
            }
        };

        let wanted: BTreeSet<String> = worktrees
            .iter()
            .map(|wt| wt.session_name.as_str())
            .chain(workspaces.values().map(|ws| ws.session_name.as_str()))
            .filter(|name| alive.contains(*name))
            .map(str::to_string)
            .collect();
        if wanted.is_empty() {
            return HashMap::new();
        }

        let commands = match self.multiplexer.pane_commands().await {
            Ok(commands) => commands,
            Err(err) => {
                warn!(
                    component = "engine",
                    event = "engine.sessions.pane_commands_failed",
                    error = %err,
                );
                HashMap::new()
            }
        };

        let multiplexer = self.multiplexer.clone();
        stream::iter(wanted)
            .map(move |name| {
                let ai_tool = commands
                    .get(&name)
                    .map(|cmd| detect_tool(cmd))
                    .unwrap_or(AiTool::None);
                live_session_facts(multiplexer.clone(), name, ai_tool)
            })
            .buffer_unordered(self.concurrency())
            .collect()
            .await
    }

    async fn refresh_git_facts(&self, state: &mut RefreshState, inventory: &Inventory) {
        let inspector = self.inspector.clone();
        let facts: HashMap<PathBuf, GitFacts> = stream::iter(inventory.paths())
            .map(move |path| git_facts_for(inspector.clone(), path))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        state.git_facts = facts;
        state.last_git_refresh = Some(Instant::now());
        state.force_git = false;
    }

    async fn refresh_pr_facts(&self, state: &mut RefreshState, inventory: &Inventory) {
        let cache = self.pr_cache.clone();
        let mut lookups: HashMap<PathBuf, Option<PrStatus>> = stream::iter(inventory.paths())
            .map(move |path| cached_pr_status(cache.clone(), path))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        let mut stale: BTreeMap<String, Vec<(PathBuf, String)>> = BTreeMap::new();
        for wt in &inventory.worktrees {
            match lookups.remove(&wt.info.path).flatten() {
                Some(status) => {
                    state.pr_status.insert(wt.info.path.clone(), status);
                }
                None => stale
                    .entry(wt.project.clone())
                    .or_default()
                    .push((wt.info.path.clone(), wt.info.branch.clone())),
            }
        }
        if stale.is_empty() {
            return;
        }

        for (path, _) in stale.values().flatten() {
            state.pr_status.insert(path.clone(), PrStatus::loading());
        }

        let batches: Vec<PrBatch> = stale
            .into_iter()
            .map(|(project, members)| PrBatch {
                repo: self.inspector.repo_path(&project),
                project,
                members,
            })
            .collect();

        let review = self.review.clone();
        let fetched: Vec<_> = stream::iter(batches)
            .map(move |batch| fetch_pr_batch(review.clone(), batch))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        let mut resolved = Vec::new();
        for (batch, result) in fetched {
            match result {
                Ok(prs) => {
                    for (path, branch) in batch.members {
                        let status = prs
                            .get(&branch)
                            .cloned()
                            .map(PrFacts::into_status)
                            .unwrap_or_else(PrStatus::no_pr);
                        resolved.push((path, status));
                    }
                }
                Err(err) => {
                    warn!(
                        component = "engine",
                        event = "engine.pr.batch_failed",
                        project = %batch.project,
                        error = %err,
                    );
                    for wt in inventory
                        .worktrees
                        .iter()
                        .filter(|wt| wt.project == batch.project)
                    {
                        state.pr_status.insert(wt.info.path.clone(), PrStatus::error());
                    }
                }
            }
        }

        let cache = self.pr_cache.clone();
        let written: Vec<_> = stream::iter(resolved)
            .map(move |(path, status)| store_pr_status(cache.clone(), path, status))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;
        state.pr_status.extend(written);
    }

    fn emit_if_changed(&self, state: &mut RefreshState, inventory: &Inventory) -> bool {
        let items = build_rows(&RowInputs {
            worktrees: &inventory.worktrees,
            workspaces: &inventory.workspaces,
            sessions: &inventory.sessions,
            git: &state.git_facts,
            prs: &state.pr_status,
        });
        let hash = content_hash(&items);
        if hash == state.last_hash {
            return false;
        }

        state.last_hash = hash;
        state.version += 1;
        let snapshot = Arc::new(Snapshot {
            version: state.version,
            items,
        });
        self.current.store(snapshot.clone());
        let receivers = self
            .events
            .send(EngineEvent::Snapshot(snapshot.clone()))
            .unwrap_or(0);

        info!(
            component = "engine",
            event = "engine.snapshot.emitted",
            version = snapshot.version,
            items = snapshot.items.len(),
            receivers,
        );
        true
    }

    // -- Operator commands ---------------------------------------------------

    /// Create a worktree and branch named `name` off the base branch and
    /// open its session. Returns the new worktree path.
    pub async fn create_feature(&self, project: &str, name: &str) -> Result<PathBuf, EngineError> {
        validate_name(name, NameKind::Feature)?;
        self.ensure_new_feature(project, name).await?;

        let path = self
            .inspector
            .create_worktree(project, name)
            .await
            .map_err(|source| EngineError::Mutation {
                action: "create worktree",
                source,
            })?;
        self.open_session(project, name, &path).await;

        self.force_refresh().await?;
        self.expect_present(project, name, &path)?;
        info!(
            component = "engine",
            event = "engine.feature.created",
            project = %project,
            feature = %name,
            path = %path.display(),
        );
        Ok(path)
    }

    /// Check out `remote_branch` into a new worktree named `local_name`.
    pub async fn create_from_branch(
        &self,
        project: &str,
        remote_branch: &str,
        local_name: &str,
    ) -> Result<PathBuf, EngineError> {
        validate_name(remote_branch, NameKind::Branch)?;
        validate_name(local_name, NameKind::Feature)?;
        self.ensure_new_feature(project, local_name).await?;

        let path = self
            .inspector
            .create_worktree_from_remote(project, remote_branch, local_name)
            .await
            .map_err(|source| EngineError::Mutation {
                action: "create worktree from branch",
                source,
            })?;
        self.open_session(project, local_name, &path).await;

        self.force_refresh().await?;
        self.expect_present(project, local_name, &path)?;
        info!(
            component = "engine",
            event = "engine.feature.created_from_branch",
            project = %project,
            remote_branch = %remote_branch,
            feature = %local_name,
            path = %path.display(),
        );
        Ok(path)
    }

    /// Remove the worktree directory and its session. The branch is kept.
    pub async fn archive_feature(
        &self,
        project: &str,
        path: &Path,
        feature: &str,
    ) -> Result<(), EngineError> {
        self.ensure_project(project).await?;

        self.inspector
            .archive_worktree(project, path)
            .await
            .map_err(|source| EngineError::Mutation {
                action: "archive worktree",
                source,
            })?;

        let session = self.multiplexer.session_name(project, feature);
        if let Err(err) = self.multiplexer.kill_session(&session).await {
            warn!(
                component = "engine",
                event = "engine.session.kill_failed",
                session = %session,
                error = %err,
            );
        }
        self.pr_cache.invalidate(path);

        self.force_refresh().await?;
        let key = path.to_string_lossy();
        if self.current_snapshot().find(&key).is_some() {
            return Err(EngineError::NotReflected {
                action: "archive",
                path: key.into_owned(),
            });
        }
        info!(
            component = "engine",
            event = "engine.feature.archived",
            project = %project,
            feature = %feature,
            path = %path.display(),
        );
        Ok(())
    }

    async fn ensure_project(&self, project: &str) -> Result<(), EngineError> {
        let projects = self
            .inspector
            .discover_projects()
            .await
            .map_err(EngineError::Discovery)?;
        if projects.iter().any(|p| p == project) {
            Ok(())
        } else {
            Err(EngineError::UnknownProject(project.to_string()))
        }
    }

    async fn ensure_new_feature(&self, project: &str, feature: &str) -> Result<(), EngineError> {
        self.ensure_project(project).await?;
        let exists = self.current_snapshot().items.iter().any(|row| {
            !row.is_workspace_header && row.project == project && row.feature == feature
        });
        if exists {
            return Err(EngineError::AlreadyExists(format!("{project}/{feature}")));
        }
        Ok(())
    }

    async fn open_session(&self, project: &str, feature: &str, path: &Path) {
        let session = self.multiplexer.session_name(project, feature);
        if let Err(err) = self.multiplexer.create_session(&session, path).await {
            warn!(
                component = "engine",
                event = "engine.session.create_failed",
                session = %session,
                error = %err,
            );
        }
    }

    fn expect_present(&self, project: &str, feature: &str, path: &Path) -> Result<(), EngineError> {
        let present = self.current_snapshot().items.iter().any(|row| {
            !row.is_workspace_header && row.project == project && row.feature == feature
        });
        if present {
            Ok(())
        } else {
            Err(EngineError::NotReflected {
                action: "create",
                path: path.to_string_lossy().into_owned(),
            })
        }
    }
}

async fn list_project(
    inspector: Arc<dyn RepositoryInspector>,
    project: String,
) -> (String, Result<Vec<WorktreeInfo>, CommandError>) {
    let result = inspector.list_worktrees(&project).await;
    (project, result)
}

/// Session facts for a live session; a failed capture reads as not running.
async fn live_session_facts(
    multiplexer: Arc<dyn SessionMultiplexer>,
    name: String,
    ai_tool: AiTool,
) -> (String, SessionFacts) {
    let ai_status = if ai_tool == AiTool::None {
        AiStatus::NotRunning
    } else {
        match multiplexer.capture_pane(&name).await {
            Ok(text) => detect(&text, ai_tool),
            Err(err) => {
                debug!(
                    component = "engine",
                    event = "engine.sessions.capture_failed",
                    session = %name,
                    error = %err,
                );
                AiStatus::NotRunning
            }
        }
    };
    let facts = SessionFacts {
        attached: true,
        ai_tool,
        ai_status,
    };
    (name, facts)
}

async fn git_facts_for(
    inspector: Arc<dyn RepositoryInspector>,
    path: PathBuf,
) -> (PathBuf, GitFacts) {
    let facts = match inspector.diff_facts(&path).await {
        Ok(facts) => facts,
        Err(err) => {
            warn!(
                component = "engine",
                event = "engine.git.facts_failed",
                path = %path.display(),
                error = %err,
            );
            GitFacts::default()
        }
    };
    (path, facts)
}

async fn cached_pr_status(cache: PrCache, path: PathBuf) -> (PathBuf, Option<PrStatus>) {
    let status = cache.get(&path).await;
    (path, status)
}

async fn fetch_pr_batch(
    review: Arc<dyn CodeReviewClient>,
    batch: PrBatch,
) -> (PrBatch, Result<HashMap<String, PrFacts>, CommandError>) {
    let branches: Vec<String> = batch
        .members
        .iter()
        .map(|(_, branch)| branch.clone())
        .filter(|branch| !branch.is_empty())
        .collect();
    let result = review
        .list_pull_requests(&batch.repo, Some(branches.as_slice()))
        .await;
    (batch, result)
}

async fn store_pr_status(cache: PrCache, path: PathBuf, status: PrStatus) -> (PathBuf, PrStatus) {
    cache.set(&path, status.clone()).await;
    (path, status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    /// Becomes a directory name and a local branch name.
    Feature,
    /// A remote branch, may contain `/`.
    Branch,
}

pub fn validate_name(name: &str, kind: NameKind) -> Result<(), EngineError> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.chars().any(char::is_whitespace) {
        Some("must not contain whitespace")
    } else if name.contains("..") {
        Some("must not contain `..`")
    } else if name.starts_with('-') {
        Some("must not start with `-`")
    } else if kind == NameKind::Feature && name.contains('/') {
        Some("must not contain `/`")
    } else if name
        .chars()
        .any(|c| c.is_control() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        Some("contains a character git does not allow in branch names")
    } else if name.ends_with(".lock") || name.ends_with('/') || name.ends_with('.') {
        Some("has an ending git does not allow in branch names")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(EngineError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
