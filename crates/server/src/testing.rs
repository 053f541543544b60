//! In-memory collaborators for engine and distributor tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::CommandError;
use crate::git::{GitFacts, RepositoryInspector, WorktreeInfo};
use crate::github::{CodeReviewClient, PrFacts};
use crate::tmux::SessionMultiplexer;

fn failed(program: &str, stderr: &str) -> CommandError {
    CommandError::Failed {
        program: program.to_string(),
        code: Some(1),
        stderr: stderr.to_string(),
    }
}

#[derive(Default)]
struct InspectorState {
    projects: BTreeMap<String, Vec<WorktreeInfo>>,
    failing_projects: HashSet<String>,
    fail_discovery: bool,
    hashes: HashMap<PathBuf, (Option<String>, Option<String>)>,
    diff_facts: HashMap<PathBuf, GitFacts>,
    failing_diffs: HashSet<PathBuf>,
    workspaces: HashSet<String>,
    remote_branches: HashSet<String>,
    refuse_archive: HashSet<PathBuf>,
    next_ts: i64,
}

/// Repository layout: repos at `/src/<project>`, worktrees at
/// `/wt/<project>/<feature>`, workspaces at `/workspaces/<feature>`.
#[derive(Default)]
pub struct FakeInspector {
    state: Mutex<InspectorState>,
    pub diff_calls: AtomicUsize,
    pub discover_calls: AtomicUsize,
}

impl FakeInspector {
    fn state(&self) -> std::sync::MutexGuard<'_, InspectorState> {
        self.state.lock().expect("fake inspector lock")
    }

    pub fn add_project(&self, project: &str) {
        self.state().projects.entry(project.to_string()).or_default();
    }

    pub fn add_worktree(&self, project: &str, feature: &str, path: &Path, branch: &str, ts: i64) {
        let mut state = self.state();
        state.hashes.insert(
            path.to_path_buf(),
            (Some(format!("{feature}-head")), None),
        );
        state
            .projects
            .entry(project.to_string())
            .or_default()
            .push(WorktreeInfo {
                feature: feature.to_string(),
                path: path.to_path_buf(),
                branch: branch.to_string(),
                last_commit_ts: ts,
            });
    }

    pub fn set_last_commit(&self, path: &Path, ts: i64) {
        let mut state = self.state();
        for worktrees in state.projects.values_mut() {
            for wt in worktrees.iter_mut().filter(|wt| wt.path == path) {
                wt.last_commit_ts = ts;
            }
        }
    }

    pub fn set_hashes(&self, path: &Path, local: &str, remote: Option<&str>) {
        self.state().hashes.insert(
            path.to_path_buf(),
            (Some(local.to_string()), remote.map(str::to_string)),
        );
    }

    pub fn fail_hashes(&self, path: &Path) {
        self.state().hashes.insert(path.to_path_buf(), (None, None));
    }

    pub fn set_diff(&self, path: &Path, facts: GitFacts) {
        self.state().diff_facts.insert(path.to_path_buf(), facts);
    }

    pub fn fail_diff(&self, path: &Path) {
        self.state().failing_diffs.insert(path.to_path_buf());
    }

    pub fn add_workspace(&self, feature: &str) {
        self.state().workspaces.insert(feature.to_string());
    }

    pub fn add_remote_branch(&self, branch: &str) {
        self.state().remote_branches.insert(branch.to_string());
    }

    pub fn refuse_archive(&self, path: &Path) {
        self.state().refuse_archive.insert(path.to_path_buf());
    }

    pub fn fail_discovery(&self, fail: bool) {
        self.state().fail_discovery = fail;
    }

    pub fn fail_project(&self, project: &str) {
        self.state().failing_projects.insert(project.to_string());
    }

    fn insert_created(&self, project: &str, feature: &str, branch: &str) -> PathBuf {
        let path = PathBuf::from(format!("/wt/{project}/{feature}"));
        let mut state = self.state();
        state.next_ts += 1;
        let ts = 2_000_000_000 + state.next_ts;
        state
            .hashes
            .insert(path.clone(), (Some(format!("{feature}-head")), None));
        state
            .projects
            .entry(project.to_string())
            .or_default()
            .push(WorktreeInfo {
                feature: feature.to_string(),
                path: path.clone(),
                branch: branch.to_string(),
                last_commit_ts: ts,
            });
        path
    }
}

#[async_trait]
impl RepositoryInspector for FakeInspector {
    async fn discover_projects(&self) -> Result<Vec<String>, CommandError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.fail_discovery {
            return Err(failed("git", "projects root unreadable"));
        }
        Ok(state.projects.keys().cloned().collect())
    }

    async fn list_worktrees(&self, project: &str) -> Result<Vec<WorktreeInfo>, CommandError> {
        let state = self.state();
        if state.failing_projects.contains(project) {
            return Err(failed("git", "worktree list failed"));
        }
        Ok(state.projects.get(project).cloned().unwrap_or_default())
    }

    async fn diff_facts(&self, path: &Path) -> Result<GitFacts, CommandError> {
        self.diff_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.failing_diffs.contains(path) {
            return Err(failed("git", "status failed"));
        }
        Ok(state.diff_facts.get(path).copied().unwrap_or_default())
    }

    async fn local_commit_hash(&self, path: &Path) -> Result<String, CommandError> {
        match self.state().hashes.get(path) {
            Some((Some(local), _)) => Ok(local.clone()),
            _ => Err(failed("git", "not a git repository")),
        }
    }

    async fn current_branch(&self, path: &Path) -> Result<String, CommandError> {
        let state = self.state();
        state
            .projects
            .values()
            .flatten()
            .find(|wt| wt.path == path)
            .map(|wt| wt.branch.clone())
            .ok_or_else(|| failed("git", "unknown worktree"))
    }

    async fn remote_commit_hash(
        &self,
        path: &Path,
        _branch: &str,
    ) -> Result<Option<String>, CommandError> {
        Ok(self
            .state()
            .hashes
            .get(path)
            .and_then(|(_, remote)| remote.clone()))
    }

    fn repo_path(&self, project: &str) -> PathBuf {
        PathBuf::from(format!("/src/{project}"))
    }

    fn workspace_path(&self, feature: &str) -> Option<PathBuf> {
        self.state()
            .workspaces
            .contains(feature)
            .then(|| PathBuf::from(format!("/workspaces/{feature}")))
    }

    async fn create_worktree(
        &self,
        project: &str,
        feature: &str,
    ) -> Result<PathBuf, CommandError> {
        if !self.state().projects.contains_key(project) {
            return Err(failed("git", "not a repository"));
        }
        Ok(self.insert_created(project, feature, feature))
    }

    async fn create_worktree_from_remote(
        &self,
        project: &str,
        remote_branch: &str,
        local_name: &str,
    ) -> Result<PathBuf, CommandError> {
        if !self.state().remote_branches.contains(remote_branch) {
            return Err(failed("git", "couldn't find remote ref"));
        }
        Ok(self.insert_created(project, local_name, local_name))
    }

    async fn archive_worktree(&self, project: &str, path: &Path) -> Result<(), CommandError> {
        let mut state = self.state();
        if state.refuse_archive.contains(path) {
            return Err(failed("git", "contains modified or untracked files"));
        }
        let worktrees = state
            .projects
            .get_mut(project)
            .ok_or_else(|| failed("git", "not a repository"))?;
        let before = worktrees.len();
        worktrees.retain(|wt| wt.path != path);
        if worktrees.len() == before {
            return Err(failed("git", "is not a working tree"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MultiplexerState {
    sessions: Vec<String>,
    pane_text: HashMap<String, String>,
    commands: HashMap<String, String>,
    failing_captures: HashSet<String>,
    fail_list: bool,
}

#[derive(Default)]
pub struct FakeMultiplexer {
    state: Mutex<MultiplexerState>,
    pub pane_command_calls: AtomicUsize,
    pub capture_calls: AtomicUsize,
}

impl FakeMultiplexer {
    fn state(&self) -> std::sync::MutexGuard<'_, MultiplexerState> {
        self.state.lock().expect("fake multiplexer lock")
    }

    /// Start a live session running `command` with `pane` on screen.
    pub fn run(&self, session: &str, command: &str, pane: &str) {
        let mut state = self.state();
        if !state.sessions.iter().any(|s| s == session) {
            state.sessions.push(session.to_string());
        }
        state
            .commands
            .insert(session.to_string(), command.to_string());
        state.pane_text.insert(session.to_string(), pane.to_string());
    }

    pub fn set_pane(&self, session: &str, pane: &str) {
        self.state()
            .pane_text
            .insert(session.to_string(), pane.to_string());
    }

    pub fn fail_capture(&self, session: &str) {
        self.state().failing_captures.insert(session.to_string());
    }

    pub fn fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    pub fn has_session(&self, session: &str) -> bool {
        self.state().sessions.iter().any(|s| s == session)
    }
}

#[async_trait]
impl SessionMultiplexer for FakeMultiplexer {
    async fn list_sessions(&self) -> Result<Vec<String>, CommandError> {
        let state = self.state();
        if state.fail_list {
            return Err(failed("tmux", "server exited unexpectedly"));
        }
        Ok(state.sessions.clone())
    }

    async fn capture_pane(&self, name: &str) -> Result<String, CommandError> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.failing_captures.contains(name) {
            return Err(failed("tmux", "can't find pane"));
        }
        Ok(state.pane_text.get(name).cloned().unwrap_or_default())
    }

    async fn pane_commands(&self) -> Result<HashMap<String, String>, CommandError> {
        self.pane_command_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().commands.clone())
    }

    async fn create_session(&self, name: &str, _cwd: &Path) -> Result<(), CommandError> {
        let mut state = self.state();
        if state.sessions.iter().any(|s| s == name) {
            return Err(failed("tmux", "duplicate session"));
        }
        state.sessions.push(name.to_string());
        state.commands.insert(name.to_string(), "-zsh".to_string());
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), CommandError> {
        let mut state = self.state();
        state.sessions.retain(|s| s != name);
        state.commands.remove(name);
        state.pane_text.remove(name);
        Ok(())
    }
}

#[derive(Default)]
struct ReviewState {
    prs: HashMap<PathBuf, HashMap<String, PrFacts>>,
    failing_repos: HashSet<PathBuf>,
}

#[derive(Default)]
pub struct FakeReviewClient {
    state: Mutex<ReviewState>,
    pub calls: AtomicUsize,
}

impl FakeReviewClient {
    fn state(&self) -> std::sync::MutexGuard<'_, ReviewState> {
        self.state.lock().expect("fake review lock")
    }

    pub fn set_pr(&self, project: &str, branch: &str, facts: PrFacts) {
        self.state()
            .prs
            .entry(PathBuf::from(format!("/src/{project}")))
            .or_default()
            .insert(branch.to_string(), facts);
    }

    pub fn fail_project(&self, project: &str, fail: bool) {
        let repo = PathBuf::from(format!("/src/{project}"));
        let mut state = self.state();
        if fail {
            state.failing_repos.insert(repo);
        } else {
            state.failing_repos.remove(&repo);
        }
    }
}

#[async_trait]
impl CodeReviewClient for FakeReviewClient {
    async fn list_pull_requests(
        &self,
        repo_path: &Path,
        branch_filter: Option<&[String]>,
    ) -> Result<HashMap<String, PrFacts>, CommandError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.failing_repos.contains(repo_path) {
            return Err(failed("gh", "HTTP 502"));
        }
        let mut prs = state.prs.get(repo_path).cloned().unwrap_or_default();
        if let Some(filter) = branch_filter {
            prs.retain(|branch, _| filter.contains(branch));
        }
        Ok(prs)
    }
}
