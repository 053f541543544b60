//! Repository inspection: projects, worktrees, diff facts and commit hashes.
//!
//! [`RepositoryInspector`] is the seam the engine consumes; [`GitInspector`]
//! implements it by shelling out to `git`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CommandError;
use crate::process::{execute, first_line, run_checked};

/// One linked worktree of a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub feature: String,
    pub path: PathBuf,
    pub branch: String,
    /// Unix seconds of the branch tip commit, 0 when unknown.
    pub last_commit_ts: i64,
}

/// Working-copy facts relative to upstream and the merge base.
/// The default value doubles as "unknown".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GitFacts {
    pub has_changes: bool,
    pub ahead_count: u32,
    pub behind_count: u32,
    pub added_lines: u32,
    pub deleted_lines: u32,
}

#[async_trait]
pub trait RepositoryInspector: Send + Sync {
    async fn discover_projects(&self) -> Result<Vec<String>, CommandError>;

    async fn list_worktrees(&self, project: &str) -> Result<Vec<WorktreeInfo>, CommandError>;

    async fn diff_facts(&self, path: &Path) -> Result<GitFacts, CommandError>;

    async fn local_commit_hash(&self, path: &Path) -> Result<String, CommandError>;

    async fn current_branch(&self, path: &Path) -> Result<String, CommandError>;

    /// Hash of the remote-tracking ref for `branch`, `None` when the branch
    /// has never been pushed.
    async fn remote_commit_hash(
        &self,
        path: &Path,
        branch: &str,
    ) -> Result<Option<String>, CommandError>;

    /// Main checkout of `project`, used for repository-wide commands.
    fn repo_path(&self, project: &str) -> PathBuf;

    /// Umbrella workspace directory for `feature`, if one exists on disk.
    fn workspace_path(&self, feature: &str) -> Option<PathBuf>;

    async fn create_worktree(&self, project: &str, feature: &str)
        -> Result<PathBuf, CommandError>;

    async fn create_worktree_from_remote(
        &self,
        project: &str,
        remote_branch: &str,
        local_name: &str,
    ) -> Result<PathBuf, CommandError>;

    async fn archive_worktree(&self, project: &str, path: &Path) -> Result<(), CommandError>;
}

#[derive(Debug, Clone)]
pub struct GitConfig {
    pub projects_root: PathBuf,
    pub worktrees_root: PathBuf,
    pub workspaces_root: PathBuf,
    pub base_branch: String,
    pub command_timeout: Duration,
    pub network_timeout: Duration,
}

/// [`RepositoryInspector`] backed by the `git` binary.
///
/// Layout: projects are git repositories directly under `projects_root`;
/// worktrees live at `worktrees_root/<project>/<feature>`; umbrella
/// workspaces at `workspaces_root/<feature>`.
pub struct GitInspector {
    config: GitConfig,
}

impl GitInspector {
    pub fn new(config: GitConfig) -> Self {
        Self { config }
    }

    pub fn worktree_path(&self, project: &str, feature: &str) -> PathBuf {
        self.config.worktrees_root.join(project).join(feature)
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, CommandError> {
        run_checked("git", args, Some(cwd), self.config.command_timeout).await
    }

    /// Like [`Self::git`] but a non-zero exit yields `None`.
    async fn git_optional(&self, cwd: &Path, args: &[&str]) -> Result<Option<String>, CommandError> {
        let output = execute("git", args, Some(cwd), self.config.command_timeout).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(first_line(&output.stdout).map(str::to_string))
    }

    async fn branch_timestamps(&self, repo: &Path) -> HashMap<String, i64> {
        match self
            .git(
                repo,
                &[
                    "for-each-ref",
                    "--format=%(refname:short)\t%(committerdate:unix)",
                    "refs/heads",
                ],
            )
            .await
        {
            Ok(text) => parse_ref_timestamps(&text),
            Err(_) => HashMap::new(),
        }
    }

    /// Ref that "ahead" is measured against: upstream first, then the base
    /// branch on origin, then the local base branch.
    async fn comparison_ref(&self, path: &Path) -> Option<String> {
        let remote_base = format!("origin/{}", self.config.base_branch);
        for candidate in ["@{upstream}", remote_base.as_str(), self.config.base_branch.as_str()] {
            if let Ok(Some(_)) = self
                .git_optional(path, &["rev-parse", "--verify", "--quiet", candidate])
                .await
            {
                return Some(candidate.to_string());
            }
        }
        None
    }

    async fn base_ref(&self, path: &Path) -> Option<String> {
        let remote_base = format!("origin/{}", self.config.base_branch);
        for candidate in [remote_base.as_str(), self.config.base_branch.as_str()] {
            if let Ok(Some(_)) = self
                .git_optional(path, &["rev-parse", "--verify", "--quiet", candidate])
                .await
            {
                return Some(candidate.to_string());
            }
        }
        None
    }

    async fn ensure_parent(&self, path: &Path) -> Result<(), CommandError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CommandError::Io {
                    context: format!("create {}", parent.display()),
                    source,
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryInspector for GitInspector {
    async fn discover_projects(&self) -> Result<Vec<String>, CommandError> {
        let root = &self.config.projects_root;
        let mut entries = tokio::fs::read_dir(root)
            .await
            .map_err(|source| CommandError::Io {
                context: format!("read {}", root.display()),
                source,
            })?;

        let mut projects = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(CommandError::Io {
                        context: format!("read {}", root.display()),
                        source,
                    })
                }
            };
            let path = entry.path();
            if !path.join(".git").exists() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                projects.push(name.to_string());
            }
        }
        projects.sort();
        Ok(projects)
    }

    async fn list_worktrees(&self, project: &str) -> Result<Vec<WorktreeInfo>, CommandError> {
        let repo = self.repo_path(project);
        let text = self.git(&repo, &["worktree", "list", "--porcelain"]).await?;
        let timestamps = self.branch_timestamps(&repo).await;

        let worktrees = parse_worktree_porcelain(&text)
            .into_iter()
            .skip(1) // main checkout
            .filter(|entry| !entry.bare)
            .filter_map(|entry| {
                let feature = entry.path.file_name()?.to_str()?.to_string();
                let branch = entry.branch.unwrap_or_default();
                let last_commit_ts = timestamps.get(&branch).copied().unwrap_or(0);
                Some(WorktreeInfo {
                    feature,
                    path: entry.path,
                    branch,
                    last_commit_ts,
                })
            })
            .collect();
        Ok(worktrees)
    }

    async fn diff_facts(&self, path: &Path) -> Result<GitFacts, CommandError> {
        let status = self.git(path, &["status", "--porcelain"]).await?;
        let mut facts = GitFacts {
            has_changes: !status.trim().is_empty(),
            ..GitFacts::default()
        };

        if let Some(reference) = self.comparison_ref(path).await {
            let range = format!("HEAD...{reference}");
            if let Ok(counts) = self
                .git(path, &["rev-list", "--left-right", "--count", &range])
                .await
            {
                if let Some((ahead, behind)) = parse_left_right_counts(&counts) {
                    facts.ahead_count = ahead;
                    facts.behind_count = behind;
                }
            }
        }

        if let Some(base) = self.base_ref(path).await {
            if let Ok(merge_base) = self.git(path, &["merge-base", "HEAD", &base]).await {
                if let Ok(stat) = self.git(path, &["diff", "--shortstat", merge_base.trim()]).await {
                    let (added, deleted) = parse_shortstat(&stat);
                    facts.added_lines = added;
                    facts.deleted_lines = deleted;
                }
            }
        }

        Ok(facts)
    }

    async fn local_commit_hash(&self, path: &Path) -> Result<String, CommandError> {
        let text = self.git(path, &["rev-parse", "HEAD"]).await?;
        Ok(text.trim().to_string())
    }

    async fn current_branch(&self, path: &Path) -> Result<String, CommandError> {
        let text = self.git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(text.trim().to_string())
    }

    async fn remote_commit_hash(
        &self,
        path: &Path,
        branch: &str,
    ) -> Result<Option<String>, CommandError> {
        let upstream = format!("{branch}@{{upstream}}");
        if let Some(hash) = self
            .git_optional(path, &["rev-parse", "--verify", "--quiet", &upstream])
            .await?
        {
            return Ok(Some(hash));
        }
        let tracking = format!("refs/remotes/origin/{branch}");
        self.git_optional(path, &["rev-parse", "--verify", "--quiet", &tracking])
            .await
    }

    fn repo_path(&self, project: &str) -> PathBuf {
        self.config.projects_root.join(project)
    }

    fn workspace_path(&self, feature: &str) -> Option<PathBuf> {
        let path = self.config.workspaces_root.join(feature);
        path.is_dir().then_some(path)
    }

    async fn create_worktree(
        &self,
        project: &str,
        feature: &str,
    ) -> Result<PathBuf, CommandError> {
        let repo = self.repo_path(project);
        let path = self.worktree_path(project, feature);
        self.ensure_parent(&path).await?;

        let start_point = self
            .base_ref(&repo)
            .await
            .unwrap_or_else(|| "HEAD".to_string());
        let path_arg = path.to_string_lossy();
        self.git(
            &repo,
            &["worktree", "add", "-b", feature, &path_arg, &start_point],
        )
        .await?;
        Ok(path)
    }

    async fn create_worktree_from_remote(
        &self,
        project: &str,
        remote_branch: &str,
        local_name: &str,
    ) -> Result<PathBuf, CommandError> {
        let repo = self.repo_path(project);
        let path = self.worktree_path(project, local_name);
        self.ensure_parent(&path).await?;

        run_checked(
            "git",
            &["fetch", "origin", remote_branch],
            Some(&repo),
            self.config.network_timeout,
        )
        .await?;

        let remote_ref = format!("origin/{remote_branch}");
        let path_arg = path.to_string_lossy();
        self.git(
            &repo,
            &[
                "worktree", "add", "--track", "-b", local_name, &path_arg, &remote_ref,
            ],
        )
        .await?;
        Ok(path)
    }

    async fn archive_worktree(&self, project: &str, path: &Path) -> Result<(), CommandError> {
        let repo = self.repo_path(project);
        let path_arg = path.to_string_lossy();
        // No --force: a dirty worktree is refused rather than discarded.
        self.git(&repo, &["worktree", "remove", &path_arg]).await?;
        let _ = self.git(&repo, &["worktree", "prune"]).await;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PorcelainEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub bare: bool,
}

/// Parse `git worktree list --porcelain` into one entry per block.
pub(crate) fn parse_worktree_porcelain(text: &str) -> Vec<PorcelainEntry> {
    let mut entries = Vec::new();
    let mut current: Option<PorcelainEntry> = None;

    for line in text.lines() {
        let line = line.trim_end();
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(PorcelainEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                bare: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(short.to_string());
        } else if line == "bare" {
            entry.bare = true;
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

pub(crate) fn parse_ref_timestamps(text: &str) -> HashMap<String, i64> {
    text.lines()
        .filter_map(|line| {
            let (name, ts) = line.trim().split_once('\t')?;
            Some((name.to_string(), ts.trim().parse::<i64>().ok()?))
        })
        .collect()
}

/// Parse `rev-list --left-right --count` output: `<ahead>\t<behind>`.
pub(crate) fn parse_left_right_counts(text: &str) -> Option<(u32, u32)> {
    let mut parts = text.split_whitespace();
    let ahead = parts.next()?.parse().ok()?;
    let behind = parts.next()?.parse().ok()?;
    Some((ahead, behind))
}

/// Parse `git diff --shortstat` into (insertions, deletions).
pub(crate) fn parse_shortstat(text: &str) -> (u32, u32) {
    let mut added = 0;
    let mut deleted = 0;
    for part in text.split(',') {
        let part = part.trim();
        let Some((count, rest)) = part.split_once(' ') else {
            continue;
        };
        let Ok(count) = count.parse::<u32>() else {
            continue;
        };
        if rest.starts_with("insertion") {
            added = count;
        } else if rest.starts_with("deletion") {
            deleted = count;
        }
    }
    (added, deleted)
}
