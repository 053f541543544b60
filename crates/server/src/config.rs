//! Command-line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::distributor::DistributorConfig;
use crate::engine::EngineConfig;
use crate::git::GitConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "arbor",
    version,
    about = "Live worktree, session and pull-request status over WebSocket"
)]
pub struct Args {
    /// Data directory for the PR cache database and logs (default ~/.arbor)
    #[arg(long, env = "ARBOR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "ARBOR_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "ARBOR_PORT", default_value_t = 4100)]
    pub port: u16,

    /// Path the WebSocket endpoint is mounted at
    #[arg(long, env = "ARBOR_WS_PATH", default_value = "/ws", value_parser = parse_ws_path)]
    pub ws_path: String,

    /// Directory whose child git repositories are the projects (default ~/arbor/projects)
    #[arg(long, env = "ARBOR_PROJECTS_ROOT")]
    pub projects_root: Option<PathBuf>,

    /// Worktrees live at <root>/<project>/<feature> (default ~/arbor/worktrees)
    #[arg(long, env = "ARBOR_WORKTREES_ROOT")]
    pub worktrees_root: Option<PathBuf>,

    /// Umbrella workspaces live at <root>/<feature> (default ~/arbor/workspaces)
    #[arg(long, env = "ARBOR_WORKSPACES_ROOT")]
    pub workspaces_root: Option<PathBuf>,

    /// Branch new features start from and diffs are measured against
    #[arg(long, env = "ARBOR_BASE_BRANCH", default_value = "main")]
    pub base_branch: String,

    /// Minimum seconds between git-fact refreshes
    #[arg(long, default_value_t = 15)]
    pub git_refresh_secs: u64,

    /// Seconds between timer-driven refreshes
    #[arg(long, default_value_t = 10)]
    pub refresh_secs: u64,

    /// Maximum concurrent subprocesses per refresh pass
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..=64))]
    pub concurrency: u64,

    /// Quiet period after filesystem events before refreshing
    #[arg(long, default_value_t = 250)]
    pub debounce_ms: u64,

    #[arg(long, default_value_t = 10)]
    pub command_timeout_secs: u64,

    /// Timeout for network-bound calls (`git fetch`, `gh`)
    #[arg(long, default_value_t = 20)]
    pub network_timeout_secs: u64,
}

fn parse_ws_path(value: &str) -> Result<String, String> {
    if !value.starts_with('/') {
        return Err("must start with `/`".into());
    }
    if value == "/health" || value.starts_with("/api/") || value == "/api" {
        return Err("conflicts with a built-in route".into());
    }
    Ok(value.to_string())
}

impl Args {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs.max(1))
    }

    pub fn git_config(&self) -> anyhow::Result<GitConfig> {
        let default_root = || -> anyhow::Result<PathBuf> {
            Ok(dirs::home_dir()
                .context("HOME directory not found")?
                .join("arbor"))
        };
        let resolve = |explicit: &Option<PathBuf>, name: &str| -> anyhow::Result<PathBuf> {
            match explicit {
                Some(path) => Ok(path.clone()),
                None => Ok(default_root()?.join(name)),
            }
        };

        Ok(GitConfig {
            projects_root: resolve(&self.projects_root, "projects")?,
            worktrees_root: resolve(&self.worktrees_root, "worktrees")?,
            workspaces_root: resolve(&self.workspaces_root, "workspaces")?,
            base_branch: self.base_branch.clone(),
            command_timeout: self.command_timeout(),
            network_timeout: self.network_timeout(),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            git_refresh_interval: Duration::from_secs(self.git_refresh_secs),
            concurrency: self.concurrency as usize,
            ..EngineConfig::default()
        }
    }

    pub fn distributor_config(&self, git: &GitConfig) -> DistributorConfig {
        DistributorConfig {
            host: self.host.clone(),
            port: self.port,
            ws_path: self.ws_path.clone(),
            refresh_interval: Duration::from_secs(self.refresh_secs.max(1)),
            debounce: Duration::from_millis(self.debounce_ms),
            watch_roots: watch_roots(git),
        }
    }
}

/// Worktree and workspace roots. Projects are not watched: their working
/// copies are not rows.
fn watch_roots(git: &GitConfig) -> Vec<PathBuf> {
    vec![git.worktrees_root.clone(), git.workspaces_root.clone()]
}
