//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// AI assistant running inside a worktree's session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiTool {
    #[default]
    None,
    Claude,
    Codex,
    Gemini,
}

/// What the assistant in a session is currently doing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiStatus {
    #[default]
    NotRunning,
    Idle,
    Working,
    Waiting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrState {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "MERGED")]
    Merged,
    #[default]
    #[serde(rename = "none")]
    None,
}

/// Aggregate CI state of a pull request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksStatus {
    Passing,
    Failing,
    Pending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mergeable {
    Mergeable,
    Conflicting,
    #[default]
    Unknown,
}

/// Fetch lifecycle of a [`PrStatus`].
///
/// `NotChecked` → `Loading` → one of `Exists` / `NoPr` / `Error` until the
/// next fetch. Only `Exists` carries meaningful PR fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingStatus {
    #[default]
    NotChecked,
    Loading,
    Exists,
    NoPr,
    Error,
}

impl LoadingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoadingStatus::Exists | LoadingStatus::NoPr | LoadingStatus::Error
        )
    }
}

/// Pull request status of one worktree's branch
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrStatus {
    pub number: Option<u64>,
    pub state: PrState,
    pub checks: Option<ChecksStatus>,
    pub mergeable: Mergeable,
    pub loading_status: LoadingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl PrStatus {
    pub fn not_checked() -> Self {
        Self::default()
    }

    pub fn loading() -> Self {
        Self {
            loading_status: LoadingStatus::Loading,
            ..Self::default()
        }
    }

    pub fn no_pr() -> Self {
        Self {
            loading_status: LoadingStatus::NoPr,
            ..Self::default()
        }
    }

    pub fn error() -> Self {
        Self {
            loading_status: LoadingStatus::Error,
            ..Self::default()
        }
    }

    /// True only when the fields describe an actual pull request.
    pub fn exists(&self) -> bool {
        self.loading_status == LoadingStatus::Exists
    }
}

/// Human triage label of a row. Serialized as its kebab-case string; the
/// absence of any signal is the empty string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusLabel {
    #[serde(rename = "working")]
    Working,
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "conflict")]
    Conflict,
    #[serde(rename = "pr-failed")]
    PrFailed,
    #[serde(rename = "pr-passed")]
    PrPassed,
    #[serde(rename = "pr-checking")]
    PrChecking,
    #[serde(rename = "merged")]
    Merged,
    #[serde(rename = "uncommitted")]
    Uncommitted,
    #[serde(rename = "un-pushed")]
    UnPushed,
    #[serde(rename = "ready")]
    Ready,
    #[default]
    #[serde(rename = "")]
    None,
}

impl StatusLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusLabel::Working => "working",
            StatusLabel::Waiting => "waiting",
            StatusLabel::Conflict => "conflict",
            StatusLabel::PrFailed => "pr-failed",
            StatusLabel::PrPassed => "pr-passed",
            StatusLabel::PrChecking => "pr-checking",
            StatusLabel::Merged => "merged",
            StatusLabel::Uncommitted => "uncommitted",
            StatusLabel::UnPushed => "un-pushed",
            StatusLabel::Ready => "ready",
            StatusLabel::None => "",
        }
    }
}

impl std::fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dashboard row.
///
/// `path` is the only identity that is stable across refresh cycles; every
/// other field may change between snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeSummary {
    pub project: String,
    pub feature: String,
    pub path: String,
    pub branch: String,
    pub session_name: String,
    pub attached: bool,
    pub ai_tool: AiTool,
    pub ai_status: AiStatus,
    pub has_changes: bool,
    pub ahead_count: u32,
    pub behind_count: u32,
    pub added_lines: u32,
    pub deleted_lines: u32,
    pub pr: Option<PrStatus>,
    pub status_label: StatusLabel,
    pub last_commit_ts: i64,
    pub is_workspace: bool,
    pub is_workspace_header: bool,
    pub is_workspace_child: bool,
    pub parent_feature: Option<String>,
}

impl WorktreeSummary {
    pub fn new(
        project: impl Into<String>,
        feature: impl Into<String>,
        path: impl Into<String>,
        branch: impl Into<String>,
        session_name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            feature: feature.into(),
            path: path.into(),
            branch: branch.into(),
            session_name: session_name.into(),
            ..Self::default()
        }
    }
}

/// Versioned, ordered list of worktree rows
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub items: Vec<WorktreeSummary>,
}

impl Snapshot {
    pub fn find(&self, path: &str) -> Option<&WorktreeSummary> {
        self.items.iter().find(|item| item.path == path)
    }
}
