//! Code-review client: pull requests per repository via the `gh` CLI.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use arbor_protocol::{ChecksStatus, LoadingStatus, Mergeable, PrState, PrStatus};
use async_trait::async_trait;
use serde::Deserialize;

use crate::error::CommandError;
use crate::process::run_checked;

/// Pull request facts as reported by the code-review host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrFacts {
    pub number: u64,
    pub state: PrState,
    pub checks: Option<ChecksStatus>,
    pub mergeable: Mergeable,
    pub url: Option<String>,
}

impl PrFacts {
    pub fn into_status(self) -> PrStatus {
        PrStatus {
            number: Some(self.number),
            state: self.state,
            checks: self.checks,
            mergeable: self.mergeable,
            loading_status: LoadingStatus::Exists,
            url: self.url,
        }
    }
}

#[async_trait]
pub trait CodeReviewClient: Send + Sync {
    /// All pull requests of the repository at `repo_path`, keyed by head
    /// branch. One call per repository; `branch_filter` only narrows the
    /// returned map.
    async fn list_pull_requests(
        &self,
        repo_path: &Path,
        branch_filter: Option<&[String]>,
    ) -> Result<HashMap<String, PrFacts>, CommandError>;
}

pub struct GhClient {
    timeout: Duration,
    limit: u32,
}

impl GhClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            limit: 200,
        }
    }
}

#[async_trait]
impl CodeReviewClient for GhClient {
    async fn list_pull_requests(
        &self,
        repo_path: &Path,
        branch_filter: Option<&[String]>,
    ) -> Result<HashMap<String, PrFacts>, CommandError> {
        let limit = self.limit.to_string();
        let json = run_checked(
            "gh",
            &[
                "pr",
                "list",
                "--state",
                "all",
                "--limit",
                &limit,
                "--json",
                "number,state,headRefName,mergeable,statusCheckRollup,url",
            ],
            Some(repo_path),
            self.timeout,
        )
        .await?;

        let mut prs = parse_pr_list(&json)?;
        if let Some(filter) = branch_filter {
            prs.retain(|branch, _| filter.iter().any(|wanted| wanted == branch));
        }
        Ok(prs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPullRequest {
    number: u64,
    state: String,
    head_ref_name: String,
    #[serde(default)]
    mergeable: Option<String>,
    #[serde(default)]
    status_check_rollup: Option<Vec<GhCheck>>,
    #[serde(default)]
    url: Option<String>,
}

/// Either a CheckRun (`status` + `conclusion`) or a StatusContext (`state`).
#[derive(Debug, Deserialize)]
struct GhCheck {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

pub(crate) fn parse_pr_list(json: &str) -> Result<HashMap<String, PrFacts>, CommandError> {
    let raw: Vec<GhPullRequest> =
        serde_json::from_str(json).map_err(|e| CommandError::Parse {
            program: "gh".into(),
            detail: e.to_string(),
        })?;

    let mut by_branch: HashMap<String, PrFacts> = HashMap::new();
    for pr in raw {
        let facts = PrFacts {
            number: pr.number,
            state: parse_state(&pr.state),
            checks: rollup_checks(pr.status_check_rollup.as_deref().unwrap_or_default()),
            mergeable: parse_mergeable(pr.mergeable.as_deref()),
            url: pr.url,
        };
        // gh lists newest first; a later entry only wins with a better state.
        match by_branch.get(&pr.head_ref_name) {
            Some(existing) if state_rank(existing.state) <= state_rank(facts.state) => {}
            _ => {
                by_branch.insert(pr.head_ref_name, facts);
            }
        }
    }
    Ok(by_branch)
}

fn state_rank(state: PrState) -> u8 {
    match state {
        PrState::Open => 0,
        PrState::Merged => 1,
        PrState::Closed => 2,
        PrState::None => 3,
    }
}

fn parse_state(state: &str) -> PrState {
    match state.to_ascii_uppercase().as_str() {
        "OPEN" => PrState::Open,
        "MERGED" => PrState::Merged,
        "CLOSED" => PrState::Closed,
        _ => PrState::None,
    }
}

fn parse_mergeable(value: Option<&str>) -> Mergeable {
    match value.map(str::to_ascii_uppercase).as_deref() {
        Some("MERGEABLE") => Mergeable::Mergeable,
        Some("CONFLICTING") => Mergeable::Conflicting,
        _ => Mergeable::Unknown,
    }
}

fn rollup_checks(checks: &[GhCheck]) -> Option<ChecksStatus> {
    if checks.is_empty() {
        return None;
    }

    let mut pending = false;
    for check in checks {
        let outcome = check
            .conclusion
            .as_deref()
            .filter(|c| !c.is_empty())
            .or(check.state.as_deref())
            .map(str::to_ascii_uppercase);

        match outcome.as_deref() {
            Some(
                "FAILURE" | "ERROR" | "CANCELLED" | "TIMED_OUT" | "ACTION_REQUIRED"
                | "STARTUP_FAILURE",
            ) => return Some(ChecksStatus::Failing),
            Some("PENDING" | "EXPECTED") | None => pending = true,
            Some(_) => {
                let completed = check
                    .status
                    .as_deref()
                    .map(|s| s.eq_ignore_ascii_case("COMPLETED"))
                    .unwrap_or(true);
                if !completed {
                    pending = true;
                }
            }
        }
    }

    Some(if pending {
        ChecksStatus::Pending
    } else {
        ChecksStatus::Passing
    })
}
