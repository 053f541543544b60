//! Status classification: git, session and PR facts → one triage label.
//!
//! Rules are evaluated in order and the first match wins. The order encodes
//! "most actionable first" and must not be rearranged.

use arbor_protocol::{AiStatus, AiTool, ChecksStatus, Mergeable, PrState, PrStatus, StatusLabel};

use crate::git::GitFacts;

/// Session-side facts of a row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFacts {
    pub attached: bool,
    pub ai_tool: AiTool,
    pub ai_status: AiStatus,
}

pub fn classify(session: &SessionFacts, git: &GitFacts, pr: Option<&PrStatus>) -> StatusLabel {
    let ai_running = session.attached && session.ai_tool != AiTool::None;

    if ai_running && session.ai_status == AiStatus::Working {
        return StatusLabel::Working;
    }
    if ai_running && session.ai_status == AiStatus::Waiting {
        return StatusLabel::Waiting;
    }

    // `error` / `no_pr` carry no PR data.
    if let Some(pr) = pr.filter(|pr| pr.exists()) {
        if pr.mergeable == Mergeable::Conflicting {
            return StatusLabel::Conflict;
        }
        if pr.checks == Some(ChecksStatus::Failing) {
            return StatusLabel::PrFailed;
        }
        if pr.state == PrState::Open
            && pr.mergeable == Mergeable::Mergeable
            && pr.checks == Some(ChecksStatus::Passing)
        {
            return StatusLabel::PrPassed;
        }
        if pr.state == PrState::Open
            && pr.number.is_some()
            && matches!(pr.checks, None | Some(ChecksStatus::Pending))
        {
            return StatusLabel::PrChecking;
        }
        if pr.state == PrState::Merged {
            return StatusLabel::Merged;
        }
    }

    if git.has_changes {
        return StatusLabel::Uncommitted;
    }
    if git.ahead_count > 0 {
        return StatusLabel::UnPushed;
    }
    if ai_running && session.ai_status == AiStatus::Idle {
        return StatusLabel::Ready;
    }
    StatusLabel::None
}

/// Label for a workspace header row: only session and AI facts count.
pub fn classify_header(session: &SessionFacts) -> StatusLabel {
    classify(session, &GitFacts::default(), None)
}
