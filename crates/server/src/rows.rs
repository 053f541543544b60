//! Pure row assembly: collected facts → ordered snapshot items.
//!
//! Every fact source is merged by its own function so a row never depends
//! on which pass produced it. No I/O happens here.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use arbor_protocol::{AiStatus, AiTool, PrStatus, WorktreeSummary};
use ring::digest::{digest, SHA256};

use crate::classifier::{classify, classify_header, SessionFacts};
use crate::git::{GitFacts, WorktreeInfo};

/// A worktree with the project it belongs to and its session name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectWorktree {
    pub project: String,
    pub info: WorktreeInfo,
    pub session_name: String,
}

/// An umbrella workspace present on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    pub session_name: String,
}

pub struct RowInputs<'a> {
    pub worktrees: &'a [ProjectWorktree],
    /// Keyed by feature name.
    pub workspaces: &'a HashMap<String, WorkspaceInfo>,
    /// Live sessions only, keyed by session name.
    pub sessions: &'a HashMap<String, SessionFacts>,
    pub git: &'a HashMap<PathBuf, GitFacts>,
    pub prs: &'a HashMap<PathBuf, PrStatus>,
}

impl RowInputs<'_> {
    fn session(&self, name: &str) -> SessionFacts {
        self.sessions.get(name).copied().unwrap_or_default()
    }

    fn git(&self, path: &Path) -> GitFacts {
        self.git.get(path).copied().unwrap_or_default()
    }

    fn pr(&self, path: &Path) -> PrStatus {
        self.prs.get(path).cloned().unwrap_or_else(PrStatus::not_checked)
    }
}

pub fn build_rows(inputs: &RowInputs<'_>) -> Vec<WorktreeSummary> {
    let mut groups: BTreeMap<&str, Vec<&ProjectWorktree>> = BTreeMap::new();
    for wt in inputs.worktrees {
        groups.entry(wt.info.feature.as_str()).or_default().push(wt);
    }

    let mut ordered: Vec<(&str, Vec<&ProjectWorktree>)> = groups.into_iter().collect();
    // BTreeMap order already gives the feature-name tie break; the sort is stable.
    ordered.sort_by_key(|(_, members)| {
        Reverse(
            members
                .iter()
                .map(|wt| wt.info.last_commit_ts)
                .max()
                .unwrap_or(i64::MIN),
        )
    });

    let mut rows = Vec::with_capacity(inputs.worktrees.len() + inputs.workspaces.len());
    for (feature, mut members) in ordered {
        members.sort_by(|a, b| {
            a.project
                .cmp(&b.project)
                .then_with(|| a.info.path.cmp(&b.info.path))
        });

        match inputs.workspaces.get(feature) {
            Some(workspace) => {
                let session = inputs.session(&workspace.session_name);
                let newest = members
                    .iter()
                    .map(|wt| wt.info.last_commit_ts)
                    .max()
                    .unwrap_or_default();
                rows.push(header_row(feature, workspace, session, newest));
                for wt in members {
                    rows.push(child_row(wt, workspace, session, inputs));
                }
            }
            None => {
                for wt in members {
                    rows.push(standalone_row(wt, inputs));
                }
            }
        }
    }
    rows
}

fn base_row(wt: &ProjectWorktree, session_name: &str) -> WorktreeSummary {
    let mut row = WorktreeSummary::new(
        wt.project.clone(),
        wt.info.feature.clone(),
        wt.info.path.to_string_lossy(),
        wt.info.branch.clone(),
        session_name,
    );
    row.last_commit_ts = wt.info.last_commit_ts;
    row
}

fn apply_session_facts(row: &mut WorktreeSummary, session: &SessionFacts) {
    row.attached = session.attached;
    row.ai_tool = session.ai_tool;
    row.ai_status = session.ai_status;
}

fn apply_git_facts(row: &mut WorktreeSummary, git: &GitFacts) {
    row.has_changes = git.has_changes;
    row.ahead_count = git.ahead_count;
    row.behind_count = git.behind_count;
    row.added_lines = git.added_lines;
    row.deleted_lines = git.deleted_lines;
}

fn apply_pr_status(row: &mut WorktreeSummary, pr: PrStatus) {
    row.pr = Some(pr);
}

fn standalone_row(wt: &ProjectWorktree, inputs: &RowInputs<'_>) -> WorktreeSummary {
    let session = inputs.session(&wt.session_name);
    let git = inputs.git(&wt.info.path);
    let pr = inputs.pr(&wt.info.path);

    let mut row = base_row(wt, &wt.session_name);
    apply_session_facts(&mut row, &session);
    apply_git_facts(&mut row, &git);
    row.status_label = classify(&session, &git, Some(&pr));
    apply_pr_status(&mut row, pr);
    row
}

/// Children live inside the workspace session; its AI belongs to the header.
fn child_row(
    wt: &ProjectWorktree,
    workspace: &WorkspaceInfo,
    workspace_session: SessionFacts,
    inputs: &RowInputs<'_>,
) -> WorktreeSummary {
    let session = SessionFacts {
        attached: workspace_session.attached,
        ai_tool: AiTool::None,
        ai_status: AiStatus::NotRunning,
    };
    let git = inputs.git(&wt.info.path);
    let pr = inputs.pr(&wt.info.path);

    let mut row = base_row(wt, &workspace.session_name);
    apply_session_facts(&mut row, &session);
    apply_git_facts(&mut row, &git);
    row.status_label = classify(&session, &git, Some(&pr));
    apply_pr_status(&mut row, pr);
    row.is_workspace_child = true;
    row.parent_feature = Some(wt.info.feature.clone());
    row
}

fn header_row(
    feature: &str,
    workspace: &WorkspaceInfo,
    session: SessionFacts,
    last_commit_ts: i64,
) -> WorktreeSummary {
    let mut row = WorktreeSummary::new(
        String::new(),
        feature,
        workspace.path.to_string_lossy(),
        feature,
        workspace.session_name.clone(),
    );
    apply_session_facts(&mut row, &session);
    row.status_label = classify_header(&session);
    row.last_commit_ts = last_commit_ts;
    row.is_workspace = true;
    row.is_workspace_header = true;
    row
}

/// SHA-256 over the JSON encoding of the ordered rows.
pub fn content_hash(rows: &[WorktreeSummary]) -> Vec<u8> {
    let encoded = serde_json::to_vec(rows).unwrap_or_default();
    digest(&SHA256, &encoded).as_ref().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_protocol::{ChecksStatus, LoadingStatus, Mergeable, PrState, StatusLabel};

    fn wt(project: &str, feature: &str, ts: i64) -> ProjectWorktree {
        ProjectWorktree {
            project: project.into(),
            info: WorktreeInfo {
                feature: feature.into(),
                path: PathBuf::from(format!("/wt/{project}/{feature}")),
                branch: feature.into(),
                last_commit_ts: ts,
            },
            session_name: format!("{project}-{feature}"),
        }
    }

    struct Facts {
        workspaces: HashMap<String, WorkspaceInfo>,
        sessions: HashMap<String, SessionFacts>,
        git: HashMap<PathBuf, GitFacts>,
        prs: HashMap<PathBuf, PrStatus>,
    }

    impl Facts {
        fn empty() -> Self {
            Self {
                workspaces: HashMap::new(),
                sessions: HashMap::new(),
                git: HashMap::new(),
                prs: HashMap::new(),
            }
        }

        fn rows(&self, worktrees: &[ProjectWorktree]) -> Vec<WorktreeSummary> {
            build_rows(&RowInputs {
                worktrees,
                workspaces: &self.workspaces,
                sessions: &self.sessions,
                git: &self.git,
                prs: &self.prs,
            })
        }
    }

    fn keys(rows: &[WorktreeSummary]) -> Vec<(String, String)> {
        rows.iter()
            .map(|r| (r.project.clone(), r.feature.clone()))
            .collect()
    }

    #[test]
    fn groups_ordered_by_newest_commit_then_feature_name() {
        let worktrees = [
            wt("p1", "old", 10),
            wt("p2", "tie-b", 50),
            wt("p1", "tie-a", 50),
            wt("p2", "old", 90),
        ];
        let rows = Facts::empty().rows(&worktrees);

        assert_eq!(
            keys(&rows),
            vec![
                ("p1".into(), "old".into()),
                ("p2".into(), "old".into()),
                ("p1".into(), "tie-a".into()),
                ("p2".into(), "tie-b".into()),
            ]
        );
    }

    #[test]
    fn workspace_yields_header_then_children_by_project() {
        let mut facts = Facts::empty();
        facts.workspaces.insert(
            "auth".into(),
            WorkspaceInfo {
                path: PathBuf::from("/workspaces/auth"),
                session_name: "auth".into(),
            },
        );
        facts.sessions.insert(
            "auth".into(),
            SessionFacts {
                attached: true,
                ai_tool: AiTool::Claude,
                ai_status: AiStatus::Idle,
            },
        );
        facts.git.insert(
            PathBuf::from("/wt/api/auth"),
            GitFacts {
                has_changes: true,
                ..GitFacts::default()
            },
        );

        let worktrees = [wt("web", "auth", 5), wt("api", "auth", 7)];
        let rows = facts.rows(&worktrees);

        assert_eq!(rows.len(), 3);
        let header = &rows[0];
        assert!(header.is_workspace_header && header.is_workspace);
        assert_eq!(header.session_name, "auth");
        assert_eq!(header.status_label, StatusLabel::Ready);
        assert_eq!(header.pr, None);
        assert_eq!(header.last_commit_ts, 7);

        let children: Vec<_> = rows[1..].iter().map(|r| r.project.as_str()).collect();
        assert_eq!(children, ["api", "web"]);
        for child in &rows[1..] {
            assert!(child.is_workspace_child);
            assert_eq!(child.parent_feature.as_deref(), Some("auth"));
            assert_eq!(child.session_name, "auth");
            assert!(child.attached);
            assert_eq!(child.ai_tool, AiTool::None);
        }
        assert_eq!(rows[1].status_label, StatusLabel::Uncommitted);
        assert_eq!(rows[2].status_label, StatusLabel::None);
    }

    #[test]
    fn standalone_rows_merge_every_fact_source() {
        let mut facts = Facts::empty();
        let f1 = wt("p1", "f1", 2);
        let f2 = wt("p1", "f2", 1);
        facts.git.insert(
            f1.info.path.clone(),
            GitFacts {
                has_changes: true,
                added_lines: 12,
                deleted_lines: 3,
                ..GitFacts::default()
            },
        );
        facts.prs.insert(
            f2.info.path.clone(),
            PrStatus {
                number: Some(42),
                state: PrState::Open,
                checks: Some(ChecksStatus::Passing),
                mergeable: Mergeable::Mergeable,
                loading_status: LoadingStatus::Exists,
                url: None,
            },
        );

        let rows = facts.rows(&[f1, f2]);

        assert_eq!(rows[0].feature, "f1");
        assert_eq!(rows[0].status_label, StatusLabel::Uncommitted);
        assert_eq!((rows[0].added_lines, rows[0].deleted_lines), (12, 3));
        assert_eq!(rows[0].pr, Some(PrStatus::not_checked()));
        assert_eq!(rows[1].status_label, StatusLabel::PrPassed);
        assert!(!rows.iter().any(|r| r.is_workspace || r.is_workspace_child));
    }

    #[test]
    fn hash_tracks_content_only() {
        let worktrees = [wt("p1", "f1", 1)];
        let a = Facts::empty().rows(&worktrees);
        let b = Facts::empty().rows(&worktrees);
        assert_eq!(content_hash(&a), content_hash(&b));

        let mut facts = Facts::empty();
        facts.git.insert(
            worktrees[0].info.path.clone(),
            GitFacts {
                ahead_count: 1,
                ..GitFacts::default()
            },
        );
        assert_ne!(content_hash(&a), content_hash(&facts.rows(&worktrees)));
        assert_eq!(content_hash(&[]).len(), 32);
    }
}
