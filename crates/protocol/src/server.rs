//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{Snapshot, WorktreeSummary};

/// Messages sent from the server to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake reply to `hello`.
    #[serde(rename = "ready")]
    Ready { version: u64, ts: u64 },

    /// Full worktree list at `version`.
    #[serde(rename = "worktrees.snapshot")]
    WorktreesSnapshot {
        version: u64,
        items: Vec<WorktreeSummary>,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn snapshot(snapshot: &Snapshot) -> Self {
        ServerMessage::WorktreesSnapshot {
            version: snapshot.version,
            items: snapshot.items.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ServerMessage;
    use crate::types::*;

    #[test]
    fn snapshot_message_uses_dotted_tag_and_camel_case_items() {
        let snapshot = Snapshot {
            version: 3,
            items: vec![WorktreeSummary::new("p1", "f1", "/tmp/p1/f1", "f1", "p1-f1")],
        };

        let value = serde_json::to_value(ServerMessage::snapshot(&snapshot)).expect("serialize");
        assert_eq!(value["type"], "worktrees.snapshot");
        assert_eq!(value["version"], 3);
        let item = &value["items"][0];
        assert_eq!(item["sessionName"], "p1-f1");
        assert_eq!(item["aiTool"], "none");
        assert_eq!(item["aiStatus"], "not_running");
        assert_eq!(item["statusLabel"], "");
        assert_eq!(item["isWorkspaceHeader"], false);
    }

    #[test]
    fn ready_message_shape() {
        let value =
            serde_json::to_value(ServerMessage::Ready { version: 7, ts: 1_700_000_000_000 })
                .expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"type": "ready", "version": 7, "ts": 1_700_000_000_000u64})
        );
    }

    #[test]
    fn pr_status_wire_values() {
        let pr = PrStatus {
            number: Some(42),
            state: PrState::Open,
            checks: Some(ChecksStatus::Passing),
            mergeable: Mergeable::Mergeable,
            loading_status: LoadingStatus::Exists,
            url: None,
        };
        let value = serde_json::to_value(&pr).expect("serialize");
        assert_eq!(value["state"], "OPEN");
        assert_eq!(value["checks"], "passing");
        assert_eq!(value["mergeable"], "MERGEABLE");
        assert_eq!(value["loadingStatus"], "exists");

        let reparsed: PrStatus = serde_json::from_value(value).expect("deserialize");
        assert_eq!(reparsed, pr);
    }
}
