//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Messages sent from an observer to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Declare the topics this connection wants pushed to it.
    #[serde(rename = "hello")]
    Hello {
        #[serde(default)]
        subs: Vec<String>,
    },

    /// One-shot request for the current snapshot.
    #[serde(rename = "get.worktrees")]
    GetWorktrees,
}

impl ClientMessage {
    pub fn hello<I, S>(subs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientMessage::Hello {
            subs: subs.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ClientMessage;

    #[test]
    fn parses_hello_with_topics() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"hello","subs":["worktrees"]}"#).expect("parse");
        assert_eq!(msg, ClientMessage::hello(["worktrees"]));
    }

    #[test]
    fn hello_without_subs_defaults_to_empty() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"hello"}"#).expect("parse");
        assert_eq!(msg, ClientMessage::Hello { subs: vec![] });
    }

    #[test]
    fn parses_dotted_get_request() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"get.worktrees"}"#).expect("parse");
        assert_eq!(msg, ClientMessage::GetWorktrees);
    }

    #[test]
    fn rejects_unknown_type() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#);
        assert!(result.is_err());
    }
}
