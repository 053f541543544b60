//! Operator command bodies for the HTTP API

use serde::{Deserialize, Serialize};

/// `POST /api/features`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFeatureRequest {
    pub project: String,
    pub name: String,
}

/// `POST /api/features/from-branch`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFromBranchRequest {
    pub project: String,
    pub remote_branch: String,
    pub local_name: String,
}

/// `POST /api/features/archive`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveFeatureRequest {
    pub project: String,
    pub path: String,
    pub feature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Machine-readable failure code, e.g. `invalid_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok(path: Option<String>) -> Self {
        Self {
            ok: true,
            path,
            code: None,
            error: None,
        }
    }

    pub fn failed(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            path: None,
            code: Some(code.into()),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_branch_request_is_camel_case() {
        let req: CreateFromBranchRequest = serde_json::from_str(
            r#"{"project":"p1","remoteBranch":"origin/fix","localName":"fix"}"#,
        )
        .expect("parse");
        assert_eq!(req.remote_branch, "origin/fix");
        assert_eq!(req.local_name, "fix");
    }

    #[test]
    fn success_response_omits_error_fields() {
        let value = serde_json::to_value(CommandResponse::ok(Some("/wt/p1/f3".into())))
            .expect("serialize");
        assert_eq!(value, serde_json::json!({"ok": true, "path": "/wt/p1/f3"}));

        let value = serde_json::to_value(CommandResponse::failed("invalid_name", "bad"))
            .expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"ok": false, "code": "invalid_name", "error": "bad"})
        );
    }
}
