use serde::{Deserialize, Serialize};

/// What a tool asks the gate for. The gate assigns the id and session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePermissionRequest {
    pub tool_name: String,
    pub description: String,
    pub action: String,
    pub path: String,
}

impl CreatePermissionRequest {
    pub fn new(
        tool_name: impl Into<String>,
        description: impl Into<String>,
        action: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            description: description.into(),
            action: action.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub tool_name: String,
    pub description: String,
    pub action: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    AllowForSession,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub request: PermissionRequest,
    pub decision: PermissionDecision,
}

impl PermissionResponse {
    pub fn new(request: PermissionRequest, decision: PermissionDecision) -> Self {
        Self { request, decision }
    }
}
