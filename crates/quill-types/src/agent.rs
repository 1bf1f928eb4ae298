use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentEventType {
    Request,
    Response,
    Error,
}

/// Lifecycle notification for one orchestrated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: AgentEventType,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub content: String,
}

impl AgentEvent {
    pub fn new(
        event_type: AgentEventType,
        session_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            content: content.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type,
            AgentEventType::Response | AgentEventType::Error
        )
    }
}
