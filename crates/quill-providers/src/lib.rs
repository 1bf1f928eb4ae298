use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use quill_types::{ConversationTurn, FunctionCall, Role, ToolCall, ToolDefinition};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no API key configured; set QUILL_API_KEY or OPENAI_API_KEY")]
    MissingApiKey,
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("completion endpoint returned HTTP {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("malformed completion response: {0}")]
    Protocol(String),
}

/// What the model said back: text, tool calls, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn model(&self) -> &str;

    /// One chat-completion round. An empty `tools` slice disables tool use.
    async fn complete(
        &self,
        messages: &[ConversationTurn],
        tools: &[ToolDefinition],
    ) -> Result<Completion, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct OpenAICompatibleProvider {
    settings: ProviderSettings,
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self { settings, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim().trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn complete(
        &self,
        messages: &[ConversationTurn],
        tools: &[ToolDefinition],
    ) -> Result<Completion, ProviderError> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .filter(|key| !is_placeholder_api_key(key))
            .ok_or(ProviderError::MissingApiKey)?;

        let body = build_request_body(&self.settings, messages, tools);
        tracing::debug!(
            model = %self.settings.model,
            messages = messages.len(),
            tools = tools.len(),
            "sending completion request"
        );
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        if status != StatusCode::OK {
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| extract_openai_error(&v))
                .unwrap_or_else(|| truncate_for_error(&text, 500));
            return Err(ProviderError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ProviderError::Protocol(format!(
                "invalid JSON ({e}): {}",
                truncate_for_error(&text, 200)
            ))
        })?;
        parse_completion(&value)
    }
}

pub fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn turn_to_wire(turn: &ConversationTurn) -> Value {
    let content = if turn.content.is_empty() && !turn.tool_calls.is_empty() {
        Value::Null
    } else {
        Value::String(turn.content.clone())
    };
    let mut message = json!({
        "role": turn.role.as_str(),
        "content": content,
    });
    if let Some(call_id) = &turn.tool_call_id {
        message["tool_call_id"] = json!(call_id);
    }
    if turn.role == Role::Assistant && !turn.tool_calls.is_empty() {
        message["tool_calls"] = turn
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.function.name,
                        "arguments": call.function.arguments,
                    }
                })
            })
            .collect();
    }
    message
}

pub fn build_request_body(
    settings: &ProviderSettings,
    messages: &[ConversationTurn],
    tools: &[ToolDefinition],
) -> Value {
    let mut body = json!({
        "model": settings.model,
        "messages": messages.iter().map(turn_to_wire).collect::<Vec<_>>(),
        "max_tokens": settings.max_tokens,
        "temperature": settings.temperature,
    });
    // endpoints reject an empty tools array, so tool use is disabled by omission
    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.schema,
                    }
                })
            })
            .collect();
        body["tool_choice"] = json!("auto");
    }
    body
}

pub fn parse_completion(value: &Value) -> Result<Completion, ProviderError> {
    let message = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| {
            ProviderError::Protocol(format!(
                "response missing choices[0].message: {}",
                truncate_for_error(&value.to_string(), 200)
            ))
        })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in calls {
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProviderError::Protocol("tool call without id".to_string()))?;
            let function = call.get("function").ok_or_else(|| {
                ProviderError::Protocol(format!("tool call `{id}` without function"))
            })?;
            let name = function
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ProviderError::Protocol(format!("tool call `{id}` without function name"))
                })?;
            let arguments = match function.get("arguments") {
                Some(Value::String(raw)) => raw.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            tool_calls.push(ToolCall {
                id: id.to_string(),
                function: FunctionCall {
                    name: name.to_string(),
                    arguments,
                },
            });
        }
    }

    Ok(Completion {
        content,
        tool_calls,
    })
}

fn truncate_for_error(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        format!("{}...", input.chars().take(max_chars).collect::<String>())
    }
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}
