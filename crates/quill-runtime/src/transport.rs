use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use quill_types::McpServerConfig;

use crate::mcp::McpError;

/// Moves JSON-RPC messages to one server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Sends a request carrying an `id` and returns the response with the same id.
    async fn request(&self, request: Value) -> Result<Value, McpError>;
    async fn notify(&self, notification: Value) -> Result<(), McpError>;
}

fn request_key(request: &Value) -> Result<String, McpError> {
    request
        .get("id")
        .map(|id| id.to_string())
        .ok_or_else(|| McpError::Protocol("request is missing an id".to_string()))
}

fn method_of(request: &Value) -> String {
    request
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or("request")
        .to_string()
}

struct StdioIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Line-delimited JSON-RPC over a child process's stdin/stdout.
pub struct StdioTransport {
    io: Mutex<StdioIo>,
    _child: Child,
    timeout: Duration,
}

impl StdioTransport {
    pub fn spawn(config: &McpServerConfig, timeout: Duration) -> Result<Self, McpError> {
        if config.command.trim().is_empty() {
            return Err(McpError::Spawn(format!(
                "server `{}` has no command",
                config.name
            )));
        }
        let mut command = Command::new(&config.command);
        command.args(&config.args);
        for entry in &config.env {
            match entry.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    command.env(key.trim(), value);
                }
                _ => tracing::warn!(server = %config.name, entry = %entry, "ignoring malformed env entry"),
            }
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| McpError::Spawn(format!("{}: {e}", config.command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Spawn("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Spawn("child stdout unavailable".to_string()))?;

        Ok(Self {
            io: Mutex::new(StdioIo {
                stdin,
                stdout: BufReader::new(stdout).lines(),
            }),
            _child: child,
            timeout,
        })
    }
}

async fn write_line(stdin: &mut ChildStdin, message: &Value) -> Result<(), McpError> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| McpError::Protocol(format!("unserializable message: {e}")))?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

async fn read_response(
    stdout: &mut Lines<BufReader<ChildStdout>>,
    key: &str,
) -> Result<Value, McpError> {
    loop {
        let Some(line) = stdout.next_line().await? else {
            return Err(McpError::Closed);
        };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            tracing::debug!(line = %line, "skipping non-JSON line from MCP server");
            continue;
        };
        // notifications and stale responses from timed-out calls are dropped
        if message.get("id").map(|id| id.to_string()).as_deref() == Some(key) {
            return Ok(message);
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, request: Value) -> Result<Value, McpError> {
        let key = request_key(&request)?;
        let mut io = self.io.lock().await;
        write_line(&mut io.stdin, &request).await?;

        tokio::time::timeout(self.timeout, read_response(&mut io.stdout, &key))
            .await
            .map_err(|_| McpError::Timeout(method_of(&request)))?
    }

    async fn notify(&self, notification: Value) -> Result<(), McpError> {
        let mut io = self.io.lock().await;
        write_line(&mut io.stdin, &notification).await
    }
}

type Pending = Arc<StdMutex<HashMap<String, oneshot::Sender<Value>>>>;

/// MCP over Server-Sent Events: responses arrive on a GET stream, requests go
/// to the endpoint the server announces in its first `endpoint` event.
pub struct SseTransport {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    pending: Pending,
    reader: JoinHandle<()>,
    timeout: Duration,
}

impl SseTransport {
    pub async fn connect(config: &McpServerConfig, timeout: Duration) -> Result<Self, McpError> {
        if config.url.trim().is_empty() {
            return Err(McpError::Transport(format!(
                "server `{}` has no url",
                config.name
            )));
        }
        let headers = build_headers(&config.headers)?;
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        let response = client
            .get(config.url.trim())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!(
                "SSE stream returned HTTP {}",
                status.as_u16()
            )));
        }
        let base = response.url().clone();

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_stream(response, endpoint_tx, pending.clone()));

        let announced = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(path)) => path,
            Ok(Err(_)) => {
                reader.abort();
                return Err(McpError::Closed);
            }
            Err(_) => {
                reader.abort();
                return Err(McpError::Timeout("endpoint".to_string()));
            }
        };
        let endpoint = match base.join(announced.trim()) {
            Ok(url) => url.to_string(),
            Err(e) => {
                reader.abort();
                return Err(McpError::Protocol(format!(
                    "bad endpoint `{announced}`: {e}"
                )));
            }
        };

        Ok(Self {
            client,
            endpoint,
            headers,
            pending,
            reader,
            timeout,
        })
    }

    fn forget(&self, key: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    async fn post(&self, message: &Value) -> Result<reqwest::Response, McpError> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(message)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!(
                "endpoint returned HTTP {}: {}",
                status.as_u16(),
                body.chars().take(400).collect::<String>()
            )));
        }
        Ok(response)
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn request(&self, request: Value) -> Result<Value, McpError> {
        let key = request_key(&request)?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), tx);

        let response = match self.post(&request).await {
            Ok(response) => response,
            Err(err) => {
                self.forget(&key);
                return Err(err);
            }
        };

        // Some servers answer inline instead of on the stream.
        let inline = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);
        if inline {
            let body = response.text().await.unwrap_or_default();
            if let Ok(message) = serde_json::from_str::<Value>(&body) {
                if message.get("id").map(|id| id.to_string()).as_deref() == Some(key.as_str()) {
                    self.forget(&key);
                    return Ok(message);
                }
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(McpError::Closed),
            Err(_) => {
                self.forget(&key);
                Err(McpError::Timeout(method_of(&request)))
            }
        }
    }

    async fn notify(&self, notification: Value) -> Result<(), McpError> {
        self.post(&notification).await.map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Parses one blank-line-terminated SSE block. Comment-only blocks yield `None`.
pub(crate) fn parse_sse_frame(block: &str) -> Option<SseFrame> {
    let mut event = String::from("message");
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = value.to_string(),
            "data" => data.push(value),
            _ => {}
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data.join("\n"),
    })
}

/// Removes every complete frame from `buffer`, leaving any partial tail.
pub(crate) fn drain_sse_frames(buffer: &mut Vec<u8>) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
        let block: Vec<u8> = buffer.drain(..pos + 2).collect();
        let text = String::from_utf8_lossy(&block);
        if let Some(frame) = parse_sse_frame(&text) {
            frames.push(frame);
        }
    }
    frames
}

async fn read_stream(
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    pending: Pending,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut buffer: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        for frame in drain_sse_frames(&mut buffer) {
            if frame.event == "endpoint" {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(frame.data);
                }
                continue;
            }
            let Ok(message) = serde_json::from_str::<Value>(&frame.data) else {
                tracing::debug!(event = %frame.event, "skipping non-JSON SSE frame");
                continue;
            };
            let Some(key) = message.get("id").map(|id| id.to_string()) else {
                continue;
            };
            let waiter = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            if let Some(waiter) = waiter {
                let _ = waiter.send(message);
            }
        }
    }
    // waking every waiter with Closed
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.trim().as_bytes())
            .map_err(|e| McpError::Transport(format!("invalid header name '{key}': {e}")))?;
        let header = HeaderValue::from_str(value.trim())
            .map_err(|e| McpError::Transport(format!("invalid header value for '{key}': {e}")))?;
        map.insert(name, header);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_on_blank_lines_and_keep_tail() {
        let mut buffer = b"event: endpoint\ndata: /messages?sessionId=abc\n\n: keepalive\n\ndata: {\"id\":1}\n\ndata: {\"id\"".to_vec();

        let frames = drain_sse_frames(&mut buffer);

        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: "endpoint".to_string(),
                    data: "/messages?sessionId=abc".to_string()
                },
                SseFrame {
                    event: "message".to_string(),
                    data: "{\"id\":1}".to_string()
                },
            ]
        );
        assert_eq!(buffer, b"data: {\"id\"".to_vec());
    }

    #[test]
    fn multi_line_data_is_joined() {
        let frame = parse_sse_frame("event: message\ndata: {\"a\":\ndata: 1}\n").expect("frame");
        assert_eq!(frame.data, "{\"a\":\n1}");
    }

    #[test]
    fn header_validation_reports_bad_names() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer t".to_string());
        assert_eq!(build_headers(&headers).expect("valid").len(), 1);

        headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(
            build_headers(&headers),
            Err(McpError::Transport(_))
        ));
    }

    #[test]
    fn stdio_requires_command() {
        let config = McpServerConfig {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            StdioTransport::spawn(&config, Duration::from_secs(1)),
            Err(McpError::Spawn(_))
        ));
    }
}
