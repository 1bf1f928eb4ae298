use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use quill_tools::{Approver, Tool};
use quill_types::{CreatePermissionRequest, McpServerConfig, McpTransportKind, ToolResult};

use crate::transport::{McpTransport, SseTransport, StdioTransport};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const MCP_CLIENT_NAME: &str = "quill";
pub const MCP_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to start MCP server: {0}")]
    Spawn(String),
    #[error("MCP I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MCP HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("MCP transport error: {0}")]
    Transport(String),
    #[error("MCP protocol error: {0}")]
    Protocol(String),
    #[error("MCP server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("MCP `{0}` timed out")]
    Timeout(String),
    #[error("MCP connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpRemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// JSON-RPC client for one MCP server.
pub struct McpClient {
    transport: Box<dyn McpTransport>,
    next_id: AtomicU64,
}

impl McpClient {
    pub fn new(transport: Box<dyn McpTransport>) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn connect(config: &McpServerConfig, timeout: Duration) -> Result<Self, McpError> {
        let transport: Box<dyn McpTransport> = match config.kind {
            McpTransportKind::Stdio => Box::new(StdioTransport::spawn(config, timeout)?),
            McpTransportKind::Sse => Box::new(SseTransport::connect(config, timeout).await?),
        };
        Ok(Self::new(transport))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .transport
            .request(json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .await?;
        if let Some(err) = response.get("error") {
            return Err(McpError::Rpc {
                code: err.get("code").and_then(|v| v.as_i64()).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| McpError::Protocol(format!("`{method}` response has no result")))
    }

    /// Handshake; returns the server's `initialize` result.
    pub async fn initialize(
        &self,
        client_name: &str,
        client_version: &str,
    ) -> Result<Value, McpError> {
        let result = self
            .call(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": client_name, "version": client_version},
                }),
            )
            .await?;
        self.transport
            .notify(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await?;
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpRemoteTool>, McpError> {
        let result = self.call("tools/list", json!({})).await?;
        let rows = result
            .get("tools")
            .and_then(|v| v.as_array())
            .ok_or_else(|| McpError::Protocol("tools/list result missing tools array".into()))?;

        let mut tools = Vec::new();
        for row in rows {
            let Some(name) = row.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            tools.push(McpRemoteTool {
                name: name.to_string(),
                description: row
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                input_schema: row
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"})),
            });
        }
        Ok(tools)
    }

    /// Invokes a remote tool and returns the raw `tools/call` result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.call("tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }
}

/// One MCP server exposed as a single local tool. The first argument picks
/// the remote tool; the rest are its parameters.
pub struct McpTool {
    name: String,
    description: String,
    client: McpClient,
    tools: Vec<McpRemoteTool>,
    approver: Arc<dyn Approver>,
}

impl McpTool {
    pub async fn connect(
        config: &McpServerConfig,
        approver: Arc<dyn Approver>,
        timeout: Duration,
    ) -> Result<Self, McpError> {
        let client = McpClient::connect(config, timeout).await?;
        client
            .initialize(MCP_CLIENT_NAME, MCP_CLIENT_VERSION)
            .await?;
        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                tracing::warn!(server = %config.name, error = %err, "MCP tool discovery failed");
                Vec::new()
            }
        };
        tracing::info!(server = %config.name, tools = tools.len(), "MCP server connected");
        Ok(Self::from_parts(config.name.clone(), client, tools, approver))
    }

    pub fn from_parts(
        name: String,
        client: McpClient,
        tools: Vec<McpRemoteTool>,
        approver: Arc<dyn Approver>,
    ) -> Self {
        let description = describe(&tools);
        Self {
            name,
            description,
            client,
            tools,
            approver,
        }
    }

    pub fn available_tools(&self) -> &[McpRemoteTool] {
        &self.tools
    }
}

fn describe(tools: &[McpRemoteTool]) -> String {
    let mut text = String::from(
        "MCP server providing various tools. args: [tool_name, parameters as a JSON object or key=value pairs].",
    );
    if !tools.is_empty() {
        let listed = tools
            .iter()
            .map(|t| {
                if t.description.is_empty() {
                    t.name.clone()
                } else {
                    format!("{} ({})", t.name, t.description)
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        text.push_str(" Tools: ");
        text.push_str(&listed);
    }
    text
}

/// Remaining positional args become the remote tool's argument object.
fn parse_params(rest: &[String]) -> Result<Value, String> {
    let joined = rest.join(" ");
    let joined = joined.trim();
    if joined.is_empty() {
        return Ok(json!({}));
    }
    match serde_json::from_str::<Value>(joined) {
        Ok(Value::Object(map)) => return Ok(Value::Object(map)),
        Ok(_) => return Err("parameters must be a JSON object".to_string()),
        Err(_) if rest.iter().all(|a| a.contains('=')) => {}
        Err(err) => return Err(err.to_string()),
    }
    let mut map = Map::new();
    for pair in rest {
        if let Some((key, value)) = pair.split_once('=') {
            let value = serde_json::from_str::<Value>(value)
                .unwrap_or_else(|_| Value::String(value.to_string()));
            map.insert(key.trim().to_string(), value);
        }
    }
    Ok(Value::Object(map))
}

/// Flattens a content-block list: `text` when present, pretty JSON otherwise.
pub fn render_mcp_content(value: &Value) -> String {
    let Some(items) = value.as_array() else {
        return serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    };
    let mut out = String::new();
    for item in items {
        match item.get("text").and_then(|v| v.as_str()) {
            Some(text) => out.push_str(text),
            None => out.push_str(
                &serde_json::to_string_pretty(item).unwrap_or_else(|_| item.to_string()),
            ),
        }
        out.push('\n');
    }
    out
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult> {
        let Some(tool_name) = args.first().map(|s| s.trim()).filter(|s| !s.is_empty()) else {
            return Ok(ToolResult::failure("tool name is required"));
        };
        if !self.tools.iter().any(|t| t.name == tool_name) {
            let available = self
                .tools
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(ToolResult::failure(format!(
                "Unknown MCP tool: {tool_name}. Available: {available}"
            )));
        }
        let params = match parse_params(&args[1..]) {
            Ok(params) => params,
            Err(err) => return Ok(ToolResult::failure(format!("Invalid parameters: {err}"))),
        };

        let approved = self
            .approver
            .request(CreatePermissionRequest::new(
                format!("{}.{}", self.name, tool_name),
                format!("Execute MCP tool '{tool_name}' with parameters: {params}"),
                "execute",
                "",
            ))
            .await;
        if !approved {
            return Ok(ToolResult::failure("Permission denied"));
        }

        match self.client.call_tool(tool_name, params).await {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let output = render_mcp_content(result.get("content").unwrap_or(&result));
                Ok(ToolResult {
                    output,
                    success: !is_error,
                })
            }
            Err(err) => {
                tracing::warn!(server = %self.name, tool = tool_name, error = %err, "MCP call failed");
                Ok(ToolResult::failure(format!(
                    "MCP tool '{tool_name}' failed: {err}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct RecordingApprover {
        answer: bool,
        seen: Mutex<Vec<CreatePermissionRequest>>,
    }

    #[async_trait]
    impl Approver for RecordingApprover {
        async fn request(&self, request: CreatePermissionRequest) -> bool {
            self.seen.lock().unwrap().push(request);
            self.answer
        }
    }

    fn approver(answer: bool) -> Arc<RecordingApprover> {
        Arc::new(RecordingApprover {
            answer,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn content_blocks_flatten_to_text() {
        let content = json!([
            {"type": "text", "text": "first"},
            {"type": "image", "data": "AA=="},
        ]);
        let rendered = render_mcp_content(&content);
        assert!(rendered.starts_with("first\n{\n"));
        assert!(rendered.contains("\"data\": \"AA==\""));
        assert!(rendered.ends_with("}\n"));
    }

    #[test]
    fn params_accept_json_or_pairs() {
        let joined = vec!["{\"path\":".to_string(), "\"/tmp\"}".to_string()];
        assert_eq!(parse_params(&joined).unwrap(), json!({"path": "/tmp"}));

        let pairs = vec!["path=/tmp".to_string(), "depth=2".to_string()];
        assert_eq!(
            parse_params(&pairs).unwrap(),
            json!({"path": "/tmp", "depth": 2})
        );

        assert_eq!(parse_params(&[]).unwrap(), json!({}));
        assert!(parse_params(&["[1,2]".to_string()]).is_err());
        assert!(parse_params(&["not json".to_string()]).is_err());
    }

    #[test]
    fn description_lists_discovered_tools() {
        let text = describe(&[McpRemoteTool {
            name: "echo".to_string(),
            description: "Echo text".to_string(),
            input_schema: json!({}),
        }]);
        assert!(text.starts_with("MCP server providing various tools."));
        assert!(text.ends_with("Tools: echo (Echo text)"));
    }

    #[cfg(unix)]
    fn fake_server() -> McpServerConfig {
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo text"}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","method":"notifications/message","params":{}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}]}}\n' "$id" "$GREETING" ;;
  esac
done
"#;
        McpServerConfig {
            name: "fake".to_string(),
            kind: McpTransportKind::Stdio,
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec!["GREETING=pong".to_string()],
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdio_server_round_trip_through_tool() {
        let gate = approver(true);
        let tool = McpTool::connect(&fake_server(), gate.clone(), Duration::from_secs(10))
            .await
            .expect("connect");

        assert_eq!(tool.name(), "fake");
        assert_eq!(tool.available_tools().len(), 1);

        let result = tool
            .execute(vec!["echo".to_string(), "{\"text\":\"hi\"}".to_string()])
            .await
            .expect("execute");

        assert!(result.success, "{}", result.output);
        assert_eq!(result.output, "pong\n");
        let seen = gate.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].tool_name, "fake.echo");
        assert_eq!(seen[0].action, "execute");
        assert_eq!(
            seen[0].description,
            "Execute MCP tool 'echo' with parameters: {\"text\":\"hi\"}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn denied_or_unknown_calls_do_not_reach_server() {
        let gate = approver(false);
        let tool = McpTool::connect(&fake_server(), gate.clone(), Duration::from_secs(10))
            .await
            .expect("connect");

        let denied = tool.execute(vec!["echo".to_string()]).await.expect("execute");
        assert_eq!(denied, ToolResult::failure("Permission denied"));

        let unknown = tool.execute(vec!["rm".to_string()]).await.expect("execute");
        assert_eq!(
            unknown,
            ToolResult::failure("Unknown MCP tool: rm. Available: echo")
        );
        assert_eq!(gate.seen.lock().unwrap().len(), 1);
    }
    /// Minimal MCP-over-SSE server: one event stream, one POST endpoint,
    /// replies pushed back on the stream. Records the `x-api-key` header of
    /// every request it sees.
    struct FakeSseServer {
        url: String,
        api_keys: Arc<Mutex<Vec<String>>>,
        methods: Arc<Mutex<Vec<String>>>,
    }

    async fn read_http_request(
        reader: &mut tokio::io::BufReader<tokio::net::TcpStream>,
    ) -> Option<(String, HashMap<String, String>, Vec<u8>)> {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt};

        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.ok()? == 0 {
            return None;
        }
        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.ok()?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        let length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0; length];
        reader.read_exact(&mut body).await.ok()?;
        Some((request_line, headers, body))
    }

    fn sse_reply(request: &Value) -> Option<Value> {
        let id = request.get("id")?.clone();
        let result = match request.get("method")?.as_str()? {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": "fake-sse", "version": "0"}
            }),
            "tools/list" => json!({
                "tools": [{"name": "shout", "description": "Uppercase text", "inputSchema": {"type": "object"}}]
            }),
            "tools/call" => {
                let text = request["params"]["arguments"]["text"]
                    .as_str()
                    .unwrap_or_default()
                    .to_uppercase();
                json!({"content": [{"type": "text", "text": text}]})
            }
            other => return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("unknown method {other}")}
            })),
        };
        Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    async fn start_fake_sse_server() -> FakeSseServer {
        use tokio::io::AsyncWriteExt;
        use tokio::sync::mpsc;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let api_keys = Arc::new(Mutex::new(Vec::new()));
        let methods = Arc::new(Mutex::new(Vec::new()));
        let (stream_tx, stream_rx) = mpsc::unbounded_channel::<String>();
        let stream_rx = Arc::new(tokio::sync::Mutex::new(Some(stream_rx)));

        {
            let api_keys = api_keys.clone();
            let methods = methods.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    let api_keys = api_keys.clone();
                    let methods = methods.clone();
                    let stream_tx = stream_tx.clone();
                    let stream_rx = stream_rx.clone();
                    tokio::spawn(async move {
                        let mut reader = tokio::io::BufReader::new(socket);
                        let Some((request_line, headers, body)) =
                            read_http_request(&mut reader).await
                        else {
                            return;
                        };
                        if let Some(key) = headers.get("x-api-key") {
                            api_keys.lock().unwrap().push(key.clone());
                        }
                        let mut socket = reader.into_inner();

                        if request_line.starts_with("GET /sse") {
                            let Some(mut replies) = stream_rx.lock().await.take() else {
                                return;
                            };
                            let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nTransfer-Encoding: chunked\r\n\r\n";
                            if socket.write_all(head.as_bytes()).await.is_err() {
                                return;
                            }
                            let mut frames = vec![
                                ": connected\n\n".to_string(),
                                "event: endpoint\ndata: /messages?sessionId=abc\n\n".to_string(),
                            ];
                            loop {
                                for frame in frames.drain(..) {
                                    let chunk = format!("{:x}\r\n{frame}\r\n", frame.len());
                                    if socket.write_all(chunk.as_bytes()).await.is_err() {
                                        return;
                                    }
                                }
                                let _ = socket.flush().await;
                                match replies.recv().await {
                                    Some(reply) => {
                                        frames.push(format!("event: message\ndata: {reply}\n\n"))
                                    }
                                    None => return,
                                }
                            }
                        }

                        if request_line.starts_with("POST /messages?sessionId=abc") {
                            if let Ok(message) = serde_json::from_slice::<Value>(&body) {
                                if let Some(method) = message.get("method").and_then(|m| m.as_str()) {
                                    methods.lock().unwrap().push(method.to_string());
                                }
                                if let Some(reply) = sse_reply(&message) {
                                    let _ = stream_tx.send(reply.to_string());
                                }
                            }
                            let response = "HTTP/1.1 202 Accepted\r\nContent-Type: text/plain\r\nContent-Length: 8\r\nConnection: close\r\n\r\nAccepted";
                            let _ = socket.write_all(response.as_bytes()).await;
                            return;
                        }

                        let _ = socket
                            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                            .await;
                    });
                }
            });
        }

        FakeSseServer {
            url: format!("http://{addr}/sse"),
            api_keys,
            methods,
        }
    }

    #[tokio::test]
    async fn sse_server_round_trip_through_tool() {
        let server = start_fake_sse_server().await;
        let config = McpServerConfig {
            name: "remote".to_string(),
            kind: McpTransportKind::Sse,
            url: server.url.clone(),
            headers: HashMap::from([("x-api-key".to_string(), "secret".to_string())]),
            ..Default::default()
        };
        let gate = approver(true);
        let tool = McpTool::connect(&config, gate.clone(), Duration::from_secs(10))
            .await
            .expect("connect");

        assert_eq!(tool.name(), "remote");
        assert_eq!(tool.available_tools().len(), 1);
        assert_eq!(tool.available_tools()[0].name, "shout");

        let result = tool
            .execute(vec!["shout".to_string(), "{\"text\":\"hi\"}".to_string()])
            .await
            .expect("execute");
        assert!(result.success, "{}", result.output);
        assert_eq!(result.output, "HI\n");

        assert_eq!(
            server.methods.lock().unwrap().clone(),
            vec![
                "initialize",
                "notifications/initialized",
                "tools/list",
                "tools/call"
            ]
        );
        let keys = server.api_keys.lock().unwrap().clone();
        assert_eq!(keys.len(), 5, "stream plus four posts: {keys:?}");
        assert!(keys.iter().all(|k| k == "secret"));
        assert_eq!(gate.seen.lock().unwrap()[0].tool_name, "remote.shout");
    }

    #[tokio::test]
    async fn sse_connect_fails_without_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = McpServerConfig {
            name: "gone".to_string(),
            kind: McpTransportKind::Sse,
            url: format!("http://{addr}/sse"),
            ..Default::default()
        };
        assert!(McpTool::connect(&config, approver(true), Duration::from_secs(2))
            .await
            .is_err());
    }
}
