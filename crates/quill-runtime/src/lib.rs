pub mod mcp;
mod transport;

pub use mcp::{McpClient, McpError, McpRemoteTool, McpTool};
pub use transport::{McpTransport, SseTransport, StdioTransport};
