use async_trait::async_trait;

use quill_types::ToolResult;

use crate::{arg, Tool};

/// Placeholder for nested agent delegation. Echoes its prompt back.
pub struct AgentTool;

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        "agent"
    }

    fn description(&self) -> &str {
        "Launch a sub-agent for tasks. args: [prompt]."
    }

    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult> {
        let Some(prompt) = arg(&args, 0) else {
            return Ok(ToolResult::failure("No prompt provided"));
        };
        Ok(ToolResult::ok(format!("Sub-agent result for: {prompt}")))
    }
}
