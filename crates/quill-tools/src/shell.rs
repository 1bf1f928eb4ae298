use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use quill_types::ToolResult;

use crate::Tool;

pub struct BashTool {
    working_dir: PathBuf,
    timeout: Duration,
}

impl BashTool {
    pub fn new(working_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            working_dir,
            timeout,
        }
    }

    fn command(&self, script: &str) -> Command {
        #[cfg(windows)]
        let mut command = {
            let mut c = Command::new("powershell");
            c.args(["-NoProfile", "-Command", script]);
            c
        };
        #[cfg(not(windows))]
        let mut command = {
            let mut c = Command::new("sh");
            c.args(["-c", script]);
            c
        };
        command
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory. args: the command words; they are joined with spaces."
    }

    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult> {
        let script = args.join(" ");
        if script.trim().is_empty() {
            return Ok(ToolResult::failure("No command provided"));
        }

        let child = self.command(&script).spawn()?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Ok(ToolResult::failure(format!(
                    "Command timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(ToolResult::ok(text))
        } else {
            if text.is_empty() {
                text = format!("Command exited with {}", output.status);
            }
            Ok(ToolResult::failure(text))
        }
    }
}
