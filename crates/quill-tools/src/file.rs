use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use quill_types::ToolResult;

use crate::{arg, resolve_path, Tool};

pub struct FileTool {
    working_dir: PathBuf,
}

impl FileTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for FileTool {
    fn name(&self) -> &str {
        "file"
    }

    fn description(&self) -> &str {
        "Inspect or delete a file. args: [operation (exists | size | delete), path]."
    }

    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult> {
        let (Some(op), Some(raw_path)) = (arg(&args, 0), arg(&args, 1)) else {
            return Ok(ToolResult::failure("operation and path are required"));
        };
        let path = resolve_path(&self.working_dir, raw_path);

        match op {
            "exists" => {
                let exists = fs::try_exists(&path).await.unwrap_or(false);
                Ok(ToolResult::ok(exists.to_string()))
            }
            "size" => match fs::metadata(&path).await {
                Ok(meta) => Ok(ToolResult::ok(meta.len().to_string())),
                Err(_) => Ok(ToolResult::failure(format!(
                    "File not found: {}",
                    path.display()
                ))),
            },
            "delete" => {
                if !fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                    return Ok(ToolResult::failure(format!(
                        "File not found: {}",
                        path.display()
                    )));
                }
                fs::remove_file(&path).await?;
                Ok(ToolResult::ok(format!("File deleted: {}", path.display())))
            }
            other => Ok(ToolResult::failure(format!(
                "Unknown operation: {other}. Supported: exists, size, delete"
            ))),
        }
    }
}
