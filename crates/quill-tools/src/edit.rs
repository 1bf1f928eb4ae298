use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;

use quill_types::{CreatePermissionRequest, ToolResult};

use crate::{arg, resolve_path, Approver, Tool};

pub struct EditTool {
    working_dir: PathBuf,
}

impl EditTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace the first exact occurrence of a string in a file. args: [file_path, old_string, new_string]."
    }

    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult> {
        let (Some(raw_path), Some(old), Some(new)) =
            (arg(&args, 0), args.get(1).filter(|s| !s.is_empty()), args.get(2))
        else {
            return Ok(ToolResult::failure(
                "file_path, old_string, and new_string are required",
            ));
        };

        let path = resolve_path(&self.working_dir, raw_path);
        let Ok(content) = fs::read_to_string(&path).await else {
            return Ok(ToolResult::failure(format!(
                "Failed to read file: {}",
                path.display()
            )));
        };
        if !content.contains(old.as_str()) {
            return Ok(ToolResult::failure(format!(
                "Old string not found in file: {}",
                path.display()
            )));
        }

        fs::write(&path, content.replacen(old.as_str(), new, 1)).await?;
        Ok(ToolResult::ok(format!(
            "File edited successfully: {}",
            path.display()
        )))
    }
}

pub struct WriteTool {
    working_dir: PathBuf,
    approver: Arc<dyn Approver>,
}

impl WriteTool {
    pub fn new(working_dir: PathBuf, approver: Arc<dyn Approver>) -> Self {
        Self {
            working_dir,
            approver,
        }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file, creating parent directories. args: [file_path, content]."
    }

    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult> {
        let Some(raw_path) = arg(&args, 0) else {
            return Ok(ToolResult::failure("file_path is required"));
        };
        let content = args.get(1).cloned().unwrap_or_default();
        let path = resolve_path(&self.working_dir, raw_path);

        let approved = self
            .approver
            .request(CreatePermissionRequest::new(
                "write",
                format!("Write to file {}", path.display()),
                "write",
                self.working_dir.display().to_string(),
            ))
            .await;
        if !approved {
            return Ok(ToolResult::failure("Permission denied"));
        }

        if fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(ToolResult::failure(format!(
                "Path is a directory, not a file: {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;
        Ok(ToolResult::ok(format!("File written: {}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{args, FixedApprover};

    #[tokio::test]
    async fn edit_replaces_first_occurrence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "foo bar foo").expect("write");
        let tool = EditTool::new(dir.path().to_path_buf());

        let result = tool
            .execute(args(&["a.txt", "foo", "baz"]))
            .await
            .expect("execute");

        assert!(result.success);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "baz bar foo");
    }

    #[tokio::test]
    async fn edit_missing_string_is_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello").expect("write");
        let tool = EditTool::new(dir.path().to_path_buf());

        let result = tool
            .execute(args(&["a.txt", "absent", "x"]))
            .await
            .expect("execute");

        assert!(!result.success);
        assert!(result.output.starts_with("Old string not found in file: "));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "hello");

        let incomplete = tool.execute(args(&["a.txt"])).await.expect("execute");
        assert_eq!(
            incomplete.output,
            "file_path, old_string, and new_string are required"
        );
    }

    #[tokio::test]
    async fn write_asks_gate_and_creates_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let approver = FixedApprover::new(true);
        let tool = WriteTool::new(dir.path().to_path_buf(), approver.clone());

        let result = tool
            .execute(args(&["nested/deep/out.txt", "content"]))
            .await
            .expect("execute");

        assert!(result.success, "{}", result.output);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("nested/deep/out.txt")).expect("read"),
            "content"
        );
        assert_eq!(approver.asked(), 1);
        let asked = approver.last.lock().unwrap().clone().expect("request");
        assert_eq!(asked.tool_name, "write");
        assert_eq!(asked.action, "write");
        assert!(asked.description.starts_with("Write to file "));
    }

    #[tokio::test]
    async fn write_denied_leaves_disk_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = WriteTool::new(dir.path().to_path_buf(), FixedApprover::new(false));

        let result = tool
            .execute(args(&["out.txt", "content"]))
            .await
            .expect("execute");

        assert!(!result.success);
        assert_eq!(result.output, "Permission denied");
        assert!(!dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn write_refuses_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        let tool = WriteTool::new(dir.path().to_path_buf(), FixedApprover::new(true));

        let result = tool.execute(args(&["sub", "x"])).await.expect("execute");

        assert!(!result.success);
        assert!(result.output.starts_with("Path is a directory"));
        assert!(dir.path().join("sub").is_dir());
    }
}
