use std::fmt::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use quill_types::ToolResult;

use crate::{arg, display_relative, resolve_path, Tool};

pub struct LsTool {
    working_dir: PathBuf,
    max_files: usize,
}

impl LsTool {
    pub fn new(working_dir: PathBuf, max_files: usize) -> Self {
        Self {
            working_dir,
            max_files,
        }
    }
}

fn is_skipped(name: &str) -> bool {
    name.starts_with('.') || name == "__pycache__"
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List one directory level; directories end with '/'. args: [path (default '.')]."
    }

    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult> {
        let dir = resolve_path(&self.working_dir, arg(&args, 0).unwrap_or("."));
        if !fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(ToolResult::failure(format!(
                "Path does not exist or is not a directory: {}",
                dir.display()
            )));
        }

        let mut entries = Vec::new();
        let mut reader = fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_skipped(&name) {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push((name, is_dir));
        }
        if entries.is_empty() {
            return Ok(ToolResult::ok("Directory is empty"));
        }
        entries.sort();

        let truncated = entries.len() > self.max_files;
        entries.truncate(self.max_files);

        let mut out = String::new();
        let _ = writeln!(out, "- {}/", display_relative(&self.working_dir, &dir));
        for (name, is_dir) in &entries {
            let suffix = if *is_dir { "/" } else { "" };
            let _ = writeln!(out, "  - {name}{suffix}");
        }
        if truncated {
            let _ = write!(
                out,
                "\n(Results are truncated. There are more than {} files.)",
                self.max_files
            );
        }
        Ok(ToolResult::ok(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::args;

    #[tokio::test]
    async fn lists_visible_entries_and_marks_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("b.txt"), "").expect("write");
        std::fs::write(dir.path().join(".hidden"), "").expect("write");
        std::fs::create_dir(dir.path().join("src")).expect("mkdir");
        std::fs::create_dir(dir.path().join("__pycache__")).expect("mkdir");
        let tool = LsTool::new(dir.path().to_path_buf(), 1000);

        let result = tool.execute(args(&["."])).await.expect("execute");

        assert!(result.success);
        assert_eq!(result.output, "- ./\n  - b.txt\n  - src/\n");
    }

    #[tokio::test]
    async fn nested_directory_header_is_relative() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("src/bin")).expect("mkdir");
        std::fs::write(dir.path().join("src/main.rs"), "").expect("write");
        let tool = LsTool::new(dir.path().to_path_buf(), 1000);

        let result = tool.execute(args(&["src"])).await.expect("execute");

        assert_eq!(result.output, "- src/\n  - bin/\n  - main.rs\n");
    }

    #[tokio::test]
    async fn truncates_past_cap_with_notice() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), "").expect("write");
        }
        let tool = LsTool::new(dir.path().to_path_buf(), 3);

        let result = tool.execute(Vec::new()).await.expect("execute");

        assert_eq!(result.output.matches("  - ").count(), 3);
        assert!(result
            .output
            .ends_with("(Results are truncated. There are more than 3 files.)"));

        let exact = LsTool::new(dir.path().to_path_buf(), 5);
        let full = exact.execute(Vec::new()).await.expect("execute");
        assert!(!full.output.contains("truncated"));
    }

    #[tokio::test]
    async fn empty_and_missing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = LsTool::new(dir.path().to_path_buf(), 10);

        let empty = tool.execute(Vec::new()).await.expect("execute");
        assert_eq!(empty.output, "Directory is empty");

        let missing = tool.execute(args(&["missing"])).await.expect("execute");
        assert!(!missing.success);
        assert!(missing
            .output
            .starts_with("Path does not exist or is not a directory: "));
    }
}
