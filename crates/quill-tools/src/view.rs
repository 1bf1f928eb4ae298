use std::fmt::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use quill_types::ToolResult;

use crate::{arg, resolve_path, Tool};

const MAX_FILE_BYTES: u64 = 250 * 1024;
const DEFAULT_LIMIT: usize = 2000;
const MAX_LINE_CHARS: usize = 2000;
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "svg", "webp"];

pub struct ViewTool {
    working_dir: PathBuf,
}

impl ViewTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for ViewTool {
    fn name(&self) -> &str {
        "view"
    }

    fn description(&self) -> &str {
        "Read a text file with line numbers. args: [file_path, offset (lines to skip, default 0), limit (default 2000)]."
    }

    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult> {
        let Some(raw_path) = arg(&args, 0) else {
            return Ok(ToolResult::failure("file_path is required"));
        };
        let offset = match arg(&args, 1).map(|s| s.trim().parse::<usize>()) {
            None => 0,
            Some(Ok(v)) => v,
            Some(Err(_)) => return Ok(ToolResult::failure("Invalid offset parameter")),
        };
        let limit = match arg(&args, 2).map(|s| s.trim().parse::<usize>()) {
            None => DEFAULT_LIMIT,
            Some(Ok(v)) => v,
            Some(Err(_)) => return Ok(ToolResult::failure("Invalid limit parameter")),
        };

        let path = resolve_path(&self.working_dir, raw_path);
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image {
            return Ok(ToolResult::failure("Reading images is not supported yet"));
        }

        let Ok(meta) = fs::metadata(&path).await else {
            return Ok(ToolResult::failure(format!(
                "File not found: {}",
                path.display()
            )));
        };
        if meta.is_dir() {
            return Ok(ToolResult::failure(format!(
                "Path is a directory, not a file: {}",
                path.display()
            )));
        }
        if meta.len() > MAX_FILE_BYTES {
            return Ok(ToolResult::failure(format!(
                "File is too large ({} bytes). Maximum size is 250KB",
                meta.len()
            )));
        }

        let bytes = fs::read(&path).await?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(ToolResult::ok(render_window(&text, offset, limit)))
    }
}

fn render_window(text: &str, offset: usize, limit: usize) -> String {
    let mut out = String::new();
    for (idx, line) in text.lines().enumerate().skip(offset).take(limit) {
        let shown = if line.chars().count() > MAX_LINE_CHARS {
            let cut: String = line.chars().take(MAX_LINE_CHARS).collect();
            format!("{cut}...")
        } else {
            line.to_string()
        };
        let _ = writeln!(out, "{:>6}\t|{}", idx + 1, shown);
    }
    out
}
