use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;

use quill_types::ToolResult;

use crate::{arg, display_relative, resolve_path, Tool};

/// Translates `*`, `?` and `{a,b}` into an anchored regex. Everything else is literal.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut in_group = false;
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '{' if !in_group => {
                in_group = true;
                out.push('(');
            }
            '}' if in_group => {
                in_group = false;
                out.push(')');
            }
            ',' if in_group => out.push('|'),
            other => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }
    // an unterminated `{` leaves the group open and Regex::new rejects it
    out.push('$');
    Regex::new(&out)
}

/// Regular files under `root` accepted by `keep`, newest first, at most `limit`.
fn newest_files(root: &Path, limit: usize, keep: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(true)
        .build();

    let mut found: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in walker.flatten() {
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if !keep(path) {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((path.to_path_buf(), modified));
    }
    found.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    found.truncate(limit);
    found.into_iter().map(|(path, _)| path).collect()
}

fn file_name_matches(regex: &Regex, path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| regex.is_match(n))
        .unwrap_or(false)
}

fn render_found(working_dir: &Path, files: &[PathBuf]) -> String {
    let mut out = format!("Found {} file(s):\n", files.len());
    for file in files {
        let _ = writeln!(out, "{}", display_relative(working_dir, file));
    }
    out
}

pub struct GlobTool {
    working_dir: PathBuf,
    limit: usize,
}

impl GlobTool {
    pub fn new(working_dir: PathBuf, limit: usize) -> Self {
        Self { working_dir, limit }
    }
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files whose name matches a glob (*, ?, {a,b}), newest first. args: [pattern, path (default working directory)]."
    }

    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult> {
        let Some(pattern) = arg(&args, 0).map(str::to_string) else {
            return Ok(ToolResult::failure("pattern is required"));
        };
        let regex = match glob_to_regex(&pattern) {
            Ok(regex) => regex,
            Err(err) => return Ok(ToolResult::failure(format!("Invalid glob pattern: {err}"))),
        };
        let root = arg(&args, 1)
            .map(|p| resolve_path(&self.working_dir, p))
            .unwrap_or_else(|| self.working_dir.clone());
        if !root.is_dir() {
            return Ok(ToolResult::failure(format!(
                "Path does not exist or is not a directory: {}",
                root.display()
            )));
        }

        let limit = self.limit;
        let files = tokio::task::spawn_blocking(move || {
            newest_files(&root, limit, |path| file_name_matches(&regex, path))
        })
        .await?;

        if files.is_empty() {
            return Ok(ToolResult::ok(format!(
                "No files found matching pattern: {pattern}"
            )));
        }
        Ok(ToolResult::ok(render_found(&self.working_dir, &files)))
    }
}

pub struct GrepTool {
    working_dir: PathBuf,
    limit: usize,
}

impl GrepTool {
    pub fn new(working_dir: PathBuf, limit: usize) -> Self {
        Self { working_dir, limit }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Find files with a line matching a regex, newest first. args: [pattern, path (default working directory), include (file-name glob, optional)]."
    }

    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult> {
        let Some(pattern) = arg(&args, 0).map(str::to_string) else {
            return Ok(ToolResult::failure("pattern is required"));
        };
        let content_regex = match Regex::new(&pattern) {
            Ok(regex) => regex,
            Err(err) => return Ok(ToolResult::failure(format!("Invalid regex pattern: {err}"))),
        };
        let include = match arg(&args, 2).map(glob_to_regex).transpose() {
            Ok(include) => include,
            Err(err) => {
                return Ok(ToolResult::failure(format!(
                    "Invalid include pattern: {err}"
                )))
            }
        };
        let root = arg(&args, 1)
            .map(|p| resolve_path(&self.working_dir, p))
            .unwrap_or_else(|| self.working_dir.clone());
        if !root.is_dir() {
            return Ok(ToolResult::failure(format!(
                "Path does not exist or is not a directory: {}",
                root.display()
            )));
        }

        let limit = self.limit;
        let files = tokio::task::spawn_blocking(move || {
            newest_files(&root, limit, |path| {
                if let Some(include) = &include {
                    if !file_name_matches(include, path) {
                        return false;
                    }
                }
                // unreadable or non-UTF-8 files are skipped
                match std::fs::read_to_string(path) {
                    Ok(text) => text.lines().any(|line| content_regex.is_match(line)),
                    Err(_) => false,
                }
            })
        })
        .await?;

        if files.is_empty() {
            return Ok(ToolResult::ok(format!(
                "No files found containing pattern: {pattern}"
            )));
        }
        Ok(ToolResult::ok(render_found(&self.working_dir, &files)))
    }
}
