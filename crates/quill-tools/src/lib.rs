use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use quill_types::{CreatePermissionRequest, ToolDefinition, ToolResult};

mod agent;
mod edit;
mod file;
mod ls;
mod search;
mod shell;
mod view;

pub use agent::AgentTool;
pub use edit::{EditTool, WriteTool};
pub use file::FileTool;
pub use ls::LsTool;
pub use search::{glob_to_regex, GlobTool, GrepTool};
pub use shell::BashTool;
pub use view::ViewTool;

/// A named capability offered to the model. Arguments are positional strings.
///
/// Expected failures (missing file, denied permission) come back as
/// `ToolResult { success: false, .. }`; `Err` is reserved for I/O surprises
/// and is turned into a failed result by the caller.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn execute(&self, args: Vec<String>) -> anyhow::Result<ToolResult>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            schema: positional_args_schema(),
        }
    }
}

/// Human approval for side-effecting work. Resolves to `false` on deny or timeout.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn request(&self, request: CreatePermissionRequest) -> bool;
}

pub fn positional_args_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "args": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Positional arguments, in the order given by the tool description"
            }
        },
        "required": ["args"]
    })
}

#[derive(Debug, Clone)]
pub struct ToolOptions {
    pub ls_max_files: usize,
    pub search_limit: usize,
    pub bash_timeout: Duration,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            ls_max_files: 1000,
            search_limit: 100,
            bash_timeout: Duration::from_secs(120),
        }
    }
}

/// Flat, order-preserving list of tools resolved by exact name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The nine local tools, all rooted at `working_dir`.
    pub fn builtin(
        working_dir: impl Into<PathBuf>,
        approver: Arc<dyn Approver>,
        options: ToolOptions,
    ) -> Self {
        let root: PathBuf = working_dir.into();
        let mut registry = Self::new();
        registry.register(Arc::new(BashTool::new(root.clone(), options.bash_timeout)));
        registry.register(Arc::new(ViewTool::new(root.clone())));
        registry.register(Arc::new(EditTool::new(root.clone())));
        registry.register(Arc::new(WriteTool::new(root.clone(), approver)));
        registry.register(Arc::new(FileTool::new(root.clone())));
        registry.register(Arc::new(LsTool::new(root.clone(), options.ls_max_files)));
        registry.register(Arc::new(GlobTool::new(root.clone(), options.search_limit)));
        registry.register(Arc::new(GrepTool::new(root, options.search_limit)));
        registry.register(Arc::new(AgentTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        if self.get(tool.name()).is_some() {
            tracing::warn!(tool = tool.name(), "duplicate tool name; first registration wins");
        }
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Rejects array schemas without `items`; some completion endpoints refuse them.
pub fn validate_tool_schemas(
    definitions: &[ToolDefinition],
) -> Result<(), ToolSchemaValidationError> {
    for definition in definitions {
        validate_schema_node(&definition.name, "$", &definition.schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }
    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    Ok(())
}

/// Joins relative paths onto `root`; absolute paths pass through.
pub(crate) fn resolve_path(root: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    }
}

/// `path` relative to `root` when it lives underneath, else as given.
pub(crate) fn display_relative(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

pub(crate) fn arg<'a>(args: &'a [String], idx: usize) -> Option<&'a str> {
    args.get(idx).map(|s| s.as_str()).filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Approver with a fixed answer that counts how often it was asked.
    pub struct FixedApprover {
        pub answer: bool,
        pub asked: AtomicUsize,
        pub last: std::sync::Mutex<Option<CreatePermissionRequest>>,
    }

    impl FixedApprover {
        pub fn new(answer: bool) -> Arc<Self> {
            Arc::new(Self {
                answer,
                asked: AtomicUsize::new(0),
                last: std::sync::Mutex::new(None),
            })
        }

        pub fn asked(&self) -> usize {
            self.asked.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Approver for FixedApprover {
        async fn request(&self, request: CreatePermissionRequest) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request);
            self.answer
        }
    }

    pub fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FixedApprover;
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn validator_rejects_array_without_items() {
        let definitions = vec![ToolDefinition {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            schema: json!({
                "type":"object",
                "properties":{"args":{"type":"array"}}
            }),
        }];
        let err =
            validate_tool_schemas(&definitions).expect_err("expected schema validation failure");
        assert_eq!(err.tool_name, "bad");
        assert!(err.path.contains("properties.args"));
    }

    #[test]
    fn builtin_registry_keeps_order_and_valid_schemas() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry =
            ToolRegistry::builtin(dir.path(), FixedApprover::new(true), ToolOptions::default());
        assert_eq!(
            registry.names(),
            vec!["bash", "view", "edit", "write", "file", "ls", "glob", "grep", "agent"]
        );
        let definitions = registry.definitions();
        validate_tool_schemas(&definitions).expect("builtin schemas should validate");
        let unique = definitions
            .iter()
            .map(|d| d.name.as_str())
            .collect::<HashSet<_>>();
        assert_eq!(unique.len(), definitions.len());
        assert!(definitions
            .iter()
            .all(|d| d.schema["properties"]["args"]["items"]["type"] == "string"));
    }

    #[test]
    fn registry_resolves_exact_names_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry =
            ToolRegistry::builtin(dir.path(), FixedApprover::new(true), ToolOptions::default());
        assert!(registry.get("ls").is_some());
        assert!(registry.get("LS").is_none());
        assert!(registry.get("l").is_none());
    }

    #[test]
    fn relative_paths_are_rooted() {
        let root = Path::new("/work");
        assert_eq!(resolve_path(root, "a/b.txt"), PathBuf::from("/work/a/b.txt"));
        assert_eq!(resolve_path(root, "/etc/hosts"), PathBuf::from("/etc/hosts"));
        assert_eq!(display_relative(root, Path::new("/work/a/b.txt")), "a/b.txt");
        assert_eq!(display_relative(root, root), ".");
        assert_eq!(display_relative(root, Path::new("/tmp/x")), "/tmp/x");
    }
}
