use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use quill_providers::{ProviderSettings, DEFAULT_BASE_URL, DEFAULT_MODEL};
use quill_tools::ToolOptions;
use quill_types::McpServerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub permission_timeout_secs: u64,
    pub max_concurrent_requests: usize,
    pub ls_max_files: usize,
    pub search_limit: usize,
    pub bash_timeout_secs: u64,
    pub mcp_timeout_secs: u64,
    pub mcp_servers: Vec<McpServerConfig>,
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            system_prompt: None,
            working_dir: None,
            permission_timeout_secs: 600,
            max_concurrent_requests: 8,
            ls_max_files: 1000,
            search_limit: 100,
            bash_timeout_secs: 120,
            mcp_timeout_secs: 30,
            mcp_servers: Vec::new(),
            debug: false,
        }
    }
}

impl AppConfig {
    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            ..ProviderSettings::default()
        }
    }

    pub fn tool_options(&self) -> ToolOptions {
        ToolOptions {
            ls_max_files: self.ls_max_files,
            search_limit: self.search_limit,
            bash_timeout: Duration::from_secs(self.bash_timeout_secs),
        }
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_secs)
    }

    pub fn mcp_timeout(&self) -> Duration {
        Duration::from_secs(self.mcp_timeout_secs)
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// JSON configuration merged from, lowest first: built-in defaults, the
/// global file, the project file, environment variables, CLI overrides.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    global_path: Option<PathBuf>,
    project_path: PathBuf,
    layers: ConfigLayers,
}

impl ConfigStore {
    /// `project_path` defaults to `<working_dir>/.quill/config.json`.
    pub async fn load(
        working_dir: &Path,
        project_path: Option<PathBuf>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path =
            project_path.unwrap_or_else(|| working_dir.join(".quill").join("config.json"));
        let global_path = resolve_global_config_path();

        let global = match &global_path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let project = read_json_file(&project_path).await?;

        Ok(Self {
            global_path,
            project_path,
            layers: ConfigLayers {
                global,
                project,
                env: env_layer(|key| std::env::var(key).ok()),
                cli: cli_overrides.unwrap_or_else(empty_object),
            },
        })
    }

    pub fn global_path(&self) -> Option<&Path> {
        self.global_path.as_deref()
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn merged(&self) -> anyhow::Result<Value> {
        let mut merged = serde_json::to_value(AppConfig::default())?;
        for layer in [
            &self.layers.global,
            &self.layers.project,
            &self.layers.env,
            &self.layers.cli,
        ] {
            deep_merge(&mut merged, layer);
        }
        Ok(merged)
    }

    pub fn config(&self) -> anyhow::Result<AppConfig> {
        serde_json::from_value(self.merged()?).context("invalid configuration")
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(empty_object());
    }
    serde_json::from_str::<Value>(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn resolve_global_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("QUILL_GLOBAL_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("quill").join("config.json"))
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    if let Some(key) = get("QUILL_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
        deep_merge(&mut root, &json!({ "api_key": key }));
    }
    if let Some(url) = get("QUILL_BASE_URL") {
        deep_merge(&mut root, &json!({ "base_url": url }));
    }
    if let Some(model) = get("QUILL_MODEL") {
        deep_merge(&mut root, &json!({ "model": model }));
    }
    if let Some(debug) = get("QUILL_DEBUG").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "debug": debug }));
    }
    root
}

fn parse_bool_like(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
