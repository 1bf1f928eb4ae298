use std::path::{Path, PathBuf};
use std::sync::Arc;

use quill_providers::{OpenAICompatibleProvider, Provider};
use quill_runtime::McpTool;
use quill_tools::{Approver, ToolRegistry};

use crate::config::AppConfig;
use crate::logger::Logger;
use crate::orchestrator::{AgentOrchestrator, OrchestratorOptions};
use crate::permissions::PermissionGate;
use crate::storage::Storage;

/// Everything a front end needs, wired from one [`AppConfig`].
#[derive(Clone)]
pub struct EngineRuntime {
    pub config: AppConfig,
    pub working_dir: PathBuf,
    pub storage: Arc<Storage>,
    pub gate: PermissionGate,
    pub logger: Logger,
    pub orchestrator: AgentOrchestrator,
}

impl EngineRuntime {
    /// Builds storage, the permission gate, tools (including MCP servers) and
    /// the orchestrator. With no `state_dir` the message store stays in memory.
    pub async fn start(config: AppConfig, state_dir: Option<&Path>) -> anyhow::Result<Self> {
        let working_dir = match &config.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let storage = Arc::new(match state_dir {
            Some(dir) => Storage::new(dir).await?,
            None => Storage::in_memory(),
        });
        let logger = Logger::new();
        let gate = PermissionGate::with_timeout(config.permission_timeout());
        let provider: Arc<dyn Provider> =
            Arc::new(OpenAICompatibleProvider::new(config.provider_settings())?);
        if config.api_key.is_none() {
            logger.warn("no API key configured; completion requests will fail");
        }

        let tools = build_tool_registry(&config, &working_dir, &gate, &logger).await;
        tracing::info!(tools = ?tools.names(), "tool registry ready");

        let orchestrator = AgentOrchestrator::new(
            storage.clone(),
            provider,
            tools,
            gate.clone(),
            logger.clone(),
            OrchestratorOptions {
                system_prompt: config.system_prompt.clone(),
                working_dir: working_dir.clone(),
                max_concurrent_requests: config.max_concurrent_requests,
            },
        );

        Ok(Self {
            config,
            working_dir,
            storage,
            gate,
            logger,
            orchestrator,
        })
    }

    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
    }
}

/// Built-in tools followed by one tool per reachable MCP server.
pub async fn build_tool_registry(
    config: &AppConfig,
    working_dir: &Path,
    gate: &PermissionGate,
    logger: &Logger,
) -> ToolRegistry {
    let approver: Arc<dyn Approver> = Arc::new(gate.clone());
    let mut registry = ToolRegistry::builtin(working_dir, approver.clone(), config.tool_options());
    for server in &config.mcp_servers {
        match McpTool::connect(server, approver.clone(), config.mcp_timeout()).await {
            Ok(tool) => registry.register(Arc::new(tool)),
            Err(err) => logger.warn(format!("skipping MCP server `{}`: {err}", server.name)),
        }
    }
    registry
}
