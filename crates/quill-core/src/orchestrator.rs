use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::Level;

use quill_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use quill_providers::{Completion, Provider};
use quill_tools::{validate_tool_schemas, ToolRegistry};
use quill_types::{
    AgentEvent, AgentEventType, ConversationTurn, CreatePermissionRequest, EventType, Message,
    Role, ToolCall, ToolDefinition, ToolResult,
};

use crate::error::EngineError;
use crate::event_bus::{Channel, EventBroker};
use crate::logger::Logger;
use crate::permissions::{with_session, PermissionGate};
use crate::session_title::generate_title;
use crate::storage::MessageStore;

const COMPONENT: &str = "orchestrator";

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub system_prompt: Option<String>,
    pub working_dir: PathBuf,
    pub max_concurrent_requests: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            working_dir: PathBuf::from("."),
            max_concurrent_requests: 8,
        }
    }
}

pub fn default_system_prompt(working_dir: &std::path::Path) -> String {
    format!(
        "You are a coding assistant working in the directory {}. \
         Use the provided tools when they help answer the user. Every tool takes a single \
         `args` array of positional strings, in the order given by the tool's description. \
         Keep answers concise.",
        working_dir.display()
    )
}

struct Inner {
    store: Arc<dyn MessageStore>,
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    definitions: Vec<ToolDefinition>,
    gate: PermissionGate,
    logger: Logger,
    events: EventBroker<AgentEvent>,
    system_prompt: String,
    working_dir: PathBuf,
    workers: Arc<Semaphore>,
    queues: Mutex<Queues>,
}

#[derive(Default)]
struct Queues {
    closed: bool,
    by_session: HashMap<String, mpsc::UnboundedSender<String>>,
}

/// Turns user messages into completion calls, gated tool runs and replies.
///
/// Requests for one session are handled strictly in submission order; at most
/// `max_concurrent_requests` requests run at once across all sessions.
#[derive(Clone)]
pub struct AgentOrchestrator {
    inner: Arc<Inner>,
}

impl AgentOrchestrator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        gate: PermissionGate,
        logger: Logger,
        options: OrchestratorOptions,
    ) -> Self {
        let definitions = tools.definitions();
        if let Err(err) = validate_tool_schemas(&definitions) {
            logger.warn(format!("tool schema rejected by validator: {err}"));
        }
        let system_prompt = options
            .system_prompt
            .unwrap_or_else(|| default_system_prompt(&options.working_dir));
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                tools,
                definitions,
                gate,
                logger,
                events: EventBroker::new(),
                system_prompt,
                working_dir: options.working_dir,
                workers: Arc::new(Semaphore::new(options.max_concurrent_requests.max(1))),
                queues: Mutex::new(Queues::default()),
            }),
        }
    }

    pub fn subscribe(&self) -> Channel<AgentEvent> {
        self.inner.events.subscribe()
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.inner.gate
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    pub fn generate_title(&self, content: &str) -> String {
        generate_title(content)
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes a `Request` event and queues the work. Never waits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn send_request(&self, session_id: &str, content: &str) {
        let mut queues = self.queues();
        if queues.closed {
            self.inner
                .logger
                .warn(format!("dropping request for session {session_id}: orchestrator shut down"));
            return;
        }
        self.inner.events.publish(
            EventType::Created,
            AgentEvent::new(AgentEventType::Request, session_id, content),
        );

        let delivered = queues
            .by_session
            .get(session_id)
            .map(|tx| tx.send(content.to_string()).is_ok())
            .unwrap_or(false);
        if !delivered {
            let tx = self.spawn_session_worker(session_id);
            // the receiver was just created, so this cannot fail
            let _ = tx.send(content.to_string());
            queues.by_session.insert(session_id.to_string(), tx);
        }
    }

    fn spawn_session_worker(&self, session_id: &str) -> mpsc::UnboundedSender<String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let workers = self.inner.workers.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            while let Some(content) = rx.recv().await {
                let Ok(_permit) = workers.clone().acquire_owned().await else {
                    break;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let orchestrator = AgentOrchestrator { inner };
                let task = {
                    let orchestrator = orchestrator.clone();
                    let session_id = session_id.clone();
                    let content = content.clone();
                    tokio::spawn(async move { orchestrator.run_request(&session_id, &content).await })
                };
                if let Err(join_err) = task.await {
                    orchestrator
                        .fail(
                            &session_id,
                            EngineError::Protocol(format!("worker aborted: {join_err}")),
                        )
                        .await;
                }

                // sends happen under the same lock, so an empty queue here stays empty
                let idle = {
                    let mut queues = orchestrator.queues();
                    let idle = rx.is_empty();
                    if idle {
                        queues.by_session.remove(&session_id);
                    }
                    idle
                };
                if idle {
                    break;
                }
            }
            tracing::debug!(session_id = %session_id, "session worker stopped");
        });
        tx
    }

    /// Stops accepting work and closes event and permission channels.
    pub fn shutdown(&self) {
        {
            let mut queues = self.queues();
            queues.closed = true;
            queues.by_session.clear();
        }
        self.inner.workers.close();
        self.inner.gate.shutdown();
        self.inner.events.shutdown();
    }

    async fn run_request(&self, session_id: &str, content: &str) {
        let started = Instant::now();
        match self.run_turn(session_id, content).await {
            Ok(_) => emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    session_id: Some(session_id),
                    status: Some("response"),
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                    ..ObservabilityEvent::new("request.finish", COMPONENT)
                },
            ),
            Err(err) => self.fail(session_id, err).await,
        }
    }

    async fn fail(&self, session_id: &str, err: EngineError) {
        let text = format!("LLM error: {err}");
        self.inner
            .logger
            .error(format!("request for session {session_id} failed: {err}"));
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                session_id: Some(session_id),
                status: Some(err.kind()),
                detail: Some(&text),
                ..ObservabilityEvent::new("request.error", COMPONENT)
            },
        );
        if let Err(store_err) = self
            .inner
            .store
            .create(session_id, Role::Assistant, &text)
            .await
        {
            self.inner.logger.error(format!(
                "could not persist error reply for session {session_id}: {store_err:#}"
            ));
        }
        self.inner.events.publish(
            EventType::Created,
            AgentEvent::new(AgentEventType::Error, session_id, text),
        );
    }

    async fn run_turn(&self, session_id: &str, content: &str) -> Result<String, EngineError> {
        let history = self.inner.store.list(session_id).await?;
        let mut turns = self.assemble(&history, content);

        let first = self
            .complete(session_id, &turns, &self.inner.definitions)
            .await?;
        let reply = if first.tool_calls.is_empty() {
            first.content
        } else {
            turns.push(ConversationTurn::assistant_with_calls(
                first.content,
                first.tool_calls.clone(),
            ));
            for call in &first.tool_calls {
                let output = self.run_tool_call(session_id, call).await;
                turns.push(ConversationTurn::tool(call.id.clone(), output));
            }
            // tools are not re-offered: one tool round per request
            self.complete(session_id, &turns, &[]).await?.content
        };

        self.inner
            .store
            .create(session_id, Role::Assistant, &reply)
            .await?;
        self.inner.events.publish(
            EventType::Created,
            AgentEvent::new(AgentEventType::Response, session_id, reply.clone()),
        );
        Ok(reply)
    }

    fn assemble(&self, history: &[Message], content: &str) -> Vec<ConversationTurn> {
        let mut turns = Vec::with_capacity(history.len() + 2);
        turns.push(ConversationTurn::system(self.inner.system_prompt.clone()));
        turns.extend(
            history
                .iter()
                .map(|m| ConversationTurn::new(m.role, m.content.clone())),
        );
        let already_last = history
            .last()
            .map(|m| m.role == Role::User && m.content == content)
            .unwrap_or(false);
        if !already_last {
            turns.push(ConversationTurn::user(content));
        }
        turns
    }

    async fn complete(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
        tools: &[ToolDefinition],
    ) -> Result<Completion, EngineError> {
        let model = self.inner.provider.model().to_string();
        let started = Instant::now();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                session_id: Some(session_id),
                model_id: Some(&model),
                status: Some("start"),
                ..ObservabilityEvent::new("provider.call.start", COMPONENT)
            },
        );
        match self.inner.provider.complete(turns, tools).await {
            Ok(completion) => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        session_id: Some(session_id),
                        model_id: Some(&model),
                        status: Some(if completion.tool_calls.is_empty() {
                            "text"
                        } else {
                            "tool_calls"
                        }),
                        duration_ms: Some(started.elapsed().as_millis() as u64),
                        ..ObservabilityEvent::new("provider.call.finish", COMPONENT)
                    },
                );
                Ok(completion)
            }
            Err(err) => {
                let detail = err.to_string();
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        session_id: Some(session_id),
                        model_id: Some(&model),
                        status: Some("failed"),
                        duration_ms: Some(started.elapsed().as_millis() as u64),
                        detail: Some(&detail),
                        ..ObservabilityEvent::new("provider.call.error", COMPONENT)
                    },
                );
                Err(err.into())
            }
        }
    }

    /// Runs one requested call. Every outcome becomes text for the tool turn.
    async fn run_tool_call(&self, session_id: &str, call: &ToolCall) -> String {
        let name = call.function.name.as_str();
        let Some(tool) = self.inner.tools.get(name) else {
            self.inner
                .logger
                .warn(format!("model requested unknown tool `{name}`; skipped"));
            return format!("Error: unknown tool `{name}`");
        };
        let args = match parse_tool_args(&call.function.arguments) {
            Ok(args) => args,
            Err(err) => {
                self.inner
                    .logger
                    .warn(format!("malformed arguments for `{name}`: {err}"));
                return format!("Error: invalid arguments for `{name}`: {err}");
            }
        };

        let approved = with_session(
            session_id,
            self.inner.gate.request(CreatePermissionRequest::new(
                name,
                format!("Run tool `{name}` with arguments {args:?}"),
                "execute",
                self.inner.working_dir.display().to_string(),
            )),
        )
        .await;
        if !approved {
            self.inner
                .logger
                .info(format!("tool `{name}` denied for session {session_id}"));
            return format!("Permission denied for tool `{name}`");
        }

        let started = Instant::now();
        let result = match with_session(session_id, tool.execute(args)).await {
            Ok(result) => result,
            Err(err) => ToolResult::failure(format!("Error: {err:#}")),
        };
        let arguments = redact_text(&call.function.arguments);
        emit_event(
            if result.success { Level::INFO } else { Level::WARN },
            ProcessKind::Engine,
            ObservabilityEvent {
                session_id: Some(session_id),
                tool: Some(name),
                status: Some(if result.success { "ok" } else { "failed" }),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                detail: Some(&arguments),
                ..ObservabilityEvent::new("tool.execute", COMPONENT)
            },
        );
        result.output
    }
}

/// Extracts the positional `args` array from a tool call's JSON arguments.
fn parse_tool_args(raw: &str) -> Result<Vec<String>, String> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let Some(object) = value.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };
    match object.get("args") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()),
        Some(Value::String(single)) => Ok(vec![single.clone()]),
        Some(_) => Err("`args` must be an array of strings".to_string()),
    }
}
