use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quill_core::{generate_title, Channel, ConfigStore, EngineRuntime, MessageStore};
use quill_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, redact_text,
    ObservabilityEvent, ProcessKind, DEFAULT_RETENTION_DAYS,
};
use quill_types::{
    AgentEvent, AgentEventType, PermissionDecision, PermissionRequest, PermissionResponse, Role,
};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

#[derive(Parser, Debug)]
#[command(name = "quill-engine")]
#[command(about = "Terminal coding assistant for OpenAI-compatible endpoints")]
struct Cli {
    /// Project config file (default: <working-dir>/.quill/config.json)
    #[arg(long, global = true)]
    config: Option<String>,
    #[arg(long, global = true, env = "QUILL_STATE_DIR")]
    state_dir: Option<String>,
    #[arg(long, global = true)]
    working_dir: Option<String>,
    #[arg(long, global = true)]
    model: Option<String>,
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[arg(long, global = true)]
    api_key: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one prompt in a fresh session and print the reply.
    Run {
        prompt: String,
        /// Approve every tool permission request without asking.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Interactive conversation; `/exit` leaves.
    Chat {
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// List the tools offered to the model.
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let working_dir = match &cli.working_dir {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir()?,
    };
    let state_dir = resolve_state_dir(cli.state_dir.clone());
    let overrides = build_cli_overrides(
        cli.api_key.clone(),
        cli.base_url.clone(),
        cli.model.clone(),
        cli.working_dir.as_ref().map(|_| working_dir.clone()),
    );
    let store = ConfigStore::load(&working_dir, cli.config.clone().map(PathBuf::from), overrides)
        .await?;
    let mut config = store.config()?;
    config.working_dir.get_or_insert_with(|| working_dir.clone());

    let process = match cli.command {
        Command::Chat { .. } => ProcessKind::Chat,
        _ => ProcessKind::Engine,
    };
    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let (_log_guard, log_info) = init_process_logging(
        process,
        &logs_dir,
        DEFAULT_RETENTION_DAYS,
        cli.debug || config.debug,
    )?;
    let key_fingerprint = config.api_key.as_deref().map(redact_text);
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            status: Some("ok"),
            detail: key_fingerprint.as_deref(),
            model_id: Some(&config.model),
            ..ObservabilityEvent::new("logging.initialized", "engine.main")
        },
    );
    tracing::info!(
        logs_dir = %log_info.logs_dir,
        state_dir = %state_dir.display(),
        project_config = %store.project_path().display(),
        "quill engine starting"
    );

    let runtime = EngineRuntime::start(config, Some(&state_dir)).await?;
    let outcome = match cli.command {
        Command::Run { prompt, yes } => run_once(&runtime, &prompt, yes).await,
        Command::Chat { session, yes } => chat(&runtime, session, yes).await,
        Command::Tools => {
            for definition in runtime.orchestrator.tools().definitions() {
                println!("{:<12} {}", definition.name, definition.description);
            }
            Ok(())
        }
    };
    runtime.shutdown();
    outcome
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("quill"))
        .unwrap_or_else(|| PathBuf::from(".quill"))
}

fn build_cli_overrides(
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    working_dir: Option<PathBuf>,
) -> Option<Value> {
    let mut root = Map::new();
    if let Some(key) = api_key {
        root.insert("api_key".to_string(), Value::String(key));
    }
    if let Some(url) = base_url {
        root.insert("base_url".to_string(), Value::String(url));
    }
    if let Some(model) = model {
        root.insert("model".to_string(), Value::String(model));
    }
    if let Some(dir) = working_dir {
        root.insert(
            "working_dir".to_string(),
            Value::String(dir.display().to_string()),
        );
    }
    if root.is_empty() {
        None
    } else {
        Some(Value::Object(root))
    }
}

struct Console {
    input: Lines<BufReader<Stdin>>,
    auto_approve: bool,
}

impl Console {
    fn new(auto_approve: bool) -> Self {
        Self {
            input: BufReader::new(tokio::io::stdin()).lines(),
            auto_approve,
        }
    }

    async fn read_line(&mut self) -> anyhow::Result<Option<String>> {
        self.input.next_line().await.context("reading stdin")
    }

    async fn decide(&mut self, request: &PermissionRequest) -> anyhow::Result<PermissionDecision> {
        if self.auto_approve {
            return Ok(PermissionDecision::Allow);
        }
        eprintln!();
        eprintln!("[permission] {} ({})", request.tool_name, request.action);
        eprintln!("  {}", request.description);
        if !request.path.is_empty() {
            eprintln!("  path: {}", request.path);
        }
        eprint!("  allow? [y]es / [a]lways this session / [n]o: ");
        std::io::stderr().flush()?;
        let answer = self.read_line().await?.unwrap_or_default();
        Ok(match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => PermissionDecision::Allow,
            "a" | "always" => PermissionDecision::AllowForSession,
            _ => PermissionDecision::Deny,
        })
    }
}

/// Answers permission prompts until the session's request finishes.
async fn await_reply(
    runtime: &EngineRuntime,
    session_id: &str,
    events: &mut Channel<AgentEvent>,
    permissions: &mut Channel<PermissionRequest>,
    console: &mut Console,
) -> anyhow::Result<AgentEvent> {
    loop {
        tokio::select! {
            event = events.pop() => {
                let Some(event) = event else {
                    anyhow::bail!("engine stopped before replying");
                };
                if event.payload.session_id == session_id && event.payload.is_terminal() {
                    return Ok(event.payload);
                }
            }
            request = permissions.pop() => {
                let Some(request) = request else {
                    anyhow::bail!("permission channel closed");
                };
                let decision = console.decide(&request.payload).await?;
                runtime
                    .gate
                    .respond(PermissionResponse::new(request.payload, decision));
            }
        }
    }
}

async fn submit(
    runtime: &EngineRuntime,
    session_id: &str,
    content: &str,
    console: &mut Console,
) -> anyhow::Result<AgentEvent> {
    let mut events = runtime.orchestrator.subscribe();
    let mut permissions = runtime.gate.subscribe();
    runtime
        .storage
        .create(session_id, Role::User, content)
        .await?;
    runtime.orchestrator.send_request(session_id, content);
    await_reply(runtime, session_id, &mut events, &mut permissions, console).await
}

async fn run_once(runtime: &EngineRuntime, prompt: &str, yes: bool) -> anyhow::Result<()> {
    let session = runtime
        .storage
        .create_session(&generate_title(prompt))
        .await?;
    let mut console = Console::new(yes);
    let reply = submit(runtime, &session.id, prompt, &mut console).await?;
    match reply.event_type {
        AgentEventType::Error => anyhow::bail!("{}", reply.content),
        _ => println!("{}", reply.content),
    }
    Ok(())
}

async fn chat(runtime: &EngineRuntime, session: Option<String>, yes: bool) -> anyhow::Result<()> {
    let (session, mut untitled) = match session {
        Some(id) => {
            let session = runtime
                .storage
                .get_session(&id)
                .await
                .with_context(|| format!("unknown session `{id}`"))?;
            (session, false)
        }
        None => (runtime.storage.create_session("New session").await?, true),
    };
    eprintln!("session {} ({})", session.id, session.title);
    eprintln!("type /exit to leave");

    let mut console = Console::new(yes);
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = console.read_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "/exit" | "/quit") {
            break;
        }
        if untitled {
            runtime
                .storage
                .rename_session(&session.id, &generate_title(line))
                .await?;
            untitled = false;
        }

        let reply = submit(runtime, &session.id, line, &mut console).await?;
        match reply.event_type {
            AgentEventType::Error => eprintln!("{}", reply.content),
            _ => println!("{}", reply.content),
        }
    }
    Ok(())
}
