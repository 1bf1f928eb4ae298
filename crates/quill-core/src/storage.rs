use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use quill_types::{EventType, Message, Role, Session};

use crate::event_bus::{Channel, EventBroker};

/// Conversation persistence as the orchestrator sees it.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages of one session in creation order.
    async fn list(&self, session_id: &str) -> anyhow::Result<Vec<Message>>;
    async fn create(&self, session_id: &str, role: Role, content: &str) -> anyhow::Result<Message>;
}

/// Sessions and messages in memory, optionally mirrored to JSON files.
pub struct Storage {
    base: Option<PathBuf>,
    sessions: RwLock<HashMap<String, Session>>,
    messages: RwLock<Vec<Message>>,
    /// Held from snapshot to the last write so files never go backwards.
    flush_lock: Mutex<()>,
    session_events: EventBroker<Session>,
    message_events: EventBroker<Message>,
}

impl Storage {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .await
            .with_context(|| format!("creating state dir {}", base.display()))?;
        let sessions: HashMap<String, Session> = read_json_or_default(&base.join("sessions.json")).await?;
        let messages: Vec<Message> = read_json_or_default(&base.join("messages.json")).await?;
        Ok(Self {
            base: Some(base),
            sessions: RwLock::new(sessions),
            messages: RwLock::new(messages),
            flush_lock: Mutex::new(()),
            session_events: EventBroker::new(),
            message_events: EventBroker::new(),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            base: None,
            sessions: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
            flush_lock: Mutex::new(()),
            session_events: EventBroker::new(),
            message_events: EventBroker::new(),
        }
    }

    pub fn subscribe_sessions(&self) -> Channel<Session> {
        self.session_events.subscribe()
    }

    pub fn subscribe_messages(&self) -> Channel<Message> {
        self.message_events.subscribe()
    }

    pub async fn create_session(&self, title: &str) -> anyhow::Result<Session> {
        let session = Session::new(title);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        self.flush().await?;
        self.session_events
            .publish(EventType::Created, session.clone());
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Newest first.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub async fn rename_session(&self, id: &str, title: &str) -> anyhow::Result<Option<Session>> {
        let updated = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(id) else {
                return Ok(None);
            };
            session.title = title.to_string();
            session.updated_at = Utc::now();
            session.clone()
        };
        self.flush().await?;
        self.session_events
            .publish(EventType::Updated, updated.clone());
        Ok(Some(updated))
    }

    /// Removes the session and all of its messages.
    pub async fn delete_session(&self, id: &str) -> anyhow::Result<bool> {
        let Some(removed) = self.sessions.write().await.remove(id) else {
            return Ok(false);
        };
        self.messages.write().await.retain(|m| m.session_id != id);
        self.flush().await?;
        self.session_events.publish(EventType::Deleted, removed);
        Ok(true)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let Some(base) = &self.base else {
            return Ok(());
        };
        let _flushing = self.flush_lock.lock().await;
        let sessions = serde_json::to_string_pretty(&*self.sessions.read().await)?;
        fs::write(base.join("sessions.json"), sessions).await?;
        let messages = serde_json::to_string_pretty(&*self.messages.read().await)?;
        fs::write(base.join("messages.json"), messages).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn list(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        // stored in insertion order; the stable sort keeps it for equal timestamps
        let mut messages: Vec<Message> = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn create(&self, session_id: &str, role: Role, content: &str) -> anyhow::Result<Message> {
        let message = Message::new(session_id, role, content);
        self.messages.write().await.push(message.clone());
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.updated_at = message.created_at;
        }
        self.flush().await?;
        self.message_events
            .publish(EventType::Created, message.clone());
        Ok(message)
    }
}

async fn read_json_or_default<T>(path: &Path) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path).await?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
