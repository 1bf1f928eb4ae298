use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use uuid::Uuid;

use quill_tools::Approver;
use quill_types::{
    CreatePermissionRequest, EventType, PermissionDecision, PermissionRequest, PermissionResponse,
};

use crate::event_bus::{Channel, EventBroker};

pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

tokio::task_local! {
    static CURRENT_SESSION: String;
}

/// Runs `fut` with `session_id` attached to every gate request it raises.
pub async fn with_session<F: Future>(session_id: impl Into<String>, fut: F) -> F::Output {
    CURRENT_SESSION.scope(session_id.into(), fut).await
}

fn current_session() -> String {
    CURRENT_SESSION
        .try_with(|id| id.clone())
        .unwrap_or_default()
}

/// A published request awaiting its answer. The grant key is taken from
/// here, never from the response.
struct Pending {
    tool_name: String,
    action: String,
    tx: oneshot::Sender<bool>,
}

#[derive(Default)]
struct GateState {
    pending: HashMap<String, Pending>,
    session_grants: Vec<(String, String)>,
}

/// Human approval for side-effecting tool calls.
///
/// `request` publishes a [`PermissionRequest`] and waits until `respond` is
/// called for it or the timeout elapses; timeouts count as deny. Pending
/// entries and session grants share one lock that is never held across an await.
#[derive(Clone)]
pub struct PermissionGate {
    state: Arc<Mutex<GateState>>,
    broker: EventBroker<PermissionRequest>,
    timeout: Duration,
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PERMISSION_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState::default())),
            broker: EventBroker::new(),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Channel<PermissionRequest> {
        self.broker.subscribe()
    }

    pub async fn request(&self, input: CreatePermissionRequest) -> bool {
        let (request, rx) = {
            let mut state = self.lock();
            let granted = state
                .session_grants
                .iter()
                .any(|(tool, action)| *tool == input.tool_name && *action == input.action);
            if granted {
                tracing::debug!(tool = %input.tool_name, action = %input.action, "permission granted for session");
                return true;
            }
            let request = PermissionRequest {
                id: Uuid::new_v4().simple().to_string(),
                session_id: current_session(),
                tool_name: input.tool_name,
                description: input.description,
                action: input.action,
                path: input.path,
            };
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                request.id.clone(),
                Pending {
                    tool_name: request.tool_name.clone(),
                    action: request.action.clone(),
                    tx,
                },
            );
            (request, rx)
        };

        let id = request.id.clone();
        tracing::info!(
            request_id = %id,
            session_id = %request.session_id,
            tool = %request.tool_name,
            action = %request.action,
            "permission requested"
        );
        self.broker.publish(EventType::Created, request);

        let mut rx = rx;
        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(_)) => false,
            Err(_) => self.settle_timed_out(&id, rx),
        }
    }

    /// Decides a request whose wait elapsed. A `respond` that won the race
    /// has already sent its answer under the lock, so that answer stands.
    fn settle_timed_out(&self, id: &str, mut rx: oneshot::Receiver<bool>) -> bool {
        if self.lock().pending.remove(id).is_some() {
            tracing::warn!(request_id = %id, "permission request timed out; denying");
            return false;
        }
        rx.try_recv().unwrap_or(false)
    }

    /// Resolves a pending request. Returns `false` if it was already resolved or expired.
    pub fn respond(&self, response: PermissionResponse) -> bool {
        let mut state = self.lock();
        let Some(pending) = state.pending.remove(&response.request.id) else {
            return false;
        };
        let allowed = match response.decision {
            PermissionDecision::Allow => true,
            PermissionDecision::AllowForSession => {
                let key = (pending.tool_name, pending.action);
                if !state.session_grants.contains(&key) {
                    state.session_grants.push(key);
                }
                true
            }
            PermissionDecision::Deny => false,
        };
        // sent under the lock so a timed-out waiter sees it in settle_timed_out
        let _ = pending.tx.send(allowed);
        drop(state);
        tracing::info!(request_id = %response.request.id, decision = ?response.decision, "permission resolved");
        true
    }

    pub fn grant(&self, request: PermissionRequest) -> bool {
        self.respond(PermissionResponse::new(request, PermissionDecision::Allow))
    }

    pub fn grant_for_session(&self, request: PermissionRequest) -> bool {
        self.respond(PermissionResponse::new(
            request,
            PermissionDecision::AllowForSession,
        ))
    }

    pub fn deny(&self, request: PermissionRequest) -> bool {
        self.respond(PermissionResponse::new(request, PermissionDecision::Deny))
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Denies everything pending and closes subscriber channels.
    pub fn shutdown(&self) {
        self.lock().pending.clear();
        self.broker.shutdown();
    }
}

#[async_trait]
impl Approver for PermissionGate {
    async fn request(&self, request: CreatePermissionRequest) -> bool {
        PermissionGate::request(self, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_request() -> CreatePermissionRequest {
        CreatePermissionRequest::new("write", "Write to file /tmp/a.txt", "write", "/tmp")
    }

    #[tokio::test]
    async fn request_waits_for_response() {
        let gate = PermissionGate::new();
        let mut requests = gate.subscribe();

        let responder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let event = requests.pop().await.expect("request event");
                assert_eq!(event.event_type, EventType::Created);
                assert_eq!(event.payload.tool_name, "write");
                assert_eq!(event.payload.id.len(), 32);
                gate.grant(event.payload)
            })
        };

        assert!(gate.request(write_request()).await);
        assert!(responder.await.expect("responder"));
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn deny_resolves_false() {
        let gate = PermissionGate::new();
        let mut requests = gate.subscribe();
        let responder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let event = requests.pop().await.expect("request event");
                gate.deny(event.payload)
            })
        };

        assert!(!gate.request(write_request()).await);
        assert!(responder.await.expect("responder"));
    }

    #[tokio::test]
    async fn timeout_denies_and_leaves_nothing_pending() {
        let gate = PermissionGate::with_timeout(Duration::from_millis(20));
        let mut requests = gate.subscribe();

        for _ in 0..3 {
            assert!(!gate.request(write_request()).await);
            assert_eq!(gate.pending_count(), 0);
        }

        let first = requests.try_pop().expect("published").payload;
        assert!(!gate.grant(first), "late answers are ignored");
    }

    #[tokio::test]
    async fn allow_for_session_short_circuits_identical_pairs() {
        let gate = PermissionGate::new();
        let mut requests = gate.subscribe();
        let responder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let event = requests.pop().await.expect("request event");
                gate.grant_for_session(event.payload);
                requests
            })
        };

        assert!(gate.request(write_request()).await);
        let mut requests = responder.await.expect("responder");

        for _ in 0..3 {
            assert!(gate.request(write_request()).await);
        }
        assert!(requests.try_pop().is_none(), "no new prompt expected");
        assert_eq!(gate.pending_count(), 0);

        let other_action = CreatePermissionRequest::new("write", "append", "append", "/tmp");
        let short = PermissionGate {
            timeout: Duration::from_millis(20),
            ..gate.clone()
        };
        assert!(!short.request(other_action).await);
        assert!(requests.try_pop().is_some());
    }

    #[tokio::test]
    async fn second_response_is_a_no_op() {
        let gate = PermissionGate::new();
        let mut requests = gate.subscribe();
        let responder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let request = requests.pop().await.expect("request event").payload;
                let first = gate.deny(request.clone());
                let second = gate.grant_for_session(request);
                (first, second)
            })
        };

        assert!(!gate.request(write_request()).await);
        assert_eq!(responder.await.expect("responder"), (true, false));

        // the ignored AllowForSession must not have been recorded
        let short = PermissionGate {
            timeout: Duration::from_millis(20),
            ..gate.clone()
        };
        assert!(!short.request(write_request()).await);
    }

    #[tokio::test]
    async fn session_grant_uses_the_published_pair() {
        let gate = PermissionGate::new();
        let mut requests = gate.subscribe();
        let responder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let mut request = requests.pop().await.expect("request event").payload;
                request.tool_name = "bash".to_string();
                request.action = "execute".to_string();
                gate.grant_for_session(request)
            })
        };

        assert!(gate.request(write_request()).await);
        assert!(responder.await.expect("responder"));

        let short = PermissionGate {
            timeout: Duration::from_millis(20),
            ..gate.clone()
        };
        assert!(short.request(write_request()).await);
        let bash = CreatePermissionRequest::new("bash", "Run ls", "execute", "/tmp");
        assert!(!short.request(bash).await);
    }

    #[test]
    fn answer_racing_a_timeout_is_honoured() {
        let gate = PermissionGate::new();
        let (tx, rx) = oneshot::channel();
        gate.lock().pending.insert(
            "req_1".to_string(),
            Pending {
                tool_name: "write".to_string(),
                action: "write".to_string(),
                tx,
            },
        );
        let request = PermissionRequest {
            id: "req_1".to_string(),
            session_id: String::new(),
            tool_name: "write".to_string(),
            description: "Write to file /tmp/a.txt".to_string(),
            action: "write".to_string(),
            path: "/tmp".to_string(),
        };

        // respond lands after the deadline but before the waiter re-locks
        assert!(gate.grant_for_session(request));
        assert!(gate.settle_timed_out("req_1", rx));
        assert_eq!(gate.pending_count(), 0);
    }

    #[test]
    fn unanswered_timeout_denies() {
        let gate = PermissionGate::new();
        let (tx, rx) = oneshot::channel();
        gate.lock().pending.insert(
            "req_2".to_string(),
            Pending {
                tool_name: "write".to_string(),
                action: "write".to_string(),
                tx,
            },
        );
        assert!(!gate.settle_timed_out("req_2", rx));
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn requests_carry_the_scoped_session() {
        let gate = PermissionGate::with_timeout(Duration::from_millis(20));
        let mut requests = gate.subscribe();

        with_session("ses_42", gate.request(write_request())).await;
        gate.request(write_request()).await;

        assert_eq!(requests.try_pop().expect("scoped").payload.session_id, "ses_42");
        assert_eq!(requests.try_pop().expect("unscoped").payload.session_id, "");
    }

    #[tokio::test]
    async fn shutdown_denies_pending_requests() {
        let gate = PermissionGate::new();
        let mut requests = gate.subscribe();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request(write_request()).await })
        };

        requests.pop().await.expect("request event");
        gate.shutdown();

        assert!(!waiter.await.expect("waiter"));
    }
}
