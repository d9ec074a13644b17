//! Request routing on the agent.
//!
//! Dispatch is sequential: the loop reads the next broadcast only after the
//! current reply has been pushed, so handlers never interleave on one agent.
//! Handlers are typed objects in a map built at startup — action names never
//! reach any reflective lookup.
//!
//! A handler failure never crashes a request: the error lands in the reply's
//! `error` field and the envelope is sent regardless.

use crate::executor::{self, CommandSpec, Executor, resolve_sink};
use crate::transport::{PushSocket, Subscription, TransportError};
use async_trait::async_trait;
use fleetbus_protocol::{Reply, Request, number, string_list};
use std::collections::HashMap;
use tracing::{debug, info};

/// Per-request failures surfaced to the operator via the reply's `error`
/// field.  The display strings are part of the wire contract.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("A command is already being executed.")]
    ExecutorBusy,
    #[error("No executor.")]
    NoExecutor,
    #[error("No executor or pipes.")]
    NoTailSource,
    #[error("Command field 'path' is missing or empty.")]
    MissingPath,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// The agent's identity and its single executor slot.
///
/// Handlers receive `&mut AgentState`; only a *detached* command occupies
/// the slot (a synchronous executor is born and dies within its call).
pub struct AgentState {
    pub agent_id: String,
    pub executor: Option<Executor>,
}

impl AgentState {
    pub fn new(agent_id: String) -> Self {
        AgentState {
            agent_id,
            executor: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler trait + registry
// ---------------------------------------------------------------------------

#[async_trait]
trait Handler: Send + Sync {
    async fn handle(
        &self,
        state: &mut AgentState,
        request: &Request,
        reply: &mut Reply,
    ) -> Result<(), HandlerError>;
}

/// Action-name to handler map, built once at startup.
pub struct Dispatcher {
    handlers: HashMap<&'static str, Box<dyn Handler>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Box<dyn Handler>> = HashMap::new();
        handlers.insert("ping", Box::new(PingAction));
        handlers.insert("command", Box::new(CommandAction));
        handlers.insert("tail", Box::new(TailAction));
        handlers.insert("check", Box::new(CheckAction));
        Dispatcher { handlers }
    }

    /// Route one broadcast request.
    ///
    /// `None` means the request targeted another agent and is dropped
    /// silently; otherwise the reply is always produced, with `error` set on
    /// unknown actions and handler failures.
    pub async fn dispatch(&self, state: &mut AgentState, request: &Request) -> Option<Reply> {
        if !request.selects(&state.agent_id) {
            debug!(agent_id = %state.agent_id, "request targets another agent, dropping");
            return None;
        }

        let mut reply = Reply::skeleton(
            request.req.clone().unwrap_or_default(),
            state.agent_id.clone(),
        );
        let action = request.action.as_deref().unwrap_or("");
        match self.handlers.get(action) {
            None => reply.error = Some(format!("Action '{action}' unknown.")),
            Some(handler) => {
                if let Err(e) = handler.handle(state, request, &mut reply).await {
                    reply.error = Some(e.to_string());
                }
            }
        }
        Some(reply)
    }

    /// Sequential receive/dispatch/push loop; returns once the broadcast
    /// stream ends.
    pub async fn run_loop(
        &self,
        mut subscription: Subscription,
        mut push: PushSocket,
        mut state: AgentState,
    ) -> Result<(), TransportError> {
        while let Some(request) = subscription.next_request().await? {
            if let Some(reply) = self.dispatch(&mut state, &request).await {
                push.send(&reply).await?;
            }
        }
        info!(agent_id = %state.agent_id, "broadcast stream ended");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

struct PingAction;

#[async_trait]
impl Handler for PingAction {
    async fn handle(
        &self,
        _state: &mut AgentState,
        _request: &Request,
        reply: &mut Reply,
    ) -> Result<(), HandlerError> {
        reply.time = Some(
            chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
        );
        Ok(())
    }
}

struct CommandAction;

#[async_trait]
impl Handler for CommandAction {
    async fn handle(
        &self,
        state: &mut AgentState,
        request: &Request,
        reply: &mut Reply,
    ) -> Result<(), HandlerError> {
        if state.executor.is_some() {
            return Err(HandlerError::ExecutorBusy);
        }

        let argv = request
            .field("path")
            .and_then(string_list)
            .filter(|argv| !argv.is_empty())
            .ok_or(HandlerError::MissingPath)?;
        let detached = request.field_truthy("thread");
        let spec = CommandSpec {
            argv,
            env: request.field("env").and_then(string_list),
            stdout: resolve_sink(request.field_str("stdout"), detached, false),
            stderr: resolve_sink(request.field_str("stderr"), detached, true),
        };

        if detached {
            let executor = executor::spawn_detached(spec).await?;
            reply.stdout_fh = executor.stdout_path();
            reply.stderr_fh = executor.stderr_path();
            state.executor = Some(executor);
        } else {
            let outcome = executor::run_sync(spec).await?;
            reply.stdout = outcome.stdout;
            reply.stderr = outcome.stderr;
            reply.exit_code = Some(Some(outcome.exit_code));
        }
        Ok(())
    }
}

struct TailAction;

#[async_trait]
impl Handler for TailAction {
    async fn handle(
        &self,
        state: &mut AgentState,
        request: &Request,
        reply: &mut Reply,
    ) -> Result<(), HandlerError> {
        let limit = request
            .field("size")
            .and_then(number)
            .map(|size| size.max(0.0) as u64);
        let executor = state
            .executor
            .as_mut()
            .ok_or(HandlerError::NoTailSource)?;
        if !executor.has_tail_source() {
            return Err(HandlerError::NoTailSource);
        }

        let report = executor.tail(limit).await?;
        if let Some((text, remain)) = report.stdout {
            reply.stdout = Some(text);
            reply.stdout_remain = Some(remain);
        }
        if let Some((text, remain)) = report.stderr {
            reply.stderr = Some(text);
            reply.stderr_remain = Some(remain);
        }
        Ok(())
    }
}

struct CheckAction;

#[async_trait]
impl Handler for CheckAction {
    async fn handle(
        &self,
        state: &mut AgentState,
        request: &Request,
        reply: &mut Reply,
    ) -> Result<(), HandlerError> {
        let wait = request.field_truthy("wait");
        let clear = request.field_truthy("clear");
        {
            let executor = state.executor.as_mut().ok_or(HandlerError::NoExecutor)?;
            if wait || clear {
                executor.wait().await;
            }
            reply.exit_code = Some(executor.exit_code());
        }
        if clear {
            if let Some(executor) = state.executor.take() {
                executor.cleanup().await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: serde_json::Value) -> Request {
        serde_json::from_value(value).unwrap()
    }

    fn fixture() -> (Dispatcher, AgentState) {
        (Dispatcher::new(), AgentState::new("abc".to_owned()))
    }

    #[tokio::test]
    async fn targeted_requests_for_other_agents_are_dropped() {
        let (dispatcher, mut state) = fixture();
        let dropped = request(json!({"req": "1", "action": "ping", "target": "def"}));
        assert!(dispatcher.dispatch(&mut state, &dropped).await.is_none());

        let set = request(json!({"req": "1", "action": "ping", "target": ["abc", "def"]}));
        assert!(dispatcher.dispatch(&mut state, &set).await.is_some());
    }

    #[tokio::test]
    async fn unknown_actions_report_the_documented_error() {
        let (dispatcher, mut state) = fixture();
        let reply = dispatcher
            .dispatch(&mut state, &request(json!({"req": "7", "action": "reboot"})))
            .await
            .unwrap();
        assert_eq!(reply.req, "7");
        assert_eq!(reply.agent, "abc");
        assert_eq!(reply.error.as_deref(), Some("Action 'reboot' unknown."));
    }

    #[tokio::test]
    async fn ping_stamps_an_iso_timestamp() {
        let (dispatcher, mut state) = fixture();
        let reply = dispatcher
            .dispatch(&mut state, &request(json!({"req": "1", "action": "ping"})))
            .await
            .unwrap();
        let time = reply.time.unwrap();
        assert!(time.contains('T'), "not ISO-8601: {time}");
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn sync_command_replies_inline() {
        let (dispatcher, mut state) = fixture();
        let reply = dispatcher
            .dispatch(
                &mut state,
                &request(json!({"req": "1", "action": "command", "path": ["echo", "hi"]})),
            )
            .await
            .unwrap();
        assert_eq!(reply.stdout.as_deref(), Some("hi\n"));
        assert_eq!(reply.exit_code, Some(Some(0)));
        assert!(reply.stdout_fh.is_none());
        // A synchronous run never occupies the slot.
        assert!(state.executor.is_none());
    }

    #[tokio::test]
    async fn bare_string_path_is_a_one_token_argv() {
        let (dispatcher, mut state) = fixture();
        let reply = dispatcher
            .dispatch(
                &mut state,
                &request(json!({"req": "1", "action": "command", "path": "true"})),
            )
            .await
            .unwrap();
        assert_eq!(reply.exit_code, Some(Some(0)));
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn command_without_path_fails_inside_the_reply() {
        let (dispatcher, mut state) = fixture();
        let reply = dispatcher
            .dispatch(&mut state, &request(json!({"req": "1", "action": "command"})))
            .await
            .unwrap();
        assert_eq!(
            reply.error.as_deref(),
            Some("Command field 'path' is missing or empty.")
        );
    }

    #[tokio::test]
    async fn detached_lifecycle_tail_check_clear() {
        let (dispatcher, mut state) = fixture();

        // Nothing to tail yet.
        let reply = dispatcher
            .dispatch(&mut state, &request(json!({"req": "1", "action": "tail"})))
            .await
            .unwrap();
        assert_eq!(reply.error.as_deref(), Some("No executor or pipes."));

        let reply = dispatcher
            .dispatch(
                &mut state,
                &request(json!({
                    "req": "2", "action": "command",
                    "path": ["sh", "-c", "printf hello"], "thread": "true",
                })),
            )
            .await
            .unwrap();
        assert!(reply.stdout_fh.is_some());
        assert!(reply.stdout.is_none());

        // The slot is taken: a second command fails without touching it.
        let reply = dispatcher
            .dispatch(
                &mut state,
                &request(json!({
                    "req": "3", "action": "command",
                    "path": ["echo", "nope"], "thread": "true",
                })),
            )
            .await
            .unwrap();
        assert_eq!(
            reply.error.as_deref(),
            Some("A command is already being executed.")
        );
        assert!(state.executor.is_some());

        let reply = dispatcher
            .dispatch(
                &mut state,
                &request(json!({"req": "4", "action": "check", "wait": "true"})),
            )
            .await
            .unwrap();
        assert_eq!(reply.exit_code, Some(Some(0)));
        assert!(state.executor.is_some());

        let reply = dispatcher
            .dispatch(
                &mut state,
                &request(json!({"req": "5", "action": "tail", "size": "2"})),
            )
            .await
            .unwrap();
        assert_eq!(reply.stdout.as_deref(), Some("he"));
        assert_eq!(reply.stdout_remain, Some(3));

        let reply = dispatcher
            .dispatch(
                &mut state,
                &request(json!({"req": "6", "action": "check", "clear": "true"})),
            )
            .await
            .unwrap();
        assert_eq!(reply.exit_code, Some(Some(0)));
        assert!(state.executor.is_none());

        // Cleared slot: tail and check both fail with their own messages.
        let reply = dispatcher
            .dispatch(&mut state, &request(json!({"req": "7", "action": "tail"})))
            .await
            .unwrap();
        assert_eq!(reply.error.as_deref(), Some("No executor or pipes."));
        let reply = dispatcher
            .dispatch(&mut state, &request(json!({"req": "8", "action": "check"})))
            .await
            .unwrap();
        assert_eq!(reply.error.as_deref(), Some("No executor."));
    }

    #[tokio::test]
    async fn check_reports_null_exit_code_while_running() {
        let (dispatcher, mut state) = fixture();
        dispatcher
            .dispatch(
                &mut state,
                &request(json!({
                    "req": "1", "action": "command",
                    "path": ["sleep", "5"], "thread": "true", "stdout": "null", "stderr": "null",
                })),
            )
            .await
            .unwrap();

        let reply = dispatcher
            .dispatch(&mut state, &request(json!({"req": "2", "action": "check"})))
            .await
            .unwrap();
        assert_eq!(reply.exit_code, Some(None));

        // Fully-null redirection leaves tail with no source.
        let reply = dispatcher
            .dispatch(&mut state, &request(json!({"req": "3", "action": "tail"})))
            .await
            .unwrap();
        assert_eq!(reply.error.as_deref(), Some("No executor or pipes."));

        if let Some(executor) = state.executor.take() {
            executor.cleanup().await;
        }
    }
}
