//! Single-flight conversation orchestrator.
//!
//! One agent query runs at a time for the whole process. `send_message`
//! persists the user turn, then spawns a task that drains the provider
//! stream into the event bus; tool-permission checks from the provider are
//! parked here as oneshot continuations until a viewer responds, a timeout
//! fires, or the query is cancelled. Whatever way the turn ends, the
//! accumulated assistant text is persisted to the session that started the
//! turn and exactly one `chat:message-complete` goes out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use soagent_core::events::ChatEvent;
use soagent_core::ids::{SessionId, ToolUseId};
use soagent_core::messages::StoredMessage;
use soagent_core::provider::{
    AgentProvider, Attachment, GateDecision, PermissionMode, ProviderEnv, ProviderFingerprint,
    QueryEvent, QueryRequest, QuestionAnswers, ToolGate,
};
use soagent_store::{SessionStore, StoreError};

use crate::bus::EventBus;

const PERMISSION_TIMEOUT: Duration = Duration::from_secs(30);
const QUESTION_TIMEOUT: Duration = Duration::from_secs(120);
const SESSION_TITLE_MAX: usize = 50;
const QUESTION_TOOL: &str = "AskUserQuestion";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One `/chat/send` request, already deserialized.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub text: String,
    pub workspace_dir: std::path::PathBuf,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Option<Vec<String>>,
    pub env: Option<ProviderEnv>,
    pub attachments: Vec<Attachment>,
    pub mcp_servers: serde_json::Map<String, Value>,
}

#[derive(Debug)]
pub enum SendOutcome {
    Started { session_id: SessionId },
    /// A query was already in flight; the send was dropped.
    Busy,
}

#[derive(Default)]
struct LiveState {
    active_session: Option<SessionId>,
    /// Provider-side conversation token from the last completed turn.
    resume_token: Option<String>,
    /// Connection parameters the resume token is bound to.
    fingerprint: Option<ProviderFingerprint>,
    /// In-memory transcript of the active session.
    messages: Vec<StoredMessage>,
}

pub struct ChatOrchestrator {
    provider: Arc<dyn AgentProvider>,
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    running: AtomicBool,
    live: AsyncMutex<LiveState>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
    done: parking_lot::Mutex<Option<oneshot::Receiver<()>>>,
    pending_permissions: DashMap<ToolUseId, oneshot::Sender<bool>>,
    pending_questions: DashMap<ToolUseId, oneshot::Sender<QuestionAnswers>>,
}

impl ChatOrchestrator {
    pub fn new(
        provider: Arc<dyn AgentProvider>,
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            store,
            bus,
            running: AtomicBool::new(false),
            live: AsyncMutex::new(LiveState::default()),
            cancel: parking_lot::Mutex::new(None),
            done: parking_lot::Mutex::new(None),
            pending_permissions: DashMap::new(),
            pending_questions: DashMap::new(),
        })
    }

    /// Accept a user turn. A turn already in flight makes this a no-op.
    pub async fn send_message(
        self: &Arc<Self>,
        opts: SendOptions,
    ) -> Result<SendOutcome, OrchestratorError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("a query is already in flight, dropping send");
            return Ok(SendOutcome::Busy);
        }

        match self.dispatch(opts).await {
            Ok(session_id) => Ok(SendOutcome::Started { session_id }),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, opts: SendOptions) -> Result<SessionId, OrchestratorError> {
        let mut live = self.live.lock().await;

        let session_id = match &live.active_session {
            Some(id) => id.clone(),
            None => {
                let session = self.store.create_session(
                    &opts.workspace_dir.to_string_lossy(),
                    &session_title(&opts.text),
                )?;
                tracing::info!(session_id = %session.id, "created session");
                live.active_session = Some(session.id.clone());
                session.id
            }
        };

        // The user turn is durable before the provider sees it.
        let user_msg = StoredMessage::user(opts.text.as_str());
        self.store.save_message(&session_id, &user_msg)?;
        live.messages.push(user_msg);

        // A resume token is only valid against the connection parameters it
        // was minted under.
        let fingerprint = ProviderFingerprint::of(opts.env.as_ref());
        if live.fingerprint.as_ref().is_some_and(|prev| *prev != fingerprint)
            && live.resume_token.is_some()
        {
            tracing::info!("provider configuration changed, discarding resume token");
            live.resume_token = None;
        }
        live.fingerprint = Some(fingerprint);

        let request = QueryRequest {
            prompt: opts.text,
            workspace_dir: opts.workspace_dir,
            model: opts.model,
            permission_mode: opts.permission_mode,
            allowed_tools: opts.allowed_tools,
            env: opts.env,
            resume: live.resume_token.clone(),
            attachments: opts.attachments,
            mcp_servers: opts.mcp_servers,
        };
        drop(live);

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());
        let (done_tx, done_rx) = oneshot::channel();
        *self.done.lock() = Some(done_rx);

        let gate: Option<Arc<dyn ToolGate>> = if request.permission_mode.requires_gating() {
            Some(Arc::new(GateBroker { orch: Arc::clone(self), cancel: cancel.clone() }))
        } else {
            None
        };

        let orch = Arc::clone(self);
        let target = session_id.clone();
        tokio::spawn(async move {
            orch.run_turn(request, gate, cancel, done_tx, target).await;
        });

        Ok(session_id)
    }

    async fn run_turn(
        self: Arc<Self>,
        request: QueryRequest,
        gate: Option<Arc<dyn ToolGate>>,
        cancel: CancellationToken,
        done_tx: oneshot::Sender<()>,
        target: SessionId,
    ) {
        let mut assistant_text = String::new();
        let mut saw_stream_text = false;
        let mut usage = None;
        let mut resume = None;

        match self.provider.query(request, gate).await {
            Ok(mut stream) => loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => event,
                };
                let Some(event) = event else { break };

                match event {
                    Ok(QueryEvent::TextDelta { delta }) => {
                        saw_stream_text = true;
                        assistant_text.push_str(&delta);
                        self.bus.broadcast(ChatEvent::MessageChunk { text: delta });
                    }
                    Ok(QueryEvent::ThinkingDelta { delta }) => {
                        self.bus.broadcast(ChatEvent::ThinkingChunk { thinking: delta });
                    }
                    Ok(QueryEvent::ToolUseStart { id, name }) => {
                        self.bus.broadcast(ChatEvent::ToolUseStart { id, name });
                    }
                    Ok(QueryEvent::ToolInputDelta { id, partial_json }) => {
                        self.bus.broadcast(ChatEvent::ToolInputDelta { id, partial_json });
                    }
                    Ok(QueryEvent::ToolResult { id, content, is_error }) => {
                        self.bus.broadcast(ChatEvent::ToolResult { id, content, is_error });
                    }
                    // Whole-message text only counts when nothing streamed;
                    // otherwise it would double the transcript.
                    Ok(QueryEvent::AssistantText { text }) => {
                        if !saw_stream_text {
                            assistant_text.push_str(&text);
                            self.bus.broadcast(ChatEvent::MessageChunk { text });
                        }
                    }
                    Ok(QueryEvent::Completed { resume_token, usage: turn_usage }) => {
                        resume = resume_token;
                        usage = turn_usage;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "provider stream failed");
                        self.bus.broadcast(ChatEvent::MessageError { error: e.to_string() });
                        break;
                    }
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "provider query failed to start");
                self.bus.broadcast(ChatEvent::MessageError { error: e.to_string() });
            }
        }

        // Persist whatever arrived, to the session the turn started in,
        // even if the viewer has since switched sessions.
        if !assistant_text.is_empty() {
            let msg = StoredMessage::assistant(assistant_text, usage);
            if let Err(e) = self.store.save_message(&target, &msg) {
                tracing::error!(session_id = %target, error = %e, "failed to persist assistant message");
            }
            let mut live = self.live.lock().await;
            if live.active_session.as_ref() == Some(&target) {
                live.messages.push(msg);
                if resume.is_some() {
                    live.resume_token = resume.take();
                }
            }
        } else if resume.is_some() {
            let mut live = self.live.lock().await;
            if live.active_session.as_ref() == Some(&target) {
                live.resume_token = resume.take();
            }
        }

        self.bus.broadcast(ChatEvent::MessageComplete);

        self.pending_permissions.clear();
        self.pending_questions.clear();
        *self.cancel.lock() = None;
        self.running.store(false, Ordering::SeqCst);
        let _ = done_tx.send(());
    }

    /// Cancel the in-flight turn, if any. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().as_ref() {
            cancel.cancel();
        }
    }

    /// Stop and forget the active conversation. The provider fingerprint is
    /// kept so a later send does not spuriously discard its resume logic.
    pub async fn reset(&self) {
        self.stop();
        let mut live = self.live.lock().await;
        live.active_session = None;
        live.resume_token = None;
        live.messages.clear();
    }

    /// Switch the active conversation, waiting for any in-flight turn to
    /// finish unwinding first so its output lands in the right session.
    pub async fn load_session(
        &self,
        id: &SessionId,
    ) -> Result<Vec<StoredMessage>, OrchestratorError> {
        self.stop();
        let done = self.done.lock().take();
        if let Some(done) = done {
            let _ = done.await;
        }

        let messages = self.store.messages(id)?;
        self.store.touch(id)?;

        let mut live = self.live.lock().await;
        live.active_session = Some(id.clone());
        live.resume_token = None;
        live.messages = messages.clone();
        Ok(messages)
    }

    /// Resolve a parked permission request. Unknown ids (already resolved,
    /// timed out, or cancelled) are ignored.
    pub fn respond_permission(&self, id: &ToolUseId, allowed: bool) -> bool {
        match self.pending_permissions.remove(id) {
            Some((_, tx)) => tx.send(allowed).is_ok(),
            None => false,
        }
    }

    pub fn respond_question(&self, id: &ToolUseId, answers: QuestionAnswers) -> bool {
        match self.pending_questions.remove(id) {
            Some((_, tx)) => tx.send(answers).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn active_session(&self) -> Option<SessionId> {
        self.live.lock().await.active_session.clone()
    }

    /// The in-memory transcript of the active session.
    pub async fn transcript(&self) -> Vec<StoredMessage> {
        self.live.lock().await.messages.clone()
    }
}

fn session_title(text: &str) -> String {
    let trimmed = text.trim();
    let mut end = trimmed.len().min(SESSION_TITLE_MAX);
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

/// Bridges provider-side tool checks to viewer responses. Each check parks
/// a oneshot in the orchestrator's pending map; the first of response,
/// timeout, or cancellation wins and the entry is removed before resolving
/// so the losers are no-ops.
struct GateBroker {
    orch: Arc<ChatOrchestrator>,
    cancel: CancellationToken,
}

#[async_trait]
impl ToolGate for GateBroker {
    async fn check(
        &self,
        tool_name: &str,
        tool_use_id: &ToolUseId,
        tool_input: Value,
    ) -> GateDecision {
        if tool_name == QUESTION_TOOL {
            self.ask_question(tool_use_id, tool_input).await
        } else {
            self.ask_permission(tool_name, tool_use_id, tool_input).await
        }
    }
}

impl GateBroker {
    async fn ask_permission(
        &self,
        tool_name: &str,
        id: &ToolUseId,
        input: Value,
    ) -> GateDecision {
        let (tx, rx) = oneshot::channel();
        self.orch.pending_permissions.insert(id.clone(), tx);
        self.orch.bus.broadcast(ChatEvent::PermissionRequest {
            tool_name: tool_name.to_string(),
            tool_use_id: id.clone(),
            tool_input: input,
        });

        tokio::select! {
            answer = rx => match answer {
                Ok(true) => GateDecision::Allow { updated_input: None },
                Ok(false) => GateDecision::Deny { message: "denied by user".into() },
                Err(_) => GateDecision::Deny { message: "permission request dropped".into() },
            },
            _ = tokio::time::sleep(PERMISSION_TIMEOUT) => {
                self.orch.pending_permissions.remove(id);
                tracing::warn!(tool = tool_name, "permission request timed out, allowing");
                GateDecision::Allow { updated_input: None }
            }
            _ = self.cancel.cancelled() => {
                self.orch.pending_permissions.remove(id);
                GateDecision::Deny { message: "query cancelled".into() }
            }
        }
    }

    /// Questions are advisory: the tool call always proceeds, carrying
    /// whatever answers arrived (possibly none).
    async fn ask_question(&self, id: &ToolUseId, input: Value) -> GateDecision {
        let (tx, rx) = oneshot::channel();
        self.orch.pending_questions.insert(id.clone(), tx);
        let questions = input.get("questions").cloned().unwrap_or_else(|| json!([]));
        self.orch.bus.broadcast(ChatEvent::QuestionRequest {
            tool_use_id: id.clone(),
            questions,
        });

        let answers = tokio::select! {
            answers = rx => answers.unwrap_or_default(),
            _ = tokio::time::sleep(QUESTION_TIMEOUT) => {
                self.orch.pending_questions.remove(id);
                tracing::warn!("question timed out, proceeding unanswered");
                QuestionAnswers::default()
            }
            _ = self.cancel.cancelled() => {
                self.orch.pending_questions.remove(id);
                QuestionAnswers::default()
            }
        };

        let mut updated = input;
        if let Value::Object(map) = &mut updated {
            map.insert("answers".into(), json!(answers));
        }
        GateDecision::Allow { updated_input: Some(updated) }
    }
}
