//! The narrow contract against the external execution provider.
//!
//! The core drives exactly one streaming query at a time and observes its
//! events; everything about how the provider reasons or executes tools is
//! behind `AgentProvider`. `ToolGate` is the seam through which the
//! orchestrator intercepts side-effecting tool calls for user approval.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::ids::ToolUseId;
use crate::messages::TokenUsage;

/// How credential material is handed to the provider. Third-party
/// Anthropic-compatible endpoints disagree on which variable they honor,
/// so the original exposes all four combinations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    AuthToken,
    ApiKey,
    AuthTokenClearApiKey,
    #[default]
    Both,
}

/// Connection parameters for the external provider, as sent by the client
/// on each `/chat/send`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEnv {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default, rename = "authType")]
    pub auth_mode: AuthMode,
    /// API timeout in milliseconds.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default, rename = "disableNonessential")]
    pub disable_nonessential_traffic: bool,
}

/// Environment mutations to apply to the provider process: variables to set
/// and variables that must be absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvPatch {
    pub set: Vec<(&'static str, String)>,
    pub unset: Vec<&'static str>,
}

impl ProviderEnv {
    /// Translate into the ANTHROPIC_* variable set the provider understands.
    /// The model is deliberately not passed through the environment; it goes
    /// on the query itself.
    pub fn env_patch(&self) -> EnvPatch {
        let mut patch = EnvPatch::default();

        match &self.base_url {
            Some(url) => patch.set.push(("ANTHROPIC_BASE_URL", url.clone())),
            None => patch.unset.push("ANTHROPIC_BASE_URL"),
        }

        match &self.api_key {
            Some(key) => {
                let key = key.expose_secret().to_string();
                match self.auth_mode {
                    AuthMode::AuthToken => {
                        patch.set.push(("ANTHROPIC_AUTH_TOKEN", key));
                        patch.unset.push("ANTHROPIC_API_KEY");
                    }
                    AuthMode::ApiKey => {
                        patch.unset.push("ANTHROPIC_AUTH_TOKEN");
                        patch.set.push(("ANTHROPIC_API_KEY", key));
                    }
                    AuthMode::AuthTokenClearApiKey => {
                        patch.set.push(("ANTHROPIC_AUTH_TOKEN", key));
                        patch.set.push(("ANTHROPIC_API_KEY", String::new()));
                    }
                    AuthMode::Both => {
                        patch.set.push(("ANTHROPIC_AUTH_TOKEN", key.clone()));
                        patch.set.push(("ANTHROPIC_API_KEY", key));
                    }
                }
            }
            None => {
                patch.unset.push("ANTHROPIC_AUTH_TOKEN");
                patch.unset.push("ANTHROPIC_API_KEY");
            }
        }

        patch.unset.push("ANTHROPIC_MODEL");

        match self.timeout_ms {
            Some(ms) => patch.set.push(("API_TIMEOUT_MS", ms.to_string())),
            None => patch.unset.push("API_TIMEOUT_MS"),
        }

        if self.disable_nonessential_traffic {
            patch
                .set
                .push(("CLAUDE_CODE_DISABLE_NONESSENTIAL_TRAFFIC", "1".into()));
        } else {
            patch.unset.push("CLAUDE_CODE_DISABLE_NONESSENTIAL_TRAFFIC");
        }

        patch
    }
}

/// The tuple of connection parameters that decides whether a resumable
/// token from a previous turn is still safe to use. Reasoning-block
/// signatures are provider-specific, so any change here invalidates
/// resumption. The model is excluded on purpose: switching models on the
/// same provider keeps signatures valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderFingerprint {
    base_url: String,
    credential: String,
    auth_mode: AuthMode,
    timeout_ms: Option<u64>,
    disable_nonessential_traffic: bool,
}

impl ProviderFingerprint {
    pub fn of(env: Option<&ProviderEnv>) -> Self {
        match env {
            Some(env) => Self {
                base_url: env.base_url.clone().unwrap_or_default(),
                credential: env
                    .api_key
                    .as_ref()
                    .map(|k| k.expose_secret().to_string())
                    .unwrap_or_default(),
                auth_mode: env.auth_mode,
                timeout_ms: env.timeout_ms,
                disable_nonessential_traffic: env.disable_nonessential_traffic,
            },
            None => Self {
                base_url: String::new(),
                credential: String::new(),
                auth_mode: AuthMode::default(),
                timeout_ms: None,
                disable_nonessential_traffic: false,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl Default for PermissionMode {
    fn default() -> Self {
        Self::AcceptEdits
    }
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }

    /// Bypass mode runs without the tool-interception gate.
    pub fn requires_gating(&self) -> bool {
        !matches!(self, Self::BypassPermissions)
    }
}

/// An inline image sent with a user turn, base64-encoded.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub media_type: String,
    pub data: String,
}

/// One streaming query against the provider.
#[derive(Clone, Debug, Default)]
pub struct QueryRequest {
    pub prompt: String,
    pub workspace_dir: PathBuf,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Option<Vec<String>>,
    pub env: Option<ProviderEnv>,
    /// Provider-side conversation to continue, when fingerprint-compatible.
    pub resume: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Resolved MCP server configs, keyed by server id.
    pub mcp_servers: serde_json::Map<String, Value>,
}

/// Events observed while a query streams. Tool-argument fragments are
/// forwarded raw; reconstruction is the consumer's job (`partial_json`).
#[derive(Clone, Debug)]
pub enum QueryEvent {
    TextDelta { delta: String },
    ThinkingDelta { delta: String },
    ToolUseStart { id: ToolUseId, name: String },
    ToolInputDelta { id: ToolUseId, partial_json: String },
    ToolResult { id: ToolUseId, content: String, is_error: bool },
    /// Full assistant text delivered without streaming deltas. Counted only
    /// when no streamed text was seen for the turn.
    AssistantText { text: String },
    /// Terminal event carrying the provider's resumable token.
    Completed { resume_token: Option<String>, usage: Option<TokenUsage> },
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to start provider: {0}")]
    Spawn(String),
    #[error("provider protocol error: {0}")]
    Protocol(String),
    #[error("provider io error: {0}")]
    Io(String),
    #[error("cancelled")]
    Cancelled,
}

pub type QueryStream = Pin<Box<dyn Stream<Item = Result<QueryEvent, ProviderError>> + Send>>;

/// Decision returned by a `ToolGate` for a single tool invocation.
#[derive(Clone, Debug)]
pub enum GateDecision {
    Allow { updated_input: Option<Value> },
    Deny { message: String },
}

/// User-in-the-loop interception point for side-effecting tool calls.
/// Implementations suspend until a response, a timeout, or cancellation.
#[async_trait]
pub trait ToolGate: Send + Sync {
    async fn check(
        &self,
        tool_name: &str,
        tool_use_id: &ToolUseId,
        tool_input: Value,
    ) -> GateDecision;
}

/// The external execution provider. Opening a query yields a lazy event
/// stream; dropping the stream is how cancellation reaches the provider.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn query(
        &self,
        request: QueryRequest,
        gate: Option<Arc<dyn ToolGate>>,
    ) -> Result<QueryStream, ProviderError>;
}

/// Answers to a multi-question tool, keyed by question id.
pub type QuestionAnswers = HashMap<String, String>;
