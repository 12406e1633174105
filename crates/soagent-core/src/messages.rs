use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// Who authored a stored message. Tool traffic is never persisted,
/// only the user/assistant transcript.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One line of a session's append-only JSONL log. File order is causal order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl StoredMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now().to_rfc3339(),
            usage: None,
        }
    }

    pub fn assistant(content: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now().to_rfc3339(),
            usage,
        }
    }
}
