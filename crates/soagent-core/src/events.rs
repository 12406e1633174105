use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ids::ToolUseId;

/// A log record carried on the `chat:log` channel. These are the only
/// events retained in the bus replay ring for late subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Everything the server can push to a viewer. Closed union instead of the
/// stringly event names the wire uses; `event_name()` is the only place the
/// wire strings live.
#[derive(Clone, Debug)]
pub enum ChatEvent {
    MessageChunk { text: String },
    ThinkingChunk { thinking: String },
    ToolUseStart { id: ToolUseId, name: String },
    ToolInputDelta { id: ToolUseId, partial_json: String },
    ToolResult { id: ToolUseId, content: String, is_error: bool },
    MessageComplete,
    MessageError { error: String },
    PermissionRequest { tool_name: String, tool_use_id: ToolUseId, tool_input: Value },
    QuestionRequest { tool_use_id: ToolUseId, questions: Value },
    Log(LogRecord),
}

impl ChatEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::MessageChunk { .. } => "chat:message-chunk",
            Self::ThinkingChunk { .. } => "chat:thinking-chunk",
            Self::ToolUseStart { .. } => "chat:tool-use-start",
            Self::ToolInputDelta { .. } => "chat:tool-input-delta",
            Self::ToolResult { .. } => "chat:tool-result",
            Self::MessageComplete => "chat:message-complete",
            Self::MessageError { .. } => "chat:message-error",
            Self::PermissionRequest { .. } => "permission:request",
            Self::QuestionRequest { .. } => "question:request",
            Self::Log(_) => "chat:log",
        }
    }

    /// JSON payload for the SSE `data:` line.
    pub fn payload(&self) -> Value {
        match self {
            Self::MessageChunk { text } => json!({ "text": text }),
            Self::ThinkingChunk { thinking } => json!({ "thinking": thinking }),
            Self::ToolUseStart { id, name } => json!({ "id": id, "name": name }),
            Self::ToolInputDelta { id, partial_json } => {
                json!({ "id": id, "partial_json": partial_json })
            }
            Self::ToolResult { id, content, is_error } => {
                json!({ "id": id, "content": content, "isError": is_error })
            }
            Self::MessageComplete => Value::Null,
            Self::MessageError { error } => json!({ "error": error }),
            Self::PermissionRequest { tool_name, tool_use_id, tool_input } => {
                json!({ "toolName": tool_name, "toolUseId": tool_use_id, "toolInput": tool_input })
            }
            Self::QuestionRequest { tool_use_id, questions } => {
                json!({ "toolUseId": tool_use_id, "questions": questions })
            }
            Self::Log(record) => json!(record),
        }
    }

    /// Only `chat:log` events are buffered for replay.
    pub fn is_log(&self) -> bool {
        matches!(self, Self::Log(_))
    }
}
