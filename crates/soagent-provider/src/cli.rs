//! Production provider: drives the `claude` CLI as a subprocess in
//! stream-json mode.
//!
//! One query is one child process. The user turn goes to stdin as a single
//! NDJSON line, events come back line by line on stdout, and tool-permission
//! checks arrive inline as `control_request` lines that must be answered on
//! stdin before the child proceeds. Dropping the returned stream kills the
//! child (`kill_on_drop`), which is how cancellation reaches the provider.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use soagent_core::ids::ToolUseId;
use soagent_core::messages::TokenUsage;
use soagent_core::provider::{
    AgentProvider, GateDecision, ProviderError, QueryEvent, QueryRequest, QueryStream, ToolGate,
};

const DEFAULT_BINARY: &str = "claude";
const BINARY_ENV: &str = "SOAGENT_CLAUDE_BIN";
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct CliProvider {
    binary: PathBuf,
}

impl CliProvider {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// Binary from `SOAGENT_CLAUDE_BIN`, falling back to `claude` on PATH.
    pub fn from_env() -> Self {
        let binary = std::env::var(BINARY_ENV).unwrap_or_else(|_| DEFAULT_BINARY.to_string());
        Self::new(binary)
    }
}

#[async_trait]
impl AgentProvider for CliProvider {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn query(
        &self,
        request: QueryRequest,
        gate: Option<Arc<dyn ToolGate>>,
    ) -> Result<QueryStream, ProviderError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(build_args(&request))
            .current_dir(&request.workspace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(env) = &request.env {
            let patch = env.env_patch();
            for (key, value) in &patch.set {
                cmd.env(key, value);
            }
            for key in &patch.unset {
                cmd.env_remove(key);
            }
        }

        let mut child = cmd.spawn().map_err(|e| ProviderError::Spawn(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Spawn("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Spawn("child stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "soagent_provider::stderr", "{line}");
                }
            });
        }

        let turn = serde_json::to_string(&user_turn(&request))
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        stdin
            .write_all(format!("{turn}\n").as_bytes())
            .await
            .map_err(|e| ProviderError::Io(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            // Moving the child in ties its lifetime to the reader: when this
            // task returns the child is dropped and killed.
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = LineParser::default();

            loop {
                let line = tokio::select! {
                    _ = tx.closed() => return,
                    line = lines.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Io(e.to_string()))).await;
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match parser.parse(&line) {
                    Parsed::Events(events) => {
                        for event in events {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Parsed::Control(ctl) => {
                        let decision = match &gate {
                            Some(gate) => {
                                gate.check(&ctl.tool_name, &ctl.tool_use_id, ctl.input.clone())
                                    .await
                            }
                            None => GateDecision::Allow { updated_input: None },
                        };
                        let response = control_response(&ctl.request_id, &decision);
                        let line = format!("{response}\n");
                        if let Err(e) = stdin.write_all(line.as_bytes()).await {
                            let _ = tx.send(Err(ProviderError::Io(e.to_string()))).await;
                            break;
                        }
                    }
                    Parsed::Fail(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                    Parsed::Ignored => {}
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn build_args(request: &QueryRequest) -> Vec<String> {
    let mut args: Vec<String> = [
        "--print",
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--include-partial-messages",
        "--verbose",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    if let Some(model) = &request.model {
        args.push("--model".into());
        args.push(model.clone());
    }
    if let Some(resume) = &request.resume {
        args.push("--resume".into());
        args.push(resume.clone());
    }
    args.push("--permission-mode".into());
    args.push(request.permission_mode.as_str().into());
    if let Some(tools) = &request.allowed_tools {
        if !tools.is_empty() {
            args.push("--allowed-tools".into());
            args.push(tools.join(","));
        }
    }
    if !request.mcp_servers.is_empty() {
        args.push("--mcp-config".into());
        args.push(json!({ "mcpServers": request.mcp_servers }).to_string());
    }

    args
}

/// The initial stdin line: one user turn with text plus any image blocks.
fn user_turn(request: &QueryRequest) -> Value {
    let mut content = vec![json!({ "type": "text", "text": request.prompt })];
    for attachment in &request.attachments {
        content.push(json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": attachment.media_type,
                "data": attachment.data,
            },
        }));
    }
    json!({
        "type": "user",
        "message": { "role": "user", "content": content },
    })
}

fn control_response(request_id: &Value, decision: &GateDecision) -> Value {
    let response = match decision {
        GateDecision::Allow { updated_input } => {
            let mut body = json!({ "behavior": "allow" });
            if let Some(input) = updated_input {
                body["updatedInput"] = input.clone();
            }
            body
        }
        GateDecision::Deny { message } => json!({ "behavior": "deny", "message": message }),
    };
    json!({
        "type": "control_response",
        "response": {
            "request_id": request_id,
            "subtype": "success",
            "response": response,
        },
    })
}

struct ControlRequest {
    request_id: Value,
    tool_name: String,
    tool_use_id: ToolUseId,
    input: Value,
}

enum Parsed {
    Events(Vec<QueryEvent>),
    Control(ControlRequest),
    Fail(ProviderError),
    Ignored,
}

/// Classifies one stdout line. Stateful: `input_json_delta` events carry
/// only a block index, so the index-to-tool-id mapping from the matching
/// `content_block_start` has to be remembered.
#[derive(Default)]
struct LineParser {
    tool_blocks: HashMap<u64, ToolUseId>,
}

impl LineParser {
    fn parse(&mut self, line: &str) -> Parsed {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "skipping unparseable provider line");
                return Parsed::Ignored;
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("stream_event") => self.parse_stream_event(&value),
            Some("assistant") => parse_assistant(&value),
            Some("user") => parse_tool_results(&value),
            Some("result") => parse_result(&value),
            Some("control_request") => parse_control_request(&value),
            _ => Parsed::Ignored,
        }
    }

    fn parse_stream_event(&mut self, value: &Value) -> Parsed {
        let Some(event) = value.get("event") else {
            return Parsed::Ignored;
        };
        let index = event.get("index").and_then(Value::as_u64);

        match event.get("type").and_then(Value::as_str) {
            Some("content_block_start") => {
                let Some(block) = event.get("content_block") else {
                    return Parsed::Ignored;
                };
                if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    return Parsed::Ignored;
                }
                let id = ToolUseId::from_raw(
                    block.get("id").and_then(Value::as_str).unwrap_or_default(),
                );
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if let Some(index) = index {
                    self.tool_blocks.insert(index, id.clone());
                }
                Parsed::Events(vec![QueryEvent::ToolUseStart { id, name }])
            }
            Some("content_block_delta") => {
                let Some(delta) = event.get("delta") else {
                    return Parsed::Ignored;
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                        Parsed::Events(vec![QueryEvent::TextDelta { delta: text.to_string() }])
                    }
                    Some("thinking_delta") => {
                        let text = delta
                            .get("thinking")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        Parsed::Events(vec![QueryEvent::ThinkingDelta { delta: text.to_string() }])
                    }
                    Some("input_json_delta") => {
                        let fragment = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        let Some(id) = index.and_then(|i| self.tool_blocks.get(&i).cloned())
                        else {
                            return Parsed::Ignored;
                        };
                        Parsed::Events(vec![QueryEvent::ToolInputDelta {
                            id,
                            partial_json: fragment.to_string(),
                        }])
                    }
                    _ => Parsed::Ignored,
                }
            }
            _ => Parsed::Ignored,
        }
    }
}

/// Whole assistant messages arrive alongside stream events; the consumer
/// decides whether the text was already covered by deltas.
fn parse_assistant(value: &Value) -> Parsed {
    let blocks = value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        Parsed::Ignored
    } else {
        Parsed::Events(vec![QueryEvent::AssistantText { text }])
    }
}

fn parse_tool_results(value: &Value) -> Parsed {
    let blocks = value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut events = Vec::new();
    for block in &blocks {
        if block.get("type").and_then(Value::as_str) != Some("tool_result") {
            continue;
        }
        let id = ToolUseId::from_raw(
            block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );
        let content = match block.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect(),
            _ => String::new(),
        };
        let is_error = block
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        events.push(QueryEvent::ToolResult { id, content, is_error });
    }

    if events.is_empty() {
        Parsed::Ignored
    } else {
        Parsed::Events(events)
    }
}

fn parse_result(value: &Value) -> Parsed {
    if value.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
        let detail = value
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or("query failed")
            .to_string();
        return Parsed::Fail(ProviderError::Protocol(detail));
    }

    let resume_token = value
        .get("session_id")
        .and_then(Value::as_str)
        .map(String::from);
    let usage = value.get("usage").map(|u| TokenUsage {
        input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
    });
    Parsed::Events(vec![QueryEvent::Completed { resume_token, usage }])
}

fn parse_control_request(value: &Value) -> Parsed {
    let Some(request) = value.get("request") else {
        return Parsed::Ignored;
    };
    if request.get("subtype").and_then(Value::as_str) != Some("can_use_tool") {
        return Parsed::Ignored;
    }
    Parsed::Control(ControlRequest {
        request_id: value.get("request_id").cloned().unwrap_or(Value::Null),
        tool_name: request
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        tool_use_id: ToolUseId::from_raw(
            request
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        ),
        input: request.get("input").cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use soagent_core::provider::{Attachment, PermissionMode};

    fn request() -> QueryRequest {
        QueryRequest {
            prompt: "hello".into(),
            workspace_dir: "/tmp/ws".into(),
            ..Default::default()
        }
    }

    #[test]
    fn base_args_enable_streaming_io() {
        let args = build_args(&request());
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"--include-partial-messages".to_string()));
        let i = args.iter().position(|a| a == "--output-format").unwrap();
        assert_eq!(args[i + 1], "stream-json");
        let i = args.iter().position(|a| a == "--permission-mode").unwrap();
        assert_eq!(args[i + 1], "acceptEdits");
    }

    #[test]
    fn optional_args_appear_when_set() {
        let mut req = request();
        req.model = Some("some-model".into());
        req.resume = Some("resume-token-1".into());
        req.permission_mode = PermissionMode::Plan;
        req.allowed_tools = Some(vec!["Read".into(), "Bash".into()]);

        let args = build_args(&req);
        let i = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[i + 1], "some-model");
        let i = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[i + 1], "resume-token-1");
        let i = args.iter().position(|a| a == "--permission-mode").unwrap();
        assert_eq!(args[i + 1], "plan");
        let i = args.iter().position(|a| a == "--allowed-tools").unwrap();
        assert_eq!(args[i + 1], "Read,Bash");
    }

    #[test]
    fn mcp_config_is_inlined_json() {
        let mut req = request();
        req.mcp_servers.insert(
            "files".into(),
            json!({ "type": "stdio", "command": "mcp-files" }),
        );
        let args = build_args(&req);
        let i = args.iter().position(|a| a == "--mcp-config").unwrap();
        let parsed: Value = serde_json::from_str(&args[i + 1]).unwrap();
        assert_eq!(parsed["mcpServers"]["files"]["command"], "mcp-files");
    }

    #[test]
    fn user_turn_carries_text_and_images() {
        let mut req = request();
        req.attachments.push(Attachment {
            media_type: "image/png".into(),
            data: "aGk=".into(),
        });
        let turn = user_turn(&req);
        assert_eq!(turn["type"], "user");
        assert_eq!(turn["message"]["content"][0]["text"], "hello");
        assert_eq!(turn["message"]["content"][1]["source"]["media_type"], "image/png");
    }

    #[test]
    fn text_delta_parses() {
        let mut parser = LineParser::default();
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}}"#;
        match parser.parse(line) {
            Parsed::Events(events) => {
                assert!(matches!(&events[0], QueryEvent::TextDelta { delta } if delta == "hi"));
            }
            _ => panic!("expected events"),
        }
    }

    #[test]
    fn tool_input_deltas_correlate_by_block_index() {
        let mut parser = LineParser::default();
        let start = r#"{"type":"stream_event","event":{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_abc","name":"Bash"}}}"#;
        match parser.parse(start) {
            Parsed::Events(events) => match &events[0] {
                QueryEvent::ToolUseStart { id, name } => {
                    assert_eq!(id.as_str(), "toolu_abc");
                    assert_eq!(name, "Bash");
                }
                other => panic!("unexpected: {other:?}"),
            },
            _ => panic!("expected events"),
        }

        let delta = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"cmd\""}}}"#;
        match parser.parse(delta) {
            Parsed::Events(events) => match &events[0] {
                QueryEvent::ToolInputDelta { id, partial_json } => {
                    assert_eq!(id.as_str(), "toolu_abc");
                    assert_eq!(partial_json, "{\"cmd\"");
                }
                other => panic!("unexpected: {other:?}"),
            },
            _ => panic!("expected events"),
        }
    }

    #[test]
    fn orphan_input_delta_is_ignored() {
        let mut parser = LineParser::default();
        let delta = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":9,"delta":{"type":"input_json_delta","partial_json":"{"}}}"#;
        assert!(matches!(parser.parse(delta), Parsed::Ignored));
    }

    #[test]
    fn assistant_message_concatenates_text_blocks() {
        let mut parser = LineParser::default();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"a"},{"type":"tool_use","id":"x"},{"type":"text","text":"b"}]}}"#;
        match parser.parse(line) {
            Parsed::Events(events) => {
                assert!(matches!(&events[0], QueryEvent::AssistantText { text } if text == "ab"));
            }
            _ => panic!("expected events"),
        }
    }

    #[test]
    fn tool_result_parses_string_and_array_content() {
        let mut parser = LineParser::default();
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"plain"},{"type":"tool_result","tool_use_id":"toolu_2","content":[{"type":"text","text":"part"}],"is_error":true}]}}"#;
        match parser.parse(line) {
            Parsed::Events(events) => {
                assert_eq!(events.len(), 2);
                match &events[0] {
                    QueryEvent::ToolResult { id, content, is_error } => {
                        assert_eq!(id.as_str(), "toolu_1");
                        assert_eq!(content, "plain");
                        assert!(!is_error);
                    }
                    other => panic!("unexpected: {other:?}"),
                }
                match &events[1] {
                    QueryEvent::ToolResult { content, is_error, .. } => {
                        assert_eq!(content, "part");
                        assert!(is_error);
                    }
                    other => panic!("unexpected: {other:?}"),
                }
            }
            _ => panic!("expected events"),
        }
    }

    #[test]
    fn success_result_carries_resume_token_and_usage() {
        let mut parser = LineParser::default();
        let line = r#"{"type":"result","subtype":"success","session_id":"prov-123","usage":{"input_tokens":10,"output_tokens":20}}"#;
        match parser.parse(line) {
            Parsed::Events(events) => match &events[0] {
                QueryEvent::Completed { resume_token, usage } => {
                    assert_eq!(resume_token.as_deref(), Some("prov-123"));
                    let usage = usage.as_ref().unwrap();
                    assert_eq!(usage.input_tokens, 10);
                    assert_eq!(usage.output_tokens, 20);
                }
                other => panic!("unexpected: {other:?}"),
            },
            _ => panic!("expected events"),
        }
    }

    #[test]
    fn error_result_fails_the_stream() {
        let mut parser = LineParser::default();
        let line = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"boom"}"#;
        match parser.parse(line) {
            Parsed::Fail(ProviderError::Protocol(msg)) => assert_eq!(msg, "boom"),
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn control_request_extracts_tool_call() {
        let mut parser = LineParser::default();
        let line = r#"{"type":"control_request","request_id":"req_7","request":{"subtype":"can_use_tool","tool_name":"Write","tool_use_id":"toolu_9","input":{"path":"/tmp/x"}}}"#;
        match parser.parse(line) {
            Parsed::Control(ctl) => {
                assert_eq!(ctl.request_id, json!("req_7"));
                assert_eq!(ctl.tool_name, "Write");
                assert_eq!(ctl.tool_use_id.as_str(), "toolu_9");
                assert_eq!(ctl.input["path"], "/tmp/x");
            }
            _ => panic!("expected control request"),
        }
    }

    #[test]
    fn garbage_lines_are_ignored() {
        let mut parser = LineParser::default();
        assert!(matches!(parser.parse("not json"), Parsed::Ignored));
        assert!(matches!(parser.parse(r#"{"type":"system","subtype":"init"}"#), Parsed::Ignored));
    }

    #[test]
    fn allow_response_shape() {
        let response = control_response(
            &json!("req_1"),
            &GateDecision::Allow { updated_input: Some(json!({"a": 1})) },
        );
        assert_eq!(response["type"], "control_response");
        assert_eq!(response["response"]["request_id"], "req_1");
        assert_eq!(response["response"]["response"]["behavior"], "allow");
        assert_eq!(response["response"]["response"]["updatedInput"]["a"], 1);
    }

    #[test]
    fn deny_response_shape() {
        let response =
            control_response(&json!("req_2"), &GateDecision::Deny { message: "no".into() });
        assert_eq!(response["response"]["response"]["behavior"], "deny");
        assert_eq!(response["response"]["response"]["message"], "no");
    }
}
