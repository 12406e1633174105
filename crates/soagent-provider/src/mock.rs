//! Pre-programmed provider for deterministic orchestrator tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use soagent_core::ids::ToolUseId;
use soagent_core::provider::{
    AgentProvider, GateDecision, ProviderError, QueryEvent, QueryRequest, QueryStream, ToolGate,
};

/// One scripted reply, consumed per `query` call in order.
pub enum MockResponse {
    /// Yield the items, then end the stream.
    Stream(Vec<Result<QueryEvent, ProviderError>>),
    /// Fail the `query` call itself.
    Error(ProviderError),
    /// Wait, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield the events, then never end. Exercises cancellation paths.
    StreamThenHang(Vec<QueryEvent>),
    /// Announce a tool use, run it through the gate, then finish with the
    /// trailing events. The gate decision is surfaced as a ToolResult.
    GatedTool {
        tool_name: String,
        tool_use_id: ToolUseId,
        tool_input: Value,
        then: Vec<QueryEvent>,
    },
}

impl MockResponse {
    /// A turn that streams `text` as deltas and completes cleanly.
    pub fn stream_text(text: &str) -> Self {
        Self::Stream(vec![
            Ok(QueryEvent::TextDelta { delta: text.to_string() }),
            Ok(QueryEvent::Completed { resume_token: None, usage: None }),
        ])
    }

    /// Like `stream_text`, but the completion carries a resume token.
    pub fn stream_text_with_resume(text: &str, resume: &str) -> Self {
        Self::Stream(vec![
            Ok(QueryEvent::TextDelta { delta: text.to_string() }),
            Ok(QueryEvent::Completed {
                resume_token: Some(resume.to_string()),
                usage: None,
            }),
        ])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Returns scripted responses in sequence and records every request it saw.
#[derive(Default)]
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<QueryRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests observed so far, in call order.
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl AgentProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn query(
        &self,
        request: QueryRequest,
        gate: Option<Arc<dyn ToolGate>>,
    ) -> Result<QueryStream, ProviderError> {
        self.requests.lock().push(request);
        let response = self
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| ProviderError::Spawn("no scripted response left".into()))?;

        let mut current = response;
        loop {
            match current {
                MockResponse::Stream(items) => {
                    return Ok(Box::pin(stream::iter(items)));
                }
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    current = *inner;
                }
                MockResponse::StreamThenHang(events) => {
                    let head = stream::iter(events.into_iter().map(Ok));
                    return Ok(Box::pin(head.chain(stream::pending())));
                }
                MockResponse::GatedTool { tool_name, tool_use_id, tool_input, then } => {
                    let start = QueryEvent::ToolUseStart {
                        id: tool_use_id.clone(),
                        name: tool_name.clone(),
                    };
                    let gated = async move {
                        let decision = match gate {
                            Some(gate) => {
                                gate.check(&tool_name, &tool_use_id, tool_input).await
                            }
                            None => GateDecision::Allow { updated_input: None },
                        };
                        let result = match decision {
                            GateDecision::Allow { updated_input } => QueryEvent::ToolResult {
                                id: tool_use_id,
                                content: updated_input
                                    .map(|v| v.to_string())
                                    .unwrap_or_else(|| "allowed".to_string()),
                                is_error: false,
                            },
                            GateDecision::Deny { message } => QueryEvent::ToolResult {
                                id: tool_use_id,
                                content: message,
                                is_error: true,
                            },
                        };
                        let mut tail = vec![result];
                        tail.extend(then);
                        stream::iter(tail.into_iter().map(Ok))
                    };
                    let stream = stream::iter(vec![Ok(start)])
                        .chain(stream::once(gated).flatten());
                    return Ok(Box::pin(stream));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    #[tokio::test]
    async fn scripted_text_stream() {
        let provider = MockProvider::new(vec![MockResponse::stream_text("hello")]);
        let mut stream = provider.query(QueryRequest::default(), None).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, QueryEvent::TextDelta { delta } if delta == "hello"));
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second, QueryEvent::Completed { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn responses_are_consumed_in_order() {
        let provider = MockProvider::new(vec![
            MockResponse::stream_text("first"),
            MockResponse::Error(ProviderError::Spawn("down".into())),
        ]);

        assert!(provider.query(QueryRequest::default(), None).await.is_ok());
        assert!(provider.query(QueryRequest::default(), None).await.is_err());
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_is_an_error() {
        let provider = MockProvider::new(vec![]);
        assert!(provider.query(QueryRequest::default(), None).await.is_err());
    }

    #[tokio::test]
    async fn requests_are_recorded() {
        let provider = MockProvider::new(vec![MockResponse::stream_text("x")]);
        let request = QueryRequest { prompt: "the prompt".into(), ..Default::default() };
        let _ = provider.query(request, None).await.unwrap();

        let seen = provider.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].prompt, "the prompt");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response_waits() {
        let provider = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(5),
            MockResponse::stream_text("late"),
        )]);

        let start = tokio::time::Instant::now();
        let _ = provider.query(QueryRequest::default(), None).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn gated_tool_without_gate_allows() {
        let provider = MockProvider::new(vec![MockResponse::GatedTool {
            tool_name: "Bash".into(),
            tool_use_id: ToolUseId::from_raw("toolu_t"),
            tool_input: serde_json::json!({"cmd": "ls"}),
            then: vec![QueryEvent::Completed { resume_token: None, usage: None }],
        }]);

        let stream = provider.query(QueryRequest::default(), None).await.unwrap();
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Ok(QueryEvent::ToolUseStart { .. })));
        assert!(matches!(
            &events[1],
            Ok(QueryEvent::ToolResult { is_error: false, .. })
        ));
        assert!(matches!(events[2], Ok(QueryEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn hanging_stream_yields_head_then_pends() {
        let provider = MockProvider::new(vec![MockResponse::StreamThenHang(vec![
            QueryEvent::TextDelta { delta: "partial".into() },
        ])]);

        let mut stream = provider.query(QueryRequest::default(), None).await.unwrap();
        assert!(stream.next().await.is_some());
        let pending = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(pending.is_err(), "stream should hang after its head");
    }
}
