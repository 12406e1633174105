//! Event-stream endpoint: every bus event becomes one SSE frame.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};

use crate::server::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// `GET /chat/events`. The subscriber's queue starts with the replayed log
/// ring, then receives live events until the client disconnects; the bus
/// prunes the subscription on the first publish after disconnect.
pub async fn chat_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (id, rx) = state.bus.subscribe();
    tracing::info!(subscriber_id = %id, "viewer connected");

    let stream = rx.map(|event| {
        Ok(Event::default()
            .event(event.event_name())
            .data(event.payload().to_string()))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat"))
}
