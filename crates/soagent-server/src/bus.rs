//! Fan-out of chat events to every connected viewer.
//!
//! Publishing never blocks: each subscriber gets a bounded queue and a
//! subscriber that cannot keep up (full queue) or has disconnected (closed
//! queue) is dropped on the next publish. Only `chat:log` events are kept
//! in a small replay ring so a late subscriber sees recent process logs;
//! conversation history is served from the store, not replayed here.

use std::collections::VecDeque;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use soagent_core::events::ChatEvent;
use soagent_core::ids::SubscriberId;

const REPLAY_CAPACITY: usize = 100;
const SUBSCRIBER_QUEUE: usize = 256;

#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<SubscriberId, mpsc::Sender<ChatEvent>>,
    replay: Mutex<VecDeque<ChatEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a viewer. Replayable events already in the ring are queued
    /// before the subscriber becomes visible to `broadcast`, so a new
    /// subscriber never sees a replayed event after a live one.
    pub fn subscribe(&self) -> (SubscriberId, ReceiverStream<ChatEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);

        for event in self.replay.lock().iter() {
            if tx.try_send(event.clone()).is_err() {
                break;
            }
        }

        let id = SubscriberId::new();
        self.subscribers.insert(id.clone(), tx);
        (id, ReceiverStream::new(rx))
    }

    pub fn unsubscribe(&self, id: &SubscriberId) {
        self.subscribers.remove(id);
    }

    /// Fire-and-forget publish to every subscriber.
    pub fn broadcast(&self, event: ChatEvent) {
        if event.is_log() {
            let mut replay = self.replay.lock();
            if replay.len() == REPLAY_CAPACITY {
                replay.pop_front();
            }
            replay.push_back(event.clone());
        }

        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().try_send(event.clone()).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
