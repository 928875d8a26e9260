//! In-process topic pub/sub for progress streaming.
//!
//! Subscribers get a bounded queue (capacity 16); `publish` never blocks
//! and drops events a slow subscriber cannot absorb. Dropping events is a
//! contract, not an accident: correctness lives in the database, the bus
//! only accelerates the UI. There is no durable buffer, so late subscribers
//! see only new events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

/// Bound on each subscriber queue.
pub const SUBSCRIBER_CAPACITY: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Progress { token_id: String, progress: u8 },
    TokenReady { token_id: String },
    CampaignReady { campaign_id: String },
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Progress { .. } => "progress",
            Event::TokenReady { .. } => "token_ready",
            Event::CampaignReady { .. } => "campaign_ready",
        }
    }

    /// One wire frame: `event: <type>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_type(), data)
    }
}

/// Keep-alive comment sent when a stream opens.
pub fn sse_greeting() -> &'static str {
    ": connected\n\n"
}

pub fn token_topic(token_id: &str) -> String {
    format!("token:{token_id}")
}

pub fn campaign_topic(campaign_id: &str) -> String {
    format!("campaign:{campaign_id}")
}

struct Subscriber {
    id: u64,
    tx: Sender<Event>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bounded queue on `topic`. The subscription unsubscribes
    /// and drains on drop.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        Subscription {
            rx,
            topic: topic.to_string(),
            id,
            bus: self.clone(),
        }
    }

    /// Non-blocking fan-out. The lock covers only the sender-list copy;
    /// sends happen outside it, and full or disconnected queues are
    /// dropped targets, never waits.
    pub fn publish(&self, topic: &str, event: Event) {
        let senders: Vec<(u64, Sender<Event>)> = {
            let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            match topics.get(topic) {
                Some(subs) => subs.iter().map(|s| (s.id, s.tx.clone())).collect(),
                None => return,
            }
        };
        for (id, tx) in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::debug!("event dropped for slow subscriber {id} on {topic}");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

pub struct Subscription {
    pub rx: Receiver<Event>,
    topic: String,
    id: u64,
    bus: EventBus,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.topic, self.id);
        // Drain whatever was queued so pending events do not outlive the
        // subscription.
        while self.rx.try_recv().is_ok() {}
    }
}
