use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::trace;

use super::types::{EngineEvent, EventKind};

/// Event subscriber handle. Dropping the handle unsubscribes.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<EngineEvent>,
    kinds: Option<Vec<EventKind>>,
}

impl EventSubscriber {
    fn new(receiver: broadcast::Receiver<EngineEvent>, kinds: Option<Vec<EventKind>>) -> Self {
        Self { receiver, kinds }
    }

    /// Receive the next event matching the filter
    pub async fn recv(&mut self) -> Result<EngineEvent> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Try to receive without blocking
    pub fn try_recv(&mut self) -> Result<Option<EngineEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn matches(&self, event: &EngineEvent) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&event.kind()),
            None => true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EventBusStats {
    pub total_events: u64,
    pub events_by_kind: HashMap<&'static str, u64>,
    pub subscriber_count: usize,
    pub dropped_events: u64,
}

/// Broadcast bus for engine events. Owned by the engine; subscribers get a
/// handle and fall behind independently (slow subscribers drop, the engine
/// never blocks on them).
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    stats: Arc<RwLock<EventBusStats>>,
    history: Arc<RwLock<Vec<EngineEvent>>>,
    max_history: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            stats: Arc::new(RwLock::new(EventBusStats::default())),
            history: Arc::new(RwLock::new(Vec::new())),
            max_history: 100,
        }
    }

    /// Publish an event to all subscribers.
    pub async fn publish(&self, event: EngineEvent) {
        trace!("Publishing event: {:?}", event.kind());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_kind
                .entry(event.kind().as_str())
                .or_insert(0) += 1;
        }

        {
            let mut history = self.history.write().await;
            history.push(event.clone());
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(0..excess);
            }
        }

        if self.sender.send(event).is_err() {
            // No subscribers is normal
            let mut stats = self.stats.write().await;
            stats.dropped_events += 1;
        }
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber::new(self.sender.subscribe(), None)
    }

    /// Subscribe to specific event kinds
    pub fn subscribe_to(&self, kinds: Vec<EventKind>) -> EventSubscriber {
        EventSubscriber::new(self.sender.subscribe(), Some(kinds))
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub async fn stats(&self) -> EventBusStats {
        let mut stats = self.stats.read().await.clone();
        stats.subscriber_count = self.subscriber_count();
        stats
    }

    /// Last events, oldest first, for debugging
    pub async fn history(&self) -> Vec<EngineEvent> {
        self.history.read().await.clone()
    }
}
