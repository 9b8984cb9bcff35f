//! Process-local notification bus backed by tokio broadcast channels.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{BusMessage, Topic};
use crate::domain::ports::NotificationBus;

/// Configuration for the in-memory bus.
#[derive(Debug, Clone)]
pub struct InMemoryBusConfig {
    /// Per-topic channel capacity. Slow subscribers lag beyond this.
    pub channel_capacity: usize,
}

impl Default for InMemoryBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// One broadcast channel per topic, created on first use.
pub struct InMemoryBus {
    channels: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    config: InMemoryBusConfig,
}

impl InMemoryBus {
    /// Bus with per-topic channels of the configured capacity.
    pub fn new(config: InMemoryBusConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn sender(&self, topic: &str) -> DomainResult<broadcast::Sender<BusMessage>> {
        if let Some(sender) = self
            .channels
            .read()
            .map_err(|_| DomainError::BusError("channel registry poisoned".to_string()))?
            .get(topic)
        {
            return Ok(sender.clone());
        }

        let mut channels = self
            .channels
            .write()
            .map_err(|_| DomainError::BusError("channel registry poisoned".to_string()))?;
        let sender = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.config.channel_capacity).0);
        Ok(sender.clone())
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.channels
            .read()
            .ok()
            .and_then(|channels| channels.get(&topic.name()).map(broadcast::Sender::receiver_count))
            .unwrap_or(0)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(InMemoryBusConfig::default())
    }
}

impl NotificationBus for InMemoryBus {
    fn send(&self, topic: &Topic, payload: Value) -> DomainResult<usize> {
        let name = topic.name();
        let sender = self.sender(&name)?;
        match sender.send(BusMessage { topic: name, payload }) {
            Ok(receivers) => Ok(receivers),
            // Only fails when nobody is subscribed
            Err(_) => Ok(0),
        }
    }

    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<BusMessage> {
        match self.sender(&topic.name()) {
            Ok(sender) => sender.subscribe(),
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "subscribing on a detached channel");
                broadcast::channel(1).1
            }
        }
    }
}
