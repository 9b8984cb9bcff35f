//! Notification bus port.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::domain::errors::DomainResult;
use crate::domain::models::{BusMessage, Topic};

/// Topic based publish/subscribe channel.
///
/// Delivery is at-least-once and unordered across messages; consumers must
/// be idempotent.
pub trait NotificationBus: Send + Sync {
    /// Send a message and report how many subscribers it reached.
    fn send(&self, topic: &Topic, payload: Value) -> DomainResult<usize>;

    /// Fire-and-forget send; a topic nobody listens on is not an error.
    fn publish(&self, topic: &Topic, payload: Value) -> DomainResult<()> {
        self.send(topic, payload).map(|_| ())
    }

    /// Receive messages published on `topic` from now on.
    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<BusMessage>;
}
