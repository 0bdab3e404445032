//! Live progress notifications
//!
//! The engine publishes state snapshots and log lines to per-execution
//! topics. Delivery is best effort: a message published while nobody is
//! subscribed is dropped.

use async_trait::async_trait;
use keel_core::dto::notification::Notification;
use tokio::sync::broadcast;
use tracing::trace;

/// Publishes notifications to observers
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, notification: Notification);
}

/// A notification together with the topic it was published on
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub notification: Notification,
}

/// In-process notifier backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Published>,
}

impl BroadcastNotifier {
    /// Creates a notifier; slow subscribers lag once `capacity` messages are queued
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to every topic
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(&self, topic: &str, notification: Notification) {
        let message = Published {
            topic: topic.to_string(),
            notification,
        };
        if self.sender.send(message).is_err() {
            trace!("No subscribers for {}", topic);
        }
    }
}
