//! Topic subscription bookkeeping for one live connection
//!
//! The registry exists only while its connection does: it is cleared
//! wholesale on every disconnect, and the session re-subscribes from its
//! own retained interest list after reconnecting. Handles from a dead
//! connection are never reused.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{ClientFrame, Topic};

/// Handle for one active topic subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub topic: Topic,
}

/// Active subscriptions on the current connection.
pub struct SubscriptionRegistry {
    active: HashMap<Topic, Subscription>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

impl SubscriptionRegistry {
    pub fn new(outbound: mpsc::UnboundedSender<ClientFrame>) -> Self {
        Self {
            active: HashMap::new(),
            outbound,
        }
    }

    /// Idempotent per connection: re-subscribing to an already-active topic
    /// returns the existing handle. Exactly one subscribe frame and one
    /// delivery path per topic.
    pub fn subscribe(&mut self, topic: Topic) -> Subscription {
        if let Some(existing) = self.active.get(&topic) {
            return existing.clone();
        }

        let sub = Subscription {
            id: Uuid::new_v4(),
            topic: topic.clone(),
        };

        if self
            .outbound
            .send(ClientFrame::Subscribe {
                topic: topic.to_string(),
            })
            .is_err()
        {
            warn!(topic = %topic, "subscribe frame dropped: connection gone");
        } else {
            debug!(topic = %topic, "subscribed");
        }

        self.active.insert(topic, sub.clone());
        sub
    }

    /// Remove the handler and send an unsubscribe frame. Safe to call
    /// repeatedly; absent topics are a no-op.
    pub fn unsubscribe(&mut self, topic: &Topic) {
        if self.active.remove(topic).is_none() {
            return;
        }

        if self
            .outbound
            .send(ClientFrame::Unsubscribe {
                topic: topic.to_string(),
            })
            .is_err()
        {
            warn!(topic = %topic, "unsubscribe frame dropped: connection gone");
        } else {
            debug!(topic = %topic, "unsubscribed");
        }
    }

    pub fn is_active(&self, topic: &Topic) -> bool {
        self.active.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Drop all handles without emitting frames. Called when the transport
    /// is already gone; the next connection starts from a clean registry.
    pub fn clear(&mut self) {
        if !self.active.is_empty() {
            debug!(count = self.active.len(), "clearing dead subscriptions");
        }
        self.active.clear();
    }
}
