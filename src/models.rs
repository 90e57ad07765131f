//! Domain model for the realtime stream
//!
//! These are the shapes the broker and the history REST endpoint agree on.
//! Wire field names are camelCase (the platform's JSON convention).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One chat message, live or from a history page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// One reaction on a message. Uniqueness: at most one per (emoji, user)
/// per message at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: String,
    pub emoji: String,
    pub user: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Direction of a reaction delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Added,
    Removed,
}

/// One user's online/offline status inside a presence batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub is_online: bool,
}

/// Latest progress for one background task. Transient; only the newest
/// value per task is retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: String,
    pub phase: String,
    pub percent: f32,
}

/// One item in a notification bucket's capped recent list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}
