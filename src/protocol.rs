//! Broker wire protocol: topics, frames, and the event classifier
//!
//! Every broker frame is a JSON envelope carrying the originating topic and
//! an explicit `type` discriminant, decoded straight into a tagged union.
//! Field-presence sniffing is deliberately not used: two variants sharing a
//! field set must still classify unambiguously. The only structural
//! fallback left is for legacy untagged frames, which are routed by the
//! identity of the subscribing topic (task-progress vs. notification), not
//! by payload shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::RealtimeError;
use crate::models::{Message, NotificationItem, PresenceEntry, Reaction, ReactionAction, TaskProgress};

// =============================================================================
// TOPICS
// =============================================================================

/// A named pub/sub channel. One subscription per topic per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Per-user notification stream
    UserNotifications { user_id: String },
    /// Per-user authoritative unread-count push stream
    UserUnread { user_id: String },
    /// Per-scope chat stream (messages, reactions, typing, presence)
    ScopeChat { scope: String },
    /// Per-task progress stream, dynamically tracked
    TaskProgress { task_id: String },
    /// Per-scope task start/finish events
    ScopeTasks { scope: String },
}

impl Topic {
    /// Parse a wire topic path back into its variant.
    pub fn parse(path: &str) -> Option<Self> {
        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            ["user", id, "notifications"] => Some(Self::UserNotifications {
                user_id: (*id).to_string(),
            }),
            ["user", id, "unread"] => Some(Self::UserUnread {
                user_id: (*id).to_string(),
            }),
            ["scope", id, "chat"] => Some(Self::ScopeChat {
                scope: (*id).to_string(),
            }),
            ["task", id, "progress"] => Some(Self::TaskProgress {
                task_id: (*id).to_string(),
            }),
            ["scope", id, "tasks"] => Some(Self::ScopeTasks {
                scope: (*id).to_string(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserNotifications { user_id } => write!(f, "user/{}/notifications", user_id),
            Self::UserUnread { user_id } => write!(f, "user/{}/unread", user_id),
            Self::ScopeChat { scope } => write!(f, "scope/{}/chat", scope),
            Self::TaskProgress { task_id } => write!(f, "task/{}/progress", task_id),
            Self::ScopeTasks { scope } => write!(f, "scope/{}/tasks", scope),
        }
    }
}

// =============================================================================
// OUTBOUND FRAMES
// =============================================================================

/// Client-to-broker frame. The `action` tag mirrors the subscribe frames
/// the broker expects; action bodies are minimal per the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        topic: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        /// Client-generated id for server-side dedup on retry.
        client_ref: String,
    },
    #[serde(rename_all = "camelCase")]
    React {
        topic: String,
        message_id: String,
        emoji: String,
    },
    #[serde(rename_all = "camelCase")]
    SetTyping {
        topic: String,
        is_typing: bool,
    },
    Ping,
}

// =============================================================================
// INBOUND EVENTS
// =============================================================================

/// Broker-to-client event, discriminated by the explicit `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake acknowledgment; first frame after a successful connect.
    Connected {
        #[serde(default)]
        session: Option<String>,
    },
    /// Subscription acknowledgment.
    Subscribed { topic: String },
    Pong,
    ChatMessage {
        #[serde(flatten)]
        message: Message,
    },
    #[serde(rename_all = "camelCase")]
    Reaction {
        message_id: String,
        action: ReactionAction,
        reaction: Reaction,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        user_id: String,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    Presence {
        user_id: String,
        is_online: bool,
    },
    /// Full replace of the online set.
    PresenceBatch { users: Vec<PresenceEntry> },
    TaskProgress {
        #[serde(flatten)]
        progress: TaskProgress,
    },
    Notification {
        #[serde(flatten)]
        item: NotificationItem,
    },
    /// Authoritative unread counter push; overwrites optimistic local state.
    UnreadCount { scope: String, count: u32 },
}

/// One classified inbound frame: the topic it arrived on (if any) plus the
/// decoded event.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub topic: Option<String>,
    pub event: ServerEvent,
}

/// Decode one raw broker frame.
///
/// Tagged frames decode directly. Untagged frames are routed by the
/// subscribing topic's identity: task topics carry progress payloads,
/// notification topics carry notification payloads. Anything else is a
/// per-frame `Parse` error; the caller drops the frame and moves on.
pub fn classify(raw: &str) -> Result<InboundFrame, RealtimeError> {
    let value: Value = serde_json::from_str(raw).map_err(|source| RealtimeError::Parse {
        topic: "<invalid json>".to_string(),
        source,
    })?;

    let topic = value
        .get("topic")
        .and_then(Value::as_str)
        .map(str::to_string);
    let topic_label = topic.clone().unwrap_or_else(|| "<none>".to_string());

    // Primary path: explicit discriminant.
    if value.get("type").is_some() {
        let event =
            serde_json::from_value::<ServerEvent>(value).map_err(|source| RealtimeError::Parse {
                topic: topic_label,
                source,
            })?;
        return Ok(InboundFrame { topic, event });
    }

    // Legacy fallback: route by subscribing topic identity.
    let routed = topic.as_deref().and_then(Topic::parse);
    let event = match routed {
        Some(Topic::TaskProgress { .. }) | Some(Topic::ScopeTasks { .. }) => {
            serde_json::from_value::<TaskProgress>(value)
                .map(|progress| ServerEvent::TaskProgress { progress })
        }
        Some(Topic::UserNotifications { .. }) => serde_json::from_value::<NotificationItem>(value)
            .map(|item| ServerEvent::Notification { item }),
        Some(Topic::UserUnread { .. }) => serde_json::from_value::<ServerEvent>(Value::Object({
            let mut obj = value.as_object().cloned().unwrap_or_default();
            obj.insert("type".to_string(), Value::String("unread_count".to_string()));
            obj
        })),
        _ => {
            return Err(RealtimeError::Parse {
                topic: topic_label,
                source: serde::de::Error::custom("frame carries no type tag and no routable topic"),
            })
        }
    };

    match event {
        Ok(event) => {
            trace!(topic = %topic_label, "classified untagged frame by topic identity");
            Ok(InboundFrame { topic, event })
        }
        Err(source) => Err(RealtimeError::Parse {
            topic: topic_label,
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_display_parse_roundtrip() {
        let topics = vec![
            Topic::UserNotifications {
                user_id: "u1".to_string(),
            },
            Topic::UserUnread {
                user_id: "u1".to_string(),
            },
            Topic::ScopeChat {
                scope: "course-7".to_string(),
            },
            Topic::TaskProgress {
                task_id: "t42".to_string(),
            },
            Topic::ScopeTasks {
                scope: "course-7".to_string(),
            },
        ];

        for topic in topics {
            assert_eq!(Topic::parse(&topic.to_string()), Some(topic));
        }
        assert_eq!(Topic::parse("bogus/path"), None);
    }

    #[test]
    fn test_subscribe_frame_serialization() {
        let frame = ClientFrame::Subscribe {
            topic: "scope/course-7/chat".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""action":"subscribe""#));
        assert!(json.contains("scope/course-7/chat"));
    }

    #[test]
    fn test_classify_tagged_chat_message() {
        let raw = r#"{
            "topic": "scope/course-7/chat",
            "type": "chat_message",
            "id": "m1",
            "content": "hi",
            "author": "u1",
            "createdAt": "2026-03-01T10:00:00Z"
        }"#;

        let frame = classify(raw).unwrap();
        assert_eq!(frame.topic.as_deref(), Some("scope/course-7/chat"));
        match frame.event {
            ServerEvent::ChatMessage { message } => {
                assert_eq!(message.id, "m1");
                assert_eq!(message.content, "hi");
            }
            other => panic!("expected chat message, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_tagged_reaction() {
        let raw = r#"{
            "topic": "scope/course-7/chat",
            "type": "reaction",
            "messageId": "m1",
            "action": "added",
            "reaction": {"id": "r1", "emoji": "👍", "user": "u1"}
        }"#;

        let frame = classify(raw).unwrap();
        match frame.event {
            ServerEvent::Reaction {
                message_id,
                action,
                reaction,
            } => {
                assert_eq!(message_id, "m1");
                assert_eq!(action, ReactionAction::Added);
                assert_eq!(reaction.emoji, "👍");
            }
            other => panic!("expected reaction, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_untagged_routes_by_task_topic() {
        let raw = r#"{
            "topic": "task/t42/progress",
            "taskId": "t42",
            "phase": "transcoding",
            "percent": 62.5
        }"#;

        let frame = classify(raw).unwrap();
        match frame.event {
            ServerEvent::TaskProgress { progress } => {
                assert_eq!(progress.task_id, "t42");
                assert_eq!(progress.phase, "transcoding");
            }
            other => panic!("expected task progress, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_untagged_routes_by_unread_topic() {
        let raw = r#"{"topic": "user/u1/unread", "scope": "teacher", "count": 4}"#;

        let frame = classify(raw).unwrap();
        match frame.event {
            ServerEvent::UnreadCount { scope, count } => {
                assert_eq!(scope, "teacher");
                assert_eq!(count, 4);
            }
            other => panic!("expected unread count, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_untagged_unroutable_is_parse_error() {
        let raw = r#"{"topic": "scope/course-7/chat", "something": true}"#;
        let err = classify(raw).unwrap_err();
        assert!(matches!(err, RealtimeError::Parse { .. }));
    }

    #[test]
    fn test_presence_batch_decodes() {
        let raw = r#"{
            "topic": "scope/course-7/chat",
            "type": "presence_batch",
            "users": [
                {"userId": "u1", "isOnline": true},
                {"userId": "u2", "isOnline": true}
            ]
        }"#;

        let frame = classify(raw).unwrap();
        match frame.event {
            ServerEvent::PresenceBatch { users } => assert_eq!(users.len(), 2),
            other => panic!("expected presence batch, got {:?}", other),
        }
    }
}
