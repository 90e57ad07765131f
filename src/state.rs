//! Live state reduction
//!
//! Pure update functions applied per event variant to the session's
//! in-memory collections. Collections are owned by their session and
//! mutated only through these reducers on the frame-handling path (plus
//! the history merge), so no cross-session locking is needed.
//!
//! Staleness uses monotonic `Instant`, never wall-clock time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::config::RealtimeConfig;
use crate::models::{Message, NotificationItem, PresenceEntry, Reaction, ReactionAction, TaskProgress};
use crate::protocol::{InboundFrame, ServerEvent};

// =============================================================================
// CHAT
// =============================================================================

/// Ordered message list plus the ephemeral typing/presence maps for one
/// chat scope. Message order is strictly (created_at, id).
#[derive(Debug)]
pub struct ChatState {
    messages: Vec<Message>,
    /// user id -> last refresh; absence = not typing
    typing: HashMap<String, Instant>,
    /// user id -> online; absence = offline
    presence: HashMap<String, bool>,
    typing_ttl: Duration,
}

impl ChatState {
    pub fn new(typing_ttl: Duration) -> Self {
        Self {
            messages: Vec::new(),
            typing: HashMap::new(),
            presence: HashMap::new(),
            typing_ttl,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Append a live message at the tail. Live messages are always newer
    /// than any merged history page, so no re-sort is triggered. Duplicate
    /// ids are dropped.
    pub fn apply_message(&mut self, message: Message) {
        if self.messages.iter().any(|m| m.id == message.id) {
            debug!(id = %message.id, "dropping duplicate message");
            return;
        }
        self.messages.push(message);
    }

    /// Apply a reaction delta to the target message. Idempotent both ways:
    /// adding an existing (id or emoji/user) reaction changes nothing, and
    /// removing an absent one is a no-op.
    pub fn apply_reaction(&mut self, message_id: &str, action: ReactionAction, reaction: Reaction) {
        let Some(message) = self.messages.iter_mut().find(|m| m.id == message_id) else {
            debug!(message_id, "reaction for unknown message");
            return;
        };

        let matches = |r: &Reaction| {
            r.id == reaction.id || (r.emoji == reaction.emoji && r.user == reaction.user)
        };

        match action {
            ReactionAction::Added => {
                if !message.reactions.iter().any(matches) {
                    message.reactions.push(reaction);
                }
            }
            ReactionAction::Removed => {
                message.reactions.retain(|r| !matches(r));
            }
        }
    }

    /// Upsert on `is_typing=true`, delete on `false`. Entries older than
    /// the TTL are evicted here as well, so a client that vanishes without
    /// sending its `false` signal cannot stay "typing" forever.
    pub fn apply_typing(&mut self, user_id: &str, is_typing: bool, now: Instant) {
        if is_typing {
            self.typing.insert(user_id.to_string(), now);
        } else {
            self.typing.remove(user_id);
        }
        self.sweep_typing(now);
    }

    /// Evict typing entries past the TTL. Also callable from a periodic
    /// tick for scopes with no typing traffic.
    pub fn sweep_typing(&mut self, now: Instant) {
        let ttl = self.typing_ttl;
        self.typing
            .retain(|_, last| now.duration_since(*last) < ttl);
    }

    pub fn typing_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.typing.keys().cloned().collect();
        users.sort();
        users
    }

    /// Individual presence event: upsert/delete by user id.
    pub fn apply_presence(&mut self, user_id: &str, is_online: bool) {
        if is_online {
            self.presence.insert(user_id.to_string(), true);
        } else {
            self.presence.remove(user_id);
        }
    }

    /// Batch event: the entire map is replaced with only the online users
    /// enumerated in the batch.
    pub fn apply_presence_batch(&mut self, users: &[PresenceEntry]) {
        self.presence = users
            .iter()
            .filter(|u| u.is_online)
            .map(|u| (u.user_id.clone(), true))
            .collect();
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.get(user_id).copied().unwrap_or(false)
    }

    pub fn online_count(&self) -> usize {
        self.presence.len()
    }

    /// Replace the list with history page 0 (already chronological).
    pub fn replace_history(&mut self, page: Vec<Message>) {
        self.messages = page;
    }

    /// Prepend an older history page (already chronological), dropping any
    /// ids the list already holds.
    pub fn prepend_history(&mut self, page: Vec<Message>) {
        let mut merged: Vec<Message> = page
            .into_iter()
            .filter(|m| !self.messages.iter().any(|existing| existing.id == m.id))
            .collect();
        merged.append(&mut self.messages);
        self.messages = merged;
    }
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Per role-scope unread counter plus a capped recent list, newest first.
#[derive(Debug, Default)]
pub struct NotificationBucket {
    pub unread: u32,
    pub recent: Vec<NotificationItem>,
}

/// Session-scoped notification buckets. Constructed at session start and
/// dropped at session end; nothing here outlives its logical owner.
#[derive(Debug)]
pub struct NotificationState {
    buckets: HashMap<String, NotificationBucket>,
    recent_cap: usize,
}

impl NotificationState {
    pub fn new(recent_cap: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            recent_cap,
        }
    }

    fn bucket_mut(&mut self, scope: &str) -> &mut NotificationBucket {
        self.buckets.entry(scope.to_string()).or_default()
    }

    pub fn bucket(&self, scope: &str) -> Option<&NotificationBucket> {
        self.buckets.get(scope)
    }

    pub fn apply_notification(&mut self, item: NotificationItem) {
        let cap = self.recent_cap;
        let scope = item.scope.clone().unwrap_or_else(|| "general".to_string());
        let bucket = self.bucket_mut(&scope);

        if !item.read {
            bucket.unread = bucket.unread.saturating_add(1);
        }
        bucket.recent.insert(0, item);
        bucket.recent.truncate(cap);
    }

    /// Authoritative counter push: overwrites whatever the optimistic
    /// mutations below left behind. The contract specifies no finer
    /// reconciliation, so the push always wins.
    pub fn apply_unread_count(&mut self, scope: &str, count: u32) {
        self.bucket_mut(scope).unread = count;
    }

    /// Optimistic: decrement and flag the matching cached item without
    /// waiting for server confirmation.
    pub fn mark_read(&mut self, scope: &str, id: &str) {
        let bucket = self.bucket_mut(scope);
        if let Some(item) = bucket.recent.iter_mut().find(|i| i.id == id && !i.read) {
            item.read = true;
            bucket.unread = bucket.unread.saturating_sub(1);
        }
    }

    /// Optimistic: zero the counter and flag every cached item; reconciled
    /// later by the authoritative unread push.
    pub fn mark_all_read(&mut self, scope: &str) {
        let bucket = self.bucket_mut(scope);
        bucket.unread = 0;
        for item in &mut bucket.recent {
            item.read = true;
        }
    }

    pub fn unread_total(&self) -> u32 {
        self.buckets.values().map(|b| b.unread).sum()
    }
}

// =============================================================================
// TASK PROGRESS
// =============================================================================

/// Latest progress per tracked task; nothing older is retained.
#[derive(Debug, Default)]
pub struct TaskState {
    progress: HashMap<String, TaskProgress>,
}

impl TaskState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_progress(&mut self, progress: TaskProgress) {
        self.progress.insert(progress.task_id.clone(), progress);
    }

    pub fn latest(&self, task_id: &str) -> Option<&TaskProgress> {
        self.progress.get(task_id)
    }

    /// Forget a task once the UI stops tracking it.
    pub fn forget(&mut self, task_id: &str) {
        self.progress.remove(task_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.progress.len()
    }
}

// =============================================================================
// SESSION STORES
// =============================================================================

/// One session's complete set of reducible collections. The owning session
/// is the sole mutator on the frame path.
pub struct SessionStores {
    pub chat: RwLock<ChatState>,
    pub notifications: RwLock<NotificationState>,
    pub tasks: RwLock<TaskState>,
}

impl SessionStores {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            chat: RwLock::new(ChatState::new(config.typing_ttl())),
            notifications: RwLock::new(NotificationState::new(config.recent_notifications_cap)),
            tasks: RwLock::new(TaskState::new()),
        }
    }

    /// Route one classified frame to its reducer. Control events
    /// (connected/subscribed/pong) never reach state.
    pub fn apply(&self, frame: InboundFrame) {
        match frame.event {
            ServerEvent::ChatMessage { message } => self.chat.write().apply_message(message),
            ServerEvent::Reaction {
                message_id,
                action,
                reaction,
            } => self
                .chat
                .write()
                .apply_reaction(&message_id, action, reaction),
            ServerEvent::Typing { user_id, is_typing } => {
                self.chat
                    .write()
                    .apply_typing(&user_id, is_typing, Instant::now())
            }
            ServerEvent::Presence { user_id, is_online } => {
                self.chat.write().apply_presence(&user_id, is_online)
            }
            ServerEvent::PresenceBatch { users } => {
                self.chat.write().apply_presence_batch(&users)
            }
            ServerEvent::TaskProgress { progress } => self.tasks.write().apply_progress(progress),
            ServerEvent::Notification { item } => {
                self.notifications.write().apply_notification(item)
            }
            ServerEvent::UnreadCount { scope, count } => {
                self.notifications.write().apply_unread_count(&scope, count)
            }
            ServerEvent::Connected { .. } | ServerEvent::Subscribed { .. } | ServerEvent::Pong => {}
        }
    }
}
