//! Live session wiring
//!
//! One `LiveSession` per logical concern (chat, notifications, task
//! progress): it owns the connection's retry loop, the per-connection
//! subscription registry, the retained interest list, and the reducible
//! state stores. Several sessions run fully concurrently; ordering is
//! guaranteed only per topic within one connection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::connection::Connection;
use crate::error::RealtimeError;
use crate::history::HistoryLoader;
use crate::protocol::{ClientFrame, InboundFrame, ServerEvent, Topic};
use crate::session::{LinkState, ReconnectPolicy};
use crate::state::SessionStores;
use crate::subscriptions::SubscriptionRegistry;

/// One logical realtime session: connection + registry + reduced state.
///
/// Created on first subscriber interest, torn down on the last consumer's
/// departure or credential loss. Holding it in an `Arc` is the session
/// scope; nothing here is process-global.
pub struct LiveSession {
    config: RealtimeConfig,
    endpoint: String,
    credential: String,
    identity_hint: Option<String>,

    policy: Arc<ReconnectPolicy>,
    stores: Arc<SessionStores>,

    /// Topics the session's consumers currently declare interest in.
    /// Survives reconnects; the registry below does not.
    interest: Mutex<HashSet<Topic>>,
    /// Registry for the current connection only; None while disconnected.
    registry: Mutex<Option<SubscriptionRegistry>>,
    /// Outbound sender for the current connection; None while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,

    running: AtomicBool,
}

impl LiveSession {
    pub fn new(
        config: RealtimeConfig,
        endpoint: impl Into<String>,
        credential: impl Into<String>,
        identity_hint: Option<String>,
        interest: Vec<Topic>,
    ) -> Arc<Self> {
        let policy = Arc::new(ReconnectPolicy::new(&config));
        let stores = Arc::new(SessionStores::new(&config));

        Arc::new(Self {
            config,
            endpoint: endpoint.into(),
            credential: credential.into(),
            identity_hint,
            policy,
            stores,
            interest: Mutex::new(interest.into_iter().collect()),
            registry: Mutex::new(None),
            outbound: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn stores(&self) -> &Arc<SessionStores> {
        &self.stores
    }

    pub fn state(&self) -> LinkState {
        self.policy.state()
    }

    pub fn is_connected(&self) -> bool {
        self.policy.state() == LinkState::Connected
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.policy.attempt()
    }

    /// Spawn the session's retry loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<(), RealtimeError>> {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.run().await })
    }

    /// The reconnect loop: Connecting -> Connected -> Closed -> Backoff ->
    /// Connecting, until teardown (-> Idle, terminal) or a fatal handshake
    /// rejection (surfaced, never auto-retried).
    pub async fn run(&self) -> Result<(), RealtimeError> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!(endpoint = %self.endpoint, "session already running; one live connection per scope");
            return Ok(());
        }

        let result = self.run_inner().await;
        self.policy.transition(LinkState::Idle);
        self.running.store(false, Ordering::Release);
        result
    }

    async fn run_inner(&self) -> Result<(), RealtimeError> {
        loop {
            if self.policy.is_closing() {
                return Ok(());
            }

            self.policy.transition(LinkState::Connecting);
            let connection = match Connection::connect(
                &self.config,
                &self.endpoint,
                &self.credential,
                self.identity_hint.as_deref(),
            )
            .await
            {
                Ok(connection) => connection,
                Err(e @ RealtimeError::Handshake(_)) => {
                    error!(error = %e, "handshake rejected; not retrying");
                    return Err(e);
                }
                Err(e) => {
                    // Silent up to the backoff cap: log-only, no surfacing.
                    debug!(error = %e, "connect attempt failed");
                    if !self.backoff().await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, mut in_rx) =
                mpsc::channel::<InboundFrame>(self.config.inbound_channel_capacity);

            // Fresh registry per connection; resubscribe from the retained
            // interest list, never from dead handles.
            {
                let mut registry = SubscriptionRegistry::new(out_tx.clone());
                let interest: Vec<Topic> = self.interest.lock().iter().cloned().collect();
                for topic in interest {
                    registry.subscribe(topic);
                }
                *self.registry.lock() = Some(registry);
                *self.outbound.lock() = Some(out_tx);
            }
            self.policy.on_connected();

            // The reducer is the connection's single consumer; it stops
            // when the connection drops its inbound sender.
            let stores = Arc::clone(&self.stores);
            let policy = Arc::clone(&self.policy);
            let reducer = tokio::spawn(async move {
                while let Some(frame) = in_rx.recv().await {
                    // No state mutation from late frames after teardown.
                    if policy.is_closing() {
                        break;
                    }
                    if let ServerEvent::Subscribed { topic } = &frame.event {
                        debug!(topic = %topic, "subscription acknowledged");
                        continue;
                    }
                    stores.apply(frame);
                }
            });

            let reason = connection.run(out_rx, in_tx).await;
            let _ = reducer.await;

            // Reset per-connection state before any retry decision.
            {
                if let Some(registry) = self.registry.lock().as_mut() {
                    registry.clear();
                }
                *self.registry.lock() = None;
                *self.outbound.lock() = None;
            }
            self.policy.transition(LinkState::Closed);

            if self.policy.is_closing() {
                return Ok(());
            }

            info!(reason = %reason, "connection closed, scheduling reconnect");
            if !self.backoff().await {
                return Ok(());
            }
        }
    }

    async fn backoff(&self) -> bool {
        self.policy.transition(LinkState::Backoff);
        let delay = self.policy.next_backoff();
        debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.policy.attempt(),
            "backing off"
        );
        self.policy.wait_backoff(delay).await
    }

    /// Tear the session down. Synchronously cancels any pending backoff
    /// timer and deactivates the transport; the closing flag guarantees no
    /// reconnect fires afterwards.
    pub fn teardown(&self) {
        self.policy.begin_teardown();
        // Dropping registry and sender closes the connection's outbound
        // channel, which ends its frame loop with a local close.
        *self.registry.lock() = None;
        *self.outbound.lock() = None;
    }

    // -------------------------------------------------------------------------
    // Subscription interest
    // -------------------------------------------------------------------------

    /// Declare interest in a topic. Subscribes immediately when connected;
    /// either way the topic is re-subscribed after every reconnect.
    pub fn subscribe(&self, topic: Topic) {
        self.interest.lock().insert(topic.clone());
        if let Some(registry) = self.registry.lock().as_mut() {
            registry.subscribe(topic);
        }
    }

    /// Withdraw interest. No-op if the topic was never subscribed.
    pub fn unsubscribe(&self, topic: &Topic) {
        self.interest.lock().remove(topic);
        if let Some(registry) = self.registry.lock().as_mut() {
            registry.unsubscribe(topic);
        }
    }

    /// Start following one background task's progress stream.
    pub fn track_task(&self, task_id: &str) {
        self.subscribe(Topic::TaskProgress {
            task_id: task_id.to_string(),
        });
    }

    /// Stop following a task; its retained progress value is dropped.
    pub fn untrack_task(&self, task_id: &str) {
        self.unsubscribe(&Topic::TaskProgress {
            task_id: task_id.to_string(),
        });
        self.stores.tasks.write().forget(task_id);
    }

    // -------------------------------------------------------------------------
    // Outbound actions
    // -------------------------------------------------------------------------

    fn send_frame(&self, frame: ClientFrame, action: &'static str) -> Result<(), RealtimeError> {
        if self.policy.state() != LinkState::Connected {
            return Err(RealtimeError::SendWithoutConnection { action });
        }
        let guard = self.outbound.lock();
        match guard.as_ref() {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            // Connection died under us; same user-visible failure.
            _ => Err(RealtimeError::SendWithoutConnection { action }),
        }
    }

    /// Send a chat message. Returns the client ref usable for server-side
    /// dedup; fails loudly when disconnected, never queues.
    pub fn send_message(
        &self,
        topic: &Topic,
        content: impl Into<String>,
        reply_to: Option<String>,
    ) -> Result<String, RealtimeError> {
        let client_ref = Uuid::new_v4().to_string();
        self.send_frame(
            ClientFrame::SendMessage {
                topic: topic.to_string(),
                content: content.into(),
                reply_to,
                client_ref: client_ref.clone(),
            },
            "send_message",
        )?;
        Ok(client_ref)
    }

    pub fn react(
        &self,
        topic: &Topic,
        message_id: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Result<(), RealtimeError> {
        self.send_frame(
            ClientFrame::React {
                topic: topic.to_string(),
                message_id: message_id.into(),
                emoji: emoji.into(),
            },
            "react",
        )
    }

    pub fn set_typing(&self, topic: &Topic, is_typing: bool) -> Result<(), RealtimeError> {
        self.send_frame(
            ClientFrame::SetTyping {
                topic: topic.to_string(),
                is_typing,
            },
            "set_typing",
        )
    }

    // -------------------------------------------------------------------------
    // History
    // -------------------------------------------------------------------------

    /// Fetch one history page and merge it into the message list: page 0
    /// replaces, higher pages prepend. Returns whether older pages remain.
    /// On error the list is left exactly as it was.
    pub async fn load_history(
        &self,
        loader: &HistoryLoader,
        page: usize,
    ) -> Result<bool, RealtimeError> {
        let fetched = loader.load_page(page).await?;
        if self.policy.is_closing() {
            return Ok(false);
        }

        let mut chat = self.stores.chat.write();
        if fetched.page == 0 {
            chat.replace_history(fetched.messages);
        } else {
            chat.prepend_history(fetched.messages);
        }
        Ok(fetched.has_more)
    }
}
