//! Realtime client configuration
//!
//! Backoff, heartbeat and timeout tuning for the broker link, plus the
//! knobs the reducers and history loader need. Defaults are safe for
//! production; every value can be overridden from the environment.

use std::time::Duration;

/// Tunables for one realtime session
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    // Backoff parameters
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Positive-only jitter fraction applied on top of the capped delay.
    /// Kept below 1.0 so consecutive delays stay monotone.
    pub jitter_factor: f64,

    // Connection timeouts
    pub connect_timeout_ms: u64,

    // Heartbeat parameters
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,

    // Inbound frame queue (bounded, single consumer)
    pub inbound_channel_capacity: usize,

    // Reducer behavior
    pub typing_ttl_ms: u64,
    pub recent_notifications_cap: usize,

    // History loader
    pub history_page_size: usize,
    pub history_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            // Backoff: 500ms base, 2x per attempt, 30s cap, +25% jitter
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_factor: 0.25,

            connect_timeout_ms: 10_000,

            // Heartbeat in both directions every 25s, pong due within 10s
            ping_interval_ms: 25_000,
            pong_timeout_ms: 10_000,

            inbound_channel_capacity: 256,

            // Typing indicators expire if no refresh arrives
            typing_ttl_ms: 8_000,
            recent_notifications_cap: 10,

            history_page_size: 30,
            history_timeout_ms: 10_000,
        }
    }
}

impl RealtimeConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("CLASSLINE_BACKOFF_BASE_MS") {
            config.backoff_base_ms = v.parse().unwrap_or(config.backoff_base_ms);
        }
        if let Ok(v) = std::env::var("CLASSLINE_BACKOFF_MAX_MS") {
            config.backoff_max_ms = v.parse().unwrap_or(config.backoff_max_ms);
        }
        if let Ok(v) = std::env::var("CLASSLINE_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = v.parse().unwrap_or(config.connect_timeout_ms);
        }
        if let Ok(v) = std::env::var("CLASSLINE_PING_INTERVAL_MS") {
            config.ping_interval_ms = v.parse().unwrap_or(config.ping_interval_ms);
        }
        if let Ok(v) = std::env::var("CLASSLINE_PONG_TIMEOUT_MS") {
            config.pong_timeout_ms = v.parse().unwrap_or(config.pong_timeout_ms);
        }
        if let Ok(v) = std::env::var("CLASSLINE_TYPING_TTL_MS") {
            config.typing_ttl_ms = v.parse().unwrap_or(config.typing_ttl_ms);
        }
        if let Ok(v) = std::env::var("CLASSLINE_HISTORY_PAGE_SIZE") {
            config.history_page_size = v.parse().unwrap_or(config.history_page_size);
        }

        config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }
}
