//! Reconnect state machine
//!
//! Wraps a connection's lifecycle in explicit states with exponential
//! backoff between attempts. Teardown discipline: the `closing` flag is
//! set first, then any pending backoff sleep is woken, and the flag is
//! re-checked at the top of every reconnect decision, so a scheduled
//! reconnect can never fire after teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::RealtimeConfig;

/// Link state machine states.
///
/// `Idle` is terminal: it is entered only when the owning scope is torn
/// down or the credential is revoked, never by the retry loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Before the first attempt, or terminal after teardown
    Idle,
    /// Transport + handshake in progress
    Connecting,
    /// Handshake acknowledged, frames flowing
    Connected,
    /// Transport lost, not yet retried
    Closed,
    /// Waiting out the backoff timer
    Backoff,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Backoff => write!(f, "BACKOFF"),
        }
    }
}

// =============================================================================
// EXPONENTIAL BACKOFF
// =============================================================================

/// Backoff calculator: `delay(n) = min(base * 2^n * (1 + jitter), cap)`
/// with positive-only jitter drawn per attempt. Jittering inside the cap
/// keeps consecutive delays monotone non-decreasing, which neither
/// symmetric jitter nor cap-then-jitter can guarantee.
#[derive(Debug)]
pub struct BackoffCalculator {
    base_ms: u64,
    max_ms: u64,
    jitter_factor: f64,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            jitter_factor: config.jitter_factor,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(12345),
        }
    }

    /// Fast PRNG for jitter (xorshift64)
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    /// Compute the delay for the current attempt and advance the counter.
    /// Jitter is applied before the cap: with jitter_factor < 1 the
    /// jittered value for attempt n never exceeds the raw value for
    /// attempt n+1, and once the cap is reached every delay equals the
    /// cap, so consecutive delays are monotone non-decreasing.
    pub fn next_backoff(&mut self) -> Duration {
        let exp = (self.base_ms as f64) * 2f64.powi(self.attempt.min(31) as i32);
        let jittered = exp * (1.0 + self.next_random() * self.jitter_factor);

        self.attempt = self.attempt.saturating_add(1);

        Duration::from_millis(jittered.min(self.max_ms as f64) as u64)
    }

    /// Reset on a successful Connected transition.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// RECONNECT POLICY
// =============================================================================

/// Shared lifecycle guard for one logical connection's retry loop.
#[derive(Debug)]
pub struct ReconnectPolicy {
    state: RwLock<LinkState>,
    backoff: Mutex<BackoffCalculator>,
    closing: AtomicBool,
    cancel: Notify,
}

impl ReconnectPolicy {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            state: RwLock::new(LinkState::Idle),
            backoff: Mutex::new(BackoffCalculator::new(config)),
            closing: AtomicBool::new(false),
            cancel: Notify::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    pub fn transition(&self, new_state: LinkState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        if old_state != new_state {
            info!(from = %old_state, to = %new_state, "link_transition");
        }
    }

    /// Checked at the start of every reconnect decision and before any
    /// state mutation triggered by a late-arriving callback.
    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Tear down: flag first, then wake any pending backoff sleep. The
    /// ordering guarantees no reconnect fires after this returns.
    pub fn begin_teardown(&self) {
        self.closing.store(true, Ordering::Release);
        self.cancel.notify_waiters();
        debug!("teardown initiated");
    }

    /// Record a successful Connected transition; resets the attempt count.
    pub fn on_connected(&self) {
        self.backoff.lock().reset();
        self.transition(LinkState::Connected);
    }

    /// Record a failed attempt and get the delay before the next one.
    pub fn next_backoff(&self) -> Duration {
        self.backoff.lock().next_backoff()
    }

    pub fn attempt(&self) -> u32 {
        self.backoff.lock().attempt()
    }

    /// Sleep out a backoff delay. Returns false if teardown cancelled the
    /// wait (or had already begun); true means the caller may reconnect.
    pub async fn wait_backoff(&self, delay: Duration) -> bool {
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        // Register interest before checking the flag so a concurrent
        // teardown cannot slip between the check and the sleep.
        cancelled.as_mut().enable();

        if self.is_closing() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_closing(),
            _ = &mut cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> RealtimeConfig {
        RealtimeConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 30_000,
            jitter_factor: 0.25,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_formula() {
        let config = quick_config();
        let mut backoff = BackoffCalculator::new(&config);

        // delay(0) ≈ base: within [base, base * 1.25]
        let d0 = backoff.next_backoff();
        assert!(d0.as_millis() >= 100 && d0.as_millis() <= 125);

        // delay(1) ≈ 2 * base
        let d1 = backoff.next_backoff();
        assert!(d1.as_millis() >= 200 && d1.as_millis() <= 250);

        // delay(2) ≈ 4 * base
        let d2 = backoff.next_backoff();
        assert!(d2.as_millis() >= 400 && d2.as_millis() <= 500);
    }

    #[test]
    fn test_backoff_monotone_until_reset() {
        let config = quick_config();
        let mut backoff = BackoffCalculator::new(&config);

        let mut prev = Duration::ZERO;
        for _ in 0..20 {
            let d = backoff.next_backoff();
            assert!(d >= prev, "backoff must be monotone non-decreasing");
            assert!(d.as_millis() <= 30_000);
            prev = d;
        }

        backoff.reset();
        let after_reset = backoff.next_backoff();
        assert!(after_reset.as_millis() >= 100 && after_reset.as_millis() <= 125);
        assert_eq!(backoff.attempt(), 1);
    }

    #[test]
    fn test_backoff_cap() {
        let config = quick_config();
        let mut backoff = BackoffCalculator::new(&config);
        for _ in 0..40 {
            backoff.next_backoff();
        }
        // Past the cap, jitter no longer moves the delay.
        assert_eq!(backoff.next_backoff().as_millis(), 30_000);
    }

    #[test]
    fn test_backoff_monotone_at_cap() {
        let config = RealtimeConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            jitter_factor: 0.25,
            ..Default::default()
        };
        let mut backoff = BackoffCalculator::new(&config);

        // A low cap makes any fresh per-attempt jitter above it visible.
        let mut prev = Duration::ZERO;
        for _ in 0..10 {
            let d = backoff.next_backoff();
            assert!(
                d >= prev,
                "delay {:?} fell below previous {:?} at the cap",
                d,
                prev
            );
            prev = d;
        }
        assert_eq!(prev.as_millis(), 1_000);
    }

    #[test]
    fn test_transitions() {
        let policy = ReconnectPolicy::new(&quick_config());
        assert_eq!(policy.state(), LinkState::Idle);

        policy.transition(LinkState::Connecting);
        policy.on_connected();
        assert_eq!(policy.state(), LinkState::Connected);
        assert_eq!(policy.attempt(), 0);

        policy.transition(LinkState::Closed);
        let _ = policy.next_backoff();
        assert_eq!(policy.attempt(), 1);

        // Connected resets the attempt counter
        policy.on_connected();
        assert_eq!(policy.attempt(), 0);
    }

    #[tokio::test]
    async fn test_teardown_cancels_pending_backoff() {
        let policy = std::sync::Arc::new(ReconnectPolicy::new(&quick_config()));

        let waiter = {
            let policy = policy.clone();
            tokio::spawn(async move { policy.wait_backoff(Duration::from_secs(60)).await })
        };

        // Give the waiter a chance to park on the timer.
        tokio::time::sleep(Duration::from_millis(20)).await;
        policy.begin_teardown();

        let may_reconnect = waiter.await.unwrap();
        assert!(!may_reconnect, "teardown must cancel the pending backoff");
        assert!(policy.is_closing());
    }

    #[tokio::test]
    async fn test_wait_backoff_refuses_after_teardown() {
        let policy = ReconnectPolicy::new(&quick_config());
        policy.begin_teardown();
        assert!(!policy.wait_backoff(Duration::from_millis(1)).await);
    }
}
