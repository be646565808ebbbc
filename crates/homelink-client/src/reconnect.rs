//! Reconnect manager: decides *when* the orchestrator should attempt to
//! open a new transport.

use rand::Rng;
use std::time::Duration;

use homelink_core::config::ReconnectPolicy;

/// Tracks backoff state across repeated disconnects for a single session.
pub struct ReconnectManager {
    policy: ReconnectPolicy,
    attempt: u32,
    permanent: bool,
}

impl ReconnectManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            permanent: false,
        }
    }

    /// Called when the session reaches `Command`. Resets backoff.
    pub fn on_connected(&mut self) {
        self.attempt = 0;
    }

    /// Called on a caller-initiated disconnect. `permanent` suppresses
    /// further scheduling until `reactivate()`.
    pub fn on_disconnect(&mut self, permanent: bool) {
        self.permanent = permanent;
    }

    /// Called by `connect()` to clear a previous permanent disconnect.
    pub fn reactivate(&mut self) {
        self.permanent = false;
        self.attempt = 0;
    }

    /// Whether a reconnect attempt should be scheduled at all.
    pub fn should_reconnect(&self) -> bool {
        self.policy.auto_reconnect && !self.permanent
    }

    /// The delay before the next attempt, including jitter, and advances the
    /// attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.policy.delay_for_attempt(self.attempt);
        self.attempt += 1;
        let jitter_max = base.as_secs_f64() * self.policy.jitter_fraction;
        let jitter = if jitter_max > 0.0 {
            rand::rng().random_range(0.0..jitter_max)
        } else {
            0.0
        };
        Duration::from_secs_f64(base.as_secs_f64() + jitter)
    }
}
