//! Timing and retry configuration shared by transports and the host orchestrator.

use std::time::Duration;

const DEFAULT_HOST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_GUEST_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(8);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_STALE_MULTIPLIER: u32 = 3;
const DEFAULT_BROADCAST_DEBOUNCE: Duration = Duration::from_millis(50);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a session on either side of the connection.
///
/// All fields have defaults; use the `with_*` methods to tune them.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tabsync::SessionConfig;
///
/// let config = SessionConfig::default()
///     .with_heartbeat_interval(Duration::from_secs(2))
///     .with_max_attempts(5);
/// assert_eq!(config.stale_timeout(), Duration::from_secs(6));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bound on a single host registration attempt.
    pub host_timeout: Duration,
    /// Bound on a single guest join attempt.
    ///
    /// Guests need longer than hosts to finish NAT or relay negotiation, so
    /// this defaults to twice the host timeout. The builders keep it above
    /// `host_timeout`; assigning the field directly bypasses that.
    pub guest_timeout: Duration,
    /// Number of setup attempts before giving up. Values below 1 are clamped to 1.
    pub max_attempts: u32,
    /// Delay before the second attempt. Doubles on every further attempt.
    pub backoff_base: Duration,
    /// Upper bound on the delay between attempts.
    pub backoff_max: Duration,
    /// How often each side sends a liveness probe.
    pub heartbeat_interval: Duration,
    /// Silence longer than `heartbeat_interval * stale_multiplier` marks a link stale.
    /// Values below 2 are clamped to 2.
    pub stale_multiplier: u32,
    /// Quiet period the host waits before broadcasting a snapshot.
    pub broadcast_debounce: Duration,
    /// How long `destroy()` waits for links to close gracefully before aborting them.
    pub shutdown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_timeout: DEFAULT_HOST_TIMEOUT,
            guest_timeout: DEFAULT_GUEST_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_multiplier: DEFAULT_STALE_MULTIPLIER,
            broadcast_debounce: DEFAULT_BROADCAST_DEBOUNCE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Set the per-attempt host registration timeout.
    ///
    /// If the guest timeout no longer exceeds it, the guest timeout is raised
    /// to twice this value.
    #[must_use]
    pub fn with_host_timeout(mut self, timeout: Duration) -> Self {
        self.host_timeout = timeout;
        self.keep_guest_above_host()
    }

    /// Set the per-attempt guest join timeout.
    ///
    /// A value not above the host timeout is raised to twice the host timeout.
    #[must_use]
    pub fn with_guest_timeout(mut self, timeout: Duration) -> Self {
        self.guest_timeout = timeout;
        self.keep_guest_above_host()
    }

    /// Set the number of setup attempts. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the exponential backoff base delay and cap.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }

    /// Set the heartbeat probe interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the stale multiplier. Values below 2 are clamped to 2.
    #[must_use]
    pub fn with_stale_multiplier(mut self, multiplier: u32) -> Self {
        self.stale_multiplier = multiplier.max(2);
        self
    }

    /// Set the host's broadcast debounce window.
    #[must_use]
    pub fn with_broadcast_debounce(mut self, window: Duration) -> Self {
        self.broadcast_debounce = window;
        self
    }

    /// Set the graceful shutdown timeout. A zero timeout aborts link tasks immediately.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn keep_guest_above_host(mut self) -> Self {
        if self.guest_timeout <= self.host_timeout {
            self.guest_timeout = self
                .host_timeout
                .saturating_mul(2)
                .max(self.host_timeout.saturating_add(Duration::from_millis(1)));
        }
        self
    }

    /// Silence after which a link is declared stale.
    pub fn stale_timeout(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.stale_multiplier.max(2))
    }

    /// Delay to wait after the given failed attempt (1-based) before the next one.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_give_guests_more_time_than_hosts() {
        let config = SessionConfig::default();
        assert!(config.guest_timeout > config.host_timeout);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.broadcast_debounce, Duration::from_millis(50));
        assert_eq!(config.stale_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = SessionConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn builder_clamps_degenerate_values() {
        let config = SessionConfig::default()
            .with_max_attempts(0)
            .with_stale_multiplier(1);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.stale_multiplier, 2);
    }

    #[test]
    fn guest_timeout_stays_above_host_timeout() {
        let config = SessionConfig::default().with_guest_timeout(Duration::from_secs(4));
        assert_eq!(config.guest_timeout, Duration::from_secs(20));

        let config = SessionConfig::default().with_host_timeout(Duration::from_secs(30));
        assert_eq!(config.guest_timeout, Duration::from_secs(60));

        let config = SessionConfig::default()
            .with_host_timeout(Duration::from_secs(2))
            .with_guest_timeout(Duration::from_secs(5));
        assert_eq!(config.host_timeout, Duration::from_secs(2));
        assert_eq!(config.guest_timeout, Duration::from_secs(5));

        let config = SessionConfig::default().with_host_timeout(Duration::ZERO);
        assert_eq!(config.guest_timeout, Duration::from_secs(20));
        let config = config.with_guest_timeout(Duration::ZERO);
        assert!(config.guest_timeout > config.host_timeout);
    }
}
