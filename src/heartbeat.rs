//! Liveness bookkeeping for a single link.
//!
//! Each side of a link probes the other every `interval`. Any inbound frame
//! (a pong, a ping, or application data) counts as proof of life. Once the
//! link has been silent for `interval * stale_multiplier` it is stale, which
//! catches half-open connections that never produce a close or error event.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::SessionConfig;

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    stale_after: Duration,
    last_seen: Instant,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, stale_after: Duration) -> Self {
        Self {
            interval,
            stale_after,
            last_seen: Instant::now(),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.heartbeat_interval, config.stale_timeout())
    }

    /// Note that the peer just proved it is alive.
    pub fn record_activity(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Time since the peer was last heard from.
    pub fn silence(&self) -> Duration {
        self.last_seen.elapsed()
    }

    pub fn is_stale(&self) -> bool {
        self.silence() >= self.stale_after
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// A probe ticker whose first tick lands one interval from now.
    pub fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn becomes_stale_after_silence() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(1), Duration::from_secs(3));
        assert!(!monitor.is_stale());
        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert!(!monitor.is_stale());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(monitor.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_the_clock() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(1), Duration::from_secs(3));
        tokio::time::sleep(Duration::from_secs(2)).await;
        monitor.record_activity();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!monitor.is_stale());
        assert_eq!(monitor.silence(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_skips_the_immediate_tick() {
        let monitor = HeartbeatMonitor::from_config(
            &SessionConfig::default().with_heartbeat_interval(Duration::from_secs(2)),
        );
        let start = Instant::now();
        let mut ticker = monitor.ticker();
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(monitor.stale_after(), Duration::from_secs(6));
    }
}
