// Heartbeat / staleness tracking for one stream session.
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub ping_interval_ms: u64,
    pub stale_after_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 30_000,
            stale_after_ms: 60_000,
            tick_interval_ms: 5_000,
        }
    }
}

impl HealthConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Idle,
    SendPing,
    /// No inbound traffic (pongs included) within `stale_after`.
    Stale,
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    ping_interval: Duration,
    stale_after: Duration,
    last_message: Instant,
    last_ping: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig, now: Instant) -> Self {
        Self {
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            stale_after: Duration::from_millis(config.stale_after_ms),
            last_message: now,
            last_ping: None,
        }
    }

    pub fn on_message(&mut self, now: Instant) {
        if now > self.last_message {
            self.last_message = now;
        }
        self.last_ping = None;
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_message) >= self.stale_after
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_message)
    }

    pub fn tick(&mut self, now: Instant) -> HealthAction {
        if self.is_stale(now) {
            return HealthAction::Stale;
        }
        if self.silence(now) < self.ping_interval {
            return HealthAction::Idle;
        }
        // one ping per quiet interval
        let due = match self.last_ping {
            None => true,
            Some(sent) => now.saturating_duration_since(sent) >= self.ping_interval,
        };
        if due {
            self.last_ping = Some(now);
            HealthAction::SendPing
        } else {
            HealthAction::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_quiet_connection_gets_one_ping() {
        let t0 = Instant::now();
        let mut hm = HealthMonitor::new(&HealthConfig::default(), t0);
        assert_eq!(hm.tick(t0 + secs(10)), HealthAction::Idle);
        assert_eq!(hm.tick(t0 + secs(30)), HealthAction::SendPing);
        assert_eq!(hm.tick(t0 + secs(35)), HealthAction::Idle);
        assert!(!hm.is_stale(t0 + secs(59)));
    }

    #[test]
    fn test_stale_after_sixty_seconds() {
        let t0 = Instant::now();
        let mut hm = HealthMonitor::new(&HealthConfig::default(), t0);
        assert_eq!(hm.tick(t0 + secs(60)), HealthAction::Stale);
        assert!(hm.is_stale(t0 + secs(61)));
    }

    #[test]
    fn test_pong_keeps_connection_alive() {
        let t0 = Instant::now();
        let mut hm = HealthMonitor::new(&HealthConfig::default(), t0);
        assert_eq!(hm.tick(t0 + secs(30)), HealthAction::SendPing);
        hm.on_message(t0 + secs(31));
        assert_eq!(hm.tick(t0 + secs(61)), HealthAction::SendPing);
        assert!(!hm.is_stale(t0 + secs(90)));
        assert!(hm.is_stale(t0 + secs(91)));
    }
}
