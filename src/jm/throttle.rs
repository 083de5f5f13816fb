//! Restart throttle: decides whether, and after how long, a crashed job may
//! respawn. The throttle is advisory; the dispatcher enacts the decision.

use std::time::{Duration, Instant};

/// Two crashes closer together than this trigger a cooldown.
pub const RAPID_WINDOW: Duration = Duration::from_secs(5);
/// Minimum delay between a throttled crash and the next respawn attempt.
pub const COOLDOWN: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnDecision {
    /// Crash was outside the rapid window: respawn right away.
    Respawn,
    /// Crash-after-crash within the window: respawn no earlier than this.
    Defer(Instant),
    /// Restarts are disabled for this job.
    GiveUp,
}

#[derive(Debug)]
pub struct RestartThrottle {
    restart: bool,
    last_exit: Option<Instant>,
}

impl RestartThrottle {
    pub fn new(restart: bool) -> Self {
        Self {
            restart,
            last_exit: None,
        }
    }

    pub fn on_exit(&mut self, now: Instant) -> RespawnDecision {
        if !self.restart {
            return RespawnDecision::GiveUp;
        }
        let rapid = matches!(
            self.last_exit,
            Some(prev) if now.duration_since(prev) <= RAPID_WINDOW
        );
        self.last_exit = Some(now);
        if rapid {
            RespawnDecision::Defer(now + COOLDOWN)
        } else {
            RespawnDecision::Respawn
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_restart_never_respawns() {
        let mut t = RestartThrottle::new(false);
        let now = Instant::now();
        assert_eq!(t.on_exit(now), RespawnDecision::GiveUp);
        assert_eq!(t.on_exit(now + RAPID_WINDOW * 2), RespawnDecision::GiveUp);
    }

    #[test]
    fn first_crash_respawns_immediately() {
        let mut t = RestartThrottle::new(true);
        assert_eq!(t.on_exit(Instant::now()), RespawnDecision::Respawn);
    }

    #[test]
    fn rapid_second_crash_defers_by_the_cooldown() {
        let mut t = RestartThrottle::new(true);
        let first = Instant::now();
        assert_eq!(t.on_exit(first), RespawnDecision::Respawn);

        let second = first + Duration::from_secs(2);
        assert_eq!(t.on_exit(second), RespawnDecision::Defer(second + COOLDOWN));
    }

    #[test]
    fn slow_crashes_keep_respawning() {
        let mut t = RestartThrottle::new(true);
        let first = Instant::now();
        assert_eq!(t.on_exit(first), RespawnDecision::Respawn);

        let second = first + RAPID_WINDOW + Duration::from_millis(1);
        assert_eq!(t.on_exit(second), RespawnDecision::Respawn);
    }

    #[test]
    fn deferred_crash_still_updates_the_window() {
        let mut t = RestartThrottle::new(true);
        let first = Instant::now();
        t.on_exit(first);
        let second = first + Duration::from_secs(1);
        assert!(matches!(t.on_exit(second), RespawnDecision::Defer(_)));

        // A third crash shortly after the second is measured against the
        // second exit, not the first.
        let third = second + Duration::from_secs(1);
        assert_eq!(t.on_exit(third), RespawnDecision::Defer(third + COOLDOWN));
    }
}
