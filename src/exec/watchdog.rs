//! Silence watchdog for polled agent output.
//!
//! Tracks the time since the last byte arrived. Once the quiet period
//! elapses while the process is still alive, [`SilenceWatchdog::check`]
//! reports the silence exactly once; the episode ends when new bytes arrive.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// Per-capture silence tracker.
#[derive(Debug)]
pub struct SilenceWatchdog {
    quiet_period: Duration,
    last_activity: Instant,
    advised: bool,
}

impl SilenceWatchdog {
    /// Start tracking from now.
    #[must_use]
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            last_activity: Instant::now(),
            advised: false,
        }
    }

    /// Record that `bytes` new bytes arrived.
    pub fn observe(&mut self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.last_activity = Instant::now();
        if self.advised {
            debug!("agent output resumed after stall advisory");
            self.advised = false;
        }
    }

    /// Return the idle time if an advisory is due for the current episode.
    pub fn check(&mut self, process_alive: bool) -> Option<Duration> {
        self.check_at(Instant::now(), process_alive)
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&mut self, now: Instant, process_alive: bool) -> Option<Duration> {
        if !process_alive || self.advised || self.quiet_period.is_zero() {
            return None;
        }
        let idle = now.saturating_duration_since(self.last_activity);
        if idle < self.quiet_period {
            return None;
        }
        self.advised = true;
        info!(idle_secs = idle.as_secs(), "agent output stalled");
        Some(idle)
    }

    /// Whether an advisory has fired for the current silence episode.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.advised
    }
}
