//! Identify pacing across a pool.
//!
//! A new session may only be claimed once the spacing has passed since the
//! previous shard became ready. Resumes do not claim a session and are not paced.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum gap between one shard becoming ready and the next identify.
pub const IDENTIFY_SPACING: Duration = Duration::from_millis(5000);

#[derive(Debug)]
pub struct StartupPacer {
    spacing: Duration,
    last_ready: Mutex<Option<Instant>>,
}

impl Default for StartupPacer {
    fn default() -> Self {
        Self::new(IDENTIFY_SPACING)
    }
}

impl StartupPacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last_ready: Mutex::new(None),
        }
    }

    /// Record that a shard reached ready at `at`. Never moves backwards.
    pub fn mark_ready(&self, at: Instant) {
        let mut last = self.last_ready.lock();
        if last.map_or(true, |prev| at > prev) {
            *last = Some(at);
        }
    }

    pub fn last_ready(&self) -> Option<Instant> {
        *self.last_ready.lock()
    }

    /// `spacing - (now - last_ready)`, saturating at zero; zero if nothing is ready yet.
    pub fn identify_delay(&self, now: Instant) -> Duration {
        self.last_ready()
            .map_or(Duration::ZERO, |ready| {
                self.spacing.saturating_sub(now.saturating_duration_since(ready))
            })
    }

    /// Instant at which an identify may be sent.
    pub fn identify_deadline(&self, now: Instant) -> Instant {
        now + self.identify_delay(now)
    }
}
