//! Rate limited progress reporting

use std::time::{Duration, Instant};

use crate::utils::human_friendly_bytesize;

/// Per fetch limiter for progress notifications
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_update: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_update: None,
        }
    }

    /// Returns true and records `now` if a notification may be sent
    pub fn should_report(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_update = Some(now);
        true
    }
}

/// Text for a progress message: `"X of Y"`, or `"X"` when the total is unknown
pub fn progress_text(now: u64, total: u64) -> String {
    if total > 0 {
        format!(
            "{} of {}",
            human_friendly_bytesize(now),
            human_friendly_bytesize(total)
        )
    } else {
        human_friendly_bytesize(now)
    }
}
