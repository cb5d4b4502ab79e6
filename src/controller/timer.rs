use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub const TICK: Duration = Duration::from_secs(1);

/// Start of a connected call. Elapsed time is always recomputed from the start
/// instead of counted in ticks, so a late tick never drifts the duration.
#[derive(Debug, Clone, Copy)]
pub struct CallClock {
    started: Instant,
    started_at: DateTime<Utc>,
}

impl CallClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_secs(&self) -> u64 {
        whole_seconds_between(self.started, Instant::now())
    }
}

/// `floor((now - start) / 1s)`, zero when `now` is before `start`.
pub fn whole_seconds_between(start: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(start).as_secs()
}
