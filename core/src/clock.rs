//! Wall clock: the only place the engine reads the current time.
//!
//! RULE: Rules never call this. They see time only through the
//! resolved TimeWindow, which keeps evaluation deterministic.

use chrono::{DateTime, SubsecRound, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    /// Current instant, truncated to whole seconds (run ids have
    /// second resolution, so finer precision would only leak into
    /// window bounds).
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(0)
    }
}

/// A fixed clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    instant: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self { instant: Mutex::new(instant.trunc_subsecs(0)) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.instant.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.instant.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
