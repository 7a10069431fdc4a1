use std::sync::{Mutex, PoisonError};

use time::OffsetDateTime;

/// Server-side timestamp source. Every value handed out is strictly greater than
/// the previous one, so insert order within a store is total even when the wall
/// clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_micros: Mutex<i64>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that never hands out a value at or below `micros`, e.g. the newest
    /// timestamp already persisted.
    pub fn starting_after(micros: i64) -> Self {
        Self {
            last_micros: Mutex::new(micros),
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        from_micros(self.now_micros())
    }

    pub fn now_micros(&self) -> i64 {
        let wall = to_micros(OffsetDateTime::now_utc());
        let mut last = self.last_micros.lock().unwrap_or_else(PoisonError::into_inner);
        *last = wall.max(*last + 1);
        *last
    }
}

pub fn to_micros(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000) as i64
}

pub fn from_micros(micros: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(micros as i128 * 1_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
