use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Seconds of 0001-01-01T00:00:00Z.
const MIN_SECONDS: i64 = -62_135_596_800;
/// Seconds of 10000-01-01T00:00:00Z (exclusive).
const MAX_SECONDS: i64 = 253_402_300_800;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    /// Builds a timestamp from already normalized parts, rejecting values
    /// outside the supported range.
    pub fn try_new(seconds: i64, nanos: i32) -> FirestoreResult<Self> {
        if !(0..1_000_000_000).contains(&nanos) {
            return Err(invalid_argument(format!(
                "Timestamp nanoseconds out of range: {nanos}"
            )));
        }
        if seconds < MIN_SECONDS {
            return Err(invalid_argument(format!(
                "Timestamp seconds out of range: {seconds}"
            )));
        }
        if seconds >= MAX_SECONDS {
            return Err(invalid_argument(format!(
                "Timestamp seconds out of range: {seconds}"
            )));
        }
        Ok(Self { seconds, nanos })
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(
            millis.div_euclid(1_000),
            (millis.rem_euclid(1_000) * 1_000_000) as i32,
        )
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1_000 + i64::from(self.nanos / 1_000_000)
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(duration) => Self {
                seconds: duration.as_secs() as i64,
                nanos: duration.subsec_nanos() as i32,
            },
            Err(err) => {
                let duration = err.duration();
                Self::new(
                    -(duration.as_secs() as i64),
                    -(duration.subsec_nanos() as i32),
                )
            }
        }
    }

    pub fn to_system_time(&self) -> SystemTime {
        if self.seconds >= 0 {
            UNIX_EPOCH
                + Duration::from_secs(self.seconds as u64)
                + Duration::from_nanos(self.nanos as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.seconds.unsigned_abs())
                + Duration::from_nanos(self.nanos as u64)
        }
    }

    /// Drops sub-microsecond precision, which the backend does not store for
    /// user-supplied timestamps.
    pub fn truncate_to_micros(&self) -> Self {
        Self {
            seconds: self.seconds,
            nanos: (self.nanos / 1_000) * 1_000,
        }
    }

    fn normalize(&mut self) {
        let extra_seconds = self.nanos.div_euclid(1_000_000_000);
        self.seconds += extra_seconds as i64;
        self.nanos = self.nanos.rem_euclid(1_000_000_000);
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.seconds.cmp(&other.seconds) {
            Ordering::Equal => self.nanos.cmp(&other.nanos),
            ordering => ordering,
        }
    }
}
