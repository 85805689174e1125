use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// A version of a document, as reported by the backend.
///
/// [`SnapshotVersion::min`] is the sentinel for "known absent as of an
/// unknown time" and sorts before every real version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn from_timestamp(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn to_timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.seconds * 1_000_000 + i64::from(self.timestamp.nanos / 1_000)
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SnapshotVersion(seconds={}, nanos={})",
            self.timestamp.seconds, self.timestamp.nanos
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_sorts_first() {
        let version = SnapshotVersion::from_timestamp(Timestamp::new(1, 0));
        assert!(SnapshotVersion::min() < version);
        assert!(SnapshotVersion::min().is_min());
        assert!(!version.is_min());
    }

    #[test]
    fn converts_to_micros() {
        let version = SnapshotVersion::from_timestamp(Timestamp::new(2, 5_000));
        assert_eq!(version.to_micros(), 2_000_005);
    }
}
