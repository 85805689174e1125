//! Local placeholders for pending server timestamps.
//!
//! Until the backend assigns the real time, a field written with
//! `server_timestamp()` holds a map of the form
//! `{__type__: "server_timestamp", __local_write_time__: <ts>, __previous_value__: <v>}`.

use std::collections::BTreeMap;

use crate::firestore::model::Timestamp;
use crate::firestore::value::{FirestoreValue, ValueKind};

const SERVER_TIMESTAMP_SENTINEL: &str = "server_timestamp";
const TYPE_KEY: &str = "__type__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";

/// Builds the placeholder for a server timestamp written at `local_write_time`.
///
/// When the previous value is itself a placeholder its own previous value is
/// kept instead, so placeholders never nest.
pub fn server_timestamp(
    local_write_time: Timestamp,
    previous_value: Option<&FirestoreValue>,
) -> FirestoreValue {
    let mut fields = BTreeMap::new();
    fields.insert(
        TYPE_KEY.to_string(),
        FirestoreValue::from_string(SERVER_TIMESTAMP_SENTINEL),
    );
    fields.insert(
        LOCAL_WRITE_TIME_KEY.to_string(),
        FirestoreValue::from_timestamp(local_write_time),
    );

    let previous = match previous_value {
        Some(previous) if is_server_timestamp(previous) => get_previous_value(previous),
        Some(previous) => Some(previous.clone()),
        None => None,
    };
    if let Some(previous) = previous {
        fields.insert(PREVIOUS_VALUE_KEY.to_string(), previous);
    }

    FirestoreValue::from_map(fields)
}

pub fn is_server_timestamp(value: &FirestoreValue) -> bool {
    match value.kind() {
        ValueKind::Map(map) => matches!(
            map.get(TYPE_KEY).map(FirestoreValue::kind),
            Some(ValueKind::String(kind)) if kind == SERVER_TIMESTAMP_SENTINEL
        ),
        _ => false,
    }
}

/// Returns the value the field held before the pending write, if any.
pub fn get_previous_value(value: &FirestoreValue) -> Option<FirestoreValue> {
    let previous = value.as_map()?.get(PREVIOUS_VALUE_KEY)?;
    if is_server_timestamp(previous) {
        return get_previous_value(previous);
    }
    Some(previous.clone())
}

pub fn get_local_write_time(value: &FirestoreValue) -> Option<Timestamp> {
    match value.as_map()?.get(LOCAL_WRITE_TIME_KEY)?.kind() {
        ValueKind::Timestamp(timestamp) => Some(*timestamp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_placeholders() {
        let placeholder = server_timestamp(Timestamp::new(10, 0), None);
        assert!(is_server_timestamp(&placeholder));
        assert_eq!(get_local_write_time(&placeholder), Some(Timestamp::new(10, 0)));
        assert!(get_previous_value(&placeholder).is_none());
        assert!(!is_server_timestamp(&FirestoreValue::from_string(
            SERVER_TIMESTAMP_SENTINEL
        )));
    }

    #[test]
    fn unwraps_nested_previous_value() {
        let first = server_timestamp(
            Timestamp::new(1, 0),
            Some(&FirestoreValue::from_integer(7)),
        );
        let second = server_timestamp(Timestamp::new(2, 0), Some(&first));
        assert_eq!(
            get_previous_value(&second),
            Some(FirestoreValue::from_integer(7))
        );
        assert_eq!(get_local_write_time(&second), Some(Timestamp::new(2, 0)));
    }
}
