//! Write-time sentinels accepted inside user data.
//!
//! Each function returns a [`FirestoreValue`] marker that the user data
//! parser turns into a field deletion or a field transform. Markers are never
//! stored in documents.

use crate::firestore::value::{FirestoreValue, SentinelValue};

/// Marks a field for deletion in `update_doc` or a merging `set_doc`.
pub fn delete_field() -> FirestoreValue {
    FirestoreValue::from_sentinel(SentinelValue::Delete)
}

/// Replaced by the commit time of the write on the backend.
pub fn server_timestamp() -> FirestoreValue {
    FirestoreValue::from_sentinel(SentinelValue::ServerTimestamp)
}

/// Adds each element not already present to the array stored in the field.
/// A field that does not hold an array is overwritten.
pub fn array_union(elements: Vec<FirestoreValue>) -> FirestoreValue {
    FirestoreValue::from_sentinel(SentinelValue::ArrayUnion(elements))
}

/// Removes every instance of each element from the array stored in the field.
pub fn array_remove(elements: Vec<FirestoreValue>) -> FirestoreValue {
    FirestoreValue::from_sentinel(SentinelValue::ArrayRemove(elements))
}

/// Adds `operand` to the field's numeric value, starting from 0 when the
/// field is missing or not a number.
pub fn increment(operand: i64) -> FirestoreValue {
    FirestoreValue::from_sentinel(SentinelValue::NumericIncrement(Box::new(
        FirestoreValue::from_integer(operand),
    )))
}

pub fn increment_double(operand: f64) -> FirestoreValue {
    FirestoreValue::from_sentinel(SentinelValue::NumericIncrement(Box::new(
        FirestoreValue::from_double(operand),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_carry_their_payload() {
        assert_eq!(delete_field().as_sentinel(), Some(&SentinelValue::Delete));
        assert_eq!(
            increment(5).as_sentinel().map(SentinelValue::method_name),
            Some("increment")
        );
        match array_union(vec![FirestoreValue::from_integer(1)]).as_sentinel() {
            Some(SentinelValue::ArrayUnion(elements)) => assert_eq!(elements.len(), 1),
            other => panic!("unexpected sentinel {other:?}"),
        }
        assert_ne!(server_timestamp(), delete_field());
    }
}
