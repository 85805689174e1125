use crate::firestore::model::{FieldPath, Timestamp};
use crate::firestore::value::server_timestamp::server_timestamp;
use crate::firestore::value::{FirestoreValue, ValueKind};
use crate::util::assert::{fail, hard_assert};

/// A write computed from the field's previous value rather than supplied
/// literally.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// The value the field takes in the local view before the backend
    /// acknowledges the write.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => server_timestamp(local_write_time, previous),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
        }
    }

    /// The value the field takes once the backend returned `transform_result`.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: Option<FirestoreValue>,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                match transform_result {
                    Some(result) => result,
                    None => fail(
                        "Didn't receive transformResult for a server-computed transform",
                    ),
                }
            }
        }
    }

    /// The base value an increment applies to, so that re-applying the
    /// transform after a remote change stays idempotent. `None` for the other
    /// operations.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(numeric_base(previous)),
            _ => None,
        }
    }
}

/// A transform applied to one field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

fn coerced_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn array_union(previous: Option<&FirestoreValue>, elements: &[FirestoreValue]) -> FirestoreValue {
    let mut values = coerced_array(previous);
    for element in elements {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, elements: &[FirestoreValue]) -> FirestoreValue {
    let values = coerced_array(previous)
        .into_iter()
        .filter(|candidate| !elements.iter().any(|needle| needle == candidate))
        .collect();
    FirestoreValue::from_array(values)
}

fn numeric_base(previous: Option<&FirestoreValue>) -> FirestoreValue {
    match previous {
        Some(value) if value.is_number() => value.clone(),
        _ => FirestoreValue::from_integer(0),
    }
}

/// Integer plus integer saturates at the `i64` bounds; any double operand
/// produces a double.
fn numeric_increment(previous: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    hard_assert(operand.is_number(), "increment() operand must be a number");
    let base = numeric_base(previous);
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(base), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(base.saturating_add(*delta))
        }
        _ => FirestoreValue::from_double(as_f64(&base) + as_f64(operand)),
    }
}

fn as_f64(value: &FirestoreValue) -> f64 {
    match value.kind() {
        ValueKind::Integer(v) => *v as f64,
        ValueKind::Double(v) => *v,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::server_timestamp::{get_local_write_time, get_previous_value};

    fn int(v: i64) -> FirestoreValue {
        FirestoreValue::from_integer(v)
    }

    fn array(values: Vec<FirestoreValue>) -> FirestoreValue {
        FirestoreValue::from_array(values)
    }

    #[test]
    fn server_timestamp_keeps_previous_value() {
        let op = TransformOperation::ServerTimestamp;
        let placeholder = op.apply_to_local_view(Some(&int(3)), Timestamp::new(9, 0));
        assert_eq!(get_local_write_time(&placeholder), Some(Timestamp::new(9, 0)));
        assert_eq!(get_previous_value(&placeholder), Some(int(3)));

        let committed = op.apply_to_remote_document(
            Some(&int(3)),
            Some(FirestoreValue::from_timestamp(Timestamp::new(10, 0))),
        );
        assert_eq!(committed, FirestoreValue::from_timestamp(Timestamp::new(10, 0)));
    }

    #[test]
    fn array_union_appends_missing_elements() {
        let op = TransformOperation::ArrayUnion(vec![int(1), int(3), int(3)]);
        let result = op.apply_to_local_view(Some(&array(vec![int(1), int(2)])), Timestamp::now());
        assert_eq!(result, array(vec![int(1), int(2), int(3)]));

        let from_scalar = op.apply_to_local_view(Some(&int(5)), Timestamp::now());
        assert_eq!(from_scalar, array(vec![int(1), int(3)]));
    }

    #[test]
    fn array_remove_drops_every_equal_element() {
        let op = TransformOperation::ArrayRemove(vec![int(1)]);
        let result =
            op.apply_to_local_view(Some(&array(vec![int(1), int(2), int(1)])), Timestamp::now());
        assert_eq!(result, array(vec![int(2)]));
        assert_eq!(op.apply_to_local_view(None, Timestamp::now()), array(vec![]));
    }

    #[test]
    fn increment_types_and_saturation() {
        let by_five = TransformOperation::NumericIncrement(int(5));
        assert_eq!(by_five.apply_to_local_view(Some(&int(1)), Timestamp::now()), int(6));
        assert_eq!(
            by_five.apply_to_local_view(Some(&FirestoreValue::from_string("x")), Timestamp::now()),
            int(5)
        );
        assert_eq!(
            by_five.apply_to_local_view(Some(&FirestoreValue::from_double(0.5)), Timestamp::now()),
            FirestoreValue::from_double(5.5)
        );
        assert_eq!(
            by_five.apply_to_local_view(Some(&int(i64::MAX - 1)), Timestamp::now()),
            int(i64::MAX)
        );

        let down = TransformOperation::NumericIncrement(int(-10));
        assert_eq!(down.apply_to_local_view(Some(&int(i64::MIN + 3)), Timestamp::now()), int(i64::MIN));

        let by_half = TransformOperation::NumericIncrement(FirestoreValue::from_double(0.5));
        assert_eq!(
            by_half.apply_to_local_view(Some(&int(1)), Timestamp::now()),
            FirestoreValue::from_double(1.5)
        );
    }

    #[test]
    fn base_value_only_for_increments() {
        let inc = TransformOperation::NumericIncrement(int(1));
        assert_eq!(inc.compute_base_value(None), Some(int(0)));
        assert_eq!(inc.compute_base_value(Some(&int(4))), Some(int(4)));
        assert!(TransformOperation::ServerTimestamp
            .compute_base_value(Some(&int(4)))
            .is_none());
    }
}
