//! Ordering, equality and canonical ids for typed values.
//!
//! Values of different types order by [`TypeOrder`]; values of the same type
//! use a type-specific comparison. [`value_equals`] agrees with
//! [`value_compare`] in one direction: equal values always compare as
//! `Ordering::Equal`. The converse fails only for numbers that are
//! numerically equal but not identical (an integer and a double of the same
//! magnitude, or `0.0` and `-0.0`).

use std::cmp::Ordering;

use crate::firestore::model::{DatabaseId, DocumentKey};
use crate::firestore::value::server_timestamp::{get_local_write_time, is_server_timestamp};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};
use crate::util::assert::fail;

/// Rank of a value's type in the cross-type ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeOrder {
    Null = 0,
    Boolean = 1,
    Number = 2,
    Timestamp = 3,
    ServerTimestamp = 4,
    String = 5,
    Blob = 6,
    Reference = 7,
    GeoPoint = 8,
    Array = 9,
    Object = 10,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        ValueKind::Null => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Blob,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Map(_) if is_server_timestamp(value) => TypeOrder::ServerTimestamp,
        ValueKind::Map(_) => TypeOrder::Object,
        ValueKind::Sentinel(sentinel) => fail(format!(
            "{}() is a write sentinel and has no type order",
            sentinel.method_name()
        )),
    }
}

pub fn value_equals(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Sentinel(a), ValueKind::Sentinel(b)) => return a == b,
        (ValueKind::Sentinel(_), _) | (_, ValueKind::Sentinel(_)) => return false,
        _ => {}
    }

    let order = type_order(left);
    if order != type_order(right) {
        return false;
    }

    if order == TypeOrder::ServerTimestamp {
        return get_local_write_time(left) == get_local_write_time(right);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a == b,
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a == b,
        (ValueKind::Double(a), ValueKind::Double(b)) => double_equals(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a == b,
        (ValueKind::String(a), ValueKind::String(b)) => a == b,
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a == b,
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a == b,
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => {
            a.latitude() == b.latitude() && a.longitude() == b.longitude()
        }
        (ValueKind::Array(a), ValueKind::Array(b)) => array_equals(a, b),
        (ValueKind::Map(a), ValueKind::Map(b)) => map_equals(a, b),
        _ => false,
    }
}

/// NaN equals NaN; `0.0` and `-0.0` are distinct.
fn double_equals(left: f64, right: f64) -> bool {
    if left.is_nan() && right.is_nan() {
        return true;
    }
    left.to_bits() == right.to_bits()
}

fn array_equals(left: &ArrayValue, right: &ArrayValue) -> bool {
    left.len() == right.len()
        && left
            .values()
            .iter()
            .zip(right.values())
            .all(|(l, r)| value_equals(l, r))
}

fn map_equals(left: &MapValue, right: &MapValue) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.fields().iter().all(|(key, value)| {
        right
            .get(key)
            .is_some_and(|other| value_equals(value, other))
    })
}

pub fn value_compare(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    if left_order == TypeOrder::ServerTimestamp {
        return get_local_write_time(left).cmp(&get_local_write_time(right));
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.compare(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => compare_arrays(a, b),
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ if left_order == TypeOrder::Number => compare_numbers(left.kind(), right.kind()),
        _ => Ordering::Equal,
    }
}

fn compare_numbers(left: &ValueKind, right: &ValueKind) -> Ordering {
    let (left, right) = match (left, right) {
        (ValueKind::Integer(a), ValueKind::Integer(b)) => return a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => (*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => (*a, *b as f64),
        (ValueKind::Double(a), ValueKind::Double(b)) => (*a, *b),
        _ => fail("compare_numbers called with non-numeric values"),
    };
    numeric_comparator(left, right)
}

/// Orders NaN before every other number; two NaNs compare equal.
pub(crate) fn numeric_comparator(left: f64, right: f64) -> Ordering {
    match left.partial_cmp(&right) {
        Some(ordering) => ordering,
        None => match (left.is_nan(), right.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        },
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments: Vec<&str> = left.split('/').collect();
    let right_segments: Vec<&str> = right.split('/').collect();
    for (l, r) in left_segments.iter().zip(right_segments.iter()) {
        match l.cmp(r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left_segments.len().cmp(&right_segments.len())
}

fn compare_arrays(left: &ArrayValue, right: &ArrayValue) -> Ordering {
    for (l, r) in left.values().iter().zip(right.values()) {
        match value_compare(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left.len().cmp(&right.len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((left_key, left_value), (right_key, right_value)) in
        left.fields().iter().zip(right.fields().iter())
    {
        match left_key.cmp(right_key) {
            Ordering::Equal => {}
            other => return other,
        }
        match value_compare(left_value, right_value) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    left.len().cmp(&right.len())
}

/// A string that uniquely identifies a value, used to build canonical ids of
/// queries and targets.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical_id(value, &mut out);
    out
}

fn write_canonical_id(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        ValueKind::Integer(i) => out.push_str(&i.to_string()),
        ValueKind::Double(d) => out.push_str(&canonical_double(*d)),
        ValueKind::Timestamp(ts) => out.push_str(&format!("time({},{})", ts.seconds, ts.nanos)),
        ValueKind::String(s) => out.push_str(s),
        ValueKind::Bytes(bytes) => out.push_str(&bytes.to_base64()),
        ValueKind::Reference(name) => out.push_str(reference_path(name)),
        ValueKind::GeoPoint(point) => out.push_str(&format!(
            "geo({},{})",
            canonical_double(point.latitude()),
            canonical_double(point.longitude())
        )),
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical_id(element, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, element)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical_id(element, out);
            }
            out.push('}');
        }
        ValueKind::Sentinel(sentinel) => {
            out.push_str(&format!("{}()", sentinel.method_name()));
        }
    }
}

fn canonical_double(value: f64) -> String {
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    value.to_string()
}

/// Strips the `projects/{p}/databases/{d}/documents/` prefix of a resource name.
fn reference_path(name: &str) -> &str {
    match name.find("/documents/") {
        Some(index) => &name[index + "/documents/".len()..],
        None => name,
    }
}

/// Builds a reference value pointing at `key` in `database_id`.
pub fn ref_value(database_id: &DatabaseId, key: &DocumentKey) -> FirestoreValue {
    FirestoreValue::from_reference(format!(
        "{}/documents/{}",
        database_id.canonical_name(),
        key.path().canonical_string()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{GeoPoint, Timestamp};
    use crate::firestore::value::server_timestamp::server_timestamp;
    use crate::firestore::value::BytesValue;
    use std::collections::BTreeMap;

    fn map(entries: &[(&str, FirestoreValue)]) -> FirestoreValue {
        FirestoreValue::from_map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_integer(1),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            server_timestamp(Timestamp::new(0, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_bytes(BytesValue::new(vec![0])),
            FirestoreValue::from_reference("projects/p/databases/d/documents/c/a"),
            FirestoreValue::from_geo_point(GeoPoint::new(0.0, 0.0).unwrap()),
            FirestoreValue::from_array(vec![]),
            map(&[]),
        ];
        for window in ordered.windows(2) {
            assert_eq!(value_compare(&window[0], &window[1]), Ordering::Less);
            assert_eq!(value_compare(&window[1], &window[0]), Ordering::Greater);
        }
    }

    #[test]
    fn nan_sorts_first_and_equals_itself() {
        let nan = FirestoreValue::from_double(f64::NAN);
        let low = FirestoreValue::from_double(f64::NEG_INFINITY);
        assert_eq!(value_compare(&nan, &low), Ordering::Less);
        assert_eq!(value_compare(&nan, &nan), Ordering::Equal);
        assert!(value_equals(&nan, &nan));
    }

    #[test]
    fn signed_zero_and_mixed_numbers() {
        let zero = FirestoreValue::from_double(0.0);
        let negative_zero = FirestoreValue::from_double(-0.0);
        assert!(!value_equals(&zero, &negative_zero));
        assert_eq!(value_compare(&zero, &negative_zero), Ordering::Equal);

        let int_one = FirestoreValue::from_integer(1);
        let double_one = FirestoreValue::from_double(1.0);
        assert!(!value_equals(&int_one, &double_one));
        assert_eq!(value_compare(&int_one, &double_one), Ordering::Equal);
        assert_eq!(
            value_compare(&FirestoreValue::from_integer(2), &double_one),
            Ordering::Greater
        );
    }

    #[test]
    fn references_compare_segment_wise() {
        let a = FirestoreValue::from_reference("projects/p/databases/d/documents/c/a");
        let a_sub = FirestoreValue::from_reference("projects/p/databases/d/documents/c/a/s/x");
        let b = FirestoreValue::from_reference("projects/p/databases/d/documents/c/b");
        let dash = FirestoreValue::from_reference("projects/p/databases/d/documents/c/a-");
        assert_eq!(value_compare(&a, &a_sub), Ordering::Less);
        assert_eq!(value_compare(&a_sub, &b), Ordering::Less);
        // Segment-wise comparison puts "a/..." before "a-" even though '-' < '/'.
        assert_eq!(value_compare(&a_sub, &dash), Ordering::Less);
    }

    #[test]
    fn maps_compare_by_sorted_keys_then_values() {
        let a1 = map(&[("a", FirestoreValue::from_integer(1))]);
        let a2 = map(&[("a", FirestoreValue::from_integer(2))]);
        let b0 = map(&[("b", FirestoreValue::from_integer(0))]);
        let a1b = map(&[
            ("a", FirestoreValue::from_integer(1)),
            ("b", FirestoreValue::null()),
        ]);
        assert_eq!(value_compare(&a1, &a2), Ordering::Less);
        assert_eq!(value_compare(&a2, &b0), Ordering::Less);
        assert_eq!(value_compare(&a1, &a1b), Ordering::Less);
        assert!(value_equals(&a1, &map(&[("a", FirestoreValue::from_integer(1))])));
    }

    #[test]
    fn arrays_compare_element_wise_then_length() {
        let short = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]);
        let long = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(0),
        ]);
        let bigger = FirestoreValue::from_array(vec![FirestoreValue::from_integer(2)]);
        assert_eq!(value_compare(&short, &long), Ordering::Less);
        assert_eq!(value_compare(&long, &bigger), Ordering::Less);
    }

    #[test]
    fn server_timestamps_use_local_write_time() {
        let a = server_timestamp(Timestamp::new(5, 0), Some(&FirestoreValue::from_integer(1)));
        let b = server_timestamp(Timestamp::new(5, 0), Some(&FirestoreValue::from_integer(2)));
        let later = server_timestamp(Timestamp::new(6, 0), None);
        assert!(value_equals(&a, &b));
        assert_eq!(value_compare(&a, &b), Ordering::Equal);
        assert_eq!(value_compare(&a, &later), Ordering::Less);
    }

    #[test]
    fn canonical_ids() {
        let value = map(&[
            ("b", FirestoreValue::from_array(vec![FirestoreValue::from_bool(true)])),
            ("a", FirestoreValue::from_double(f64::INFINITY)),
            (
                "r",
                FirestoreValue::from_reference("projects/p/databases/d/documents/c/x"),
            ),
        ]);
        assert_eq!(canonical_id(&value), "{a:Infinity,b:[true],r:c/x}");
        assert_eq!(
            canonical_id(&FirestoreValue::from_timestamp(Timestamp::new(1, 2))),
            "time(1,2)"
        );
    }

    #[test]
    fn builds_reference_values() {
        let db = DatabaseId::new("p", "d");
        let key = DocumentKey::from_string("c/x").unwrap();
        assert_eq!(
            ref_value(&db, &key).as_reference(),
            Some("projects/p/databases/d/documents/c/x")
        );
    }
}
