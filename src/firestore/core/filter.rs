use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::model::{Document, DocumentKey, FieldPath};
use crate::firestore::value::{type_order, value_compare, FirestoreValue, ValueKind};
use crate::util::assert::{fail, hard_assert};

/// Comparison operators supported by field filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    NotIn,
    ArrayContainsAny,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::In => "in",
            Operator::NotIn => "not-in",
            Operator::ArrayContainsAny => "array-contains-any",
        }
    }

    /// Parses the operator string accepted by `where()`.
    pub fn from_str_op(op: &str) -> Option<Self> {
        let parsed = match op {
            "<" => Operator::LessThan,
            "<=" => Operator::LessThanOrEqual,
            "==" => Operator::Equal,
            "!=" => Operator::NotEqual,
            ">" => Operator::GreaterThan,
            ">=" => Operator::GreaterThanOrEqual,
            "array-contains" => Operator::ArrayContains,
            "in" => Operator::In,
            "not-in" => Operator::NotIn,
            "array-contains-any" => Operator::ArrayContainsAny,
            _ => return None,
        };
        Some(parsed)
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    /// Operators that take an array of candidate values.
    pub fn is_disjunctive(&self) -> bool {
        matches!(
            self,
            Operator::In | Operator::NotIn | Operator::ArrayContainsAny
        )
    }

    /// Operators that may not appear in the same query as `self`.
    pub fn conflicting_operators(&self) -> &'static [Operator] {
        match self {
            Operator::NotEqual => &[Operator::NotEqual, Operator::NotIn],
            Operator::ArrayContains => &[
                Operator::ArrayContains,
                Operator::ArrayContainsAny,
                Operator::NotIn,
            ],
            Operator::In => &[Operator::ArrayContainsAny, Operator::In, Operator::NotIn],
            Operator::ArrayContainsAny => &[
                Operator::ArrayContains,
                Operator::ArrayContainsAny,
                Operator::In,
                Operator::NotIn,
            ],
            Operator::NotIn => &[
                Operator::ArrayContains,
                Operator::ArrayContainsAny,
                Operator::In,
                Operator::NotIn,
                Operator::NotEqual,
            ],
            _ => &[],
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            other => fail(format!("Unknown FieldFilter operator: {other}")),
        }
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
enum FilterKind {
    Comparison,
    Key(DocumentKey),
    KeyIn(Vec<DocumentKey>),
    KeyNotIn(Vec<DocumentKey>),
    ArrayContains,
    In,
    NotIn,
    ArrayContainsAny,
}

/// A single `field op value` restriction.
///
/// Filters on the document key carry the parsed key(s) so that matching does
/// not re-parse reference names for every candidate document.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: Operator,
    value: FirestoreValue,
    kind: FilterKind,
}

impl FieldFilter {
    /// Builds the filter variant matching `field` and `op`.
    ///
    /// The value must already be validated: key filters expect reference
    /// values (an array of them for `in` / `not-in`).
    pub fn create(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        let kind = if field.is_key_field() {
            match op {
                Operator::In => FilterKind::KeyIn(extract_keys(op, &value)),
                Operator::NotIn => FilterKind::KeyNotIn(extract_keys(op, &value)),
                Operator::ArrayContains | Operator::ArrayContainsAny => fail(format!(
                    "'{op}' queries don't make sense on document keys."
                )),
                _ => FilterKind::Key(reference_key(&value)),
            }
        } else {
            match op {
                Operator::ArrayContains => FilterKind::ArrayContains,
                Operator::In => {
                    hard_assert(value.is_array(), "InFilter expects an ArrayValue");
                    FilterKind::In
                }
                Operator::NotIn => {
                    hard_assert(value.is_array(), "NotInFilter expects an ArrayValue");
                    FilterKind::NotIn
                }
                Operator::ArrayContainsAny => {
                    hard_assert(
                        value.is_array(),
                        "ArrayContainsAnyFilter expects an ArrayValue",
                    );
                    FilterKind::ArrayContainsAny
                }
                _ => FilterKind::Comparison,
            }
        };
        Self {
            field,
            op,
            value,
            kind,
        }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match &self.kind {
            FilterKind::Key(key) => self
                .op
                .matches_comparison(DocumentKey::comparator(doc.key(), key)),
            FilterKind::KeyIn(keys) => keys.contains(doc.key()),
            FilterKind::KeyNotIn(keys) => !keys.contains(doc.key()),
            FilterKind::Comparison => {
                let Some(other) = doc.field(&self.field) else {
                    return false;
                };
                if self.op == Operator::NotEqual {
                    return self.op.matches_comparison(value_compare(other, &self.value));
                }
                type_order(&self.value) == type_order(other)
                    && self.op.matches_comparison(value_compare(other, &self.value))
            }
            FilterKind::ArrayContains => doc
                .field(&self.field)
                .and_then(FirestoreValue::as_array)
                .is_some_and(|array| array.contains(&self.value)),
            FilterKind::In => match (doc.field(&self.field), self.value.as_array()) {
                (Some(other), Some(candidates)) => candidates.contains(other),
                _ => false,
            },
            FilterKind::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                doc.field(&self.field)
                    .is_some_and(|other| !candidates.contains(other))
            }
            FilterKind::ArrayContainsAny => {
                let (Some(array), Some(candidates)) = (
                    doc.field(&self.field).and_then(FirestoreValue::as_array),
                    self.value.as_array(),
                ) else {
                    return false;
                };
                array
                    .values()
                    .iter()
                    .any(|element| candidates.contains(element))
            }
        }
    }

    /// `{field}{op}{value}` form used inside target canonical ids.
    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op,
            crate::firestore::value::canonical_id(&self.value)
        )
    }
}

impl Display for FieldFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.field.canonical_string(),
            self.op,
            crate::firestore::value::canonical_id(&self.value)
        )
    }
}

fn reference_key(value: &FirestoreValue) -> DocumentKey {
    let Some(name) = value.as_reference() else {
        fail("Comparing on key, but filter value not a RefValue");
    };
    match DocumentKey::from_resource_name(name) {
        Ok(key) => key,
        Err(err) => fail(format!("Invalid key filter value {name}: {err}")),
    }
}

fn extract_keys(op: Operator, value: &FirestoreValue) -> Vec<DocumentKey> {
    match value.kind() {
        ValueKind::Array(array) => array.values().iter().map(reference_key).collect(),
        _ => fail(format!("{op} filter on document keys expects an ArrayValue")),
    }
}
