use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::firestore::core::filter::FieldFilter;
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::{canonical_id, value_compare, FirestoreValue};
use crate::util::assert::{fail, hard_assert};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

/// A single ordering clause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn flipped(&self) -> Self {
        Self::new(self.field.clone(), self.direction.flipped())
    }

    /// Compares two documents on this clause. Both documents must carry the
    /// field.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            DocumentKey::comparator(left.key(), right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => value_compare(l, r),
                _ => fail("Trying to compare documents on fields that don't exist."),
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        format!("{}{}", self.field.canonical_string(), self.direction.as_str())
    }
}

/// A position in a query's result order.
///
/// `before` tells whether the bound sits just before the documents equal to
/// `position` (`startAt`, `endBefore`) or just after them (`startAfter`,
/// `endAt`).
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    before: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, before: bool) -> Self {
        Self { position, before }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn before(&self) -> bool {
        self.before
    }

    /// Returns whether this bound sorts before `doc` under `order_by`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        hard_assert(
            self.position.len() <= order_by.len(),
            "Bound has more components than query's orderBy",
        );
        let mut comparison = Ordering::Equal;
        for (component, order) in self.position.iter().zip(order_by) {
            comparison = if order.field().is_key_field() {
                let Some(name) = component.as_reference() else {
                    fail("Bound has a non-key value where the key path is being used.");
                };
                match DocumentKey::from_resource_name(name) {
                    Ok(key) => DocumentKey::comparator(&key, doc.key()),
                    Err(err) => fail(format!("Invalid bound key {name}: {err}")),
                }
            } else {
                match doc.field(order.field()) {
                    Some(value) => value_compare(component, value),
                    None => fail("Field should exist since document matched the orderBy already."),
                }
            };
            if order.direction() == Direction::Descending {
                comparison = comparison.reverse();
            }
            if comparison != Ordering::Equal {
                break;
            }
        }
        if self.before {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }

    fn canonical_id(&self) -> String {
        let mut out = String::from(if self.before { "b:" } else { "a:" });
        let values: Vec<String> = self.position.iter().map(canonical_id).collect();
        out.push_str(&values.join(","));
        out
    }
}

/// The normalized form of a query that is sent to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    order_by: Vec<OrderBy>,
    filters: Vec<FieldFilter>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        order_by: Vec<OrderBy>,
        filters: Vec<FieldFilter>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        Self {
            path,
            collection_group,
            order_by,
            filters,
            limit,
            start_at,
            end_at,
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// A string that is equal for two targets exactly when they are
    /// structurally equal.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        let filters: Vec<String> = self.filters.iter().map(FieldFilter::canonical_id).collect();
        let _ = write!(id, "|f:{}", filters.join(","));
        let order_by: Vec<String> = self.order_by.iter().map(OrderBy::canonical_id).collect();
        let _ = write!(id, "|ob:{}", order_by.join(","));
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
        }
        if let Some(bound) = &self.start_at {
            let _ = write!(id, "|lb:{}", bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            let _ = write!(id, "|ub:{}", bound.canonical_id());
        }
        id
    }
}
