use std::cmp::Ordering;

use once_cell::sync::OnceCell;

use crate::firestore::core::filter::{FieldFilter, Operator};
use crate::firestore::core::target::{Bound, Direction, OrderBy, Target};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::util::assert::hard_assert;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// The internal, validated form of a query.
///
/// A query lists the user's explicit orderings only. The full ordering
/// (with implicit inequality and key clauses) and the backend [`Target`] are
/// derived lazily and memoized.
#[derive(Clone, Debug)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<FieldFilter>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
    memoized_order_by: OnceCell<Vec<OrderBy>>,
    memoized_target: OnceCell<Target>,
}

impl Query {
    /// Query for the collection (odd segment count) or single document
    /// (even segment count) at `path`.
    pub fn at_path(path: ResourcePath) -> Self {
        Self::with_parts(path, None)
    }

    /// Query over every collection named `collection_id` under `path`.
    pub fn collection_group(path: ResourcePath, collection_id: impl Into<String>) -> Self {
        Self::with_parts(path, Some(collection_id.into()))
    }

    fn with_parts(path: ResourcePath, collection_group: Option<String>) -> Self {
        Self {
            path,
            collection_group,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
            memoized_order_by: OnceCell::new(),
            memoized_target: OnceCell::new(),
        }
    }

    /// A limit-to-first query that executes `target` as written, the way the
    /// backend evaluates it.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path().clone(),
            collection_group: target.collection_group().map(str::to_string),
            explicit_order_by: target.order_by().to_vec(),
            filters: target.filters().to_vec(),
            limit: target.limit(),
            limit_type: LimitType::First,
            start_at: target.start_at().cloned(),
            end_at: target.end_at().cloned(),
            memoized_order_by: OnceCell::new(),
            memoized_target: OnceCell::new(),
        }
    }

    /// Copy with the memoized state dropped, for the `with_*` builders.
    fn fresh_copy(&self) -> Self {
        Self {
            path: self.path.clone(),
            collection_group: self.collection_group.clone(),
            explicit_order_by: self.explicit_order_by.clone(),
            filters: self.filters.clone(),
            limit: self.limit,
            limit_type: self.limit_type,
            start_at: self.start_at.clone(),
            end_at: self.end_at.clone(),
            memoized_order_by: OnceCell::new(),
            memoized_target: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    /// The field of the first inequality filter, if any.
    pub fn inequality_filter_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .find(|filter| filter.is_inequality())
            .map(FieldFilter::field)
    }

    pub fn first_order_by_field(&self) -> Option<&FieldPath> {
        self.explicit_order_by.first().map(OrderBy::field)
    }

    /// Returns the first operator among `operators` used by a filter.
    pub fn find_filter_operator(&self, operators: &[Operator]) -> Option<Operator> {
        self.filters
            .iter()
            .map(FieldFilter::op)
            .find(|op| operators.contains(op))
    }

    pub fn with_added_filter(&self, filter: FieldFilter) -> Self {
        hard_assert(
            !self.is_document_query(),
            "No filtering allowed for document query",
        );
        let mut next = self.fresh_copy();
        next.filters.push(filter);
        next
    }

    pub fn with_added_order_by(&self, order_by: OrderBy) -> Self {
        hard_assert(
            self.start_at.is_none() && self.end_at.is_none(),
            "Bounds must be set after orderBy",
        );
        let mut next = self.fresh_copy();
        next.explicit_order_by.push(order_by);
        next
    }

    pub fn with_limit_to_first(&self, limit: Option<u32>) -> Self {
        let mut next = self.fresh_copy();
        next.limit = limit;
        next.limit_type = LimitType::First;
        next
    }

    pub fn with_limit_to_last(&self, limit: Option<u32>) -> Self {
        let mut next = self.fresh_copy();
        next.limit = limit;
        next.limit_type = LimitType::Last;
        next
    }

    pub fn with_start_at(&self, bound: Bound) -> Self {
        let mut next = self.fresh_copy();
        next.start_at = Some(bound);
        next
    }

    pub fn with_end_at(&self, bound: Bound) -> Self {
        let mut next = self.fresh_copy();
        next.end_at = Some(bound);
        next
    }

    /// The full ordering of results: explicit clauses plus the implicit
    /// inequality field and key clauses.
    pub fn order_by(&self) -> &[OrderBy] {
        self.memoized_order_by.get_or_init(|| {
            let mut order_by = Vec::new();
            match (self.inequality_filter_field(), self.first_order_by_field()) {
                (Some(inequality), None) => {
                    if !inequality.is_key_field() {
                        order_by.push(OrderBy::new(inequality.clone(), Direction::Ascending));
                    }
                    order_by.push(OrderBy::new(FieldPath::document_id(), Direction::Ascending));
                }
                _ => {
                    order_by.extend(self.explicit_order_by.iter().cloned());
                    let found_key_ordering = self
                        .explicit_order_by
                        .iter()
                        .any(|order| order.field().is_key_field());
                    if !found_key_ordering {
                        let last_direction = self
                            .explicit_order_by
                            .last()
                            .map(OrderBy::direction)
                            .unwrap_or(Direction::Ascending);
                        order_by.push(OrderBy::new(FieldPath::document_id(), last_direction));
                    }
                }
            }
            order_by
        })
    }

    /// The backend target for this query.
    ///
    /// Limit-to-last queries run as limit-to-first with every ordering
    /// flipped and the bounds swapped; callers reverse the returned page.
    pub fn to_target(&self) -> &Target {
        self.memoized_target.get_or_init(|| match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.order_by().to_vec(),
                self.filters.clone(),
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => {
                let order_by = self.order_by().iter().map(OrderBy::flipped).collect();
                let start_at = self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position().to_vec(), !bound.before()));
                let end_at = self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position().to_vec(), !bound.before()));
                Target::new(
                    self.path.clone(),
                    self.collection_group.clone(),
                    order_by,
                    self.filters.clone(),
                    self.limit,
                    start_at,
                    end_at,
                )
            }
        })
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    /// Returns whether `doc` belongs to this query's result set, ignoring
    /// the limit.
    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_path_and_collection_group(doc)
            && self.matches_order_by(doc)
            && self.matches_filters(doc)
            && self.matches_bounds(doc)
    }

    fn matches_path_and_collection_group(&self, doc: &Document) -> bool {
        let doc_path = doc.key().path();
        if let Some(group) = &self.collection_group {
            doc.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field().is_key_field() || doc.field(order.field()).is_some())
    }

    fn matches_filters(&self, doc: &Document) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc))
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if end.sorts_before_document(order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Orders two matching documents the way the backend returns them.
    pub fn compare_documents(&self, left: &Document, right: &Document) -> Ordering {
        for order in self.order_by() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn doc_comparator(&self) -> impl Fn(&Document, &Document) -> Ordering + '_ {
        move |left, right| self.compare_documents(left, right)
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.limit_type == other.limit_type && self.to_target() == other.to_target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ObjectValue, SnapshotVersion, Timestamp};
    use crate::firestore::value::FirestoreValue;
    use std::collections::BTreeMap;

    fn path(value: &str) -> ResourcePath {
        ResourcePath::from_string(value).unwrap()
    }

    fn field(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn doc(key: &str, fields: &[(&str, FirestoreValue)]) -> Document {
        let map: BTreeMap<String, FirestoreValue> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Document::new(
            DocumentKey::from_string(key).unwrap(),
            SnapshotVersion::from_timestamp(Timestamp::new(1, 0)),
            ObjectValue::from_map(map),
        )
    }

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from_integer(value)
    }

    #[test]
    fn implicit_order_by_uses_inequality_field() {
        let query = Query::at_path(path("rooms")).with_added_filter(FieldFilter::create(
            field("size"),
            Operator::GreaterThan,
            int(3),
        ));
        let order_by = query.order_by();
        assert_eq!(order_by.len(), 2);
        assert_eq!(order_by[0].field(), &field("size"));
        assert!(order_by[1].field().is_key_field());
        assert_eq!(order_by[1].direction(), Direction::Ascending);
    }

    #[test]
    fn implicit_key_order_follows_last_direction() {
        let query = Query::at_path(path("rooms"))
            .with_added_order_by(OrderBy::new(field("a"), Direction::Ascending))
            .with_added_order_by(OrderBy::new(field("b"), Direction::Descending));
        let order_by = query.order_by();
        assert_eq!(order_by.len(), 3);
        assert!(order_by[2].field().is_key_field());
        assert_eq!(order_by[2].direction(), Direction::Descending);
    }

    #[test]
    fn limit_to_last_flips_target() {
        let query = Query::at_path(path("rooms"))
            .with_added_order_by(OrderBy::new(field("n"), Direction::Ascending))
            .with_start_at(Bound::new(vec![int(1)], true))
            .with_end_at(Bound::new(vec![int(9)], false))
            .with_limit_to_last(Some(2));
        let target = query.to_target();
        for (normal, flipped) in query.order_by().iter().zip(target.order_by()) {
            assert_eq!(normal.field(), flipped.field());
            assert_eq!(normal.direction().flipped(), flipped.direction());
        }
        assert_eq!(target.start_at(), Some(&Bound::new(vec![int(9)], true)));
        assert_eq!(target.end_at(), Some(&Bound::new(vec![int(1)], false)));
        assert_eq!(target.limit(), Some(2));
    }

    #[test]
    fn canonical_id_distinguishes_limit_type() {
        let base = Query::at_path(path("rooms"))
            .with_added_order_by(OrderBy::new(field("n"), Direction::Ascending));
        let first = base.with_limit_to_first(Some(1));
        let last = base.with_limit_to_last(Some(1));
        assert!(first.canonical_id().ends_with("|lt:F"));
        assert!(last.canonical_id().ends_with("|lt:L"));
        assert_ne!(first, last);
        assert_eq!(first, base.with_limit_to_first(Some(1)));
    }

    #[test]
    fn matches_checks_path_filters_and_bounds() {
        let query = Query::at_path(path("rooms"))
            .with_added_filter(FieldFilter::create(field("n"), Operator::GreaterThanOrEqual, int(2)))
            .with_added_order_by(OrderBy::new(field("n"), Direction::Ascending))
            .with_end_at(Bound::new(vec![int(5)], false));
        assert!(query.matches(&doc("rooms/a", &[("n", int(2))])));
        assert!(query.matches(&doc("rooms/a", &[("n", int(5))])));
        assert!(!query.matches(&doc("rooms/a", &[("n", int(6))])));
        assert!(!query.matches(&doc("rooms/a", &[("n", int(1))])));
        assert!(!query.matches(&doc("rooms/a/sub/b", &[("n", int(3))])));
        assert!(!query.matches(&doc("halls/a", &[("n", int(3))])));
    }

    #[test]
    fn collection_group_matches_nested_collections() {
        let query = Query::collection_group(ResourcePath::root(), "msgs");
        assert!(query.matches(&doc("rooms/a/msgs/1", &[])));
        assert!(query.matches(&doc("msgs/1", &[])));
        assert!(!query.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn explicit_order_by_requires_field() {
        let query = Query::at_path(path("rooms"))
            .with_added_order_by(OrderBy::new(field("n"), Direction::Ascending));
        assert!(!query.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn comparator_orders_by_field_then_key() {
        let query = Query::at_path(path("rooms"))
            .with_added_order_by(OrderBy::new(field("n"), Direction::Descending));
        let mut docs = vec![
            doc("rooms/a", &[("n", int(1))]),
            doc("rooms/b", &[("n", int(2))]),
            doc("rooms/c", &[("n", int(2))]),
        ];
        docs.sort_by(query.doc_comparator());
        let ids: Vec<&str> = docs.iter().map(|d| d.key().id()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }
}
