use crate::firestore::core::{self, Bound, Direction, FieldFilter, Operator, OrderBy};
use crate::firestore::error::{invalid_argument, not_found, unimplemented, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, IntoFieldPath, ResourcePath};
use crate::firestore::value::server_timestamp::is_server_timestamp;
use crate::firestore::value::values::ref_value;
use crate::firestore::value::{FirestoreValue, ValueKind};

use super::database::Firestore;
use super::snapshot::DocumentSnapshot;

/// Largest number of values accepted by `in`, `not-in` and
/// `array-contains-any` filters.
const MAX_DISJUNCTIVE_VALUES: usize = 10;

/// A query against a collection or collection group.
///
/// Every builder method validates its input against the constraints already
/// on the query and returns a new query; the receiver is left untouched.
#[derive(Clone, Debug)]
pub struct Query {
    firestore: Firestore,
    query: core::Query,
}

impl Query {
    pub(crate) fn new(firestore: Firestore, query: core::Query) -> Self {
        Self { firestore, query }
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    /// The compiled query this builder wraps.
    pub fn core_query(&self) -> &core::Query {
        &self.query
    }

    /// Adds a `field op value` filter.
    ///
    /// Filters on [`FieldPath::document_id`] accept a document id string (a
    /// slash-separated path for collection group queries) or a reference
    /// value.
    pub fn where_field(
        &self,
        field: impl IntoFieldPath,
        op: Operator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        let field = field.into_field_path()?;
        let filter_value = if field.is_key_field() {
            match op {
                Operator::ArrayContains | Operator::ArrayContainsAny => {
                    return Err(invalid_argument(format!(
                        "Invalid Query. You can't perform '{op}' queries on documentId()."
                    )));
                }
                Operator::In | Operator::NotIn => {
                    let elements = validate_disjunctive_filter_elements(&value, op)?;
                    let references = elements
                        .iter()
                        .map(|element| self.parse_document_id_value(element))
                        .collect::<FirestoreResult<Vec<_>>>()?;
                    FirestoreValue::from_array(references)
                }
                _ => self.parse_document_id_value(&value)?,
            }
        } else {
            if op.is_disjunctive() {
                validate_disjunctive_filter_elements(&value, op)?;
            }
            let parsed = self.firestore.user_data_reader().parse_query_value(
                "where",
                &value,
                matches!(op, Operator::In | Operator::NotIn),
            )?;
            validate_null_and_nan(&parsed, op)?;
            parsed
        };

        let filter = FieldFilter::create(field, op, filter_value);
        self.validate_new_filter(&filter)?;
        Ok(self.with_query(self.query.with_added_filter(filter)))
    }

    pub fn order_by(&self, field: impl IntoFieldPath, direction: Direction) -> FirestoreResult<Self> {
        let field = field.into_field_path()?;
        if self.query.start_at().is_some() {
            return Err(invalid_argument(
                "Invalid query. You must not call startAt() or startAfter() before calling orderBy().",
            ));
        }
        if self.query.end_at().is_some() {
            return Err(invalid_argument(
                "Invalid query. You must not call endAt() or endBefore() before calling orderBy().",
            ));
        }
        if self.query.first_order_by_field().is_none() {
            if let Some(inequality) = self.query.inequality_filter_field() {
                validate_order_by_and_inequality_match(inequality, &field)?;
            }
        }
        let order_by = OrderBy::new(field, direction);
        Ok(self.with_query(self.query.with_added_order_by(order_by)))
    }

    /// Keeps only the first `limit` results.
    pub fn limit(&self, limit: u32) -> FirestoreResult<Self> {
        validate_positive_limit("limit", limit)?;
        Ok(self.with_query(self.query.with_limit_to_first(Some(limit))))
    }

    /// Keeps only the last `limit` results. Requires at least one explicit
    /// `order_by` by the time the query runs.
    pub fn limit_to_last(&self, limit: u32) -> FirestoreResult<Self> {
        validate_positive_limit("limitToLast", limit)?;
        Ok(self.with_query(self.query.with_limit_to_last(Some(limit))))
    }

    pub fn start_at(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound_from_fields("startAt", values, true)?;
        Ok(self.with_query(self.query.with_start_at(bound)))
    }

    pub fn start_after(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound_from_fields("startAfter", values, false)?;
        Ok(self.with_query(self.query.with_start_at(bound)))
    }

    pub fn end_at(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound_from_fields("endAt", values, false)?;
        Ok(self.with_query(self.query.with_end_at(bound)))
    }

    pub fn end_before(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound_from_fields("endBefore", values, true)?;
        Ok(self.with_query(self.query.with_end_at(bound)))
    }

    /// Starts at the position of `snapshot`, including it.
    pub fn start_at_document(&self, snapshot: &DocumentSnapshot) -> FirestoreResult<Self> {
        let bound = self.bound_from_document("startAt", snapshot, true)?;
        Ok(self.with_query(self.query.with_start_at(bound)))
    }

    pub fn start_after_document(&self, snapshot: &DocumentSnapshot) -> FirestoreResult<Self> {
        let bound = self.bound_from_document("startAfter", snapshot, false)?;
        Ok(self.with_query(self.query.with_start_at(bound)))
    }

    pub fn end_at_document(&self, snapshot: &DocumentSnapshot) -> FirestoreResult<Self> {
        let bound = self.bound_from_document("endAt", snapshot, false)?;
        Ok(self.with_query(self.query.with_end_at(bound)))
    }

    pub fn end_before_document(&self, snapshot: &DocumentSnapshot) -> FirestoreResult<Self> {
        let bound = self.bound_from_document("endBefore", snapshot, true)?;
        Ok(self.with_query(self.query.with_end_at(bound)))
    }

    pub(crate) fn validate_has_explicit_order_by_for_limit_to_last(&self) -> FirestoreResult<()> {
        if self.query.has_limit_to_last() && self.query.explicit_order_by().is_empty() {
            return Err(unimplemented(
                "limitToLast() queries require specifying at least one orderBy() clause",
            ));
        }
        Ok(())
    }

    fn with_query(&self, query: core::Query) -> Self {
        Self {
            firestore: self.firestore.clone(),
            query,
        }
    }

    fn validate_new_filter(&self, filter: &FieldFilter) -> FirestoreResult<()> {
        if filter.is_inequality() {
            if let Some(existing) = self.query.inequality_filter_field() {
                if existing != filter.field() {
                    return Err(invalid_argument(format!(
                        "Invalid query. All where filters with an inequality (<, <=, !=, not-in, >, or >=) must be on the same field. But you have inequality filters on '{existing}' and '{}'",
                        filter.field()
                    )));
                }
            }
            if let Some(first_order_by) = self.query.first_order_by_field() {
                validate_order_by_and_inequality_match(filter.field(), first_order_by)?;
            }
        }

        let op = filter.op();
        if let Some(conflicting) = self.query.find_filter_operator(op.conflicting_operators()) {
            if conflicting == op {
                return Err(invalid_argument(format!(
                    "Invalid query. You cannot use more than one '{op}' filter."
                )));
            }
            return Err(invalid_argument(format!(
                "Invalid query. You cannot use '{op}' filters with '{conflicting}' filters."
            )));
        }
        Ok(())
    }

    /// Turns a document id filter operand into a reference value.
    pub(crate) fn parse_document_id_value(
        &self,
        value: &FirestoreValue,
    ) -> FirestoreResult<FirestoreValue> {
        let database_id = self.firestore.database_id();
        match value.kind() {
            ValueKind::String(id) => {
                if id.is_empty() {
                    return Err(invalid_argument(
                        "Invalid query. When querying with documentId(), you must provide a valid document ID, but it was an empty string.",
                    ));
                }
                if !self.query.is_collection_group_query() && id.contains('/') {
                    return Err(invalid_argument(format!(
                        "Invalid query. When querying a collection by documentId(), you must provide a plain document ID, but '{id}' contains a '/' character."
                    )));
                }
                let path = self.query.path().child(ResourcePath::from_string(id)?.iter().cloned());
                if !DocumentKey::is_document_key(&path) {
                    return Err(invalid_argument(format!(
                        "Invalid query. When querying a collection group by documentId(), the value provided must result in a valid document path, but '{}' is not because it has an odd number of segments ({}).",
                        path.canonical_string(),
                        path.len()
                    )));
                }
                Ok(ref_value(database_id, &DocumentKey::from_path(path)?))
            }
            ValueKind::Reference(name) => {
                let key = DocumentKey::from_resource_name(name)?;
                Ok(ref_value(database_id, &key))
            }
            _ => Err(invalid_argument(format!(
                "Invalid query. When querying with documentId(), you must provide a valid string or a DocumentReference, but it was: {}.",
                value_description(value)
            ))),
        }
    }

    fn bound_from_fields(
        &self,
        method_name: &str,
        values: Vec<FirestoreValue>,
        before: bool,
    ) -> FirestoreResult<Bound> {
        let order_by = self.query.explicit_order_by();
        if values.len() > order_by.len() {
            return Err(invalid_argument(format!(
                "Too many arguments provided to {method_name}(). The number of arguments must be less than or equal to the number of orderBy() clauses"
            )));
        }

        let mut position = Vec::with_capacity(values.len());
        for (value, order_by) in values.iter().zip(order_by) {
            if order_by.field().is_key_field() {
                let ValueKind::String(id) = value.kind() else {
                    return Err(invalid_argument(format!(
                        "Invalid query. Expected a string for document ID in {method_name}(), but got {}",
                        value_description(value)
                    )));
                };
                if !self.query.is_collection_group_query() && id.contains('/') {
                    return Err(invalid_argument(format!(
                        "Invalid query. When querying a collection and ordering by documentId(), the value passed to {method_name}() must be a plain document ID, but '{id}' contains a slash."
                    )));
                }
                let path = self.query.path().child(ResourcePath::from_string(id)?.iter().cloned());
                if !DocumentKey::is_document_key(&path) {
                    return Err(invalid_argument(format!(
                        "Invalid query. When querying a collection group and ordering by documentId(), the value passed to {method_name}() must result in a valid document path, but '{}' is not because it contains an odd number of segments.",
                        path.canonical_string()
                    )));
                }
                let key = DocumentKey::from_path(path)?;
                position.push(ref_value(self.firestore.database_id(), &key));
            } else {
                position.push(
                    self.firestore
                        .user_data_reader()
                        .parse_query_value(method_name, value, false)?,
                );
            }
        }
        Ok(Bound::new(position, before))
    }

    /// Builds a bound from every field of the implicit ordering, so the
    /// position is unique to `snapshot`'s document.
    fn bound_from_document(
        &self,
        method_name: &str,
        snapshot: &DocumentSnapshot,
        before: bool,
    ) -> FirestoreResult<Bound> {
        let Some(document) = snapshot.document() else {
            return Err(not_found(format!(
                "Can't use a DocumentSnapshot that doesn't exist for {method_name}()."
            )));
        };

        let mut position = Vec::new();
        for order_by in self.query.order_by() {
            if order_by.field().is_key_field() {
                position.push(ref_value(self.firestore.database_id(), document.key()));
                continue;
            }
            match document.field(order_by.field()) {
                Some(value) if is_server_timestamp(value) => {
                    return Err(invalid_argument(format!(
                        "Invalid query. You are trying to start or end a query using a document for which the field \"{}\" is an uncommitted server timestamp. (Since the value of this field is unknown, you cannot start/end a query with it.)",
                        order_by.field()
                    )));
                }
                Some(value) => position.push(value.clone()),
                None => {
                    return Err(invalid_argument(format!(
                        "Invalid query. You are trying to start or end a query using a document for which the field '{}' (used as the orderBy) does not exist.",
                        order_by.field()
                    )));
                }
            }
        }
        Ok(Bound::new(position, before))
    }
}

fn validate_positive_limit(method_name: &str, limit: u32) -> FirestoreResult<()> {
    if limit == 0 {
        return Err(invalid_argument(format!(
            "Function {method_name}() requires a positive number, but it was: 0."
        )));
    }
    Ok(())
}

fn validate_order_by_and_inequality_match(
    inequality: &FieldPath,
    order_by: &FieldPath,
) -> FirestoreResult<()> {
    if inequality != order_by {
        return Err(invalid_argument(format!(
            "Invalid query. You have a where filter with an inequality (<, <=, !=, not-in, >, or >=) on field '{inequality}' and so you must also use '{inequality}' as your first argument to orderBy(), but your first orderBy() is on field '{order_by}' instead."
        )));
    }
    Ok(())
}

fn validate_disjunctive_filter_elements(
    value: &FirestoreValue,
    op: Operator,
) -> FirestoreResult<&[FirestoreValue]> {
    let elements = match value.as_array() {
        Some(array) if !array.values().is_empty() => array.values(),
        _ => {
            return Err(invalid_argument(format!(
                "Invalid Query. A non-empty array is required for '{op}' filters."
            )));
        }
    };
    if elements.len() > MAX_DISJUNCTIVE_VALUES {
        return Err(invalid_argument(format!(
            "Invalid Query. '{op}' filters support a maximum of {MAX_DISJUNCTIVE_VALUES} elements in the value array."
        )));
    }
    if matches!(op, Operator::In | Operator::ArrayContainsAny) {
        if elements.iter().any(FirestoreValue::is_null) {
            return Err(invalid_argument(format!(
                "Invalid Query. '{op}' filters cannot contain 'null' in the value array."
            )));
        }
        if elements.iter().any(FirestoreValue::is_nan) {
            return Err(invalid_argument(format!(
                "Invalid Query. '{op}' filters cannot contain 'NaN' in the value array."
            )));
        }
    }
    Ok(elements)
}

fn validate_null_and_nan(value: &FirestoreValue, op: Operator) -> FirestoreResult<()> {
    let equality = matches!(op, Operator::Equal | Operator::NotEqual);
    if value.is_null() && !equality {
        return Err(invalid_argument(
            "Invalid query. Null supports only equality comparisons.",
        ));
    }
    if value.is_nan() && !equality {
        return Err(invalid_argument(
            "Invalid query. NaN supports only equality comparisons.",
        ));
    }
    Ok(())
}

fn value_description(value: &FirestoreValue) -> &'static str {
    match value.kind() {
        ValueKind::Null => "null",
        ValueKind::Boolean(_) => "a boolean",
        ValueKind::Integer(_) | ValueKind::Double(_) => "a number",
        ValueKind::Timestamp(_) => "a timestamp",
        ValueKind::String(_) => "a string",
        ValueKind::Bytes(_) => "a bytes value",
        ValueKind::Reference(_) => "a reference",
        ValueKind::GeoPoint(_) => "a geo point",
        ValueKind::Array(_) => "an array",
        ValueKind::Map(_) => "an object",
        ValueKind::Sentinel(sentinel) => sentinel.method_name(),
    }
}

/// The documents a query returned, in query order.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    query: Query,
    documents: Vec<DocumentSnapshot>,
}

impl QuerySnapshot {
    pub fn new(query: Query, documents: Vec<DocumentSnapshot>) -> Self {
        Self { query, documents }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn documents(&self) -> &[DocumentSnapshot] {
        &self.documents
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn into_documents(self) -> Vec<DocumentSnapshot> {
        self.documents
    }
}

impl IntoIterator for QuerySnapshot {
    type Item = DocumentSnapshot;
    type IntoIter = std::vec::IntoIter<DocumentSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::InMemoryConnection;

    fn firestore() -> Firestore {
        Firestore::in_memory(InMemoryConnection::new(DatabaseId::default("p")))
    }

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from_integer(value)
    }

    fn array(values: Vec<FirestoreValue>) -> FirestoreValue {
        FirestoreValue::from_array(values)
    }

    #[tokio::test]
    async fn inequalities_must_share_a_field() {
        let query = firestore().collection("rooms").unwrap().query();
        let query = query.where_field("a", Operator::GreaterThan, int(1)).unwrap();
        let err = query
            .where_field("b", Operator::LessThan, int(1))
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert!(err
            .message()
            .contains("inequality filters on 'a' and 'b'"));
    }

    #[tokio::test]
    async fn first_order_by_must_match_the_inequality() {
        let query = firestore().collection("rooms").unwrap().query();
        let filtered = query.where_field("a", Operator::GreaterThan, int(1)).unwrap();
        let err = filtered.order_by("b", Direction::Ascending).unwrap_err();
        assert!(err.message().contains("first orderBy() is on field 'b'"));
        assert!(filtered.order_by("a", Direction::Descending).is_ok());

        let ordered = query.order_by("b", Direction::Ascending).unwrap();
        assert!(ordered
            .where_field("a", Operator::LessThan, int(1))
            .is_err());
    }

    #[tokio::test]
    async fn conflicting_operators_are_rejected() {
        let query = firestore().collection("rooms").unwrap().query();
        let with_contains = query
            .where_field("tags", Operator::ArrayContains, int(1))
            .unwrap();
        let err = with_contains
            .where_field("tags", Operator::ArrayContains, int(2))
            .unwrap_err();
        assert_eq!(
            err.message(),
            "Invalid query. You cannot use more than one 'array-contains' filter."
        );
        let err = with_contains
            .where_field("tags", Operator::ArrayContainsAny, array(vec![int(2)]))
            .unwrap_err();
        assert_eq!(
            err.message(),
            "Invalid query. You cannot use 'array-contains-any' filters with 'array-contains' filters."
        );
    }

    #[tokio::test]
    async fn disjunctive_operands_are_validated() {
        let query = firestore().collection("rooms").unwrap().query();
        assert!(query.where_field("a", Operator::In, array(vec![])).is_err());
        assert!(query.where_field("a", Operator::In, int(1)).is_err());
        let eleven = (0..11).map(int).collect();
        assert!(query.where_field("a", Operator::In, array(eleven)).is_err());
        let err = query
            .where_field("a", Operator::In, array(vec![FirestoreValue::null()]))
            .unwrap_err();
        assert!(err.message().contains("cannot contain 'null'"));
        let err = query
            .where_field(
                "a",
                Operator::ArrayContainsAny,
                array(vec![FirestoreValue::from_double(f64::NAN)]),
            )
            .unwrap_err();
        assert!(err.message().contains("cannot contain 'NaN'"));
        assert!(query
            .where_field("a", Operator::NotIn, array(vec![FirestoreValue::null()]))
            .is_ok());
    }

    #[tokio::test]
    async fn null_only_supports_equality() {
        let query = firestore().collection("rooms").unwrap().query();
        assert!(query
            .where_field("a", Operator::Equal, FirestoreValue::null())
            .is_ok());
        let err = query
            .where_field("a", Operator::GreaterThan, FirestoreValue::null())
            .unwrap_err();
        assert_eq!(
            err.message(),
            "Invalid query. Null supports only equality comparisons."
        );
    }

    #[tokio::test]
    async fn document_id_filters_become_references() {
        let db = firestore();
        let query = db.collection("rooms").unwrap().query();
        let filtered = query
            .where_field(
                FieldPath::document_id(),
                Operator::Equal,
                FirestoreValue::from_string("eros"),
            )
            .unwrap();
        let filter = &filtered.core_query().filters()[0];
        assert_eq!(
            filter.value().as_reference(),
            Some("projects/p/databases/(default)/documents/rooms/eros")
        );

        let err = query
            .where_field(
                FieldPath::document_id(),
                Operator::Equal,
                FirestoreValue::from_string("a/b"),
            )
            .unwrap_err();
        assert!(err.message().contains("contains a '/' character"));

        let group = db.collection_group("messages").unwrap();
        let err = group
            .where_field(
                FieldPath::document_id(),
                Operator::Equal,
                FirestoreValue::from_string("rooms"),
            )
            .unwrap_err();
        assert!(err.message().contains("odd number of segments (1)"));
        assert!(group
            .where_field(
                FieldPath::document_id(),
                Operator::Equal,
                FirestoreValue::from_string("rooms/eros/messages/m1"),
            )
            .is_ok());

        let err = query
            .where_field(FieldPath::document_id(), Operator::ArrayContains, int(1))
            .unwrap_err();
        assert!(err.message().contains("on documentId()"));
    }

    #[tokio::test]
    async fn cursors_follow_explicit_order_by() {
        let query = firestore().collection("rooms").unwrap().query();
        let err = query.start_at(vec![int(1)]).unwrap_err();
        assert!(err.message().starts_with("Too many arguments provided to startAt()"));

        let ordered = query.order_by("n", Direction::Ascending).unwrap();
        let started = ordered.start_after(vec![int(1)]).unwrap();
        let bound = started.core_query().start_at().unwrap();
        assert!(!bound.before());
        assert_eq!(bound.position(), &[int(1)]);

        let err = started.order_by("m", Direction::Ascending).unwrap_err();
        assert!(err.message().contains("startAt() or startAfter() before"));
    }

    #[tokio::test]
    async fn limit_to_last_needs_an_order_by() {
        let query = firestore().collection("rooms").unwrap().query();
        let last = query.limit_to_last(2).unwrap();
        let err = last
            .validate_has_explicit_order_by_for_limit_to_last()
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unimplemented);
        assert!(last
            .order_by("n", Direction::Ascending)
            .unwrap()
            .validate_has_explicit_order_by_for_limit_to_last()
            .is_ok());
        assert!(query.limit(0).is_err());
    }
}
