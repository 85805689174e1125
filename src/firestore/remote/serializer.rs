use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{Bound, Direction, FieldFilter, Operator, OrderBy, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint,
    MaybeDocument, Mutation, MutationResult, NoDocument, ObjectValue, Precondition,
    ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};
use crate::util::assert::fail;

/// Converts between model types and the JSON form of the Firestore v1 protos.
///
/// With `use_proto3_json` the canonical proto3 JSON mapping is produced
/// (RFC 3339 timestamps, bare `limit` integers). Without it, timestamps are
/// `{seconds, nanos}` objects and `limit` is wrapped in `{value}`. Decoding
/// accepts both forms.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
    use_proto3_json: bool,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId, use_proto3_json: bool) -> Self {
        Self {
            database_id,
            use_proto3_json,
        }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn use_proto3_json(&self) -> bool {
        self.use_proto3_json
    }

    pub fn database_name(&self) -> String {
        self.database_id.canonical_name()
    }

    /// `projects/{p}/databases/{d}/documents/{path}`.
    pub fn to_name(&self, key: &DocumentKey) -> String {
        format!(
            "{}/documents/{}",
            self.database_name(),
            key.path().canonical_string()
        )
    }

    /// Parses a document name, rejecting names from another database.
    pub fn from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let segments: Vec<&str> = name.split('/').collect();
        if segments.len() < 5
            || segments[0] != "projects"
            || segments[2] != "databases"
            || segments[4] != "documents"
        {
            return Err(invalid_argument(format!(
                "Tried to deserialize invalid key {name}"
            )));
        }
        if segments[1] != self.database_id.project_id() {
            return Err(invalid_argument(format!(
                "Tried to deserialize key from different project: {} vs {}",
                segments[1],
                self.database_id.project_id()
            )));
        }
        if segments[3] != self.database_id.database() {
            return Err(invalid_argument(format!(
                "Tried to deserialize key from different database: {} vs {}",
                segments[3],
                self.database_id.database()
            )));
        }
        DocumentKey::from_path(ResourcePath::from_segments(segments[5..].iter().copied()))
    }

    /// Resource name of a collection or document path used as a query parent.
    pub fn to_query_path(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!(
                "{}/documents/{}",
                self.database_name(),
                path.canonical_string()
            )
        }
    }

    pub fn to_value(&self, value: &FirestoreValue) -> JsonValue {
        match value.kind() {
            ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
            ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
            ValueKind::Double(double) => json!({ "doubleValue": encode_double(*double) }),
            ValueKind::Timestamp(timestamp) => {
                json!({ "timestampValue": self.to_timestamp(timestamp) })
            }
            ValueKind::String(string) => json!({ "stringValue": string }),
            ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
            ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
            ValueKind::GeoPoint(point) => json!({
                "geoPointValue": {
                    "latitude": point.latitude(),
                    "longitude": point.longitude(),
                }
            }),
            ValueKind::Array(array) => {
                let values: Vec<JsonValue> =
                    array.values().iter().map(|v| self.to_value(v)).collect();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({ "mapValue": { "fields": self.to_fields(map) } }),
            ValueKind::Sentinel(sentinel) => fail(format!(
                "{}() must be sent as a field transform",
                sentinel.method_name()
            )),
        }
    }

    pub fn to_fields(&self, map: &MapValue) -> JsonValue {
        let fields: serde_json::Map<String, JsonValue> = map
            .fields()
            .iter()
            .map(|(key, value)| (key.clone(), self.to_value(value)))
            .collect();
        JsonValue::Object(fields)
    }

    pub fn from_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn from_fields(&self, fields: Option<&JsonValue>) -> FirestoreResult<ObjectValue> {
        let Some(fields) = fields else {
            return Ok(ObjectValue::empty());
        };
        let object = fields
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
        let mut decoded = BTreeMap::new();
        for (key, value) in object {
            decoded.insert(key.clone(), decode_value(value)?);
        }
        Ok(ObjectValue::from_map(decoded))
    }

    pub fn to_timestamp(&self, timestamp: &Timestamp) -> JsonValue {
        if self.use_proto3_json {
            JsonValue::String(format_timestamp(timestamp))
        } else {
            json!({
                "seconds": timestamp.seconds.to_string(),
                "nanos": timestamp.nanos,
            })
        }
    }

    pub fn to_version(&self, version: &SnapshotVersion) -> JsonValue {
        self.to_timestamp(&version.to_timestamp())
    }

    pub fn from_version(&self, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
        parse_timestamp_value(value).map(SnapshotVersion::from_timestamp)
    }

    pub fn to_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.to_version(version) }))
            }
        }
    }

    /// Encodes one entry of a commit request's `writes`.
    pub fn to_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert("update".to_string(), self.to_document(key, value));
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => {
                write.insert("update".to_string(), self.to_document(key, data));
                let paths: Vec<String> =
                    field_mask.iter().map(FieldPath::canonical_string).collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            Mutation::Transform {
                key,
                field_transforms,
            } => {
                let transforms: Vec<JsonValue> = field_transforms
                    .iter()
                    .map(|transform| self.to_field_transform(transform))
                    .collect();
                write.insert(
                    "transform".to_string(),
                    json!({
                        "document": self.to_name(key),
                        "fieldTransforms": transforms,
                    }),
                );
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".to_string(), json!(self.to_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".to_string(), json!(self.to_name(key)));
            }
        }
        if let Some(precondition) = self.to_precondition(&mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    fn to_document(&self, key: &DocumentKey, data: &ObjectValue) -> JsonValue {
        json!({
            "name": self.to_name(key),
            "fields": self.to_fields(data.fields()),
        })
    }

    fn to_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field().canonical_string();
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME",
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": self.to_values(elements) },
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": self.to_values(elements) },
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.to_value(operand),
            }),
        }
    }

    fn to_values(&self, values: &[FirestoreValue]) -> Vec<JsonValue> {
        values.iter().map(|value| self.to_value(value)).collect()
    }

    /// Decodes a `Document` proto.
    pub fn from_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing 'name'"))?;
        let key = self.from_name(name)?;
        let version = match value.get("updateTime") {
            Some(update_time) => self.from_version(update_time)?,
            None => SnapshotVersion::min(),
        };
        let data = self.from_fields(value.get("fields"))?;
        Ok(Document::new(key, version, data))
    }

    /// Decodes one `BatchGetDocumentsResponse` entry.
    pub fn from_batch_get_document(&self, value: &JsonValue) -> FirestoreResult<MaybeDocument> {
        if let Some(found) = value.get("found") {
            return self.from_document(found).map(MaybeDocument::from);
        }
        if let Some(missing) = value.get("missing").and_then(JsonValue::as_str) {
            let key = self.from_name(missing)?;
            let read_time = value
                .get("readTime")
                .ok_or_else(|| invalid_argument("Tried to deserialize a missing document without a read time."))?;
            let version = self.from_version(read_time)?;
            return Ok(MaybeDocument::from(NoDocument::new(key, version)));
        }
        Err(invalid_argument(format!(
            "invalid batch get response: {value}"
        )))
    }

    pub fn from_write_result(
        &self,
        value: &JsonValue,
        commit_time: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let mut version = match value.get("updateTime") {
            Some(update_time) => self.from_version(update_time)?,
            None => commit_time,
        };
        if version.is_min() {
            // Deletes and verifies carry no update time.
            version = commit_time;
        }
        let transform_results = match value.get("transformResults").and_then(JsonValue::as_array) {
            Some(results) if !results.is_empty() => Some(
                results
                    .iter()
                    .map(decode_value)
                    .collect::<FirestoreResult<Vec<_>>>()?,
            ),
            _ => None,
        };
        Ok(MutationResult::new(version, transform_results))
    }

    /// Decodes a `CommitResponse` into one result per write.
    pub fn from_commit_response(&self, value: &JsonValue) -> FirestoreResult<Vec<MutationResult>> {
        let commit_time = value
            .get("commitTime")
            .ok_or_else(|| invalid_argument("Received a write result without a commit time"))?;
        let commit_time = self.from_version(commit_time)?;
        match value.get("writeResults").and_then(JsonValue::as_array) {
            Some(results) => results
                .iter()
                .map(|result| self.from_write_result(result, commit_time))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Encodes a `RunQueryRequest` body for `target`.
    pub fn to_query_target(&self, target: &Target) -> JsonValue {
        let mut structured = serde_json::Map::new();
        let parent = match target.collection_group() {
            Some(group) => {
                structured.insert(
                    "from".to_string(),
                    json!([{ "collectionId": group, "allDescendants": true }]),
                );
                self.to_query_path(target.path())
            }
            None => {
                let collection_id = target.path().last_segment().unwrap_or_default();
                structured.insert(
                    "from".to_string(),
                    json!([{ "collectionId": collection_id }]),
                );
                self.to_query_path(&target.path().without_last())
            }
        };

        if let Some(filter) = self.to_filter(target.filters()) {
            structured.insert("where".to_string(), filter);
        }

        if !target.order_by().is_empty() {
            let orders: Vec<JsonValue> = target.order_by().iter().map(to_order_by).collect();
            structured.insert("orderBy".to_string(), JsonValue::Array(orders));
        }

        if let Some(limit) = target.limit() {
            let limit = if self.use_proto3_json {
                json!(limit)
            } else {
                json!({ "value": limit })
            };
            structured.insert("limit".to_string(), limit);
        }

        if let Some(start) = target.start_at() {
            structured.insert("startAt".to_string(), self.to_cursor(start));
        }
        if let Some(end) = target.end_at() {
            structured.insert("endAt".to_string(), self.to_cursor(end));
        }

        json!({
            "parent": parent,
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    /// Decodes one entry of a commit request's `writes`.
    pub fn from_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = match value.get("currentDocument") {
            Some(current) => self.from_precondition(current)?,
            None => Precondition::None,
        };

        if let Some(update) = value.get("update") {
            let document = self.from_document(update)?;
            let key = document.key().clone();
            let data = document.into_data();
            return match value.get("updateMask") {
                Some(mask) => {
                    let paths = mask
                        .get("fieldPaths")
                        .and_then(JsonValue::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or_default()
                        .iter()
                        .map(|path| {
                            path.as_str()
                                .ok_or_else(|| invalid_argument("fieldPaths must be strings"))
                                .and_then(FieldPath::from_server_format)
                        })
                        .collect::<FirestoreResult<Vec<_>>>()?;
                    Ok(Mutation::Patch {
                        key,
                        data,
                        field_mask: FieldMask::new(paths),
                        precondition,
                    })
                }
                None => Ok(Mutation::Set {
                    key,
                    value: data,
                    precondition,
                }),
            };
        }

        if let Some(transform) = value.get("transform") {
            let key = self.from_name(required_str(transform, "document")?)?;
            let field_transforms = transform
                .get("fieldTransforms")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(from_field_transform)
                .collect::<FirestoreResult<Vec<_>>>()?;
            return Ok(Mutation::Transform {
                key,
                field_transforms,
            });
        }

        if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            return Ok(Mutation::Delete {
                key: self.from_name(name)?,
                precondition,
            });
        }

        if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            return Ok(Mutation::Verify {
                key: self.from_name(name)?,
                precondition,
            });
        }

        Err(invalid_argument(format!("Unknown mutation: {value}")))
    }

    fn from_precondition(&self, value: &JsonValue) -> FirestoreResult<Precondition> {
        if let Some(exists) = value.get("exists").and_then(JsonValue::as_bool) {
            return Ok(Precondition::Exists(exists));
        }
        if let Some(update_time) = value.get("updateTime") {
            return Ok(Precondition::UpdateTime(self.from_version(update_time)?));
        }
        Ok(Precondition::None)
    }

    /// Parses a query parent such as `projects/p/databases/d/documents/rooms/a`.
    pub fn from_query_path(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let root = format!("{}/documents", self.database_name());
        let rest = name
            .strip_prefix(&root)
            .ok_or_else(|| invalid_argument(format!("Invalid query parent: {name}")))?;
        match rest.strip_prefix('/') {
            Some(path) => ResourcePath::from_string(path),
            None if rest.is_empty() => Ok(ResourcePath::root()),
            None => Err(invalid_argument(format!("Invalid query parent: {name}"))),
        }
    }

    /// Decodes a `RunQueryRequest` body back into a [`Target`].
    pub fn from_query_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        let parent = self.from_query_path(required_str(value, "parent")?)?;
        let query = value
            .get("structuredQuery")
            .ok_or_else(|| invalid_argument("RunQueryRequest is missing 'structuredQuery'"))?;

        let from = query
            .get("from")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let (path, collection_group) = match from {
            [] => (parent, None),
            [selector] => {
                let collection_id = required_str(selector, "collectionId")?;
                if selector
                    .get("allDescendants")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false)
                {
                    (parent, Some(collection_id.to_string()))
                } else {
                    (parent.child([collection_id]), None)
                }
            }
            _ => {
                return Err(invalid_argument(
                    "StructuredQuery.from with more than one collection is not supported.",
                ))
            }
        };

        let filters = match query.get("where") {
            Some(filter) => self.from_filter(filter)?,
            None => Vec::new(),
        };

        let order_by = query
            .get("orderBy")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(from_order_by)
            .collect::<FirestoreResult<Vec<_>>>()?;

        let limit = match query.get("limit") {
            Some(JsonValue::Object(wrapper)) => wrapper.get("value").and_then(JsonValue::as_u64),
            Some(other) => other.as_u64(),
            None => None,
        }
        .map(|limit| u32::try_from(limit).unwrap_or(u32::MAX));

        let start_at = query.get("startAt").map(from_cursor).transpose()?;
        let end_at = query.get("endAt").map(from_cursor).transpose()?;

        Ok(Target::new(
            path,
            collection_group,
            order_by,
            filters,
            limit,
            start_at,
            end_at,
        ))
    }

    fn from_filter(&self, value: &JsonValue) -> FirestoreResult<Vec<FieldFilter>> {
        if let Some(composite) = value.get("compositeFilter") {
            let mut filters = Vec::new();
            for nested in composite
                .get("filters")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
            {
                filters.extend(self.from_filter(nested)?);
            }
            return Ok(filters);
        }
        if let Some(filter) = value.get("fieldFilter") {
            let field = from_field_reference(filter.get("field"))?;
            let op = operator_from_name(required_str(filter, "op")?)?;
            let value = decode_value(
                filter
                    .get("value")
                    .ok_or_else(|| invalid_argument("fieldFilter is missing 'value'"))?,
            )?;
            return Ok(vec![FieldFilter::create(field, op, value)]);
        }
        if let Some(filter) = value.get("unaryFilter") {
            let field = from_field_reference(filter.get("field"))?;
            let (op, value) = match required_str(filter, "op")? {
                "IS_NAN" => (Operator::Equal, FirestoreValue::from_double(f64::NAN)),
                "IS_NULL" => (Operator::Equal, FirestoreValue::null()),
                "IS_NOT_NAN" => (Operator::NotEqual, FirestoreValue::from_double(f64::NAN)),
                "IS_NOT_NULL" => (Operator::NotEqual, FirestoreValue::null()),
                other => {
                    return Err(invalid_argument(format!("Unknown unary filter op: {other}")))
                }
            };
            return Ok(vec![FieldFilter::create(field, op, value)]);
        }
        Err(invalid_argument(format!("Unknown filter: {value}")))
    }

    fn to_filter(&self, filters: &[FieldFilter]) -> Option<JsonValue> {
        let mut encoded: Vec<JsonValue> = filters
            .iter()
            .map(|filter| self.to_field_filter(filter))
            .collect();
        match encoded.len() {
            0 => None,
            1 => encoded.pop(),
            _ => Some(json!({
                "compositeFilter": { "op": "AND", "filters": encoded }
            })),
        }
    }

    fn to_field_filter(&self, filter: &FieldFilter) -> JsonValue {
        let field = json!({ "fieldPath": filter.field().canonical_string() });
        let unary = match filter.op() {
            Operator::Equal if filter.value().is_nan() => Some("IS_NAN"),
            Operator::Equal if filter.value().is_null() => Some("IS_NULL"),
            Operator::NotEqual if filter.value().is_nan() => Some("IS_NOT_NAN"),
            Operator::NotEqual if filter.value().is_null() => Some("IS_NOT_NULL"),
            _ => None,
        };
        match unary {
            Some(op) => json!({ "unaryFilter": { "field": field, "op": op } }),
            None => json!({
                "fieldFilter": {
                    "field": field,
                    "op": operator_name(filter.op()),
                    "value": self.to_value(filter.value()),
                }
            }),
        }
    }

    fn to_cursor(&self, bound: &Bound) -> JsonValue {
        json!({
            "before": bound.before(),
            "values": self.to_values(bound.position()),
        })
    }
}

fn to_order_by(order: &OrderBy) -> JsonValue {
    let direction = match order.direction() {
        Direction::Ascending => "ASCENDING",
        Direction::Descending => "DESCENDING",
    };
    json!({
        "field": { "fieldPath": order.field().canonical_string() },
        "direction": direction,
    })
}

fn operator_name(op: Operator) -> &'static str {
    match op {
        Operator::LessThan => "LESS_THAN",
        Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        Operator::Equal => "EQUAL",
        Operator::NotEqual => "NOT_EQUAL",
        Operator::GreaterThan => "GREATER_THAN",
        Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        Operator::ArrayContains => "ARRAY_CONTAINS",
        Operator::In => "IN",
        Operator::NotIn => "NOT_IN",
        Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
    }
}

fn operator_from_name(name: &str) -> FirestoreResult<Operator> {
    Ok(match name {
        "LESS_THAN" => Operator::LessThan,
        "LESS_THAN_OR_EQUAL" => Operator::LessThanOrEqual,
        "EQUAL" => Operator::Equal,
        "NOT_EQUAL" => Operator::NotEqual,
        "GREATER_THAN" => Operator::GreaterThan,
        "GREATER_THAN_OR_EQUAL" => Operator::GreaterThanOrEqual,
        "ARRAY_CONTAINS" => Operator::ArrayContains,
        "IN" => Operator::In,
        "NOT_IN" => Operator::NotIn,
        "ARRAY_CONTAINS_ANY" => Operator::ArrayContainsAny,
        other => return Err(invalid_argument(format!("Unknown filter operator: {other}"))),
    })
}

fn required_str<'a>(value: &'a JsonValue, field: &str) -> FirestoreResult<&'a str> {
    value
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("Expected string field '{field}'")))
}

fn from_field_reference(value: Option<&JsonValue>) -> FirestoreResult<FieldPath> {
    let path = value
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Expected a field reference"))?;
    FieldPath::from_server_format(path)
}

fn from_order_by(value: &JsonValue) -> FirestoreResult<OrderBy> {
    let field = from_field_reference(value.get("field"))?;
    let direction = match value.get("direction").and_then(JsonValue::as_str) {
        Some("DESCENDING") => Direction::Descending,
        _ => Direction::Ascending,
    };
    Ok(OrderBy::new(field, direction))
}

fn from_cursor(value: &JsonValue) -> FirestoreResult<Bound> {
    let before = value
        .get("before")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    let position = value
        .get("values")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(decode_value)
        .collect::<FirestoreResult<Vec<_>>>()?;
    Ok(Bound::new(position, before))
}

fn from_field_transform(value: &JsonValue) -> FirestoreResult<FieldTransform> {
    let field = FieldPath::from_server_format(required_str(value, "fieldPath")?)?;
    let array_values = |entry: &JsonValue| -> FirestoreResult<Vec<FirestoreValue>> {
        entry
            .get("values")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(decode_value)
            .collect()
    };
    let operation = if let Some(server_value) = value.get("setToServerValue") {
        if server_value.as_str() != Some("REQUEST_TIME") {
            return Err(invalid_argument(format!(
                "Unknown server value transform: {server_value}"
            )));
        }
        TransformOperation::ServerTimestamp
    } else if let Some(append) = value.get("appendMissingElements") {
        TransformOperation::ArrayUnion(array_values(append)?)
    } else if let Some(remove) = value.get("removeAllFromArray") {
        TransformOperation::ArrayRemove(array_values(remove)?)
    } else if let Some(operand) = value.get("increment") {
        TransformOperation::NumericIncrement(decode_value(operand)?)
    } else {
        return Err(invalid_argument(format!("Unknown field transform: {value}")));
    };
    Ok(FieldTransform::new(field, operation))
}

/// JSON has no literal for NaN or the infinities, so those travel as the
/// strings the proto3 mapping defines.
fn encode_double(value: f64) -> JsonValue {
    if value.is_nan() {
        JsonValue::String("NaN".to_string())
    } else if value == f64::INFINITY {
        JsonValue::String("Infinity".to_string())
    } else if value == f64::NEG_INFINITY {
        JsonValue::String("-Infinity".to_string())
    } else {
        json!(value)
    }
}

fn decode_double(value: &JsonValue) -> FirestoreResult<f64> {
    match value {
        JsonValue::Number(number) => number
            .as_f64()
            .ok_or_else(|| invalid_argument("Invalid doubleValue")),
        JsonValue::String(text) => match text.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => other
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}"))),
        },
        _ => Err(invalid_argument("doubleValue must be a number or string")),
    }
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        return Ok(FirestoreValue::from_double(decode_double(double_value)?));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        return Ok(FirestoreValue::from_timestamp(parse_timestamp_value(
            timestamp_value,
        )?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BASE64_STANDARD
            .decode(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(BytesValue::from(decoded)));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(
            latitude, longitude,
        )?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        let mut fields = BTreeMap::new();
        if let Some(entries) = map_value.get("fields").and_then(JsonValue::as_object) {
            for (key, value) in entries {
                fields.insert(key.clone(), decode_value(value)?);
            }
        }
        return Ok(FirestoreValue::from_map(fields));
    }

    Err(invalid_argument(format!("Unknown Firestore value type: {value}")))
}

fn format_timestamp(timestamp: &Timestamp) -> String {
    match Utc
        .timestamp_opt(timestamp.seconds, timestamp.nanos as u32)
        .single()
    {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => fail(format!("Timestamp out of range: {timestamp:?}")),
    }
}

fn parse_timestamp_value(value: &JsonValue) -> FirestoreResult<Timestamp> {
    match value {
        JsonValue::String(text) => {
            let datetime = DateTime::parse_from_rfc3339(text)
                .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
            let datetime = datetime.with_timezone(&Utc);
            Ok(Timestamp::new(
                datetime.timestamp(),
                datetime.timestamp_subsec_nanos() as i32,
            ))
        }
        JsonValue::Object(object) => {
            let seconds = match object.get("seconds") {
                Some(JsonValue::String(text)) => i64::from_str(text)
                    .map_err(|err| invalid_argument(format!("Invalid timestamp seconds: {err}")))?,
                Some(JsonValue::Number(number)) => number
                    .as_i64()
                    .ok_or_else(|| invalid_argument("Invalid timestamp seconds"))?,
                _ => 0,
            };
            let nanos = object
                .get("nanos")
                .and_then(JsonValue::as_i64)
                .unwrap_or(0);
            Ok(Timestamp::new(seconds, nanos as i32))
        }
        _ => Err(invalid_argument("Timestamp must be a string or an object")),
    }
}
