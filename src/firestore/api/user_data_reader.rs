use std::collections::BTreeMap;

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, FieldTransform, IntoFieldPath, Mutation,
    ObjectValue, Precondition, ResourcePath, Timestamp, TransformOperation,
};
use crate::firestore::value::values::ref_value;
use crate::firestore::value::{FirestoreValue, SentinelValue, ValueKind};
use crate::util::assert::{fail, hard_assert};

/// Options that configure `set` style writes.
///
/// With `merge` the write only touches fields present in the data; with
/// `merge_fields` it only touches the listed fields.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    pub merge: bool,
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    pub fn merge_fields<I, P>(fields: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: IntoFieldPath,
    {
        let fields = fields
            .into_iter()
            .map(IntoFieldPath::into_field_path)
            .collect::<FirestoreResult<Vec<_>>>()?;
        Ok(Self {
            merge: false,
            merge_fields: Some(fields),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

/// Where the data being parsed came from, which decides what it may contain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UserDataSource {
    Set,
    MergeSet,
    /// Update data, where keys are field paths.
    Update,
    /// A query argument such as a filter value.
    Argument,
    /// The array operand of an `in`/`not-in` filter, which may hold arrays.
    ArrayArgument,
}

impl UserDataSource {
    fn is_write(self) -> bool {
        matches!(
            self,
            UserDataSource::Set | UserDataSource::MergeSet | UserDataSource::Update
        )
    }
}

/// Result of parsing `set` data.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedSetData {
    pub data: ObjectValue,
    /// `Some` for merging sets, which become patches.
    pub field_mask: Option<FieldMask>,
    pub field_transforms: Vec<FieldTransform>,
}

impl ParsedSetData {
    /// A set (or a patch for merges), followed by a transform mutation when
    /// the data contained transform sentinels.
    pub fn to_mutations(&self, key: DocumentKey, precondition: Precondition) -> Vec<Mutation> {
        let mut mutations = Vec::with_capacity(2);
        match &self.field_mask {
            Some(mask) => mutations.push(Mutation::Patch {
                key: key.clone(),
                data: self.data.clone(),
                field_mask: mask.clone(),
                precondition,
            }),
            None => mutations.push(Mutation::Set {
                key: key.clone(),
                value: self.data.clone(),
                precondition,
            }),
        }
        if !self.field_transforms.is_empty() {
            mutations.push(Mutation::Transform {
                key,
                field_transforms: self.field_transforms.clone(),
            });
        }
        mutations
    }
}

/// Result of parsing `update` data.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedUpdateData {
    pub data: ObjectValue,
    pub field_mask: FieldMask,
    pub field_transforms: Vec<FieldTransform>,
}

impl ParsedUpdateData {
    pub fn to_mutations(&self, key: DocumentKey, precondition: Precondition) -> Vec<Mutation> {
        let mut mutations = vec![Mutation::Patch {
            key: key.clone(),
            data: self.data.clone(),
            field_mask: self.field_mask.clone(),
            precondition,
        }];
        if !self.field_transforms.is_empty() {
            mutations.push(Mutation::Transform {
                key,
                field_transforms: self.field_transforms.clone(),
            });
        }
        mutations
    }
}

#[derive(Clone)]
struct ParseContext<'a> {
    data_source: UserDataSource,
    method_name: &'a str,
    target_doc: Option<&'a DocumentKey>,
    /// `None` inside arrays.
    path: Option<FieldPath>,
    array_element: bool,
    database_id: &'a DatabaseId,
}

#[derive(Default)]
struct ParseState {
    field_transforms: Vec<FieldTransform>,
    field_mask: Vec<FieldPath>,
}

impl ParseState {
    /// Whether `path` or one of its children was written or transformed.
    fn contains(&self, path: &FieldPath) -> bool {
        self.field_mask.iter().any(|field| path.is_prefix_of(field))
            || self
                .field_transforms
                .iter()
                .any(|transform| path.is_prefix_of(transform.field()))
    }
}

impl<'a> ParseContext<'a> {
    fn error(&self, reason: impl AsRef<str>) -> FirestoreError {
        create_error(
            reason.as_ref(),
            self.method_name,
            self.path.as_ref(),
            self.target_doc,
        )
    }

    fn child_for_field(&self, field: &str) -> FirestoreResult<Self> {
        let mut child = self.clone();
        child.path = self.path.as_ref().map(|path| path.child(field));
        child.array_element = false;
        child.validate_segment(field)?;
        Ok(child)
    }

    fn child_for_field_path(&self, field: &FieldPath) -> FirestoreResult<Self> {
        let mut child = self.clone();
        child.path = self.path.as_ref().map(|path| path.append(field));
        child.array_element = false;
        for segment in field.segments() {
            child.validate_segment(segment)?;
        }
        Ok(child)
    }

    fn child_for_array(&self) -> Self {
        let mut child = self.clone();
        child.path = None;
        child.array_element = true;
        child
    }

    fn validate_segment(&self, segment: &str) -> FirestoreResult<()> {
        if segment.is_empty() {
            return Err(self.error("Document fields must not be empty"));
        }
        if self.data_source.is_write() && is_reserved_field_name(segment) {
            return Err(self.error("Document fields cannot begin and end with \"__\""));
        }
        Ok(())
    }
}

fn is_reserved_field_name(segment: &str) -> bool {
    segment.len() >= 4 && segment.starts_with("__") && segment.ends_with("__")
}

fn create_error(
    reason: &str,
    method_name: &str,
    path: Option<&FieldPath>,
    target_doc: Option<&DocumentKey>,
) -> FirestoreError {
    let mut message = format!("Function {method_name}() called with invalid data. {reason}");
    let path = path.filter(|path| !path.is_empty());
    if path.is_some() || target_doc.is_some() {
        message.push_str(" (found");
        if let Some(path) = path {
            message.push_str(&format!(" in field {}", path.canonical_string()));
        }
        if let Some(doc) = target_doc {
            message.push_str(&format!(" in document {doc}"));
        }
        message.push(')');
    }
    invalid_argument(message)
}

/// Converts user input into documents, mutations and query values.
#[derive(Clone, Debug)]
pub struct UserDataReader {
    database_id: DatabaseId,
}

impl UserDataReader {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    fn context<'a>(
        &'a self,
        data_source: UserDataSource,
        method_name: &'a str,
        target_doc: Option<&'a DocumentKey>,
    ) -> ParseContext<'a> {
        ParseContext {
            data_source,
            method_name,
            target_doc,
            path: Some(FieldPath::empty()),
            array_element: false,
            database_id: &self.database_id,
        }
    }

    pub fn parse_set_data(
        &self,
        method_name: &str,
        target_doc: &DocumentKey,
        input: BTreeMap<String, FirestoreValue>,
        options: &SetOptions,
    ) -> FirestoreResult<ParsedSetData> {
        let source = if options.is_merge() {
            UserDataSource::MergeSet
        } else {
            UserDataSource::Set
        };
        let context = self.context(source, method_name, Some(target_doc));
        let mut state = ParseState::default();
        let data = parse_object(&input, &context, &mut state)?;

        let (field_mask, field_transforms) = if options.merge {
            (
                Some(FieldMask::new(state.field_mask)),
                state.field_transforms,
            )
        } else if let Some(merge_fields) = &options.merge_fields {
            let mut validated: Vec<FieldPath> = Vec::new();
            for field in merge_fields {
                if !state.contains(field) {
                    return Err(invalid_argument(format!(
                        "Field '{field}' is specified in your field mask but missing from your input data."
                    )));
                }
                if !validated.contains(field) {
                    validated.push(field.clone());
                }
            }
            let mask = FieldMask::new(validated);
            let transforms = state
                .field_transforms
                .into_iter()
                .filter(|transform| mask.covers(transform.field()))
                .collect();
            (Some(mask), transforms)
        } else {
            (None, state.field_transforms)
        };

        Ok(ParsedSetData {
            data: ObjectValue::from_map(data),
            field_mask,
            field_transforms,
        })
    }

    /// Parses update data whose keys are dot-separated field paths.
    pub fn parse_update_data(
        &self,
        method_name: &str,
        target_doc: &DocumentKey,
        input: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<ParsedUpdateData> {
        let context = self.context(UserDataSource::Update, method_name, Some(target_doc));
        let mut state = ParseState::default();
        let mut mask_paths = Vec::new();
        let mut builder = ObjectValue::empty().to_builder();

        for (key, value) in &input {
            let path = field_path_from_dot_separated(method_name, key, target_doc)?;
            let child = context.child_for_field_path(&path)?;
            if matches!(value.as_sentinel(), Some(SentinelValue::Delete)) {
                mask_paths.push(path);
            } else if let Some(parsed) = parse_data(value, &child, &mut state)? {
                builder.set(&path, parsed);
                mask_paths.push(path);
            }
        }

        Ok(ParsedUpdateData {
            data: builder.build(),
            field_mask: FieldMask::new(mask_paths),
            field_transforms: state.field_transforms,
        })
    }

    /// Parses `field, value` pairs. When a field appears more than once the
    /// last occurrence wins.
    pub fn parse_update_varargs<P: IntoFieldPath>(
        &self,
        method_name: &str,
        target_doc: &DocumentKey,
        fields_and_values: Vec<(P, FirestoreValue)>,
    ) -> FirestoreResult<ParsedUpdateData> {
        if fields_and_values.is_empty() {
            return Err(invalid_argument(format!(
                "Function {method_name}() needs to be called with an even number of arguments that alternate between field names and values."
            )));
        }

        let context = self.context(UserDataSource::Update, method_name, Some(target_doc));
        let mut keys = Vec::with_capacity(fields_and_values.len());
        let mut values = Vec::with_capacity(fields_and_values.len());
        for (field, value) in fields_and_values {
            let path = field.into_field_path().map_err(|err| {
                create_error(err.message(), method_name, None, Some(target_doc))
            })?;
            keys.push(path);
            values.push(value);
        }

        let mut state = ParseState::default();
        let mut mask_paths: Vec<FieldPath> = Vec::new();
        let mut builder = ObjectValue::empty().to_builder();
        for (path, value) in keys.iter().zip(values.iter()).rev() {
            if mask_paths.contains(path) {
                continue;
            }
            let child = context.child_for_field_path(path)?;
            if matches!(value.as_sentinel(), Some(SentinelValue::Delete)) {
                mask_paths.push(path.clone());
            } else if let Some(parsed) = parse_data(value, &child, &mut state)? {
                builder.set(path, parsed);
                mask_paths.push(path.clone());
            }
        }

        Ok(ParsedUpdateData {
            data: builder.build(),
            field_mask: FieldMask::new(mask_paths),
            field_transforms: state.field_transforms,
        })
    }

    /// Parses a filter or cursor value. Arrays nested inside arrays are only
    /// accepted when `allow_arrays` is set (operands of `in` and `not-in`).
    pub fn parse_query_value(
        &self,
        method_name: &str,
        input: &FirestoreValue,
        allow_arrays: bool,
    ) -> FirestoreResult<FirestoreValue> {
        let source = if allow_arrays {
            UserDataSource::ArrayArgument
        } else {
            UserDataSource::Argument
        };
        let context = self.context(source, method_name, None);
        let mut state = ParseState::default();
        let parsed = parse_data(input, &context, &mut state)?;
        hard_assert(
            state.field_transforms.is_empty(),
            "Field transforms should have been disallowed.",
        );
        match parsed {
            Some(value) => Ok(value),
            None => fail("Parsed data should not be null."),
        }
    }
}

fn field_path_from_dot_separated(
    method_name: &str,
    path: &str,
    target_doc: &DocumentKey,
) -> FirestoreResult<FieldPath> {
    FieldPath::from_dot_separated(path)
        .map_err(|err| create_error(err.message(), method_name, None, Some(target_doc)))
}

fn parse_data(
    input: &FirestoreValue,
    context: &ParseContext<'_>,
    state: &mut ParseState,
) -> FirestoreResult<Option<FirestoreValue>> {
    match input.kind() {
        ValueKind::Map(map) => Ok(Some(FirestoreValue::from_map(parse_object(
            map.fields(),
            context,
            state,
        )?))),
        ValueKind::Sentinel(sentinel) => {
            parse_sentinel(sentinel, context, state)?;
            Ok(None)
        }
        ValueKind::Array(array) => {
            if let Some(path) = &context.path {
                state.field_mask.push(path.clone());
            }
            if context.array_element && context.data_source != UserDataSource::ArrayArgument {
                return Err(context.error("Nested arrays are not supported"));
            }
            let element_context = context.child_for_array();
            let mut values = Vec::with_capacity(array.len());
            for element in array.values() {
                let parsed = parse_data(element, &element_context, state)?;
                values.push(parsed.unwrap_or_else(FirestoreValue::null));
            }
            Ok(Some(FirestoreValue::from_array(values)))
        }
        _ => {
            if let Some(path) = &context.path {
                state.field_mask.push(path.clone());
            }
            parse_scalar(input, context).map(Some)
        }
    }
}

fn parse_object(
    fields: &BTreeMap<String, FirestoreValue>,
    context: &ParseContext<'_>,
    state: &mut ParseState,
) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
    let mut parsed_fields = BTreeMap::new();
    if fields.is_empty() {
        // Empty maps still land in the mask so the backend creates them.
        if let Some(path) = context.path.as_ref().filter(|path| !path.is_empty()) {
            state.field_mask.push(path.clone());
        }
        return Ok(parsed_fields);
    }
    for (key, value) in fields {
        let child = context.child_for_field(key)?;
        if let Some(parsed) = parse_data(value, &child, state)? {
            parsed_fields.insert(key.clone(), parsed);
        }
    }
    Ok(parsed_fields)
}

fn parse_sentinel(
    sentinel: &SentinelValue,
    context: &ParseContext<'_>,
    state: &mut ParseState,
) -> FirestoreResult<()> {
    let method = sentinel.method_name();
    if !context.data_source.is_write() {
        return Err(context.error(format!(
            "{method}() can only be used with update() and set()"
        )));
    }
    let path = match &context.path {
        Some(path) => path.clone(),
        None => {
            return Err(context.error(format!(
                "{method}() is not currently supported inside arrays"
            )))
        }
    };

    let operation = match sentinel {
        SentinelValue::Delete => {
            return match context.data_source {
                UserDataSource::MergeSet => {
                    state.field_mask.push(path);
                    Ok(())
                }
                UserDataSource::Update => Err(context.error(format!(
                    "{method}() can only appear at the top level of your update data"
                ))),
                _ => Err(context.error(format!(
                    "{method}() cannot be used with set() unless you pass {{merge:true}}"
                ))),
            };
        }
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => {
            TransformOperation::ArrayUnion(parse_sentinel_elements(method, elements, context)?)
        }
        SentinelValue::ArrayRemove(elements) => {
            TransformOperation::ArrayRemove(parse_sentinel_elements(method, elements, context)?)
        }
        SentinelValue::NumericIncrement(operand) => {
            if !operand.is_number() {
                return Err(context.error(format!("{method}() requires a numeric operand")));
            }
            TransformOperation::NumericIncrement(operand.as_ref().clone())
        }
    };
    state
        .field_transforms
        .push(FieldTransform::new(path, operation));
    Ok(())
}

/// Elements of `array_union`/`array_remove` parse as query-style arguments:
/// no nested arrays and no sentinels.
fn parse_sentinel_elements(
    method: &str,
    elements: &[FirestoreValue],
    context: &ParseContext<'_>,
) -> FirestoreResult<Vec<FirestoreValue>> {
    let element_context = ParseContext {
        data_source: UserDataSource::Argument,
        method_name: method,
        target_doc: context.target_doc,
        path: None,
        array_element: true,
        database_id: context.database_id,
    };
    let mut state = ParseState::default();
    elements
        .iter()
        .map(|element| {
            parse_data(element, &element_context, &mut state)
                .map(|parsed| parsed.unwrap_or_else(FirestoreValue::null))
        })
        .collect()
}

fn parse_scalar(
    input: &FirestoreValue,
    context: &ParseContext<'_>,
) -> FirestoreResult<FirestoreValue> {
    match input.kind() {
        // Timestamps are stored with microsecond precision.
        ValueKind::Timestamp(timestamp) => Ok(FirestoreValue::from_timestamp(
            Timestamp::new(timestamp.seconds, timestamp.nanos / 1_000 * 1_000),
        )),
        ValueKind::Reference(name) => parse_reference(name, context),
        _ => Ok(input.clone()),
    }
}

/// Accepts either a full resource name, which must point into this
/// database, or a document path relative to the database root.
fn parse_reference(name: &str, context: &ParseContext<'_>) -> FirestoreResult<FirestoreValue> {
    if !name.starts_with("projects/") {
        let key = DocumentKey::from_string(name).map_err(|err| context.error(err.message()))?;
        return Ok(ref_value(context.database_id, &key));
    }

    let segments: Vec<&str> = name.split('/').collect();
    if segments.len() < 5 || segments[2] != "databases" || segments[4] != "documents" {
        return Err(context.error(format!("Invalid document reference ({name})")));
    }
    let other = DatabaseId::new(segments[1], segments[3]);
    if &other != context.database_id {
        return Err(context.error(format!(
            "Document reference is for database {}/{} but should be for database {}/{}",
            other.project_id(),
            other.database(),
            context.database_id.project_id(),
            context.database_id.database()
        )));
    }
    let key = DocumentKey::from_path(ResourcePath::from_segments(segments[5..].iter().copied()))
        .map_err(|err| context.error(err.message()))?;
    Ok(ref_value(context.database_id, &key))
}
