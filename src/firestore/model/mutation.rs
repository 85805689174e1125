use crate::firestore::model::{
    Document, DocumentKey, FieldMask, FieldTransform, MaybeDocument, NoDocument, ObjectValue,
    SnapshotVersion, Timestamp, UnknownDocument,
};
use crate::firestore::value::FirestoreValue;
use crate::util::assert::{fail, hard_assert};

/// A server-checked condition attached to a mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    /// The document must (`true`) or must not (`false`) exist.
    Exists(bool),
    /// The document must exist at exactly this version.
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    /// Whether the precondition holds for the given cached state.
    pub fn is_valid_for(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => {
                *exists == maybe_doc.is_some_and(MaybeDocument::is_found_document)
            }
            Precondition::UpdateTime(version) => matches!(
                maybe_doc,
                Some(MaybeDocument::Document(doc)) if doc.version() == *version
            ),
        }
    }
}

/// The backend's acknowledgement of a single write.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    /// The commit version of the document.
    pub version: SnapshotVersion,
    /// One entry per field transform of a transform mutation, `None` for
    /// mutations without transforms.
    pub transform_results: Option<Vec<FirestoreValue>>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Option<Vec<FirestoreValue>>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

/// A write to a single document.
///
/// | Mutation  | on `Document(v)`  | on `NoDocument(v)` | on absent        |
/// |-----------|-------------------|--------------------|------------------|
/// | Set       | `Document(v)`     | `Document(min)`    | `Document(min)`  |
/// | Patch     | `Document(v)`     | unchanged          | unchanged        |
/// | Transform | `Document(v)`     | unchanged          | unchanged        |
/// | Delete    | `NoDocument(min)` | `NoDocument(min)`  | `NoDocument(min)`|
///
/// Patch rows assume the `Exists(true)` precondition that updates carry.
/// `Verify` is only ever sent inside a transaction commit and never applied
/// locally.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
    },
    /// Fields in the mask and in `data` are written, fields in the mask but
    /// missing from `data` are deleted, everything else is untouched.
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        field_mask: FieldMask,
        precondition: Precondition,
    },
    /// Always carries the `Exists(true)` precondition.
    Transform {
        key: DocumentKey,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Transform { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition,
            Mutation::Transform { .. } => Precondition::Exists(true),
        }
    }

    /// Applies the mutation to the cached state of its document to produce
    /// the latency-compensated local view. `base_doc` supplies previous values
    /// for transforms when `maybe_doc` lacks them.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        base_doc: Option<&MaybeDocument>,
        local_write_time: Timestamp,
    ) -> Option<MaybeDocument> {
        self.verify_key_matches(maybe_doc);

        if !self.precondition().is_valid_for(maybe_doc) {
            return maybe_doc.cloned();
        }

        match self {
            Mutation::Set { key, value, .. } => Some(
                Document::new(key.clone(), post_mutation_version(maybe_doc), value.clone())
                    .with_local_mutations()
                    .into(),
            ),
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => Some(
                Document::new(
                    key.clone(),
                    post_mutation_version(maybe_doc),
                    patch_document(maybe_doc, data, field_mask),
                )
                .with_local_mutations()
                .into(),
            ),
            Mutation::Transform {
                key,
                field_transforms,
            } => {
                let doc = require_document(maybe_doc);
                let results: Vec<FirestoreValue> = field_transforms
                    .iter()
                    .map(|transform| {
                        let previous = doc
                            .field(transform.field())
                            .or_else(|| {
                                base_doc
                                    .and_then(MaybeDocument::as_document)
                                    .and_then(|base| base.field(transform.field()))
                            });
                        transform
                            .operation()
                            .apply_to_local_view(previous, local_write_time)
                    })
                    .collect();
                Some(
                    Document::new(
                        key.clone(),
                        doc.version(),
                        transform_object(doc.data(), field_transforms, results),
                    )
                    .with_local_mutations()
                    .into(),
                )
            }
            Mutation::Delete { key, .. } => {
                Some(NoDocument::new(key.clone(), SnapshotVersion::min()).into())
            }
            Mutation::Verify { .. } => fail("Verify mutations are only used in transactions."),
        }
    }

    /// Applies the mutation to the cached state once the backend acknowledged
    /// it with `result`.
    pub fn apply_to_remote_document(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        result: &MutationResult,
    ) -> MaybeDocument {
        self.verify_key_matches(maybe_doc);

        match self {
            Mutation::Set { key, value, .. } => {
                hard_assert(
                    result.transform_results.is_none(),
                    "Transform results received by a set mutation.",
                );
                Document::new(key.clone(), result.version, value.clone())
                    .with_committed_mutations()
                    .into()
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                precondition,
            } => {
                hard_assert(
                    result.transform_results.is_none(),
                    "Transform results received by a patch mutation.",
                );
                if !precondition.is_valid_for(maybe_doc) {
                    return UnknownDocument::new(key.clone(), result.version).into();
                }
                Document::new(
                    key.clone(),
                    result.version,
                    patch_document(maybe_doc, data, field_mask),
                )
                .with_committed_mutations()
                .into()
            }
            Mutation::Transform {
                key,
                field_transforms,
            } => {
                let server_results = match &result.transform_results {
                    Some(results) => results,
                    None => fail("Transform results missing for a transform mutation."),
                };
                if !self.precondition().is_valid_for(maybe_doc) {
                    return UnknownDocument::new(key.clone(), result.version).into();
                }
                let doc = require_document(maybe_doc);
                hard_assert(
                    server_results.len() == field_transforms.len(),
                    format!(
                        "server transform result count ({}) should match field transform count ({})",
                        server_results.len(),
                        field_transforms.len()
                    ),
                );
                let results: Vec<FirestoreValue> = field_transforms
                    .iter()
                    .zip(server_results.iter())
                    .map(|(transform, server_result)| {
                        transform.operation().apply_to_remote_document(
                            doc.field(transform.field()),
                            Some(server_result.clone()),
                        )
                    })
                    .collect();
                Document::new(
                    key.clone(),
                    result.version,
                    transform_object(doc.data(), field_transforms, results),
                )
                .with_committed_mutations()
                .into()
            }
            Mutation::Delete { key, .. } => {
                hard_assert(
                    result.transform_results.is_none(),
                    "Transform results received by a delete mutation.",
                );
                NoDocument::new(key.clone(), result.version)
                    .with_committed_mutations()
                    .into()
            }
            Mutation::Verify { .. } => fail("Verify mutations are only used in transactions."),
        }
    }

    /// For transform mutations, the values the transforms operate on, taken
    /// from `maybe_doc`. `None` when no transform needs a base value.
    pub fn extract_base_value(&self, maybe_doc: Option<&MaybeDocument>) -> Option<ObjectValue> {
        let Mutation::Transform {
            field_transforms, ..
        } = self
        else {
            return None;
        };

        let doc = maybe_doc.and_then(MaybeDocument::as_document);
        let mut builder: Option<_> = None;
        for transform in field_transforms {
            let existing = doc.and_then(|doc| doc.field(transform.field()));
            if let Some(base) = transform.operation().compute_base_value(existing) {
                builder
                    .get_or_insert_with(|| ObjectValue::empty().to_builder())
                    .set(transform.field(), base);
            }
        }
        builder.map(|builder| builder.build())
    }

    fn verify_key_matches(&self, maybe_doc: Option<&MaybeDocument>) {
        if let Some(doc) = maybe_doc {
            hard_assert(
                doc.key() == self.key(),
                "Can only apply a mutation to a document with the same key",
            );
        }
    }
}

fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.version(),
        _ => SnapshotVersion::min(),
    }
}

fn require_document(maybe_doc: Option<&MaybeDocument>) -> &Document {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc,
        other => fail(format!("Unknown MaybeDocument type {other:?}")),
    }
}

fn patch_document(
    maybe_doc: Option<&MaybeDocument>,
    data: &ObjectValue,
    field_mask: &FieldMask,
) -> ObjectValue {
    let base = match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.data().clone(),
        _ => ObjectValue::empty(),
    };
    let mut builder = base.to_builder();
    for path in field_mask.iter().filter(|path| !path.is_empty()) {
        match data.field(path) {
            Some(value) => builder.set(path, value.clone()),
            None => builder.delete(path),
        };
    }
    builder.build()
}

fn transform_object(
    data: &ObjectValue,
    field_transforms: &[FieldTransform],
    results: Vec<FirestoreValue>,
) -> ObjectValue {
    let mut builder = data.to_builder();
    for (transform, result) in field_transforms.iter().zip(results) {
        builder.set(transform.field(), result);
    }
    builder.build()
}
