use crate::firestore::model::{DocumentKey, FieldPath, ObjectValue, SnapshotVersion};
use crate::firestore::value::FirestoreValue;

/// A document known to exist, with its data at `version`.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: SnapshotVersion,
    data: ObjectValue,
    has_local_mutations: bool,
    has_committed_mutations: bool,
}

impl Document {
    pub fn new(key: DocumentKey, version: SnapshotVersion, data: ObjectValue) -> Self {
        Self {
            key,
            version,
            data,
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn with_local_mutations(mut self) -> Self {
        self.has_local_mutations = true;
        self
    }

    pub fn with_committed_mutations(mut self) -> Self {
        self.has_committed_mutations = true;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    pub fn into_data(self) -> ObjectValue {
        self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.has_local_mutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }
}

/// A document known not to exist as of `version`. A version of
/// [`SnapshotVersion::min`] means the time of deletion is unknown.
#[derive(Clone, Debug, PartialEq)]
pub struct NoDocument {
    key: DocumentKey,
    version: SnapshotVersion,
    has_committed_mutations: bool,
}

impl NoDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            version,
            has_committed_mutations: false,
        }
    }

    pub fn with_committed_mutations(mut self) -> Self {
        self.has_committed_mutations = true;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }
}

/// A document known to exist at `version` whose contents are unknown, e.g.
/// after a committed patch whose base document was not cached.
#[derive(Clone, Debug, PartialEq)]
pub struct UnknownDocument {
    key: DocumentKey,
    version: SnapshotVersion,
}

impl UnknownDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self { key, version }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MaybeDocument {
    Document(Document),
    NoDocument(NoDocument),
    UnknownDocument(UnknownDocument),
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document(doc) => doc.key(),
            MaybeDocument::NoDocument(doc) => doc.key(),
            MaybeDocument::UnknownDocument(doc) => doc.key(),
        }
    }

    pub fn version(&self) -> SnapshotVersion {
        match self {
            MaybeDocument::Document(doc) => doc.version(),
            MaybeDocument::NoDocument(doc) => doc.version(),
            MaybeDocument::UnknownDocument(doc) => doc.version(),
        }
    }

    /// Whether local or unacknowledged writes shaped this state.
    pub fn has_pending_writes(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => {
                doc.has_local_mutations() || doc.has_committed_mutations()
            }
            MaybeDocument::NoDocument(doc) => doc.has_committed_mutations(),
            MaybeDocument::UnknownDocument(_) => true,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn into_document(self) -> Option<Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn is_found_document(&self) -> bool {
        matches!(self, MaybeDocument::Document(_))
    }
}

impl From<Document> for MaybeDocument {
    fn from(doc: Document) -> Self {
        MaybeDocument::Document(doc)
    }
}

impl From<NoDocument> for MaybeDocument {
    fn from(doc: NoDocument) -> Self {
        MaybeDocument::NoDocument(doc)
    }
}

impl From<UnknownDocument> for MaybeDocument {
    fn from(doc: UnknownDocument) -> Self {
        MaybeDocument::UnknownDocument(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    #[test]
    fn exposes_common_fields() {
        let version = SnapshotVersion::from_timestamp(Timestamp::new(5, 0));
        let doc: MaybeDocument = Document::new(key(), version, ObjectValue::empty()).into();
        assert_eq!(doc.key(), &key());
        assert_eq!(doc.version(), version);
        assert!(doc.is_found_document());
        assert!(!doc.has_pending_writes());

        let missing: MaybeDocument = NoDocument::new(key(), SnapshotVersion::min()).into();
        assert!(missing.as_document().is_none());
        assert!(missing.version().is_min());
    }

    #[test]
    fn pending_write_flags() {
        let local = Document::new(key(), SnapshotVersion::min(), ObjectValue::empty())
            .with_local_mutations();
        assert!(MaybeDocument::from(local).has_pending_writes());

        let deleted = NoDocument::new(key(), SnapshotVersion::min()).with_committed_mutations();
        assert!(MaybeDocument::from(deleted).has_pending_writes());

        let unknown = UnknownDocument::new(key(), SnapshotVersion::min());
        assert!(MaybeDocument::from(unknown).has_pending_writes());
    }
}
