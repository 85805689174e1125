use std::collections::BTreeMap;

use crate::firestore::model::{Document, DocumentKey, IntoFieldPath, SnapshotVersion};
use crate::firestore::value::FirestoreValue;

use super::database::Firestore;
use super::reference::DocumentReference;

/// The contents of a document as read from the backend, or the fact that it
/// does not exist.
#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    firestore: Firestore,
    key: DocumentKey,
    document: Option<Document>,
}

impl DocumentSnapshot {
    pub(crate) fn new(firestore: Firestore, key: DocumentKey, document: Option<Document>) -> Self {
        Self {
            firestore,
            key,
            document,
        }
    }

    /// Returns whether the document exists on the backend.
    pub fn exists(&self) -> bool {
        self.document.is_some()
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn reference(&self) -> DocumentReference {
        DocumentReference::from_key(self.firestore.clone(), self.key.clone())
    }

    /// The top-level fields of the document, `None` if it does not exist.
    pub fn data(&self) -> Option<&BTreeMap<String, FirestoreValue>> {
        self.document
            .as_ref()
            .map(|document| document.data().fields().fields())
    }

    /// The value at `field`, `None` if the document or the field is missing
    /// or the path is invalid.
    pub fn get(&self, field: impl IntoFieldPath) -> Option<&FirestoreValue> {
        let path = field.into_field_path().ok()?;
        self.document.as_ref()?.field(&path)
    }

    /// The time the document was last written; `None` for missing documents.
    pub fn update_time(&self) -> Option<SnapshotVersion> {
        self.document.as_ref().map(Document::version)
    }

    pub(crate) fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, ObjectValue, Timestamp};
    use crate::firestore::remote::InMemoryConnection;

    #[tokio::test]
    async fn reads_nested_fields() {
        let firestore = Firestore::in_memory(InMemoryConnection::new(DatabaseId::default("p")));
        let key = DocumentKey::from_string("cities/sf").unwrap();
        let mut inner = BTreeMap::new();
        inner.insert("pop".to_string(), FirestoreValue::from_integer(800));
        let mut fields = BTreeMap::new();
        fields.insert("stats".to_string(), FirestoreValue::from_map(inner));
        let version = SnapshotVersion::from_timestamp(Timestamp::new(10, 0));
        let document = Document::new(key.clone(), version, ObjectValue::from_map(fields));

        let snapshot = DocumentSnapshot::new(firestore.clone(), key.clone(), Some(document));
        assert!(snapshot.exists());
        assert_eq!(snapshot.get("stats.pop"), Some(&FirestoreValue::from_integer(800)));
        assert_eq!(snapshot.get("stats.area"), None);
        assert_eq!(snapshot.update_time(), Some(version));
        assert_eq!(snapshot.reference().path().canonical_string(), "cities/sf");

        let missing = DocumentSnapshot::new(firestore, key, None);
        assert!(!missing.exists());
        assert!(missing.data().is_none());
        assert_eq!(missing.id(), "sf");
    }
}
