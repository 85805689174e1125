use std::fmt::{Display, Formatter};

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::firestore::core;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, ResourcePath};
use crate::firestore::value::values::ref_value;
use crate::firestore::value::FirestoreValue;

use super::database::Firestore;
use super::query::Query;

const AUTO_ID_LENGTH: usize = 20;

#[derive(Clone, Debug)]
pub struct CollectionReference {
    firestore: Firestore,
    path: ResourcePath,
}

impl CollectionReference {
    pub(crate) fn new(firestore: Firestore, path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Invalid collection reference. Collection references must have an odd number of segments, but {} has {}.",
                path.canonical_string(),
                path.len()
            )));
        }
        Ok(Self { firestore, path })
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    /// The full path of the collection (e.g. `rooms/eros/messages`).
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The last segment of the collection path.
    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    /// The document containing this collection, `None` for root collections.
    pub fn parent(&self) -> Option<DocumentReference> {
        let parent_path = self.path.pop_last()?;
        if parent_path.is_empty() {
            return None;
        }
        DocumentReference::new(self.firestore.clone(), parent_path).ok()
    }

    /// A reference to the document `document_id`, or to a new document with
    /// a random 20 character id when `None`.
    pub fn doc(&self, document_id: Option<&str>) -> FirestoreResult<DocumentReference> {
        let id = document_id
            .map(str::to_string)
            .unwrap_or_else(generate_auto_id);
        if id.is_empty() {
            return Err(invalid_argument(
                "Function CollectionReference.doc() cannot be called with an empty path.",
            ));
        }
        let path = self.path.child(ResourcePath::from_string(&id)?.iter().cloned());
        DocumentReference::new(self.firestore.clone(), path)
    }

    /// A query over every document in this collection.
    pub fn query(&self) -> Query {
        Query::new(self.firestore.clone(), core::Query::at_path(self.path.clone()))
    }
}

impl Display for CollectionReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollectionReference({})", self.path.canonical_string())
    }
}

#[derive(Clone, Debug)]
pub struct DocumentReference {
    firestore: Firestore,
    key: DocumentKey,
}

impl DocumentReference {
    pub(crate) fn new(firestore: Firestore, path: ResourcePath) -> FirestoreResult<Self> {
        if !DocumentKey::is_document_key(&path) {
            return Err(invalid_argument(format!(
                "Invalid document reference. Document references must have an even number of segments, but {} has {}.",
                path.canonical_string(),
                path.len()
            )));
        }
        let key = DocumentKey::from_path(path)?;
        Ok(Self::from_key(firestore, key))
    }

    pub(crate) fn from_key(firestore: Firestore, key: DocumentKey) -> Self {
        Self { firestore, key }
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn path(&self) -> &ResourcePath {
        self.key.path()
    }

    /// The collection containing this document.
    pub fn parent(&self) -> CollectionReference {
        CollectionReference {
            firestore: self.firestore.clone(),
            path: self.key.collection_path(),
        }
    }

    /// A subcollection below this document; `path` is relative to it.
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        let sub_path = ResourcePath::from_string(path)?;
        let full_path = self.key.path().child(sub_path.iter().cloned());
        CollectionReference::new(self.firestore.clone(), full_path)
    }

    /// The reference value pointing at this document, usable as field data
    /// or as a document id filter operand.
    pub fn to_value(&self) -> FirestoreValue {
        ref_value(self.firestore.database_id(), &self.key)
    }
}

impl PartialEq for DocumentReference {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.firestore.database_id() == other.firestore.database_id()
    }
}

impl Display for DocumentReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DocumentReference({})", self.key.path().canonical_string())
    }
}

fn generate_auto_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(AUTO_ID_LENGTH)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::InMemoryConnection;

    fn firestore() -> Firestore {
        Firestore::in_memory(InMemoryConnection::new(DatabaseId::default("p")))
    }

    #[tokio::test]
    async fn collection_and_document_roundtrip() {
        let firestore = firestore();
        let collection = firestore.collection("cities").unwrap();
        assert_eq!(collection.id(), "cities");
        assert!(collection.parent().is_none());
        let document = collection.doc(Some("sf")).unwrap();
        assert_eq!(document.id(), "sf");
        assert_eq!(document.parent().id(), "cities");

        let landmarks = document.collection("landmarks").unwrap();
        assert_eq!(landmarks.path().canonical_string(), "cities/sf/landmarks");
        assert_eq!(landmarks.parent().unwrap(), document);
    }

    #[tokio::test]
    async fn auto_id_generation() {
        let collection = firestore().collection("cities").unwrap();
        let document = collection.doc(None).unwrap();
        assert_eq!(document.parent().id(), "cities");
        assert_eq!(document.id().len(), AUTO_ID_LENGTH);
    }

    #[tokio::test]
    async fn segment_parity_is_checked() {
        let firestore = firestore();
        assert!(firestore.collection("cities/sf").is_err());
        assert!(firestore.doc("cities").is_err());
        let nested = firestore
            .collection("cities")
            .unwrap()
            .doc(Some("sf/landmarks"))
            .unwrap_err();
        assert!(nested.message().contains("even number of segments"));
    }

    #[tokio::test]
    async fn reference_values_name_the_database() {
        let document = firestore().doc("cities/sf").unwrap();
        assert_eq!(
            document.to_value().as_reference(),
            Some("projects/p/databases/(default)/documents/cities/sf")
        );
    }
}
