use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

/// Identifies a document by its full path (an even number of segments).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(invalid_argument(format!(
                "Invalid document reference. Document references must have an even number of segments, but {} has {}.",
                path.canonical_string(),
                path.len()
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let resource = ResourcePath::from_string(path)?;
        Self::from_path(resource)
    }

    /// Parses a fully qualified name of the form
    /// `projects/{p}/databases/{d}/documents/{path}`. The database is not
    /// checked.
    pub fn from_resource_name(name: &str) -> FirestoreResult<Self> {
        let segments: Vec<&str> = name.split('/').collect();
        if segments.len() < 5
            || segments[0] != "projects"
            || segments[2] != "databases"
            || segments[4] != "documents"
        {
            return Err(invalid_argument(format!(
                "Tried to parse an invalid key: {name}"
            )));
        }
        Self::from_path(ResourcePath::from_segments(segments[5..].iter().copied()))
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// Returns the id of the collection holding this document.
    pub fn collection_group(&self) -> &str {
        self.path.get(self.path.len() - 2).unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        ResourcePath::comparator(&left.path, &right.path)
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::comparator(self, other)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("cities").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(DocumentKey::from_string("").is_err());
    }

    #[test]
    fn parses_valid_path() {
        let key = DocumentKey::from_string("cities/sf").unwrap();
        assert_eq!(key.id(), "sf");
        assert_eq!(key.collection_group(), "cities");
        assert_eq!(key.collection_path().canonical_string(), "cities");
    }

    #[test]
    fn orders_by_path() {
        let a = DocumentKey::from_string("c/a").unwrap();
        let b = DocumentKey::from_string("c/b").unwrap();
        let nested = DocumentKey::from_string("c/a/sub/x").unwrap();
        assert!(a < b);
        assert!(a < nested);
        assert!(nested < b);
    }
}
