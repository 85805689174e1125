use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};

const DOCUMENT_KEY_NAME: &str = "__name__";
const RESERVED_CHARACTERS: [char; 5] = ['~', '*', '/', '[', ']'];

/// A path to a field inside a document, e.g. `address.city`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Builds a path from raw segments. Segments are taken literally (a `.`
    /// inside a segment is part of the field name).
    pub fn new<S, I>(segments: I) -> FirestoreResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(invalid_argument(
                "Invalid field path. Provide at least one field name.",
            ));
        }
        if let Some(index) = segments.iter().position(String::is_empty) {
            return Err(invalid_argument(format!(
                "Invalid field name at argument {}. Field names must not be empty.",
                index + 1
            )));
        }
        Ok(Self { segments })
    }

    /// Parses a dot-separated path such as `a.b.c`.
    pub fn from_dot_separated(path: &str) -> FirestoreResult<Self> {
        if path.contains(&RESERVED_CHARACTERS[..]) {
            return Err(invalid_argument(format!(
                "Invalid field path ({path}). Paths must not contain '~', '*', '/', '[', or ']'"
            )));
        }
        Self::new(path.split('.')).map_err(|_| {
            invalid_argument(format!(
                "Invalid field path ({path}). Paths must not be empty, begin with '.', end with '.', or contain '..'"
            ))
        })
    }

    /// Parses the escaped form produced by [`canonical_string`](Self::canonical_string).
    pub fn from_server_format(path: &str) -> FirestoreResult<Self> {
        let invalid = || invalid_argument(format!("Invalid field path ({path})"));
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_backticks = false;
        let mut chars = path.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => current.push(chars.next().ok_or_else(invalid)?),
                '`' => in_backticks = !in_backticks,
                '.' if !in_backticks => {
                    if current.is_empty() {
                        return Err(invalid());
                    }
                    segments.push(std::mem::take(&mut current));
                }
                other => current.push(other),
            }
        }
        if in_backticks || current.is_empty() {
            return Err(invalid());
        }
        segments.push(current);
        Ok(Self { segments })
    }

    pub(crate) fn empty() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn document_id() -> Self {
        Self {
            segments: vec![DOCUMENT_KEY_NAME.to_string()],
        }
    }

    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_KEY_NAME
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn first_segment(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn append(&self, other: &FieldPath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    pub fn pop_first(&self) -> Self {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    pub fn pop_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        self.len() <= other.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(l, r)| l == r)
    }

    /// Dot-joined form with backtick quoting for segments that are not plain
    /// identifiers, as accepted by the backend in update masks.
    pub fn canonical_string(&self) -> String {
        self.segments
            .iter()
            .map(|segment| escape_segment(segment))
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        for (l, r) in left.segments.iter().zip(right.segments.iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        left.len().cmp(&right.len())
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn escape_segment(segment: &str) -> String {
    if is_identifier(segment) {
        return segment.to_string();
    }
    let escaped = segment.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{escaped}`")
}

impl PartialOrd for FieldPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldPath {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::comparator(self, other)
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// Trait that converts common user inputs into a validated [`FieldPath`].
pub trait IntoFieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self)
    }
}

impl<'a> IntoFieldPath for &'a FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(&self)
    }
}

impl<'a> IntoFieldPath for &'a str {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_dot_path() {
        let field = FieldPath::from_dot_separated("foo.bar").unwrap();
        assert_eq!(field.segments(), &["foo", "bar"]);
    }

    #[test]
    fn rejects_empty_and_reserved() {
        let err = FieldPath::from_dot_separated("").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(FieldPath::from_dot_separated("a..b").is_err());
        let err = FieldPath::from_dot_separated("a/b").unwrap_err();
        assert!(err.message().contains("must not contain"));
    }

    #[test]
    fn canonical_string_quotes_non_identifiers() {
        let path = FieldPath::new(["a", "b.c", "9lives", "back`tick"]).unwrap();
        assert_eq!(path.canonical_string(), "a.`b.c`.`9lives`.`back\\`tick`");
        assert_eq!(FieldPath::from_server_format(&path.canonical_string()).unwrap(), path);
        assert!(FieldPath::from_server_format("a..b").is_err());
        assert!(FieldPath::from_server_format("`open").is_err());
    }

    #[test]
    fn prefix_and_ordering() {
        let a = FieldPath::from_dot_separated("a").unwrap();
        let ab = FieldPath::from_dot_separated("a.b").unwrap();
        assert!(a.is_prefix_of(&ab));
        assert!(a.is_prefix_of(&a));
        assert!(!ab.is_prefix_of(&a));
        assert!(a < ab);
    }

    #[test]
    fn key_field() {
        assert!(FieldPath::document_id().is_key_field());
        assert!(!FieldPath::from_dot_separated("name").unwrap().is_key_field());
    }
}
