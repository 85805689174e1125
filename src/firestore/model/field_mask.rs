use crate::firestore::model::FieldPath;

/// The set of field paths a patch touches. Paths are kept sorted and unique.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FieldMask {
    fields: Vec<FieldPath>,
}

impl FieldMask {
    pub fn new(mut fields: Vec<FieldPath>) -> Self {
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether some entry is a prefix of (or equal to) `path`.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with(&self, extra: &[FieldPath]) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(extra.iter().cloned());
        Self::new(fields)
    }

    pub fn fields(&self) -> &[FieldPath] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }
}

impl FromIterator<FieldPath> for FieldMask {
    fn from_iter<T: IntoIterator<Item = FieldPath>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    #[test]
    fn sorts_and_dedups() {
        let mask = FieldMask::new(vec![path("b"), path("a.c"), path("b"), path("a")]);
        assert_eq!(mask.fields(), &[path("a"), path("a.c"), path("b")]);
        assert_eq!(
            mask,
            FieldMask::new(vec![path("a.c"), path("b"), path("a")])
        );
    }

    #[test]
    fn covers_prefixes_and_exact_matches() {
        let mask: FieldMask = vec![path("a.b"), path("c")].into_iter().collect();
        assert!(mask.covers(&path("a.b")));
        assert!(mask.covers(&path("a.b.c")));
        assert!(mask.covers(&path("c.d")));
        assert!(!mask.covers(&path("a")));
        assert!(!mask.covers(&path("a.bc")));
        assert!(!FieldMask::empty().covers(&path("a")));
    }

    #[test]
    fn union_keeps_entries_unique() {
        let mask = FieldMask::new(vec![path("a")]).union_with(&[path("a"), path("b")]);
        assert_eq!(mask.len(), 2);
    }
}
