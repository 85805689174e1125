use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};
use crate::util::assert::{fail, hard_assert};

/// The data of a document: an immutable map value addressed by field paths.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectValue {
    value: FirestoreValue,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::new(MapValue::empty())
    }

    pub fn new(map: MapValue) -> Self {
        Self {
            value: FirestoreValue::from_map_value(map),
        }
    }

    pub fn from_map(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self::new(MapValue::new(fields))
    }

    /// Returns the value at `path`, or `None` when the path does not resolve.
    /// The empty path addresses the whole object.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let mut current = &self.value;
        for segment in path.segments() {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    pub fn fields(&self) -> &MapValue {
        match self.value.as_map() {
            Some(map) => map,
            None => fail("ObjectValue root must be a map"),
        }
    }

    pub fn as_value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn into_map(self) -> MapValue {
        match self.value.into_kind() {
            ValueKind::Map(map) => map,
            _ => fail("ObjectValue root must be a map"),
        }
    }

    pub fn to_builder(&self) -> ObjectValueBuilder {
        ObjectValueBuilder::new(self.clone())
    }
}

impl Default for ObjectValue {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<MapValue> for ObjectValue {
    fn from(map: MapValue) -> Self {
        Self::new(map)
    }
}

#[derive(Clone, Debug)]
enum Overlay {
    Value(FirestoreValue),
    Delete,
    Nested(BTreeMap<String, Overlay>),
}

/// Accumulates field writes and deletes on top of a base [`ObjectValue`] and
/// merges them into a new object in a single pass.
///
/// Edits are recorded in an overlay tree keyed by path segment; the base is
/// never modified and [`build`](Self::build) returns it unchanged when no
/// edit took effect.
#[derive(Clone, Debug)]
pub struct ObjectValueBuilder {
    base: ObjectValue,
    overlay: BTreeMap<String, Overlay>,
}

impl ObjectValueBuilder {
    pub fn new(base: ObjectValue) -> Self {
        Self {
            base,
            overlay: BTreeMap::new(),
        }
    }

    /// Sets `path` to `value`, creating intermediate maps as needed.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) -> &mut Self {
        hard_assert(!path.is_empty(), "Cannot set field for empty path on ObjectValue");
        self.set_overlay(path, Overlay::Value(value));
        self
    }

    /// Removes the field at `path`. Deleting a missing field is a no-op.
    pub fn delete(&mut self, path: &FieldPath) -> &mut Self {
        hard_assert(!path.is_empty(), "Cannot delete field for empty path on ObjectValue");
        self.set_overlay(path, Overlay::Delete);
        self
    }

    fn set_overlay(&mut self, path: &FieldPath, leaf: Overlay) {
        let segments = path.segments();
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return,
        };

        let mut level = &mut self.overlay;
        for segment in parents {
            let node = level
                .entry(segment.clone())
                .or_insert_with(|| Overlay::Nested(BTreeMap::new()));
            level = as_nested(node);
        }
        level.insert(last.clone(), leaf);
    }

    pub fn build(&self) -> ObjectValue {
        match self.apply_overlay(&FieldPath::empty(), &self.overlay) {
            Some(merged) => match merged.into_kind() {
                ValueKind::Map(map) => ObjectValue::new(map),
                _ => fail("Merged overlay must be a map"),
            },
            None => self.base.clone(),
        }
    }

    /// Merges `overlay` into the base value at `path`. Returns `None` when
    /// nothing at this level changed.
    fn apply_overlay(
        &self,
        path: &FieldPath,
        overlay: &BTreeMap<String, Overlay>,
    ) -> Option<FirestoreValue> {
        let mut modified = false;
        let mut result: BTreeMap<String, FirestoreValue> = self
            .base
            .field(path)
            .and_then(FirestoreValue::as_map)
            .map(|map| map.fields().clone())
            .unwrap_or_default();

        for (segment, node) in overlay {
            match node {
                Overlay::Nested(nested) => {
                    if let Some(merged) = self.apply_overlay(&path.child(segment.clone()), nested) {
                        result.insert(segment.clone(), merged);
                        modified = true;
                    }
                }
                Overlay::Value(value) => {
                    result.insert(segment.clone(), value.clone());
                    modified = true;
                }
                Overlay::Delete => {
                    if result.remove(segment).is_some() {
                        modified = true;
                    }
                }
            }
        }

        modified.then(|| FirestoreValue::from_map(result))
    }
}

/// Turns an overlay node into a nested level, seeding it from a literal map
/// value written earlier so sibling fields survive.
fn as_nested(node: &mut Overlay) -> &mut BTreeMap<String, Overlay> {
    if !matches!(node, Overlay::Nested(_)) {
        let seeded = match node {
            Overlay::Value(value) => value
                .as_map()
                .map(|map| {
                    map.fields()
                        .iter()
                        .map(|(key, value)| (key.clone(), Overlay::Value(value.clone())))
                        .collect()
                })
                .unwrap_or_default(),
            _ => BTreeMap::new(),
        };
        *node = Overlay::Nested(seeded);
    }
    match node {
        Overlay::Nested(level) => level,
        _ => fail("Overlay node must be nested"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn int(v: i64) -> FirestoreValue {
        FirestoreValue::from_integer(v)
    }

    fn object(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
        ObjectValue::from_map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn field_walks_nested_maps() {
        let inner = object(&[("b", int(1))]);
        let value = object(&[("a", inner.as_value().clone()), ("x", int(2))]);
        assert_eq!(value.field(&path("a.b")), Some(&int(1)));
        assert_eq!(value.field(&path("x")), Some(&int(2)));
        assert!(value.field(&path("x.y")).is_none());
        assert!(value.field(&path("missing.b")).is_none());
        assert_eq!(value.field(&FieldPath::empty()), Some(value.as_value()));
    }

    #[test]
    fn set_creates_intermediate_maps_and_keeps_siblings() {
        let base = object(&[("a", object(&[("b", int(1))]).as_value().clone())]);
        let mut builder = base.to_builder();
        builder.set(&path("a.c"), int(2)).set(&path("d.e.f"), int(3));
        let result = builder.build();

        assert_eq!(result.field(&path("a.b")), Some(&int(1)));
        assert_eq!(result.field(&path("a.c")), Some(&int(2)));
        assert_eq!(result.field(&path("d.e.f")), Some(&int(3)));
        assert_eq!(base.field(&path("a.c")), None);
    }

    #[test]
    fn set_inside_previously_written_map_merges() {
        let mut builder = ObjectValue::empty().to_builder();
        builder
            .set(&path("a"), object(&[("x", int(1))]).as_value().clone())
            .set(&path("a.y"), int(2));
        let result = builder.build();
        assert_eq!(result.field(&path("a.x")), Some(&int(1)));
        assert_eq!(result.field(&path("a.y")), Some(&int(2)));
    }

    #[test]
    fn set_through_non_map_replaces_it() {
        let base = object(&[("a", int(1))]);
        let mut builder = base.to_builder();
        builder.set(&path("a.b"), int(2));
        assert_eq!(builder.build(), object(&[("a", object(&[("b", int(2))]).as_value().clone())]));
    }

    #[test]
    fn delete_removes_fields_and_missing_deletes_are_unchanged() {
        let base = object(&[("a", object(&[("b", int(1)), ("c", int(2))]).as_value().clone())]);
        let mut builder = base.to_builder();
        builder.delete(&path("a.b"));
        let result = builder.build();
        assert!(result.field(&path("a.b")).is_none());
        assert_eq!(result.field(&path("a.c")), Some(&int(2)));

        let mut noop = base.to_builder();
        noop.delete(&path("missing")).delete(&path("a.zzz"));
        assert_eq!(noop.build(), base);
    }

    #[test]
    fn repeated_identical_set_is_idempotent() {
        let base = object(&[("a", int(1))]);
        let mut once = base.to_builder();
        once.set(&path("b.c"), int(5));

        let mut twice = base.to_builder();
        twice.set(&path("b.c"), int(5)).set(&path("b.c"), int(5));

        assert_eq!(once.build(), twice.build());

        let applied = once.build();
        let mut again = applied.to_builder();
        again.set(&path("b.c"), int(5));
        assert_eq!(again.build(), applied);
    }
}
