use std::collections::BTreeMap;

use crate::firestore::error::{failed_precondition, invalid_argument, FirestoreResult};
use crate::firestore::model::{IntoFieldPath, Mutation, Precondition};
use crate::firestore::remote::Datastore;
use crate::firestore::value::FirestoreValue;

use super::database::Firestore;
use super::reference::DocumentReference;
use super::user_data_reader::SetOptions;

/// Collects writes and commits them atomically.
///
/// Nothing is sent until [`commit`](Self::commit). A batch can only be
/// committed once; later calls fail.
#[derive(Debug)]
pub struct WriteBatch {
    firestore: Firestore,
    mutations: Vec<Mutation>,
    committed: bool,
}

impl WriteBatch {
    pub(crate) fn new(firestore: Firestore) -> Self {
        Self {
            firestore,
            mutations: Vec::new(),
            committed: false,
        }
    }

    pub fn set(
        &mut self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
        options: Option<SetOptions>,
    ) -> FirestoreResult<&mut Self> {
        self.verify_not_committed()?;
        self.verify_same_firestore(reference)?;
        let parsed = self.firestore.user_data_reader().parse_set_data(
            "WriteBatch.set",
            reference.key(),
            data,
            &options.unwrap_or_default(),
        )?;
        self.mutations
            .extend(parsed.to_mutations(reference.key().clone(), Precondition::None));
        Ok(self)
    }

    /// Updates fields named by dot-separated paths. The document must exist.
    pub fn update(
        &mut self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<&mut Self> {
        self.verify_not_committed()?;
        self.verify_same_firestore(reference)?;
        let parsed = self.firestore.user_data_reader().parse_update_data(
            "WriteBatch.update",
            reference.key(),
            data,
        )?;
        self.mutations
            .extend(parsed.to_mutations(reference.key().clone(), Precondition::Exists(true)));
        Ok(self)
    }

    /// Updates `(field, value)` pairs; a repeated field keeps its last value.
    pub fn update_fields<P: IntoFieldPath>(
        &mut self,
        reference: &DocumentReference,
        fields_and_values: Vec<(P, FirestoreValue)>,
    ) -> FirestoreResult<&mut Self> {
        self.verify_not_committed()?;
        self.verify_same_firestore(reference)?;
        let parsed = self.firestore.user_data_reader().parse_update_varargs(
            "WriteBatch.update",
            reference.key(),
            fields_and_values,
        )?;
        self.mutations
            .extend(parsed.to_mutations(reference.key().clone(), Precondition::Exists(true)));
        Ok(self)
    }

    pub fn delete(&mut self, reference: &DocumentReference) -> FirestoreResult<&mut Self> {
        self.verify_not_committed()?;
        self.verify_same_firestore(reference)?;
        self.mutations.push(Mutation::Delete {
            key: reference.key().clone(),
            precondition: Precondition::None,
        });
        Ok(self)
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Sends every write in one commit. An empty batch sends nothing.
    pub async fn commit(&mut self) -> FirestoreResult<()> {
        self.verify_not_committed()?;
        self.committed = true;
        if self.mutations.is_empty() {
            return Ok(());
        }
        let mutations = std::mem::take(&mut self.mutations);
        self.firestore.datastore().invoke_commit_rpc(&mutations).await?;
        Ok(())
    }

    fn verify_not_committed(&self) -> FirestoreResult<()> {
        if self.committed {
            return Err(failed_precondition(
                "A write batch can no longer be used after commit() has been called.",
            ));
        }
        Ok(())
    }

    fn verify_same_firestore(&self, reference: &DocumentReference) -> FirestoreResult<()> {
        if reference.firestore().database_id() != self.firestore.database_id() {
            return Err(invalid_argument(
                "Provided document reference is from a different Firestore instance.",
            ));
        }
        Ok(())
    }
}
