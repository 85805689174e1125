use std::collections::BTreeMap;

use crate::firestore::core::SharedTransaction;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{IntoFieldPath, MaybeDocument};
use crate::firestore::value::FirestoreValue;
use crate::util::assert::fail;

use super::database::Firestore;
use super::reference::DocumentReference;
use super::snapshot::DocumentSnapshot;
use super::user_data_reader::SetOptions;

/// The handle passed to a transaction's update function.
///
/// Reads must come before writes. Writes are buffered and sent together when
/// the update function returns successfully.
#[derive(Clone)]
pub struct Transaction {
    firestore: Firestore,
    transaction: SharedTransaction,
}

impl Transaction {
    pub(crate) fn new(firestore: Firestore, transaction: SharedTransaction) -> Self {
        Self {
            firestore,
            transaction,
        }
    }

    /// Reads a document. A missing document yields a snapshot for which
    /// [`DocumentSnapshot::exists`] is false.
    pub async fn get(&self, reference: &DocumentReference) -> FirestoreResult<DocumentSnapshot> {
        self.verify_same_firestore(reference)?;
        let docs = self
            .transaction
            .lock()
            .await
            .lookup(std::slice::from_ref(reference.key()))
            .await?;
        let document = match docs.into_iter().next() {
            Some(MaybeDocument::Document(document)) => Some(document),
            Some(MaybeDocument::NoDocument(_)) => None,
            Some(MaybeDocument::UnknownDocument(_)) | None => fail(format!(
                "BatchGetDocumentsRequest returned unexpected document for {}",
                reference.key()
            )),
        };
        Ok(DocumentSnapshot::new(
            self.firestore.clone(),
            reference.key().clone(),
            document,
        ))
    }

    pub async fn set(
        &self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
        options: Option<SetOptions>,
    ) -> FirestoreResult<&Self> {
        self.verify_same_firestore(reference)?;
        let parsed = self.firestore.user_data_reader().parse_set_data(
            "Transaction.set",
            reference.key(),
            data,
            &options.unwrap_or_default(),
        )?;
        self.transaction
            .lock()
            .await
            .set(reference.key().clone(), &parsed);
        Ok(self)
    }

    pub async fn update(
        &self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<&Self> {
        self.verify_same_firestore(reference)?;
        let parsed = self.firestore.user_data_reader().parse_update_data(
            "Transaction.update",
            reference.key(),
            data,
        )?;
        self.transaction
            .lock()
            .await
            .update(reference.key().clone(), &parsed);
        Ok(self)
    }

    pub async fn update_fields<P: IntoFieldPath>(
        &self,
        reference: &DocumentReference,
        fields_and_values: Vec<(P, FirestoreValue)>,
    ) -> FirestoreResult<&Self> {
        self.verify_same_firestore(reference)?;
        let parsed = self.firestore.user_data_reader().parse_update_varargs(
            "Transaction.update",
            reference.key(),
            fields_and_values,
        )?;
        self.transaction
            .lock()
            .await
            .update(reference.key().clone(), &parsed);
        Ok(self)
    }

    pub async fn delete(&self, reference: &DocumentReference) -> FirestoreResult<&Self> {
        self.verify_same_firestore(reference)?;
        self.transaction
            .lock()
            .await
            .delete(reference.key().clone());
        Ok(self)
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
