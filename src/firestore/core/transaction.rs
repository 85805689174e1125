use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::api::{ParsedSetData, ParsedUpdateData};
use crate::firestore::error::{aborted, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MaybeDocument, Mutation, Precondition, SnapshotVersion};
use crate::firestore::remote::Datastore;
use crate::util::assert::{fail, hard_assert};

/// One attempt of an optimistic read-write transaction.
///
/// All reads must happen before the first write. Every document read is
/// remembered with the version it was read at; writes to it are conditioned
/// on that version, and documents that are read but never written are
/// verified at commit. A `Transaction` is never reused across attempts.
pub struct Transaction {
    datastore: Arc<dyn Datastore>,
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    mutations: Vec<Mutation>,
    written_docs: BTreeSet<DocumentKey>,
    committed: bool,
    last_write_error: Option<FirestoreError>,
}

impl Transaction {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            read_versions: BTreeMap::new(),
            mutations: Vec::new(),
            written_docs: BTreeSet::new(),
            committed: false,
            last_write_error: None,
        }
    }

    /// Reads `keys` in one round trip, in input order.
    ///
    /// Fails with `ABORTED` if a document comes back at a different version
    /// than an earlier read in this transaction saw.
    pub async fn lookup(&mut self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MaybeDocument>> {
        self.ensure_commit_not_called();

        if !self.mutations.is_empty() {
            return Err(invalid_argument(
                "Firestore transactions require all reads to be executed before all writes.",
            ));
        }
        let docs = self.datastore.invoke_batch_get_documents_rpc(keys).await?;
        for doc in &docs {
            self.record_version(doc)?;
        }
        Ok(docs)
    }

    pub fn set(&mut self, key: DocumentKey, data: &ParsedSetData) {
        let precondition = self.precondition(&key);
        self.write(data.to_mutations(key.clone(), precondition));
        self.written_docs.insert(key);
    }

    /// Queues a patch. A precondition that can never hold is kept as the
    /// transaction's write error and reported by [`commit`](Self::commit).
    pub fn update(&mut self, key: DocumentKey, data: &ParsedUpdateData) {
        match self.precondition_for_update(&key) {
            Ok(precondition) => self.write(data.to_mutations(key.clone(), precondition)),
            Err(err) => self.last_write_error = Some(err),
        }
        self.written_docs.insert(key);
    }

    pub fn delete(&mut self, key: DocumentKey) {
        let precondition = self.precondition(&key);
        self.write(vec![Mutation::Delete {
            key: key.clone(),
            precondition,
        }]);
        self.written_docs.insert(key);
    }

    /// Sends all writes, plus a verify for every document that was read but
    /// not written, in a single commit.
    pub async fn commit(&mut self) -> FirestoreResult<()> {
        self.ensure_commit_not_called();

        if let Some(err) = self.last_write_error.take() {
            return Err(err);
        }

        let unwritten: Vec<DocumentKey> = self
            .read_versions
            .keys()
            .filter(|key| !self.written_docs.contains(*key))
            .cloned()
            .collect();
        for key in unwritten {
            let precondition = self.precondition(&key);
            self.mutations.push(Mutation::Verify { key, precondition });
        }

        self.datastore.invoke_commit_rpc(&self.mutations).await?;
        self.committed = true;
        Ok(())
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    fn record_version(&mut self, doc: &MaybeDocument) -> FirestoreResult<()> {
        let doc_version = match doc {
            MaybeDocument::Document(found) => found.version(),
            MaybeDocument::NoDocument(_) => SnapshotVersion::min(),
            MaybeDocument::UnknownDocument(_) => fail(format!(
                "Document in a transaction was a read but was neither found nor missing: {}",
                doc.key()
            )),
        };

        match self.read_versions.get(doc.key()) {
            Some(existing) if *existing != doc_version => {
                Err(aborted("Document version changed between two reads."))
            }
            Some(_) => Ok(()),
            None => {
                self.read_versions.insert(doc.key().clone(), doc_version);
                Ok(())
            }
        }
    }

    /// The precondition for a write to `key`: the version it was read at, if
    /// it was read and not yet written.
    fn precondition(&self, key: &DocumentKey) -> Precondition {
        match self.read_versions.get(key) {
            Some(version) if !self.written_docs.contains(key) => {
                if version.is_min() {
                    Precondition::Exists(false)
                } else {
                    Precondition::UpdateTime(*version)
                }
            }
            _ => Precondition::None,
        }
    }

    fn precondition_for_update(&self, key: &DocumentKey) -> FirestoreResult<Precondition> {
        match self.read_versions.get(key) {
            Some(version) if !self.written_docs.contains(key) => {
                if version.is_min() {
                    // The document was read as missing, so the update would
                    // fail on the backend as well.
                    Err(invalid_argument("Can't update a document that doesn't exist."))
                } else {
                    Ok(Precondition::UpdateTime(*version))
                }
            }
            // Never read, or already written in this transaction.
            _ => Ok(Precondition::Exists(true)),
        }
    }

    fn write(&mut self, mutations: Vec<Mutation>) {
        self.ensure_commit_not_called();
        self.mutations.extend(mutations);
    }

    fn ensure_commit_not_called(&self) {
        hard_assert(
            !self.committed,
            "A transaction object cannot be used after its update callback has been invoked.",
        );
    }
}
