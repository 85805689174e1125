use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;

use crate::firestore::core::{self, TransactionOptions};
use crate::firestore::error::{failed_precondition, invalid_argument, FirestoreResult};
use crate::firestore::model::{DatabaseId, IntoFieldPath, MaybeDocument, Precondition, ResourcePath};
use crate::firestore::remote::{
    Connection, ConnectionBuilder, Datastore, DatastoreImpl, FirestoreSettings, InMemoryConnection,
    NoopTokenProvider, TokenProviderArc,
};
use crate::firestore::util::AsyncQueue;
use crate::firestore::value::FirestoreValue;
use crate::util::assert::hard_assert;

use super::query::{Query, QuerySnapshot};
use super::reference::{CollectionReference, DocumentReference};
use super::snapshot::DocumentSnapshot;
use super::transaction::Transaction;
use super::user_data_reader::{SetOptions, UserDataReader};
use super::write_batch::WriteBatch;

/// A client for one database.
///
/// The client owns its datastore and the queue transactions are scheduled
/// on. Cloning is cheap and clones share both. Construct it inside a tokio
/// runtime.
#[derive(Clone)]
pub struct Firestore {
    inner: Arc<FirestoreInner>,
}

struct FirestoreInner {
    database_id: DatabaseId,
    datastore: Arc<DatastoreImpl>,
    queue: AsyncQueue,
    user_data_reader: UserDataReader,
}

impl Firestore {
    pub fn new(
        database_id: DatabaseId,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
    ) -> Self {
        let datastore = DatastoreImpl::new(database_id.clone(), connection, token_provider);
        let inner = FirestoreInner {
            user_data_reader: UserDataReader::new(database_id.clone()),
            database_id,
            datastore: Arc::new(datastore),
            queue: AsyncQueue::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// A client talking to the REST endpoint named by `settings`, or to the
    /// emulator in `FIRESTORE_EMULATOR_HOST`.
    pub fn connect(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        token_provider: TokenProviderArc,
    ) -> FirestoreResult<Self> {
        let connection = ConnectionBuilder::new(database_id.clone())
            .with_settings(settings)
            .build()?;
        Ok(Self::new(database_id, Arc::new(connection), token_provider))
    }

    /// A client backed by an in-process [`InMemoryConnection`].
    pub fn in_memory(connection: InMemoryConnection) -> Self {
        let database_id = connection.database_id().clone();
        Self::new(database_id, Arc::new(connection), Arc::new(NoopTokenProvider))
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    pub fn project_id(&self) -> &str {
        self.inner.database_id.project_id()
    }

    /// The database name, usually `"(default)"`.
    pub fn database(&self) -> &str {
        self.inner.database_id.database()
    }

    pub(crate) fn datastore(&self) -> &Arc<DatastoreImpl> {
        &self.inner.datastore
    }

    pub(crate) fn user_data_reader(&self) -> &UserDataReader {
        &self.inner.user_data_reader
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    /// A reference to the collection at `path`, e.g. `"users/alovelace/repos"`.
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        let resource = ResourcePath::from_string(path)?;
        CollectionReference::new(self.clone(), resource)
    }

    /// A reference to the document at `path`, which must have an even number
    /// of segments.
    pub fn doc(&self, path: &str) -> FirestoreResult<DocumentReference> {
        let resource = ResourcePath::from_string(path)?;
        DocumentReference::new(self.clone(), resource)
    }

    /// A query over every collection named `collection_id`, wherever it is
    /// nested.
    pub fn collection_group(&self, collection_id: &str) -> FirestoreResult<Query> {
        if collection_id.is_empty() {
            return Err(invalid_argument(
                "Function collectionGroup() cannot be called with an empty collection id.",
            ));
        }
        if collection_id.contains('/') {
            return Err(invalid_argument(format!(
                "Invalid collection ID '{collection_id}' passed to function collectionGroup(). Collection IDs must not contain '/'."
            )));
        }
        Ok(Query::new(
            self.clone(),
            core::Query::collection_group(ResourcePath::root(), collection_id),
        ))
    }

    pub async fn get_doc(&self, reference: &DocumentReference) -> FirestoreResult<DocumentSnapshot> {
        let docs = self
            .datastore()
            .invoke_batch_get_documents_rpc(std::slice::from_ref(reference.key()))
            .await?;
        hard_assert(docs.len() == 1, "Expected a single document result");
        let document = docs.into_iter().next().and_then(MaybeDocument::into_document);
        Ok(DocumentSnapshot::new(
            self.clone(),
            reference.key().clone(),
            document,
        ))
    }

    /// Runs `query` once. Results of a limit-to-last query come back in the
    /// query's own order.
    pub async fn get_docs(&self, query: &Query) -> FirestoreResult<QuerySnapshot> {
        query.validate_has_explicit_order_by_for_limit_to_last()?;
        let core_query = query.core_query();
        let mut documents = self
            .datastore()
            .invoke_run_query_rpc(core_query.to_target())
            .await?;
        if core_query.has_limit_to_last() {
            documents.reverse();
        }
        let snapshots = documents
            .into_iter()
            .map(|document| DocumentSnapshot::new(self.clone(), document.key().clone(), Some(document)))
            .collect();
        Ok(QuerySnapshot::new(query.clone(), snapshots))
    }

    pub async fn set_doc(
        &self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
        options: Option<SetOptions>,
    ) -> FirestoreResult<()> {
        let parsed = self.user_data_reader().parse_set_data(
            "setDoc",
            reference.key(),
            data,
            &options.unwrap_or_default(),
        )?;
        let mutations = parsed.to_mutations(reference.key().clone(), Precondition::None);
        self.datastore().invoke_commit_rpc(&mutations).await?;
        Ok(())
    }

    /// Updates fields named by dot-separated paths. Fails with `NOT_FOUND`
    /// if the document does not exist.
    pub async fn update_doc(
        &self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<()> {
        let parsed = self
            .user_data_reader()
            .parse_update_data("updateDoc", reference.key(), data)?;
        let mutations = parsed.to_mutations(reference.key().clone(), Precondition::Exists(true));
        self.datastore().invoke_commit_rpc(&mutations).await?;
        Ok(())
    }

    pub async fn update_doc_fields<P: IntoFieldPath>(
        &self,
        reference: &DocumentReference,
        fields_and_values: Vec<(P, FirestoreValue)>,
    ) -> FirestoreResult<()> {
        let parsed = self.user_data_reader().parse_update_varargs(
            "updateDoc",
            reference.key(),
            fields_and_values,
        )?;
        let mutations = parsed.to_mutations(reference.key().clone(), Precondition::Exists(true));
        self.datastore().invoke_commit_rpc(&mutations).await?;
        Ok(())
    }

    pub async fn delete_doc(&self, reference: &DocumentReference) -> FirestoreResult<()> {
        let mut batch = self.batch();
        batch.delete(reference)?;
        batch.commit().await
    }

    /// Creates a document with a generated id in `collection`.
    pub async fn add_doc(
        &self,
        collection: &CollectionReference,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<DocumentReference> {
        let reference = collection.doc(None)?;
        let parsed = self.user_data_reader().parse_set_data(
            "addDoc",
            reference.key(),
            data,
            &SetOptions::default(),
        )?;
        let mutations = parsed.to_mutations(reference.key().clone(), Precondition::Exists(false));
        self.datastore().invoke_commit_rpc(&mutations).await?;
        Ok(reference)
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch::new(self.clone())
    }

    /// Runs `update_function` in a transaction with the default attempt
    /// budget. See [`run_transaction_with_options`](Self::run_transaction_with_options).
    pub async fn run_transaction<T, F, Fut>(&self, update_function: F) -> FirestoreResult<T>
    where
        T: Send + 'static,
        F: Fn(Transaction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        self.run_transaction_with_options(TransactionOptions::default(), update_function)
            .await
    }

    /// Runs `update_function` in a transaction and commits its writes.
    ///
    /// The function may run more than once: when a document it read changed
    /// before the commit, or the commit failed transiently, it is retried with
    /// a fresh transaction until `options.max_attempts` is spent.
    pub async fn run_transaction_with_options<T, F, Fut>(
        &self,
        options: TransactionOptions,
        update_function: F,
    ) -> FirestoreResult<T>
    where
        T: Send + 'static,
        F: Fn(Transaction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        if self.datastore().is_terminated() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        let firestore = self.clone();
        let datastore: Arc<dyn Datastore> = self.inner.datastore.clone();
        core::run_transaction(self.queue().clone(), datastore, options, move |transaction| {
            update_function(Transaction::new(firestore.clone(), transaction))
        })
        .await
    }

    /// Shuts the client down. Pending queue work is dropped and later calls
    /// fail with `FAILED_PRECONDITION`.
    pub async fn terminate(&self) {
        self.queue().enter_restricted_mode(true);
        self.datastore().terminate();
        log::debug!(target: "firestore", "Terminated client for {}", self.database_id().canonical_name());
    }
}

impl Debug for Firestore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firestore")
            .field("database_id", &self.inner.database_id)
            .finish()
    }
}
