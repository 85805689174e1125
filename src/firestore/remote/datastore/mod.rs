use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::Target;
use crate::firestore::error::{failed_precondition, FirestoreErrorCode, FirestoreResult};
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, MaybeDocument, Mutation, MutationResult,
};
use crate::firestore::remote::connection::Connection;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::util::assert::{fail, hard_assert};

/// The RPCs the write and transaction paths need from the backend.
///
/// Implementations do not retry; callers schedule retries through the
/// backoff layer.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Commits `mutations` atomically.
    async fn invoke_commit_rpc(&self, mutations: &[Mutation])
        -> FirestoreResult<Vec<MutationResult>>;

    /// Reads `keys`; the result has one entry per key, in the same order.
    async fn invoke_batch_get_documents_rpc(
        &self,
        keys: &[DocumentKey],
    ) -> FirestoreResult<Vec<MaybeDocument>>;

    async fn invoke_run_query_rpc(&self, target: &Target) -> FirestoreResult<Vec<Document>>;
}

/// Supplies the bearer token attached to each RPC.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Drops a cached token the backend rejected, so the next call fetches a
    /// fresh one.
    fn invalidate_token(&self);
}

#[derive(Default, Clone, Debug)]
pub struct NoopTokenProvider;

#[async_trait]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

/// [`Datastore`] that encodes requests with a [`JsonProtoSerializer`] and
/// sends them over a [`Connection`].
pub struct DatastoreImpl {
    connection: Arc<dyn Connection>,
    token_provider: TokenProviderArc,
    serializer: JsonProtoSerializer,
    terminated: AtomicBool,
}

impl DatastoreImpl {
    pub fn new(
        database_id: DatabaseId,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
    ) -> Self {
        Self::with_serializer(
            JsonProtoSerializer::new(database_id, true),
            connection,
            token_provider,
        )
    }

    pub fn with_serializer(
        serializer: JsonProtoSerializer,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
    ) -> Self {
        Self {
            connection,
            token_provider,
            serializer,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn serializer(&self) -> &JsonProtoSerializer {
        &self.serializer
    }

    /// Marks the datastore unusable. Later RPCs fail with `FAILED_PRECONDITION`.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn verify_initialized(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Err(failed_precondition(
                "The client has already been terminated.",
            ));
        }
        Ok(())
    }

    async fn invoke_rpc(
        &self,
        rpc_name: &str,
        path: &str,
        request: JsonValue,
    ) -> FirestoreResult<JsonValue> {
        self.verify_initialized()?;
        let token = self.token_provider.get_token().await?;
        let result = self
            .connection
            .invoke_rpc(rpc_name, path, request, token)
            .await;
        self.handle_result(result)
    }

    async fn invoke_streaming_rpc(
        &self,
        rpc_name: &str,
        path: &str,
        request: JsonValue,
    ) -> FirestoreResult<Vec<JsonValue>> {
        self.verify_initialized()?;
        let token = self.token_provider.get_token().await?;
        let result = self
            .connection
            .invoke_streaming_rpc(rpc_name, path, request, token)
            .await;
        self.handle_result(result)
    }

    fn handle_result<T>(&self, result: FirestoreResult<T>) -> FirestoreResult<T> {
        if let Err(err) = &result {
            if err.code == FirestoreErrorCode::Unauthenticated {
                self.token_provider.invalidate_token();
            }
        }
        result
    }

    fn documents_path(&self) -> String {
        format!("{}/documents", self.serializer.database_name())
    }
}

#[async_trait]
impl Datastore for DatastoreImpl {
    async fn invoke_commit_rpc(
        &self,
        mutations: &[Mutation],
    ) -> FirestoreResult<Vec<MutationResult>> {
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.to_mutation(mutation))
            .collect();
        let response = self
            .invoke_rpc("commit", &self.documents_path(), json!({ "writes": writes }))
            .await?;
        self.serializer.from_commit_response(&response)
    }

    async fn invoke_batch_get_documents_rpc(
        &self,
        keys: &[DocumentKey],
    ) -> FirestoreResult<Vec<MaybeDocument>> {
        let names: Vec<String> = keys.iter().map(|key| self.serializer.to_name(key)).collect();
        let responses = self
            .invoke_streaming_rpc(
                "batchGet",
                &self.documents_path(),
                json!({ "documents": names }),
            )
            .await?;

        let mut docs: HashMap<DocumentKey, MaybeDocument> = HashMap::with_capacity(keys.len());
        for response in &responses {
            let doc = self.serializer.from_batch_get_document(response)?;
            docs.insert(doc.key().clone(), doc);
        }
        hard_assert(
            docs.len() == keys.len(),
            format!(
                "Expected {} documents in the batch get response, got {}",
                keys.len(),
                docs.len()
            ),
        );
        keys.iter()
            .map(|key| match docs.remove(key) {
                Some(doc) => Ok(doc),
                None => fail(format!("Missing entity in write response for {key}")),
            })
            .collect()
    }

    async fn invoke_run_query_rpc(&self, target: &Target) -> FirestoreResult<Vec<Document>> {
        let mut request = self.serializer.to_query_target(target);
        let parent = request
            .get("parent")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.documents_path());
        if let JsonValue::Object(fields) = &mut request {
            fields.remove("parent");
        }
        let responses = self.invoke_streaming_rpc("runQuery", &parent, request).await?;
        responses
            .iter()
            // Progress messages carry only a read time.
            .filter_map(|response| response.get("document"))
            .map(|document| self.serializer.from_document(document))
            .collect()
    }
}
