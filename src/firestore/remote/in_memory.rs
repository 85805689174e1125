use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::Query;
use crate::firestore::error::{
    already_exists, failed_precondition, invalid_argument, not_found, unimplemented,
    FirestoreError, FirestoreResult,
};
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, MaybeDocument, Mutation, MutationResult, ObjectValue,
    Precondition, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::connection::Connection;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::FirestoreValue;
use crate::util::assert::fail;

/// A [`Connection`] backed by an in-process document map.
///
/// Speaks the same `commit`, `batchGet` and `runQuery` request shapes as the
/// REST backend, enforces write preconditions, evaluates transforms at the
/// commit time and assigns increasing update times. Failures can be queued
/// per RPC with [`fail_next`](Self::fail_next). Clones share state.
#[derive(Clone)]
pub struct InMemoryConnection {
    serializer: JsonProtoSerializer,
    state: Arc<Mutex<ServerState>>,
}

struct ServerState {
    documents: BTreeMap<DocumentKey, Document>,
    last_version: SnapshotVersion,
    pending_failures: Vec<(String, FirestoreError)>,
    rpc_counts: HashMap<String, usize>,
    requests: Vec<(String, JsonValue)>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            documents: BTreeMap::new(),
            last_version: SnapshotVersion::min(),
            pending_failures: Vec::new(),
            rpc_counts: HashMap::new(),
            requests: Vec::new(),
        }
    }
}

impl ServerState {
    /// The next update time: now, or just after the previous one.
    fn next_version(&mut self) -> SnapshotVersion {
        let now = SnapshotVersion::from_timestamp(Timestamp::now().truncate_to_micros());
        let next = if now > self.last_version {
            now
        } else {
            let micros = self.last_version.to_micros() + 1;
            SnapshotVersion::from_timestamp(Timestamp::new(
                micros.div_euclid(1_000_000),
                (micros.rem_euclid(1_000_000) * 1_000) as i32,
            ))
        };
        self.last_version = next;
        next
    }

    fn read_time(&self) -> SnapshotVersion {
        let now = SnapshotVersion::from_timestamp(Timestamp::now().truncate_to_micros());
        now.max(self.last_version)
    }
}

impl InMemoryConnection {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            serializer: JsonProtoSerializer::new(database_id, true),
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    pub fn database_id(&self) -> &DatabaseId {
        self.serializer.database_id()
    }

    /// Writes a document directly, as another client would. Returns its new
    /// update time.
    pub fn set_document(&self, key: &DocumentKey, data: ObjectValue) -> SnapshotVersion {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        state
            .documents
            .insert(key.clone(), Document::new(key.clone(), version, data));
        version
    }

    pub fn delete_document(&self, key: &DocumentKey) {
        let mut state = self.state.lock().unwrap();
        state.next_version();
        state.documents.remove(key);
    }

    pub fn document(&self, key: &DocumentKey) -> Option<Document> {
        self.state.lock().unwrap().documents.get(key).cloned()
    }

    pub fn documents(&self) -> Vec<Document> {
        self.state
            .lock()
            .unwrap()
            .documents
            .values()
            .cloned()
            .collect()
    }

    /// Makes the next call of `rpc_name` fail with `error`. Queued failures
    /// are consumed in order.
    pub fn fail_next(&self, rpc_name: &str, error: FirestoreError) {
        self.state
            .lock()
            .unwrap()
            .pending_failures
            .push((rpc_name.to_string(), error));
    }

    /// How many times `rpc_name` was invoked, including failed calls.
    pub fn rpc_count(&self, rpc_name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .rpc_counts
            .get(rpc_name)
            .copied()
            .unwrap_or(0)
    }

    /// Request bodies received for `rpc_name`, oldest first.
    pub fn requests(&self, rpc_name: &str) -> Vec<JsonValue> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(name, _)| name == rpc_name)
            .map(|(_, request)| request.clone())
            .collect()
    }

    fn handle(&self, rpc_name: &str, path: &str, request: &JsonValue) -> FirestoreResult<JsonValue> {
        let mut state = self.state.lock().unwrap();
        *state.rpc_counts.entry(rpc_name.to_string()).or_default() += 1;
        state
            .requests
            .push((rpc_name.to_string(), request.clone()));
        if let Some(index) = state
            .pending_failures
            .iter()
            .position(|(name, _)| name == rpc_name)
        {
            let (_, error) = state.pending_failures.remove(index);
            return Err(error);
        }

        match rpc_name {
            "commit" => self.commit(&mut state, request),
            "batchGet" => self.batch_get(&state, request),
            "runQuery" => self.run_query(&state, path, request),
            other => Err(unimplemented(format!("Unsupported RPC: {other}"))),
        }
    }

    fn commit(&self, state: &mut ServerState, request: &JsonValue) -> FirestoreResult<JsonValue> {
        let mutations = request
            .get("writes")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|write| self.serializer.from_mutation(write))
            .collect::<FirestoreResult<Vec<_>>>()?;

        let commit_version = state.next_version();
        let commit_time = commit_version.to_timestamp();
        // Writes are staged so a failed precondition leaves the store untouched.
        let mut staged: BTreeMap<DocumentKey, Option<Document>> = BTreeMap::new();
        let mut write_results = Vec::with_capacity(mutations.len());

        for mutation in &mutations {
            let key = mutation.key();
            let current: Option<MaybeDocument> = match staged.get(key) {
                Some(staged_doc) => staged_doc.clone().map(MaybeDocument::from),
                None => state.documents.get(key).cloned().map(MaybeDocument::from),
            };
            self.check_precondition(mutation, current.as_ref())?;

            if let Mutation::Verify { .. } = mutation {
                write_results.push(json!({}));
                continue;
            }

            let transform_results = match mutation {
                Mutation::Transform {
                    field_transforms, ..
                } => {
                    let doc = current.as_ref().and_then(MaybeDocument::as_document);
                    Some(
                        field_transforms
                            .iter()
                            .map(|transform| {
                                let previous = doc.and_then(|doc| doc.field(transform.field()));
                                match transform.operation() {
                                    TransformOperation::ServerTimestamp => {
                                        FirestoreValue::from_timestamp(commit_time)
                                    }
                                    operation => {
                                        operation.apply_to_local_view(previous, commit_time)
                                    }
                                }
                            })
                            .collect::<Vec<_>>(),
                    )
                }
                _ => None,
            };

            let result = MutationResult::new(commit_version, transform_results.clone());
            let applied = mutation.apply_to_remote_document(current.as_ref(), &result);
            let stored = match applied {
                MaybeDocument::Document(doc) => Some(Document::new(
                    key.clone(),
                    doc.version(),
                    doc.into_data(),
                )),
                MaybeDocument::NoDocument(_) => None,
                MaybeDocument::UnknownDocument(_) => {
                    fail("Precondition was checked before applying the write")
                }
            };
            staged.insert(key.clone(), stored);

            let mut write_result = json!({ "updateTime": self.serializer.to_version(&commit_version) });
            if let Some(results) = transform_results {
                let encoded: Vec<JsonValue> =
                    results.iter().map(|value| self.serializer.to_value(value)).collect();
                write_result["transformResults"] = JsonValue::Array(encoded);
            }
            write_results.push(write_result);
        }

        for (key, doc) in staged {
            match doc {
                Some(doc) => {
                    state.documents.insert(key, doc);
                }
                None => {
                    state.documents.remove(&key);
                }
            }
        }

        Ok(json!({
            "commitTime": self.serializer.to_version(&commit_version),
            "writeResults": write_results,
        }))
    }

    fn check_precondition(
        &self,
        mutation: &Mutation,
        current: Option<&MaybeDocument>,
    ) -> FirestoreResult<()> {
        let precondition = mutation.precondition();
        if precondition.is_valid_for(current) {
            return Ok(());
        }
        let name = self.serializer.to_name(mutation.key());
        Err(match precondition {
            Precondition::Exists(true) => not_found(format!("No document to update: {name}")),
            Precondition::Exists(false) => already_exists(format!("Document already exists: {name}")),
            Precondition::UpdateTime(_) | Precondition::None => failed_precondition(format!(
                "The stored version of {name} does not match the required base version."
            )),
        })
    }

    fn batch_get(&self, state: &ServerState, request: &JsonValue) -> FirestoreResult<JsonValue> {
        let names = request
            .get("documents")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("BatchGetDocumentsRequest needs 'documents'"))?;
        let read_time = self.serializer.to_version(&state.read_time());
        let mut responses = Vec::with_capacity(names.len());
        for name in names {
            let name = name
                .as_str()
                .ok_or_else(|| invalid_argument("Document names must be strings"))?;
            let key = self.serializer.from_name(name)?;
            let response = match state.documents.get(&key) {
                Some(doc) => json!({
                    "found": self.encode_document(doc),
                    "readTime": read_time,
                }),
                None => json!({ "missing": name, "readTime": read_time }),
            };
            responses.push(response);
        }
        Ok(JsonValue::Array(responses))
    }

    fn run_query(
        &self,
        state: &ServerState,
        path: &str,
        request: &JsonValue,
    ) -> FirestoreResult<JsonValue> {
        let structured_query = request
            .get("structuredQuery")
            .cloned()
            .ok_or_else(|| invalid_argument("RunQueryRequest needs 'structuredQuery'"))?;
        let target = self.serializer.from_query_target(&json!({
            "parent": path,
            "structuredQuery": structured_query,
        }))?;
        let query = Query::from_target(&target);

        let mut results: Vec<&Document> = state
            .documents
            .values()
            .filter(|doc| query.matches(doc))
            .collect();
        results.sort_by(|left, right| query.compare_documents(left, right));
        if let Some(limit) = target.limit() {
            results.truncate(limit as usize);
        }

        let read_time = self.serializer.to_version(&state.read_time());
        if results.is_empty() {
            return Ok(json!([{ "readTime": read_time }]));
        }
        Ok(JsonValue::Array(
            results
                .into_iter()
                .map(|doc| json!({ "document": self.encode_document(doc), "readTime": read_time }))
                .collect(),
        ))
    }

    fn encode_document(&self, doc: &Document) -> JsonValue {
        json!({
            "name": self.serializer.to_name(doc.key()),
            "fields": self.serializer.to_fields(doc.data().fields()),
            "updateTime": self.serializer.to_version(&doc.version()),
        })
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn invoke_rpc(
        &self,
        rpc_name: &str,
        path: &str,
        request: JsonValue,
        _token: Option<String>,
    ) -> FirestoreResult<JsonValue> {
        self.handle(rpc_name, path, &request)
    }
}
