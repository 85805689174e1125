use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use firestore_sync_core::firestore::api::{SetOptions, UserDataReader};
use firestore_sync_core::firestore::core::{Transaction as CoreTransaction, TransactionOptions};
use firestore_sync_core::firestore::error::{invalid_argument, FirestoreErrorCode};
use firestore_sync_core::firestore::model::{DatabaseId, DocumentKey, ObjectValue};
use firestore_sync_core::firestore::remote::{
    Datastore, DatastoreImpl, InMemoryConnection, NoopTokenProvider,
};
use firestore_sync_core::firestore::value::FirestoreValue;
use firestore_sync_core::firestore::Firestore;
use serde_json::Value as JsonValue;

fn map(entries: &[(&str, FirestoreValue)]) -> BTreeMap<String, FirestoreValue> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn int(value: i64) -> FirestoreValue {
    FirestoreValue::from_integer(value)
}

fn object(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
    ObjectValue::from_map(map(entries))
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn datastore(connection: &InMemoryConnection) -> Arc<dyn Datastore> {
    Arc::new(DatastoreImpl::new(
        connection.database_id().clone(),
        Arc::new(connection.clone()),
        Arc::new(NoopTokenProvider),
    ))
}

#[tokio::test]
async fn version_skew_between_reads_aborts_before_writing() {
    let connection = InMemoryConnection::new(DatabaseId::default("p"));
    let k = key("counters/a");
    connection.set_document(&k, object(&[("n", int(1))]));

    let mut transaction = CoreTransaction::new(datastore(&connection));
    transaction.lookup(std::slice::from_ref(&k)).await.unwrap();
    connection.set_document(&k, object(&[("n", int(2))]));

    let err = transaction
        .lookup(std::slice::from_ref(&k))
        .await
        .unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::Aborted);
    assert_eq!(connection.rpc_count("commit"), 0);
}

#[tokio::test]
async fn unwritten_reads_are_verified_at_commit() {
    let connection = InMemoryConnection::new(DatabaseId::default("p"));
    let k1 = key("docs/one");
    let k2 = key("docs/two");
    connection.set_document(&k1, object(&[("v", int(1))]));
    let k2_version = connection.set_document(&k2, object(&[("v", int(2))]));

    let reader = UserDataReader::new(connection.database_id().clone());
    let data = reader
        .parse_set_data("Transaction.set", &k1, map(&[("v", int(3))]), &SetOptions::default())
        .unwrap();

    let store = datastore(&connection);
    let mut transaction = CoreTransaction::new(store.clone());
    transaction.lookup(&[k1.clone(), k2.clone()]).await.unwrap();
    transaction.set(k1.clone(), &data);
    transaction.commit().await.unwrap();

    let requests = connection.requests("commit");
    assert_eq!(requests.len(), 1);
    let writes = requests[0]["writes"].as_array().unwrap();
    let verifies: Vec<&JsonValue> = writes
        .iter()
        .filter(|write| write.get("verify").is_some())
        .collect();
    assert_eq!(verifies.len(), 1);
    assert_eq!(
        verifies[0]["verify"],
        "projects/p/databases/(default)/documents/docs/two"
    );
    let serializer = firestore_sync_core::firestore::remote::JsonProtoSerializer::new(
        connection.database_id().clone(),
        true,
    );
    assert_eq!(
        verifies[0]["currentDocument"]["updateTime"],
        serializer.to_version(&k2_version)
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_modification_is_retried() {
    let connection = InMemoryConnection::new(DatabaseId::default("p"));
    let firestore = Firestore::in_memory(connection.clone());
    let doc = firestore.doc("counters/c").unwrap();
    connection.set_document(doc.key(), object(&[("n", int(1))]));

    let attempts = Arc::new(AtomicUsize::new(0));
    let result = {
        let attempts = attempts.clone();
        let connection = connection.clone();
        let doc = doc.clone();
        firestore
            .run_transaction(move |transaction| {
                let attempts = attempts.clone();
                let connection = connection.clone();
                let doc = doc.clone();
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let snapshot = transaction.get(&doc).await?;
                    let n = snapshot
                        .get("n")
                        .and_then(FirestoreValue::as_integer)
                        .unwrap_or_default();
                    if attempt == 1 {
                        connection.set_document(doc.key(), object(&[("n", int(100))]));
                    }
                    transaction
                        .set(&doc, map(&[("n", int(n + 1))]), None)
                        .await?;
                    Ok(n + 1)
                }
            })
            .await
    };

    assert_eq!(result.unwrap(), 101);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        connection.document(doc.key()).unwrap().data().fields().fields()["n"],
        int(101)
    );
}

#[tokio::test(start_paused = true)]
async fn attempts_are_bounded() {
    let connection = InMemoryConnection::new(DatabaseId::default("p"));
    let firestore = Firestore::in_memory(connection.clone());
    let doc = firestore.doc("counters/c").unwrap();
    connection.set_document(doc.key(), object(&[("n", int(1))]));

    let attempts = Arc::new(AtomicUsize::new(0));
    let err = {
        let attempts = attempts.clone();
        let connection = connection.clone();
        let doc = doc.clone();
        firestore
            .run_transaction_with_options(
                TransactionOptions { max_attempts: 3 },
                move |transaction| {
                    let attempts = attempts.clone();
                    let connection = connection.clone();
                    let doc = doc.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        transaction.get(&doc).await?;
                        connection.set_document(doc.key(), object(&[("n", int(0))]));
                        transaction.delete(&doc).await?;
                        Ok(())
                    }
                },
            )
            .await
            .unwrap_err()
    };

    assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(connection.rpc_count("commit"), 3);
}

#[tokio::test(start_paused = true)]
async fn permanent_errors_are_not_retried() {
    let connection = InMemoryConnection::new(DatabaseId::default("p"));
    let firestore = Firestore::in_memory(connection.clone());

    let attempts = Arc::new(AtomicUsize::new(0));
    let err = {
        let attempts = attempts.clone();
        firestore
            .run_transaction(move |_transaction| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(invalid_argument("bad input"))
                }
            })
            .await
            .unwrap_err()
    };

    assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(connection.rpc_count("commit"), 0);
}

#[tokio::test]
async fn invalid_attempt_budget_is_rejected() {
    let firestore = Firestore::in_memory(InMemoryConnection::new(DatabaseId::default("p")));
    let err = firestore
        .run_transaction_with_options(TransactionOptions { max_attempts: 0 }, |_| async {
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    assert_eq!(err.message(), "Max attempts must be at least 1");
}
