use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_lock::Mutex as AsyncMutex;
use futures::future::{BoxFuture, FutureExt};

use crate::firestore::core::transaction::Transaction;
use crate::firestore::error::{
    internal_error, invalid_argument, is_permanent_error, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::remote::backoff::{BackoffSettings, ExponentialBackoff};
use crate::firestore::remote::Datastore;
use crate::firestore::util::async_queue::{panic_message, AsyncQueue, TimerId};
use crate::firestore::util::deferred::{deferred, Deferred};
use crate::platform::runtime;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Options for `run_transaction`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Attempts before the transaction fails, including the first one.
    pub max_attempts: u32,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl TransactionOptions {
    pub fn validate(&self) -> FirestoreResult<()> {
        if self.max_attempts < 1 {
            return Err(invalid_argument("Max attempts must be at least 1"));
        }
        Ok(())
    }
}

/// The attempt-local transaction handed to the update function.
pub type SharedTransaction = Arc<AsyncMutex<Transaction>>;

type UpdateFunction<T> =
    Box<dyn Fn(SharedTransaction) -> BoxFuture<'static, FirestoreResult<T>> + Send + Sync>;

/// Drives an update function through commit, retrying with backoff.
///
/// Every attempt gets a fresh [`Transaction`]. The update function runs off
/// the queue; the commit runs on it. Failures tagged `ABORTED` or
/// `FAILED_PRECONDITION`, and transient failures, are retried until the
/// attempt budget is spent.
pub struct TransactionRunner<T> {
    inner: Arc<RunnerInner<T>>,
}

struct RunnerInner<T> {
    queue: AsyncQueue,
    datastore: Arc<dyn Datastore>,
    update_function: UpdateFunction<T>,
    deferred: Deferred<T>,
    attempts_remaining: Mutex<u32>,
    backoff: Mutex<ExponentialBackoff>,
}

impl<T: Send + 'static> TransactionRunner<T> {
    pub fn new<F, Fut>(
        queue: AsyncQueue,
        datastore: Arc<dyn Datastore>,
        options: TransactionOptions,
        update_function: F,
    ) -> (Self, BoxFuture<'static, FirestoreResult<T>>)
    where
        F: Fn(SharedTransaction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        Self::with_backoff_settings(
            queue,
            datastore,
            options,
            BackoffSettings::default(),
            update_function,
        )
    }

    pub fn with_backoff_settings<F, Fut>(
        queue: AsyncQueue,
        datastore: Arc<dyn Datastore>,
        options: TransactionOptions,
        backoff_settings: BackoffSettings,
        update_function: F,
    ) -> (Self, BoxFuture<'static, FirestoreResult<T>>)
    where
        F: Fn(SharedTransaction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        let (deferred, promise) = deferred();
        let backoff =
            ExponentialBackoff::for_queue(&queue, TimerId::TransactionRetry, backoff_settings);
        let inner = Arc::new(RunnerInner {
            queue,
            datastore,
            update_function: Box::new(move |transaction| update_function(transaction).boxed()),
            deferred,
            attempts_remaining: Mutex::new(options.max_attempts),
            backoff: Mutex::new(backoff),
        });
        (Self { inner }, promise.boxed())
    }

    /// Starts the first attempt. The outcome is delivered through the future
    /// returned by [`new`](Self::new).
    pub fn run(&self) {
        {
            let mut remaining = self.inner.attempts_remaining.lock().unwrap();
            *remaining = remaining.saturating_sub(1);
        }
        run_with_backoff(&self.inner);
    }
}

/// Runs `update_function` as a transaction on `queue`, retrying per `options`.
pub async fn run_transaction<T, F, Fut>(
    queue: AsyncQueue,
    datastore: Arc<dyn Datastore>,
    options: TransactionOptions,
    update_function: F,
) -> FirestoreResult<T>
where
    T: Send + 'static,
    F: Fn(SharedTransaction) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
{
    options.validate()?;
    let (runner, result) = TransactionRunner::new(queue, datastore, options, update_function);
    runner.run();
    result.await
}

fn run_with_backoff<T: Send + 'static>(inner: &Arc<RunnerInner<T>>) {
    let runner = Arc::clone(inner);
    inner.backoff.lock().unwrap().backoff_and_run(move || {
        async move {
            let transaction: SharedTransaction = Arc::new(AsyncMutex::new(Transaction::new(
                Arc::clone(&runner.datastore),
            )));
            // The update function may wait on reads; it must not hold the queue.
            runtime::spawn_detached(async move {
                let attempt_runner = Arc::clone(&runner);
                let attempt_transaction = Arc::clone(&transaction);
                let outcome = AssertUnwindSafe(async move {
                    (attempt_runner.update_function)(attempt_transaction).await
                })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(internal_error(format!(
                        "Transaction update function panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
                match outcome {
                    Ok(result) => commit_on_queue(runner, transaction, result),
                    Err(err) => handle_transaction_error(&runner, err),
                }
            });
            Ok(())
        }
        .boxed()
    });
}

fn commit_on_queue<T: Send + 'static>(
    runner: Arc<RunnerInner<T>>,
    transaction: SharedTransaction,
    result: T,
) {
    let queue = runner.queue.clone();
    queue.enqueue_and_forget(move || async move {
        let committed = transaction.lock().await.commit().await;
        match committed {
            Ok(()) => {
                runner.deferred.resolve(result);
            }
            Err(err) => handle_transaction_error(&runner, err),
        }
        // Failures belong to this transaction, never to the queue.
        Ok(())
    });
}

fn handle_transaction_error<T: Send + 'static>(runner: &Arc<RunnerInner<T>>, err: FirestoreError) {
    let retry = {
        let mut remaining = runner.attempts_remaining.lock().unwrap();
        if *remaining > 0 && is_retryable_transaction_error(&err) {
            *remaining -= 1;
            Some(*remaining)
        } else {
            None
        }
    };

    match retry {
        Some(remaining) => {
            log::debug!(
                target: "firestore",
                "Retrying transaction after {err}, {} attempt(s) left after this one",
                remaining
            );
            let retry_runner = Arc::clone(runner);
            runner.queue.enqueue_and_forget(move || async move {
                run_with_backoff(&retry_runner);
                Ok(())
            });
        }
        None => {
            runner.deferred.reject(err);
        }
    }
}

fn is_retryable_transaction_error(err: &FirestoreError) -> bool {
    matches!(
        err.code,
        FirestoreErrorCode::Aborted | FirestoreErrorCode::FailedPrecondition
    ) || !is_permanent_error(err.code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::firestore::api::{SetOptions, UserDataReader};
    use crate::firestore::error::{aborted, permission_denied, unavailable};
    use crate::firestore::model::{DatabaseId, DocumentKey, FieldPath, ObjectValue};
    use crate::firestore::remote::{DatastoreImpl, InMemoryConnection, NoopTokenProvider};
    use crate::firestore::value::FirestoreValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(n: i64) -> ObjectValue {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), FirestoreValue::from_integer(n));
        ObjectValue::from_map(map)
    }

    fn setup() -> (AsyncQueue, InMemoryConnection, Arc<dyn Datastore>) {
        let database_id = DatabaseId::default("p");
        let connection = InMemoryConnection::new(database_id.clone());
        let datastore = DatastoreImpl::new(
            database_id,
            Arc::new(connection.clone()),
            Arc::new(NoopTokenProvider),
        );
        (AsyncQueue::new(), connection, Arc::new(datastore))
    }

    /// Reads `c/a`, and writes back `n + 1`.
    async fn increment(
        transaction: SharedTransaction,
        reader: UserDataReader,
    ) -> FirestoreResult<i64> {
        let mut transaction = transaction.lock().await;
        let docs = transaction.lookup(&[key("c/a")]).await?;
        let current = docs[0]
            .as_document()
            .and_then(|doc| doc.data().field(&FieldPath::from_dot_separated("n").unwrap()))
            .and_then(FirestoreValue::as_integer)
            .unwrap_or(0);
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), FirestoreValue::from_integer(current + 1));
        let data = reader.parse_set_data("Transaction.set", &key("c/a"), map, &SetOptions::default())?;
        transaction.set(key("c/a"), &data);
        Ok(current + 1)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_after_a_concurrent_write() {
        let (queue, connection, datastore) = setup();
        connection.set_document(&key("c/a"), doc(1));
        let attempts = Arc::new(AtomicU32::new(0));
        let reader = UserDataReader::new(DatabaseId::default("p"));

        let counter = Arc::clone(&attempts);
        let server = connection.clone();
        let result = run_transaction(queue, datastore, TransactionOptions::default(), move |tx| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let server = server.clone();
            let reader = reader.clone();
            async move {
                let value = increment(tx, reader).await?;
                if attempt == 0 {
                    // Another client writes between our read and our commit.
                    server.set_document(&key("c/a"), doc(10));
                }
                Ok(value)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 11);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(connection.document(&key("c/a")).unwrap().data(), &doc(11));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_attempt_budget() {
        let (queue, connection, datastore) = setup();
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            connection.fail_next("commit", aborted("contention"));
        }
        let attempts = Arc::new(AtomicU32::new(0));
        let reader = UserDataReader::new(DatabaseId::default("p"));
        let counter = Arc::clone(&attempts);
        let err = run_transaction(queue, datastore, TransactionOptions::default(), move |tx| {
            counter.fetch_add(1, Ordering::SeqCst);
            increment(tx, reader.clone())
        })
        .await
        .unwrap_err();

        assert_eq!(err.code, FirestoreErrorCode::Aborted);
        assert_eq!(attempts.load(Ordering::SeqCst), DEFAULT_MAX_ATTEMPTS);
        assert!(connection.document(&key("c/a")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_update_function_rejects_without_retry() {
        let (queue, connection, datastore) = setup();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(3600),
            run_transaction(queue.clone(), datastore, TransactionOptions::default(), move |_tx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if true {
                        panic!("update function bug");
                    }
                    Ok(())
                }
            }),
        )
        .await
        .expect("transaction settles");

        let err = outcome.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Internal);
        assert!(err.message().contains("update function bug"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(connection.rpc_count("commit"), 0);
        assert!(queue.failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_and_permanent_ones_are_not() {
        let (queue, connection, datastore) = setup();
        connection.fail_next("commit", unavailable("try again"));
        let reader = UserDataReader::new(DatabaseId::default("p"));
        let value = run_transaction(
            queue.clone(),
            Arc::clone(&datastore),
            TransactionOptions::default(),
            move |tx| increment(tx, reader.clone()),
        )
        .await
        .unwrap();
        assert_eq!(value, 1);

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let err = run_transaction(queue, datastore, TransactionOptions::default(), move |_tx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(permission_denied("no")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_attempts_is_validated_and_honored() {
        let (queue, connection, datastore) = setup();
        let err = run_transaction(
            queue.clone(),
            Arc::clone(&datastore),
            TransactionOptions { max_attempts: 0 },
            |_tx| async { Ok(()) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert_eq!(err.message(), "Max attempts must be at least 1");

        connection.fail_next("commit", aborted("contention"));
        let reader = UserDataReader::new(DatabaseId::default("p"));
        let err = run_transaction(queue, datastore, TransactionOptions { max_attempts: 1 }, move |tx| {
            increment(tx, reader.clone())
        })
        .await
        .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Aborted);
    }
}
