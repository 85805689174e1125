use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::firestore::error::{cancelled, FirestoreError, FirestoreResult};

/// The settling half of a one-shot result.
///
/// Only the first `resolve` or `reject` takes effect. Dropping an unsettled
/// `Deferred` rejects its promise with `CANCELLED`.
pub struct Deferred<T> {
    sender: Mutex<Option<oneshot::Sender<FirestoreResult<T>>>>,
}

/// The awaiting half of a [`Deferred`].
pub struct DeferredPromise<T> {
    receiver: oneshot::Receiver<FirestoreResult<T>>,
}

pub fn deferred<T>() -> (Deferred<T>, DeferredPromise<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        Deferred {
            sender: Mutex::new(Some(sender)),
        },
        DeferredPromise { receiver },
    )
}

impl<T> Deferred<T> {
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: FirestoreError) -> bool {
        self.settle(Err(error))
    }

    pub fn settle(&self, result: FirestoreResult<T>) -> bool {
        match self.sender.lock().unwrap().take() {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }
}

impl<T> Future for DeferredPromise<T> {
    type Output = FirestoreResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => {
                Poll::Ready(Err(cancelled("Deferred was dropped before it settled")))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
