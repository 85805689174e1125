pub mod async_queue;
pub mod deferred;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use deferred::{deferred, Deferred, DeferredPromise};
