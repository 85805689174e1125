use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;

static BACKGROUND_RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("firestore-background")
        .enable_all()
        .build()
        .map_err(|err| log::error!(target: "firestore", "failed to build background runtime: {err}"))
        .ok()
});

/// Spawns `future` in the background.
///
/// Uses the ambient tokio runtime when called from inside one, otherwise a
/// lazily created single-worker runtime owned by this crate.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    } else {
        log::error!(target: "firestore", "dropping background task: no runtime available");
    }
}

/// Like [`spawn_detached`], but returns a handle that can abort the task.
pub fn spawn_abortable<F>(future: F) -> Option<AbortHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        Some(handle.spawn(future).abort_handle())
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        Some(runtime.spawn(future).abort_handle())
    } else {
        log::error!(target: "firestore", "dropping background task: no runtime available");
        None
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}
