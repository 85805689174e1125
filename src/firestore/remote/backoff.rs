use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::time::Instant;

use crate::firestore::error::FirestoreResult;
use crate::firestore::util::async_queue::{AsyncQueue, DelayedOperation, TimerId, WeakAsyncQueue};

pub const DEFAULT_BACKOFF_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_BACKOFF_MAX_DELAY_MS: u64 = 60 * 1_000;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_BACKOFF_INITIAL_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_ms: DEFAULT_BACKOFF_MAX_DELAY_MS,
        }
    }
}

/// Schedules retries on an [`AsyncQueue`] with exponentially growing,
/// jittered delays.
///
/// The first attempt after construction or [`reset`](Self::reset) runs
/// without delay. Each later attempt waits `base * [0.5, 1.5)` minus the time
/// already elapsed since the previous attempt started; the base grows by
/// `backoff_factor` and is clamped to `[initial_delay, max_delay]`.
pub struct ExponentialBackoff {
    queue: WeakAsyncQueue,
    timer_id: TimerId,
    settings: BackoffSettings,
    current_base_ms: f64,
    last_attempt_time: Arc<Mutex<Instant>>,
    timer: Option<DelayedOperation<()>>,
    rng: Box<dyn RngCore + Send>,
}

impl ExponentialBackoff {
    pub(crate) fn new(queue: WeakAsyncQueue, timer_id: TimerId) -> Self {
        Self::with_settings(queue, timer_id, BackoffSettings::default())
    }

    pub(crate) fn with_settings(
        queue: WeakAsyncQueue,
        timer_id: TimerId,
        settings: BackoffSettings,
    ) -> Self {
        Self {
            queue,
            timer_id,
            settings,
            current_base_ms: 0.0,
            last_attempt_time: Arc::new(Mutex::new(Instant::now())),
            timer: None,
            rng: Box::new(StdRng::from_entropy()),
        }
    }

    pub fn for_queue(queue: &AsyncQueue, timer_id: TimerId, settings: BackoffSettings) -> Self {
        Self::with_settings(queue.downgrade(), timer_id, settings)
    }

    /// Replaces the jitter source, e.g. with a seeded `StdRng`.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn settings(&self) -> BackoffSettings {
        self.settings
    }

    /// The pre-jitter delay the next `backoff_and_run` will use.
    pub fn current_base_ms(&self) -> f64 {
        self.current_base_ms
    }

    /// The next attempt runs immediately; later ones grow from the initial
    /// delay.
    pub fn reset(&mut self) {
        self.current_base_ms = 0.0;
    }

    /// Jumps to the maximum delay, e.g. after `RESOURCE_EXHAUSTED`.
    pub fn reset_to_max(&mut self) {
        self.current_base_ms = self.settings.max_delay_ms as f64;
    }

    /// Cancels any pending attempt and schedules `op` after the current
    /// backoff delay.
    pub fn backoff_and_run<F>(&mut self, op: F)
    where
        F: FnOnce() -> BoxFuture<'static, FirestoreResult<()>> + Send + 'static,
    {
        self.cancel();

        let jitter = (self.rng.gen::<f64>() - 0.5) * self.current_base_ms;
        let desired_delay_ms = (self.current_base_ms + jitter).floor().max(0.0);
        let elapsed_ms = self
            .last_attempt_time
            .lock()
            .unwrap()
            .elapsed()
            .as_millis() as f64;
        let remaining_delay_ms = (desired_delay_ms - elapsed_ms).max(0.0);

        if remaining_delay_ms > 0.0 {
            log::debug!(
                target: "firestore",
                "Backing off for {remaining_delay_ms} ms (base delay: {} ms, delay with jitter: {desired_delay_ms} ms, last attempt: {elapsed_ms} ms ago)",
                self.current_base_ms
            );
        }

        match self.queue.upgrade() {
            Some(queue) => {
                let last_attempt_time = Arc::clone(&self.last_attempt_time);
                self.timer = Some(queue.enqueue_after_delay(
                    self.timer_id,
                    Duration::from_millis(remaining_delay_ms as u64),
                    move || {
                        *last_attempt_time.lock().unwrap() = Instant::now();
                        op()
                    },
                ));
            }
            None => {
                log::debug!(target: "firestore", "Dropping backoff attempt: the queue is gone");
            }
        }

        self.current_base_ms = (self.current_base_ms * self.settings.backoff_factor)
            .max(self.settings.initial_delay_ms as f64)
            .min(self.settings.max_delay_ms as f64);
    }

    /// Runs the pending attempt now.
    pub fn skip_backoff(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.skip_delay();
        }
    }

    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel(None);
        }
    }
}
