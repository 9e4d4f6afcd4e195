//! Cancellable periodic background task.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A periodic task that runs until stopped or dropped
///
/// `stop` cancels the loop and waits for an in-flight tick to finish, so the
/// owner can tear down shared state afterwards. Stopping twice is harmless.
#[derive(Debug)]
pub(crate) struct BackgroundTask {
    name: String,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    /// Spawn `tick` every `period`, first run one period from now
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn_periodic<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let stop = token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!("Background task {} stopped", task_name);
        });

        Self {
            name,
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the loop to stop and wait for it to exit
    pub(crate) async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("Background task {} ended abnormally: {}", self.name, e);
        }
    }

}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
