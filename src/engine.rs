//! Engine: the public entry point.
//!
//! Owns the event router and its pump task, and hands calls to the batch
//! scheduler. One engine serves any number of concurrent calls over one
//! feed subscription.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cancel::CancelSignal;
use crate::config::CallOptions;
use crate::dispatch::JobDispatcher;
use crate::event::RawEvent;
use crate::model::{BatchSpec, Call, Target};
use crate::router::EventRouter;
use crate::scheduler::{AsyncCall, BatchScheduler};
use crate::transport::Transport;

/// Sending half of the event feed, for whatever reads the master's stream.
pub type FeedSender = mpsc::Sender<RawEvent>;

/// Create a bounded event feed.
pub fn event_feed(capacity: usize) -> (FeedSender, mpsc::Receiver<RawEvent>) {
    mpsc::channel(capacity.max(1))
}

pub struct Engine {
    router: EventRouter,
    scheduler: BatchScheduler,
    shutdown: Arc<Notify>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("router", &self.router)
            .field("pumping", &!self.pump.is_finished())
            .finish()
    }
}

impl Engine {
    /// Start routing `feed` and accept calls through `transport`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(transport: Arc<dyn Transport>, feed: mpsc::Receiver<RawEvent>) -> Self {
        let router = EventRouter::new();
        let shutdown = Arc::new(Notify::new());

        let pump = tokio::spawn({
            let router = router.clone();
            let shutdown = Arc::clone(&shutdown);
            async move {
                tokio::select! {
                    _ = shutdown.notified() => info!("event router shutting down"),
                    _ = router.pump(feed) => {}
                }
            }
        });

        Self {
            scheduler: BatchScheduler::new(JobDispatcher::new(transport), router.clone()),
            router,
            shutdown,
            pump,
        }
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Start `call`; see [`BatchScheduler::call_async`].
    pub fn call_async<T>(
        &self,
        call: Call<T>,
        target: Target,
        batch: BatchSpec,
        cancel: CancelSignal,
    ) -> AsyncCall<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.scheduler.call_async(call, target, batch, cancel)
    }

    /// Start `call` with configured batching and timeout.
    pub fn call<T>(&self, call: Call<T>, target: Target, options: &CallOptions) -> AsyncCall<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.call_async(call, target, options.batch, options.cancel_signal())
    }

    /// Stop routing events. Calls still in flight only settle through cancellation.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Wait for the pump task to end (after [`Engine::shutdown`] or feed close).
    pub async fn join(self) {
        let _ = self.pump.await;
    }
}
