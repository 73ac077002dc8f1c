//! Event router: fans feed events out to whoever is waiting on that job.
//!
//! Only the job-id map is locked, and only long enough to clone the
//! interested listeners out of it. Listeners run after the lock is
//! released, so they may subscribe or unsubscribe from inside a callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::event::{EventTag, RawEvent, ReturnData};
use crate::model::{JobId, WorkerId};
use crate::telemetry::metrics;

/// Something that wants the return events of one job.
pub trait JobListener: Send + Sync {
    /// Called once per return event of the subscribed job. Must not block.
    fn on_event(&self, worker: &WorkerId, value: &Value);
}

/// Handle identifying one subscription, used to unsubscribe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// What the router did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to this many listeners.
    Delivered(usize),
    /// A job event nobody is subscribed to (unrelated job, or already settled).
    Unclaimed,
    /// Not a return event, or not a job event at all.
    Ignored,
}

type Listeners = HashMap<JobId, Vec<(SubscriptionId, Arc<dyn JobListener>)>>;

/// Shared router. Cloning yields another handle to the same job map.
#[derive(Clone, Default)]
pub struct EventRouter {
    listeners: Arc<Mutex<Listeners>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("jobs", &self.lock().len())
            .finish()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start receiving return events for `job`.
    pub fn subscribe(&self, job: JobId, listener: Arc<dyn JobListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(job_id = %job, "subscribed to job events");
        self.lock().entry(job).or_default().push((id, listener));
        id
    }

    /// Stop a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, job: &JobId, id: SubscriptionId) -> bool {
        let mut listeners = self.lock();
        let Some(entries) = listeners.get_mut(job) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(sub, _)| *sub != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(job);
        }
        if removed {
            debug!(job_id = %job, "unsubscribed from job events");
        }
        removed
    }

    /// Is anyone still listening for `job`?
    pub fn is_subscribed(&self, job: &JobId) -> bool {
        self.lock().contains_key(job)
    }

    /// Route one feed event.
    pub fn deliver(&self, event: &RawEvent) -> Delivery {
        let Some(tag) = EventTag::parse(&event.tag) else {
            trace!(tag = %event.tag, "ignoring non-job event");
            return Delivery::Ignored;
        };

        let EventTag::Return { job, worker } = &tag else {
            trace!(job_id = %tag.job(), class = tag.class(), "ignoring job event");
            record(tag.class(), "ignored");
            return Delivery::Ignored;
        };

        let interested: Vec<Arc<dyn JobListener>> = match self.lock().get(job) {
            Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => Vec::new(),
        };

        if interested.is_empty() {
            debug!(job_id = %job, worker = %worker, "no listener for return event");
            record(tag.class(), "unclaimed");
            return Delivery::Unclaimed;
        }

        let value = ReturnData::return_value(&event.data);
        for listener in &interested {
            listener.on_event(worker, &value);
        }
        record(tag.class(), "delivered");
        Delivery::Delivered(interested.len())
    }

    /// Drain the feed until it closes, routing every event.
    pub async fn pump(&self, mut feed: mpsc::Receiver<RawEvent>) {
        info!("event router started");
        while let Some(event) = feed.recv().await {
            self.deliver(&event);
        }
        info!("event feed closed, router stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        // A panicking listener never runs under this lock, so the map stays consistent.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn record(class: &'static str, disposition: &'static str) {
    metrics::events_routed().add(
        1,
        &[
            KeyValue::new("class", class),
            KeyValue::new("disposition", disposition),
        ],
    );
}
