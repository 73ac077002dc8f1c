//! Result correlator: one per dispatched job.
//!
//! Holds a single-assignment slot per minion the job went to, resolves
//! slots as return events arrive, and fires a one-shot "settled" signal
//! once the last slot is resolved, naturally or by a forced sweep.
//!
//! Slots are `watch` channels keyed by minion id. Callers only ever get
//! [`WorkerResult`] views onto them; the table itself stays private and
//! behind one mutex per correlator.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::decode::decode_return;
use crate::error::{CallError, CallResult};
use crate::model::{Job, JobId, WorkerId};
use crate::router::{EventRouter, JobListener, SubscriptionId};
use crate::telemetry::metrics;

type Slot<T> = watch::Sender<Option<CallResult<T>>>;

struct SlotTable<T> {
    slots: HashMap<WorkerId, Slot<T>>,
    outstanding: usize,
    subscription: Option<SubscriptionId>,
    /// Set once, by whichever path resolves the last slot.
    settled: bool,
}

/// Tracks the outstanding minions of one job.
pub struct ResultCorrelator<T> {
    job: Job,
    function: String,
    router: EventRouter,
    table: Mutex<SlotTable<T>>,
    settled: watch::Sender<bool>,
}

impl<T> std::fmt::Debug for ResultCorrelator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCorrelator")
            .field("job_id", &self.job.id)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl<T> ResultCorrelator<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Allocate a slot per minion of `job` and subscribe to its events.
    ///
    /// Returns immediately. A job with no minions is settled on creation.
    pub fn create(job: Job, function: impl Into<String>, router: &EventRouter) -> Arc<Self> {
        let slots: HashMap<WorkerId, Slot<T>> = job
            .workers
            .iter()
            .map(|w| (w.clone(), watch::Sender::new(None)))
            .collect();
        let outstanding = slots.len();

        let correlator = Arc::new(Self {
            function: function.into(),
            router: router.clone(),
            table: Mutex::new(SlotTable {
                slots,
                outstanding,
                subscription: None,
                settled: false,
            }),
            settled: watch::Sender::new(false),
            job,
        });

        if outstanding == 0 {
            debug!(job_id = %correlator.job.id, "job has no minions, settled on creation");
            correlator.lock().settled = true;
            correlator.settled.send_replace(true);
            return correlator;
        }

        // Subscribe while holding the table so an early event cannot settle
        // the job before the subscription id is stored.
        {
            let mut table = correlator.lock();
            let listener: Arc<dyn JobListener> = correlator.clone();
            table.subscription = Some(router.subscribe(correlator.job.id.clone(), listener));
        }

        debug!(
            job_id = %correlator.job.id,
            minions = outstanding,
            "correlator created"
        );
        correlator
    }

    /// Resolve `worker`'s slot from a return value, unless it is unknown or
    /// already resolved. Never fails.
    pub fn on_event(&self, worker: &WorkerId, value: &Value) {
        let subscription = {
            let mut table = self.lock();
            let Some(slot) = table.slots.get(worker) else {
                debug!(job_id = %self.job.id, worker = %worker, "event for unknown minion dropped");
                metrics::events_dropped().add(1, &[]);
                return;
            };
            if slot.borrow().is_some() {
                debug!(job_id = %self.job.id, worker = %worker, "duplicate event dropped");
                metrics::events_dropped().add(1, &[]);
                return;
            }

            let result = decode_return::<T>(&self.function, value);
            if let Err(ref err) = result {
                debug!(job_id = %self.job.id, worker = %worker, error = %err, "minion returned an error");
            }
            record_resolution(&result);
            slot.send_replace(Some(result));
            table.outstanding -= 1;

            if table.outstanding > 0 || table.settled {
                return;
            }
            table.settled = true;
            table.subscription.take()
        };

        info!(job_id = %self.job.id, "all minions returned");
        self.finish(subscription);
    }

    /// Resolve every still-pending slot with `Canceled(reason)`.
    ///
    /// Returns how many slots were swept. A no-op once the job has settled.
    pub fn force_resolve_remaining(&self, reason: &str) -> usize {
        let (swept, subscription) = {
            let mut table = self.lock();
            if table.settled {
                return 0;
            }
            let mut swept = 0;
            for (worker, slot) in &table.slots {
                if slot.borrow().is_none() {
                    debug!(job_id = %self.job.id, worker = %worker, reason, "minion canceled");
                    let result: CallResult<T> = Err(CallError::Canceled(reason.to_string()));
                    record_resolution(&result);
                    slot.send_replace(Some(result));
                    swept += 1;
                }
            }
            table.outstanding = 0;
            table.settled = true;
            (swept, table.subscription.take())
        };

        warn!(job_id = %self.job.id, swept, reason, "job canceled with minions outstanding");
        self.finish(subscription);
        swept
    }
}

impl<T> ResultCorrelator<T> {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    /// Minions that have not returned yet.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    pub fn is_settled(&self) -> bool {
        *self.settled.borrow()
    }

    /// Completes once every slot is resolved.
    pub async fn settled(&self) {
        let mut rx = self.settled.subscribe();
        // The sender lives as long as `self`, so this only ends by settling.
        let _ = rx.wait_for(|settled| *settled).await;
    }

    /// Read-only handles onto every slot, keyed by minion.
    pub fn handles(&self) -> BTreeMap<WorkerId, WorkerResult<T>> {
        self.lock()
            .slots
            .iter()
            .map(|(worker, slot)| {
                (
                    worker.clone(),
                    WorkerResult {
                        worker: worker.clone(),
                        job: self.job.id.clone(),
                        rx: slot.subscribe(),
                    },
                )
            })
            .collect()
    }

    /// Snapshot of the slots resolved so far.
    pub fn resolved(&self) -> BTreeMap<WorkerId, CallResult<T>>
    where
        T: Clone,
    {
        self.lock()
            .slots
            .iter()
            .filter_map(|(worker, slot)| slot.borrow().clone().map(|r| (worker.clone(), r)))
            .collect()
    }

    fn finish(&self, subscription: Option<SubscriptionId>) {
        if let Some(sub) = subscription {
            self.router.unsubscribe(&self.job.id, sub);
        }
        self.settled.send_replace(true);
    }

    fn lock(&self) -> MutexGuard<'_, SlotTable<T>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> JobListener for ResultCorrelator<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn on_event(&self, worker: &WorkerId, value: &Value) {
        ResultCorrelator::on_event(self, worker, value);
    }
}

fn record_resolution<T>(result: &CallResult<T>) {
    let kind = match result {
        Ok(_) => "success",
        Err(CallError::Decoding(_)) => "decoding",
        Err(CallError::FunctionNotAvailable { .. }) => "not_available",
        Err(CallError::Canceled(_)) => "canceled",
    };
    metrics::results_resolved().add(1, &[KeyValue::new("kind", kind)]);
}

// ---------------------------------------------------------------------------
// Worker handle
// ---------------------------------------------------------------------------

/// Read-only view of one minion's slot. Cheap to clone.
#[derive(Clone)]
pub struct WorkerResult<T> {
    worker: WorkerId,
    job: JobId,
    rx: watch::Receiver<Option<CallResult<T>>>,
}

impl<T> std::fmt::Debug for WorkerResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerResult")
            .field("worker", &self.worker)
            .field("job", &self.job)
            .field("resolved", &self.rx.borrow().is_some())
            .finish()
    }
}

impl<T: Clone> WorkerResult<T> {
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn job(&self) -> &JobId {
        &self.job
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The result, if already resolved.
    pub fn get(&self) -> Option<CallResult<T>> {
        self.rx.borrow().clone()
    }

    /// Wait for the result. Every observer sees the same value.
    pub async fn wait(&self) -> CallResult<T> {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or_else(|| Err(abandoned())),
            Err(_) => Err(abandoned()),
        }
    }

    /// Run `handler` on a spawned task once the result is in.
    pub fn on_complete<F>(&self, handler: F) -> JoinHandle<()>
    where
        T: Send + Sync + 'static,
        F: FnOnce(WorkerId, CallResult<T>) + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.wait().await;
            handler(this.worker, result);
        })
    }
}

fn abandoned() -> CallError {
    CallError::Canceled("result slot dropped before resolution".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn job(id: &str, workers: &[&str]) -> Job {
        Job {
            id: JobId::from(id),
            workers: workers.iter().map(|w| WorkerId::from(*w)).collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn first_resolution_wins() {
        let router = EventRouter::new();
        let corr = ResultCorrelator::<bool>::create(job("1", &["a", "b"]), "test.ping", &router);
        let a = WorkerId::from("a");

        corr.on_event(&a, &json!(true));
        corr.on_event(&a, &json!("late duplicate"));

        assert_eq!(corr.handles()[&a].get(), Some(Ok(true)));
        assert_eq!(corr.outstanding(), 1);
        assert!(!corr.is_settled());
    }

    #[test]
    fn unknown_minion_is_ignored() {
        let router = EventRouter::new();
        let corr = ResultCorrelator::<bool>::create(job("1", &["a"]), "test.ping", &router);

        corr.on_event(&WorkerId::from("stranger"), &json!(true));

        assert_eq!(corr.outstanding(), 1);
        assert!(corr.resolved().is_empty());
    }

    #[test]
    fn last_return_settles_and_unsubscribes() {
        let router = EventRouter::new();
        let corr = ResultCorrelator::<bool>::create(job("1", &["a", "b"]), "test.ping", &router);
        assert!(router.is_subscribed(&JobId::from("1")));

        corr.on_event(&WorkerId::from("a"), &json!(true));
        corr.on_event(&WorkerId::from("b"), &json!(false));

        assert!(corr.is_settled());
        assert!(!router.is_subscribed(&JobId::from("1")));
    }

    #[test]
    fn force_resolve_only_touches_pending_slots() {
        let router = EventRouter::new();
        let corr = ResultCorrelator::<bool>::create(job("1", &["a", "b", "c"]), "test.ping", &router);
        corr.on_event(&WorkerId::from("a"), &json!(true));

        assert_eq!(corr.force_resolve_remaining("deadline"), 2);
        assert_eq!(corr.force_resolve_remaining("again"), 0);

        let resolved = corr.resolved();
        assert_eq!(resolved[&WorkerId::from("a")], Ok(true));
        assert_eq!(
            resolved[&WorkerId::from("b")],
            Err(CallError::Canceled("deadline".to_string()))
        );
        assert!(corr.is_settled());
        assert_eq!(corr.outstanding(), 0);
    }

    #[test]
    fn force_after_natural_completion_is_noop() {
        let router = EventRouter::new();
        let corr = ResultCorrelator::<bool>::create(job("1", &["a"]), "test.ping", &router);
        corr.on_event(&WorkerId::from("a"), &json!(true));

        assert_eq!(corr.force_resolve_remaining("deadline"), 0);
        assert_eq!(corr.resolved()[&WorkerId::from("a")], Ok(true));
    }

    #[test]
    fn empty_job_is_settled_immediately() {
        let router = EventRouter::new();
        let corr = ResultCorrelator::<bool>::create(job("1", &[]), "test.ping", &router);
        assert!(corr.is_settled());
        assert!(!router.is_subscribed(&JobId::from("1")));
    }

    #[tokio::test]
    async fn handles_observe_resolution() {
        let router = EventRouter::new();
        let corr = ResultCorrelator::<bool>::create(job("1", &["a"]), "test.ping", &router);
        let handle = corr.handles()[&WorkerId::from("a")].clone();
        assert!(handle.get().is_none());

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait().await }
        });
        corr.on_event(&WorkerId::from("a"), &json!("pong"));

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CallError::Decoding(_))));
        assert_eq!(handle.get(), Some(result));
        corr.settled().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_delivery_racing_cancellation_resolves_each_slot_once() {
        use crate::cancel::{CancelSignal, Settlement, gate};
        use crate::event::RawEvent;
        use crate::router::Delivery;

        const MINIONS: u64 = 32;
        const DELIVERERS: u64 = 4;

        for round in 0..100 {
            let router = EventRouter::new();
            let job_id = JobId::new(format!("job{round}"));
            let names: Vec<String> = (0..MINIONS).map(|i| format!("m{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let corr =
                ResultCorrelator::<u64>::create(job(job_id.as_str(), &refs), "test.echo", &router);
            let handles = corr.handles();

            let (trigger, signal) = CancelSignal::manual();
            let gate_task = tokio::spawn({
                let corr = Arc::clone(&corr);
                async move { gate(&corr, &signal).await }
            });

            // Every deliverer sends a return for every minion, so each slot sees duplicates.
            let deliverers: Vec<_> = (0..DELIVERERS)
                .map(|task| {
                    let router = router.clone();
                    let job_id = job_id.clone();
                    tokio::spawn(async move {
                        for i in 0..MINIONS {
                            let worker = WorkerId::new(format!("m{i}"));
                            let value = json!(task * 1000 + i);
                            let event = RawEvent::job_return(&job_id, &worker, "test.echo", value);
                            router.deliver(&event);
                            if i % 8 == 0 {
                                tokio::task::yield_now().await;
                            }
                        }
                    })
                })
                .collect();

            tokio::task::yield_now().await;
            trigger.cancel("deadline");
            for deliverer in deliverers {
                deliverer.await.unwrap();
            }
            let settlement = gate_task.await.unwrap();

            let first: BTreeMap<WorkerId, CallResult<u64>> = handles
                .iter()
                .map(|(worker, handle)| {
                    (worker.clone(), handle.get().expect("slot left pending"))
                })
                .collect();

            let canceled = first
                .values()
                .filter(|r| matches!(r, Err(CallError::Canceled(_))))
                .count();
            match &settlement {
                Settlement::Canceled { reason, swept } => {
                    assert_eq!(reason, "deadline");
                    assert_eq!(canceled, *swept);
                }
                Settlement::Completed => assert_eq!(canceled, 0),
            }
            for (worker, result) in &first {
                if let Ok(value) = result {
                    assert_eq!(format!("m{}", value % 1000), worker.as_str());
                }
            }

            assert_eq!(corr.outstanding(), 0);
            assert!(corr.is_settled());
            assert!(!router.is_subscribed(&job_id));

            // Late returns change nothing once settled.
            let m0 = WorkerId::from("m0");
            let late = RawEvent::job_return(&job_id, &m0, "test.echo", json!(999_999));
            assert_eq!(router.deliver(&late), Delivery::Unclaimed);
            corr.on_event(&m0, &json!(999_999));
            for (worker, handle) in &handles {
                assert_eq!(handle.get().as_ref(), Some(&first[worker]));
            }
            assert_eq!(corr.resolved(), first);
        }
    }
}
