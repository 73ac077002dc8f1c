//! Batch scheduler: runs one logical call as a sequence of batches.
//!
//! Batch n+1 is only dispatched after batch n has settled, so at most one
//! batch worth of minions is ever outstanding. Each batch gets its own job,
//! correlator and cancellation gate; their per-minion handles are merged
//! into one map that callers can watch grow.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::cancel::{CancelSignal, Settlement, gate};
use crate::correlator::{ResultCorrelator, WorkerResult};
use crate::dispatch::JobDispatcher;
use crate::error::{CallResult, DispatchError, Error, Result};
use crate::model::{BatchSpec, Call, Job, Target, WorkerId};
use crate::router::EventRouter;
use crate::telemetry::{job as spans, metrics};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// One dispatched batch and how it settled.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub job: Job,
    pub settlement: Settlement,
}

/// Final state of a call once every dispatched batch has settled.
#[derive(Debug, Clone)]
pub struct CallOutcome<T> {
    /// Exactly one result per minion that was dispatched to.
    pub results: BTreeMap<WorkerId, CallResult<T>>,
    /// Dispatched batches, in order.
    pub batches: Vec<BatchReport>,
    /// Matched minions that were never sent the job: their batch never
    /// started, or the master left them out of the batch it accepted.
    pub not_dispatched: Vec<WorkerId>,
    /// The submission failure that stopped the remaining batches.
    pub error: Option<DispatchError>,
    /// Set if the cancellation signal fired before the call finished.
    pub canceled: Option<String>,
}

impl<T> CallOutcome<T> {
    fn empty() -> Self {
        Self {
            results: BTreeMap::new(),
            batches: Vec::new(),
            not_dispatched: Vec::new(),
            error: None,
            canceled: None,
        }
    }

    /// Did every matched minion get dispatched and return on its own?
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
            && self.not_dispatched.is_empty()
            && self
                .batches
                .iter()
                .all(|b| b.settlement == Settlement::Completed)
    }
}

// ---------------------------------------------------------------------------
// Caller handle
// ---------------------------------------------------------------------------

struct Progress<T> {
    workers: BTreeMap<WorkerId, WorkerResult<T>>,
    /// Outcome of the first batch's submission; `None` until attempted.
    first_batch: Option<std::result::Result<(), DispatchError>>,
    finished: bool,
}

/// A call in flight. Minions appear as their batch is dispatched.
pub struct AsyncCall<T> {
    progress: watch::Receiver<Progress<T>>,
    driver: JoinHandle<CallOutcome<T>>,
}

impl<T> std::fmt::Debug for AsyncCall<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let progress = self.progress.borrow();
        f.debug_struct("AsyncCall")
            .field("known_workers", &progress.workers.len())
            .field("finished", &progress.finished)
            .finish()
    }
}

impl<T> AsyncCall<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The authoritative minion map as of the first batch's dispatch.
    ///
    /// Fails with the dispatch error if the first batch was rejected.
    pub async fn workers(&self) -> Result<BTreeMap<WorkerId, WorkerResult<T>>> {
        let mut rx = self.progress.clone();
        let progress = rx
            .wait_for(|p| p.first_batch.is_some())
            .await
            .map_err(|_| stopped())?;
        match &progress.first_batch {
            Some(Err(e)) => Err(Error::Dispatch(e.clone())),
            _ => Ok(progress.workers.clone()),
        }
    }

    /// Handle for `worker`, once its batch is dispatched. `None` if the call
    /// finishes without ever dispatching to it.
    pub async fn worker(&self, worker: &WorkerId) -> Option<WorkerResult<T>> {
        let mut rx = self.progress.clone();
        let progress = rx
            .wait_for(|p| p.finished || p.workers.contains_key(worker))
            .await
            .ok()?;
        progress.workers.get(worker).cloned()
    }

    /// Minions dispatched so far, without waiting.
    pub fn known_workers(&self) -> BTreeMap<WorkerId, WorkerResult<T>> {
        self.progress.borrow().workers.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.progress.borrow().finished
    }

    /// Wait until every dispatched batch has settled.
    pub async fn wait(self) -> Result<CallOutcome<T>> {
        self.driver
            .await
            .map_err(|e| Error::Other(format!("call driver failed: {e}")))
    }
}

fn stopped() -> Error {
    Error::Other("call driver stopped before dispatching".to_string())
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Starts calls and drives their batches.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    dispatcher: JobDispatcher,
    router: EventRouter,
}

impl BatchScheduler {
    pub fn new(dispatcher: JobDispatcher, router: EventRouter) -> Self {
        Self { dispatcher, router }
    }

    /// Start `call` on `target`, split per `batch`, observing `cancel`.
    ///
    /// Returns at once; the batches are driven on a spawned task.
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
        let (progress, rx) = watch::channel(Progress {
            workers: BTreeMap::new(),
            first_batch: None,
            finished: false,
        });
        let span = spans::start_call_span(call.function(), &target);
        let driver = Driver {
            dispatcher: self.dispatcher.clone(),
            router: self.router.clone(),
            call,
            target,
            batch,
            cancel,
            progress,
        };
        AsyncCall {
            progress: rx,
            driver: tokio::spawn(driver.run().instrument(span)),
        }
    }
}

/// A batch before dispatch. `workers` is unknown when unbatched: the
/// master decides who matches at submission time.
struct PlannedBatch {
    target: Target,
    workers: Option<Vec<WorkerId>>,
}

struct Driver<T> {
    dispatcher: JobDispatcher,
    router: EventRouter,
    call: Call<T>,
    target: Target,
    batch: BatchSpec,
    cancel: CancelSignal,
    progress: watch::Sender<Progress<T>>,
}

impl<T> Driver<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn run(self) -> CallOutcome<T> {
        let mut outcome = CallOutcome::empty();

        let plan = match self.plan().await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "could not resolve target for batching");
                self.first_batch_attempted(Err(e.clone()));
                outcome.error = Some(e);
                return self.finish(outcome);
            }
        };
        debug!(batches = plan.len(), batch = %self.batch, "call planned");

        for (index, planned) in plan.iter().enumerate() {
            if let Some(reason) = self.cancel.reason() {
                info!(batch = index, reason, "canceled before batch dispatch");
                outcome.canceled = Some(reason);
                outcome.not_dispatched.extend(undispatched(&plan[index..]));
                break;
            }

            let size = planned.workers.as_ref().map_or(0, Vec::len);
            let span = spans::start_batch_span(index, size);
            match self.run_batch(planned).instrument(span.clone()).await {
                Ok((report, results)) => {
                    spans::record_settlement(&span, report.settlement.label());
                    let dropped = not_accepted(planned, &report.job);
                    if !dropped.is_empty() {
                        warn!(
                            job_id = %report.job.id,
                            minions = dropped.len(),
                            "master did not accept every planned minion"
                        );
                        outcome.not_dispatched.extend(dropped);
                    }
                    outcome.results.extend(results);
                    outcome.batches.push(report);
                }
                Err(e) => {
                    self.first_batch_attempted(Err(e.clone()));
                    outcome.error = Some(e);
                    outcome.not_dispatched.extend(undispatched(&plan[index..]));
                    break;
                }
            }
        }

        // A late signal may have swept the final batch.
        if outcome.canceled.is_none() {
            outcome.canceled = outcome.batches.iter().find_map(|b| match &b.settlement {
                Settlement::Canceled { reason, .. } => Some(reason.clone()),
                Settlement::Completed => None,
            });
        }
        self.finish(outcome)
    }

    async fn plan(&self) -> std::result::Result<Vec<PlannedBatch>, DispatchError> {
        if self.batch == BatchSpec::Unbatched {
            return Ok(vec![PlannedBatch {
                target: self.target.clone(),
                workers: None,
            }]);
        }
        let matched = self.dispatcher.resolve(&self.target).await?;
        Ok(self
            .batch
            .partition(&matched)
            .into_iter()
            .map(|workers| PlannedBatch {
                target: Target::list(workers.iter().map(|w| w.0.clone())),
                workers: Some(workers),
            })
            .collect())
    }

    /// Dispatch one batch and wait for it to settle.
    async fn run_batch(
        &self,
        planned: &PlannedBatch,
    ) -> std::result::Result<(BatchReport, BTreeMap<WorkerId, CallResult<T>>), DispatchError> {
        let started = Instant::now();
        let job = self.dispatcher.submit(&self.call, &planned.target).await?;
        spans::record_job_id(&tracing::Span::current(), &job.id);

        let correlator = ResultCorrelator::<T>::create(job, self.call.function(), &self.router);

        // Publish before waiting so callers can attach handlers right away.
        let handles = correlator.handles();
        self.progress.send_modify(|p| {
            p.workers.extend(handles);
            p.first_batch.get_or_insert(Ok(()));
        });

        self.catch_up(&correlator);

        let settlement = gate(&correlator, &self.cancel).await;
        metrics::batch_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("settlement", settlement.label())],
        );

        Ok((
            BatchReport {
                job: correlator.job().clone(),
                settlement,
            },
            correlator.resolved(),
        ))
    }

    /// Feed returns that landed before the subscription existed.
    ///
    /// Runs beside the gate so a slow lookup never delays cancellation.
    fn catch_up(&self, correlator: &Arc<ResultCorrelator<T>>) {
        if correlator.is_settled() {
            return;
        }
        let dispatcher = self.dispatcher.clone();
        let correlator = Arc::clone(correlator);
        tokio::spawn(
            async move {
                match dispatcher.lookup(correlator.job_id()).await {
                    Ok(returns) => {
                        if !returns.is_empty() {
                            debug!(
                                job_id = %correlator.job_id(),
                                returns = returns.len(),
                                "replaying returns recorded before subscription"
                            );
                        }
                        for (worker, value) in &returns {
                            correlator.on_event(worker, value);
                        }
                    }
                    Err(e) => {
                        warn!(job_id = %correlator.job_id(), error = %e, "job lookup failed");
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn first_batch_attempted(&self, result: std::result::Result<(), DispatchError>) {
        self.progress.send_modify(|p| {
            p.first_batch.get_or_insert(result);
        });
    }

    fn finish(self, outcome: CallOutcome<T>) -> CallOutcome<T> {
        spans::record_call_finished(&tracing::Span::current(), outcome.batches.len());
        info!(
            minions = outcome.results.len(),
            batches = outcome.batches.len(),
            not_dispatched = outcome.not_dispatched.len(),
            canceled = outcome.canceled.is_some(),
            failed = outcome.error.is_some(),
            "call finished"
        );
        self.progress.send_modify(|p| {
            p.first_batch.get_or_insert(Ok(()));
            p.finished = true;
        });
        outcome
    }
}

/// Planned minions missing from the job the master actually started.
fn not_accepted(planned: &PlannedBatch, job: &Job) -> Vec<WorkerId> {
    let Some(workers) = &planned.workers else {
        return Vec::new();
    };
    workers
        .iter()
        .filter(|w| !job.workers.contains(w))
        .cloned()
        .collect()
}

fn undispatched(remaining: &[PlannedBatch]) -> Vec<WorkerId> {
    remaining
        .iter()
        .filter_map(|b| b.workers.as_ref())
        .flatten()
        .cloned()
        .collect()
}
