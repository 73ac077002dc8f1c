//! In-process stand-in for a master and its minions.
//!
//! [`SimFleet`] implements [`Transport`]: each submission gets a fresh job
//! id, and every matched minion publishes its return on the event feed
//! after its own delay. Returns are also recorded so `lookup_job` can
//! replay them.

pub mod fleet;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::engine::FeedSender;
use crate::error::DispatchError;
use crate::event::{EventTag, RawEvent};
use crate::model::{CallArgs, JobId, Target, WorkerId};
use crate::transport::{Submitted, Transport};

/// What a simulated minion answers.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Return this value.
    Value(Value),
    /// Report the called function as unknown.
    NotAvailable,
    /// Never answer.
    Silent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimWorker {
    pub id: WorkerId,
    /// Time from dispatch to return.
    pub delay: Duration,
    pub reply: Reply,
    /// Record the return for `lookup_job` but never publish it.
    pub lookup_only: bool,
    /// Matched by target resolution, but left out of every accepted job.
    pub offline: bool,
}

impl SimWorker {
    pub fn new(id: impl Into<String>, delay: Duration, reply: Reply) -> Self {
        Self {
            id: WorkerId::new(id),
            delay,
            reply,
            lookup_only: false,
            offline: false,
        }
    }

    pub fn returning(id: impl Into<String>, delay: Duration, value: Value) -> Self {
        Self::new(id, delay, Reply::Value(value))
    }

    pub fn silent(id: impl Into<String>) -> Self {
        Self::new(id, Duration::ZERO, Reply::Silent)
    }

    pub fn lookup_only(mut self) -> Self {
        self.lookup_only = true;
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }
}

/// One accepted submission, as the fleet saw it.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub job_id: JobId,
    pub function: String,
    pub workers: Vec<WorkerId>,
    pub at: Instant,
}

#[derive(Default)]
struct SimState {
    returns: HashMap<JobId, HashMap<WorkerId, Value>>,
    dispatches: Vec<DispatchRecord>,
    submissions: usize,
    reject_submission: Option<usize>,
}

pub struct SimFleet {
    workers: Vec<SimWorker>,
    feed: FeedSender,
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimFleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimFleet")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl SimFleet {
    pub fn new(feed: FeedSender, workers: Vec<SimWorker>) -> Self {
        Self {
            workers,
            feed,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Make the `n`-th submission (1-based) fail as rejected by the master.
    pub fn reject_submission(self, n: usize) -> Self {
        self.lock().reject_submission = Some(n);
        self
    }

    /// Accepted submissions so far, in order.
    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.lock().dispatches.clone()
    }

    fn matching(&self, target: &Target) -> Result<Vec<&SimWorker>, DispatchError> {
        let mut matched = Vec::new();
        for worker in &self.workers {
            let hit = target
                .matches(worker.id.as_str())
                .map_err(|e| DispatchError::InvalidTarget(e.to_string()))?;
            if hit {
                matched.push(worker);
            }
        }
        Ok(matched)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for SimFleet {
    async fn resolve_targets(&self, target: &Target) -> Result<Vec<WorkerId>, DispatchError> {
        Ok(self
            .matching(target)?
            .into_iter()
            .map(|w| w.id.clone())
            .collect())
    }

    async fn submit_job(
        &self,
        function: &str,
        args: &CallArgs,
        target: &Target,
    ) -> Result<Submitted, DispatchError> {
        let matched: Vec<&SimWorker> = self
            .matching(target)?
            .into_iter()
            .filter(|w| !w.offline)
            .collect();
        let job_id = JobId::new(Uuid::new_v4().simple().to_string());
        let workers: Vec<WorkerId> = matched.iter().map(|w| w.id.clone()).collect();

        {
            let mut state = self.lock();
            state.submissions += 1;
            if state.reject_submission == Some(state.submissions) {
                return Err(DispatchError::Rejected(format!(
                    "submission {} refused",
                    state.submissions
                )));
            }
            state.dispatches.push(DispatchRecord {
                job_id: job_id.clone(),
                function: function.to_string(),
                workers: workers.clone(),
                at: Instant::now(),
            });
        }
        debug!(%job_id, function, ?args, minions = workers.len(), "simulated dispatch");

        let announce = RawEvent::new(
            EventTag::New {
                job: job_id.clone(),
            }
            .to_string(),
            json!({ "jid": job_id, "fun": function, "minions": workers }),
        );
        if self.feed.try_send(announce).is_err() {
            trace!(%job_id, "feed full, job announcement dropped");
        }

        for worker in matched {
            let value = match &worker.reply {
                Reply::Value(value) => value.clone(),
                Reply::NotAvailable => json!(format!("'{function}' is not available.")),
                Reply::Silent => continue,
            };
            let event = RawEvent::job_return(&job_id, &worker.id, function, value.clone());

            // Instant minions have returned before the caller even sees the job id.
            if worker.delay.is_zero() {
                record_return(&self.state, &job_id, &worker.id, value);
                if !worker.lookup_only && self.feed.try_send(event).is_err() {
                    trace!(worker = %worker.id, "feed full, return only visible via lookup");
                }
                continue;
            }

            let state = Arc::clone(&self.state);
            let feed = self.feed.clone();
            let job_id = job_id.clone();
            let worker = worker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(worker.delay).await;
                record_return(&state, &job_id, &worker.id, value);
                if worker.lookup_only {
                    trace!(worker = %worker.id, "return recorded without publishing");
                    return;
                }
                let _ = feed.send(event).await;
            });
        }

        Ok(Submitted { job_id, workers })
    }

    async fn lookup_job(&self, job_id: &JobId) -> Result<HashMap<WorkerId, Value>, DispatchError> {
        Ok(self.lock().returns.get(job_id).cloned().unwrap_or_default())
    }
}

fn record_return(state: &Mutex<SimState>, job_id: &JobId, worker: &WorkerId, value: Value) {
    state
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .returns
        .entry(job_id.clone())
        .or_default()
        .insert(worker.clone(), value);
}
