//! Job dispatcher: the thin layer that turns a call into a [`Job`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::model::{Call, Job, JobId, Target, WorkerId};
use crate::telemetry::metrics;
use crate::transport::Transport;

/// Submits calls through a [`Transport`].
#[derive(Clone)]
pub struct JobDispatcher {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher").finish_non_exhaustive()
    }
}

impl JobDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Start `call` on `target`. A rejected submission creates nothing.
    pub async fn submit<T>(&self, call: &Call<T>, target: &Target) -> Result<Job, DispatchError> {
        let submitted = self
            .transport
            .submit_job(call.function(), call.args(), target)
            .await
            .inspect_err(|e| {
                warn!(function = call.function(), %target, error = %e, "dispatch rejected");
                metrics::batches_dispatched().add(1, &[KeyValue::new("result", "error")]);
            })?;

        metrics::batches_dispatched().add(1, &[KeyValue::new("result", "ok")]);
        info!(
            job_id = %submitted.job_id,
            function = call.function(),
            minions = submitted.workers.len(),
            "job dispatched"
        );

        Ok(Job {
            id: submitted.job_id,
            workers: dedup(submitted.workers),
            created_at: Utc::now(),
        })
    }

    /// Minions currently matched by `target`, without dispatching.
    pub async fn resolve(&self, target: &Target) -> Result<Vec<WorkerId>, DispatchError> {
        let workers = dedup(self.transport.resolve_targets(target).await?);
        debug!(%target, minions = workers.len(), "target resolved");
        Ok(workers)
    }

    /// Returns the master already holds for `job_id`.
    pub async fn lookup(
        &self,
        job_id: &JobId,
    ) -> Result<HashMap<WorkerId, serde_json::Value>, DispatchError> {
        self.transport.lookup_job(job_id).await
    }
}

/// Drop repeated minion ids, keeping first occurrence order.
fn dedup(workers: Vec<WorkerId>) -> Vec<WorkerId> {
    let mut seen = std::collections::HashSet::with_capacity(workers.len());
    workers.into_iter().filter(|w| seen.insert(w.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence() {
        let workers = ["b", "a", "b", "c", "a"].map(WorkerId::from).to_vec();
        assert_eq!(dedup(workers), ["b", "a", "c"].map(WorkerId::from).to_vec());
    }
}
