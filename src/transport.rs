//! The master API as seen by the engine.
//!
//! Authentication, request signing and connection handling live behind
//! this trait. [`crate::sim::SimFleet`] implements it in-process.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::model::{CallArgs, JobId, Target, WorkerId};

/// Accepted dispatch: the job id and the minions it was actually sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub job_id: JobId,
    pub workers: Vec<WorkerId>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Which minions `target` currently matches, in match order.
    /// Does not start anything.
    async fn resolve_targets(&self, target: &Target) -> Result<Vec<WorkerId>, DispatchError>;

    /// Start `function` on the minions matched by `target`.
    async fn submit_job(
        &self,
        function: &str,
        args: &CallArgs,
        target: &Target,
    ) -> Result<Submitted, DispatchError>;

    /// Return values already recorded by the master for `job_id`, keyed by minion.
    async fn lookup_job(
        &self,
        job_id: &JobId,
    ) -> Result<HashMap<WorkerId, serde_json::Value>, DispatchError>;
}
