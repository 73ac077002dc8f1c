//! Span helpers for calls and their batches.

use tracing::Span;

use crate::model::{JobId, Target};

/// Span covering a whole call, across all of its batches.
///
/// `call.batches` is filled in by [`record_call_finished`].
pub fn start_call_span(function: &str, target: &Target) -> Span {
    tracing::info_span!(
        "minion_call.call",
        "call.function" = function,
        "call.target" = %target,
        "call.batches" = tracing::field::Empty,
    )
}

/// Span covering one batch from dispatch to settlement.
pub fn start_batch_span(index: usize, size: usize) -> Span {
    tracing::info_span!(
        "minion_call.batch",
        "batch.index" = index,
        "batch.size" = size,
        "job.id" = tracing::field::Empty,
        "batch.settlement" = tracing::field::Empty,
    )
}

/// Attach the master-assigned job id once the dispatch is accepted.
pub fn record_job_id(span: &Span, job_id: &JobId) {
    span.record("job.id", tracing::field::display(job_id));
}

/// Record how a batch settled ("completed" or "canceled").
pub fn record_settlement(span: &Span, settlement: &str) {
    span.record("batch.settlement", settlement);
    span.in_scope(|| {
        tracing::info!(settlement, "batch settled");
    });
}

pub fn record_call_finished(span: &Span, batches: usize) {
    span.record("call.batches", batches);
}
