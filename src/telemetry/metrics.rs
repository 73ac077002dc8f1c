//! Metric instrument factories.
//!
//! Instruments come from the `"minion-call"` meter of the global
//! `MeterProvider`; without an OTLP endpoint that provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("minion-call")
}

/// Counter: feed events seen by the router.
/// Labels: `class` ("new" | "ret" | "prog"), `disposition` ("delivered" | "unclaimed" | "ignored").
pub fn events_routed() -> Counter<u64> {
    meter()
        .u64_counter("minion_call.events.routed")
        .with_description("Feed events seen by the event router")
        .build()
}

/// Counter: worker slots resolved.
/// Labels: `kind` ("success" | "decoding" | "not_available" | "canceled").
pub fn results_resolved() -> Counter<u64> {
    meter()
        .u64_counter("minion_call.results.resolved")
        .with_description("Per-minion result slots resolved")
        .build()
}

/// Counter: events dropped by a correlator (unknown minion or already resolved).
pub fn events_dropped() -> Counter<u64> {
    meter()
        .u64_counter("minion_call.events.dropped")
        .with_description("Return events that resolved nothing")
        .build()
}

/// Counter: batch submissions.
/// Labels: `result` ("ok" | "error").
pub fn batches_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("minion_call.batches.dispatched")
        .with_description("Batch submissions to the master")
        .build()
}

/// Histogram: time from batch dispatch to settlement.
/// Labels: `settlement` ("completed" | "canceled").
pub fn batch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("minion_call.batch.duration_ms")
        .with_description("Time from batch dispatch until every minion resolved")
        .with_unit("ms")
        .build()
}
