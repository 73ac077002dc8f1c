//! # minion-call
//!
//! Dispatches one logical remote call to a dynamic set of minions and
//! collects their individually timed, individually fallible returns by
//! correlating the master's live event feed back to the dispatched jobs.
//!
//! Provides batch sequencing (at most one batch outstanding), per-minion
//! single-assignment results, deadline/cancellation sweeps, and
//! OpenTelemetry observability.

pub mod cancel;
pub mod config;
pub mod correlator;
pub mod decode;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod router;
pub mod scheduler;
pub mod sim;
pub mod telemetry;
pub mod transport;
