//! Typed configuration from environment variables.
//!
//! Loaded once at startup; malformed values fail fast. Everything has a
//! default, so an empty environment is a valid configuration.

use std::time::Duration;

use crate::cancel::CancelSignal;
use crate::error::{Error, Result};
use crate::model::BatchSpec;

const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Default per-call options.
    pub call: CallOptions,
    /// Buffer between the feed reader and the router.
    pub feed_capacity: usize,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Batching and deadline applied to a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub batch: BatchSpec,
    /// `None` waits for every minion indefinitely.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// A fresh cancellation signal for one call, timing out per `timeout`.
    pub fn cancel_signal(&self) -> CancelSignal {
        match self.timeout {
            Some(timeout) => {
                CancelSignal::after(timeout, format!("timed out after {}s", timeout.as_secs()))
            }
            None => CancelSignal::never(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let batch = match optional_var("MINION_CALL_BATCH") {
            Some(s) => s.parse()?,
            None => BatchSpec::Unbatched,
        };
        let timeout = optional_var("MINION_CALL_TIMEOUT_SECS")
            .map(|s| parse_positive("MINION_CALL_TIMEOUT_SECS", &s))
            .transpose()?
            .map(|secs| Duration::from_secs(secs as u64));
        let feed_capacity = optional_var("MINION_CALL_FEED_CAPACITY")
            .map(|s| parse_positive("MINION_CALL_FEED_CAPACITY", &s))
            .transpose()?
            .unwrap_or(DEFAULT_FEED_CAPACITY);

        Ok(Self {
            call: CallOptions { batch, timeout },
            feed_capacity,
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Unset and blank are treated alike.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_positive(name: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!(
            "{name} must be a positive integer, got '{value}'"
        ))),
    }
}
