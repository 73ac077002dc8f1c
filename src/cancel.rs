//! Cancellation signal and the gate that races it against a correlator.
//!
//! The signal is owned by the caller; the engine only observes it. Firing
//! it does not interrupt anything, it makes every gate currently watching
//! it sweep its correlator's pending slots.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::debug;

use crate::correlator::ResultCorrelator;

/// Fires a [`CancelSignal`] once. Dropping it without firing means "never".
#[derive(Debug)]
pub struct CancelTrigger {
    tx: watch::Sender<Option<String>>,
}

impl CancelTrigger {
    /// Fire with `reason`. Later calls keep the first reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

/// Observable deadline/abort. Cloning observes the same signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<Option<String>>>,
}

impl CancelSignal {
    /// A signal that never fires: wait for every minion indefinitely.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// A signal fired by hand through the returned trigger.
    pub fn manual() -> (CancelTrigger, Self) {
        let (tx, rx) = watch::channel(None);
        (CancelTrigger { tx }, Self { rx: Some(rx) })
    }

    /// A signal that fires with `reason` after `timeout`.
    ///
    /// Must be called within a Tokio runtime; the timer runs on its own task.
    pub fn after(timeout: Duration, reason: impl Into<String>) -> Self {
        let (trigger, signal) = Self::manual();
        let reason = reason.into();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!(?timeout, "cancellation deadline reached");
            trigger.cancel(reason);
        });
        signal
    }

    /// The reason, if the signal has already fired.
    pub fn reason(&self) -> Option<String> {
        self.rx.as_ref().and_then(|rx| rx.borrow().clone())
    }

    pub fn is_fired(&self) -> bool {
        self.reason().is_some()
    }

    /// Completes with the reason once fired; pends forever otherwise.
    pub async fn fired(&self) -> String {
        if let Some(rx) = &self.rx {
            let mut rx = rx.clone();
            if let Ok(reason) = rx.wait_for(Option::is_some).await {
                if let Some(reason) = reason.clone() {
                    return reason;
                }
            }
        }
        // Never fired, or the trigger was dropped unfired.
        std::future::pending().await
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}

/// How a gated correlator settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Every minion returned on its own.
    Completed,
    /// The signal fired first; `swept` slots were resolved as canceled.
    Canceled { reason: String, swept: usize },
}

impl Settlement {
    pub fn label(&self) -> &'static str {
        match self {
            Settlement::Completed => "completed",
            Settlement::Canceled { .. } => "canceled",
        }
    }
}

/// Wait for `correlator` to settle, sweeping it if `signal` fires first.
///
/// If both are ready at once, natural completion wins.
pub async fn gate<T>(correlator: &ResultCorrelator<T>, signal: &CancelSignal) -> Settlement
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    tokio::select! {
        biased;
        _ = correlator.settled() => Settlement::Completed,
        reason = signal.fired() => {
            let swept = correlator.force_resolve_remaining(&reason);
            if swept == 0 {
                // Lost the race by a hair: the last minion returned meanwhile.
                Settlement::Completed
            } else {
                Settlement::Canceled { reason, swept }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::model::{Job, JobId, WorkerId};
    use crate::router::EventRouter;
    use chrono::Utc;
    use serde_json::json;

    fn correlator(workers: &[&str]) -> std::sync::Arc<ResultCorrelator<bool>> {
        let job = Job {
            id: JobId::from("1"),
            workers: workers.iter().map(|w| WorkerId::from(*w)).collect(),
            created_at: Utc::now(),
        };
        ResultCorrelator::create(job, "test.ping", &EventRouter::new())
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_sweeps_stragglers() {
        let corr = correlator(&["a", "b"]);
        corr.on_event(&WorkerId::from("a"), &json!(true));

        let signal = CancelSignal::after(Duration::from_secs(7), "canceled");
        let settlement = gate(&corr, &signal).await;

        assert_eq!(
            settlement,
            Settlement::Canceled {
                reason: "canceled".to_string(),
                swept: 1
            }
        );
        assert_eq!(
            corr.resolved()[&WorkerId::from("b")],
            Err(CallError::Canceled("canceled".to_string()))
        );
    }

    #[tokio::test]
    async fn natural_completion_wins_when_both_ready() {
        let corr = correlator(&["a"]);
        corr.on_event(&WorkerId::from("a"), &json!(true));
        let (trigger, signal) = CancelSignal::manual();
        trigger.cancel("too late");

        assert_eq!(gate(&corr, &signal).await, Settlement::Completed);
        assert_eq!(corr.resolved()[&WorkerId::from("a")], Ok(true));
    }

    #[test]
    fn first_reason_sticks() {
        let (trigger, signal) = CancelSignal::manual();
        assert!(!signal.is_fired());
        trigger.cancel("first");
        trigger.cancel("second");
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn never_signal_does_not_fire() {
        let signal = CancelSignal::never();
        let fired = tokio::time::timeout(Duration::from_secs(3600), signal.fired()).await;
        assert!(fired.is_err());
    }
}
