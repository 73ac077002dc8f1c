//! Smoke test for the OTLP pipelines.
//!
//! Needs a collector listening on `localhost:4317` (any OTLP/gRPC receiver).
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::time::Duration;

use minion_call::cancel::CancelSignal;
use minion_call::engine::{Engine, event_feed};
use minion_call::model::{BatchSpec, Call, Target};
use minion_call::sim::{SimFleet, SimWorker};
use minion_call::telemetry::{TelemetryConfig, init_telemetry};
use serde_json::json;

#[test]
#[ignore]
fn smoke_call_exports_all_signals() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = init_telemetry(TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            service_name: "minion-call-smoke-test".to_string(),
            default_level: "debug".to_string(),
        })
        .expect("failed to init telemetry");
        assert!(guard.is_exporting());

        let (tx, rx) = event_feed(16);
        let fleet = Arc::new(SimFleet::new(
            tx,
            vec![
                SimWorker::returning("web1", Duration::from_millis(50), json!(true)),
                SimWorker::returning("web2", Duration::from_millis(100), json!("pong")),
                SimWorker::silent("web3"),
            ],
        ));
        let engine = Engine::start(fleet, rx);

        // Spans, counters, the duration histogram and logs all fire along the way.
        let outcome = engine
            .call_async(
                Call::<bool>::new("test.ping"),
                Target::all(),
                BatchSpec::amount(2).unwrap(),
                CancelSignal::after(Duration::from_millis(500), "smoke deadline"),
            )
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.canceled.as_deref(), Some("smoke deadline"));

        engine.shutdown();
        guard.force_flush();
        println!("flushed {} batch(es) of telemetry", outcome.batches.len());
    });
}
