//! Backpressure convergence: a small gate drains a larger fan-out without
//! the permit pool ever exceeding its bound or going negative.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relevance_harness::cancel::CancellationToken;
use relevance_harness::experiment::{ExperimentKind, Variant};
use relevance_harness::orchestrator::{
    BatchStatus, ConcurrencyGate, TaskOrchestrator, VariantBatch,
};
use relevance_harness::SearchConfiguration;

use support::{CountingEvaluator, MemoryStore, Script, ScriptedBackend};

fn configuration() -> Arc<SearchConfiguration> {
    Arc::new(SearchConfiguration {
        id: "cfg-1".into(),
        name: "baseline".into(),
        index: "products".into(),
        query_body: "{}".into(),
    })
}

fn variants(n: usize) -> Vec<Variant> {
    (0..n)
        .map(|_| Variant::new("exp-1", ExperimentKind::PointwiseEvaluation, None))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_units_converge_through_a_two_permit_gate() {
    let backend = Arc::new(
        ScriptedBackend::answering(Script::Hits(vec!["doc-1", "doc-2"]))
            .with_delay(Duration::from_millis(20)),
    );
    let store = Arc::new(MemoryStore::new());
    let evaluator = Arc::new(CountingEvaluator::new());

    let gate = ConcurrencyGate::new(2, Duration::from_millis(10));
    let monitor_gate = gate.clone();
    // Tight queue so dispatch rejection and permit re-acquisition both fire.
    let orchestrator =
        TaskOrchestrator::with_gate(backend.clone(), store.clone(), evaluator, gate, 1);

    // Panics inside a spawned task would not fail the test, so record
    // violations in a flag checked afterwards.
    let violation = Arc::new(AtomicBool::new(false));
    let monitor = tokio::spawn({
        let violation = violation.clone();
        async move {
            loop {
                let metrics = monitor_gate.metrics();
                if metrics.available_permits > metrics.configured_max
                    || metrics.active_tasks > metrics.configured_max
                {
                    violation.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
    });

    let batch = VariantBatch {
        experiment_id: "exp-1".into(),
        configuration: configuration(),
        query_text: Arc::from("red shoes"),
        variants: variants(10),
        ratings: None,
        size: 10,
    };
    let outcome = orchestrator
        .run_batch(batch, CancellationToken::new("test"))
        .wait()
        .await
        .unwrap();
    monitor.abort();
    assert!(
        !violation.load(Ordering::SeqCst),
        "permit accounting violated its bounds"
    );

    assert_eq!(outcome.status, BatchStatus::Success);
    assert_eq!(outcome.summary.total, 10);
    assert_eq!(outcome.summary.succeeded, 10);
    assert_eq!(backend.calls(), 10);
    assert_eq!(store.variants().len(), 10);

    // Fully drained: every permit returned.
    let metrics = orchestrator.gate_metrics();
    assert_eq!(metrics.available_permits, 2);
    assert_eq!(metrics.active_tasks, 0);
    assert_eq!(metrics.active_batches, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_fanout_still_completes_every_variant() {
    let backend = Arc::new(
        ScriptedBackend::answering(Script::Hits(vec!["doc-1"]))
            .with_delay(Duration::from_millis(1)),
    );
    let store = Arc::new(MemoryStore::new());
    let evaluator = Arc::new(CountingEvaluator::new());

    let gate = ConcurrencyGate::new(2, Duration::from_millis(5));
    let orchestrator = TaskOrchestrator::with_gate(backend.clone(), store, evaluator, gate, 4);

    let batch = VariantBatch {
        experiment_id: "exp-1".into(),
        configuration: configuration(),
        query_text: Arc::from("red shoes"),
        variants: variants(50),
        ratings: None,
        size: 10,
    };
    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        orchestrator
            .run_batch(batch, CancellationToken::new("test"))
            .wait(),
    )
    .await
    .expect("fan-out did not converge")
    .unwrap();

    assert_eq!(outcome.summary.succeeded, 50);
    assert_eq!(backend.calls(), 50);
}
