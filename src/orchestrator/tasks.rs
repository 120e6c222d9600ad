//! Per-batch task orchestration.
//!
//! For every variant in a batch the orchestrator admits one unit of work
//! through the concurrency gate, dispatches it on the bounded search
//! executor, classifies the outcome and feeds the batch aggregator. Fatal
//! system failures abort the batch; everything else is isolated per variant.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::cancel::CancellationToken;
use crate::collaborators::{
    Evaluator, PersistenceStore, RankedDocIds, RelevanceRatings, SearchBackend,
    SearchConfiguration,
};
use crate::experiment::Variant;

use super::batch::{BatchAggregator, BatchFuture};
use super::gate::{permit_count, ConcurrencyGate, DispatchPool, GateMetrics, GatePermit};

/// Message recorded against a variant whose search returned nothing.
pub const NO_HITS_MESSAGE: &str = "no hits found";

/// Tuning knobs for the orchestration engine.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Worker count the gate is sized from.
    pub available_workers: usize,
    /// Bounded queue depth of the search dispatch executor.
    pub dispatch_queue_capacity: usize,
    /// Fixed delay between admission retries.
    pub backpressure_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            available_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            dispatch_queue_capacity: 64,
            backpressure_delay: super::gate::BACKPRESSURE_DELAY,
        }
    }
}

/// One batch of variants to evaluate against one backend configuration.
pub struct VariantBatch {
    pub experiment_id: String,
    pub configuration: Arc<SearchConfiguration>,
    pub query_text: Arc<str>,
    pub variants: Vec<Variant>,
    /// Ratings for graded scoring; absent when no judgments apply.
    pub ratings: Option<Arc<RelevanceRatings>>,
    /// Result size limit for each search execution.
    pub size: usize,
}

/// Top-level engine routing variant work through the gate and executor.
pub struct TaskOrchestrator {
    backend: Arc<dyn SearchBackend>,
    store: Arc<dyn PersistenceStore>,
    evaluator: Arc<dyn Evaluator>,
    gate: ConcurrencyGate,
    pool: DispatchPool<UnitOfWork>,
}

impl TaskOrchestrator {
    /// Must be called from within a tokio runtime (spawns executor workers).
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        store: Arc<dyn PersistenceStore>,
        evaluator: Arc<dyn Evaluator>,
        config: &OrchestratorConfig,
    ) -> Self {
        let gate = ConcurrencyGate::new(
            permit_count(config.available_workers),
            config.backpressure_delay,
        );
        Self::with_gate(backend, store, evaluator, gate, config.dispatch_queue_capacity)
    }

    /// Construct with an explicit gate (tests size it directly).
    pub fn with_gate(
        backend: Arc<dyn SearchBackend>,
        store: Arc<dyn PersistenceStore>,
        evaluator: Arc<dyn Evaluator>,
        gate: ConcurrencyGate,
        dispatch_queue_capacity: usize,
    ) -> Self {
        let pool = DispatchPool::new(
            gate.max_permits(),
            dispatch_queue_capacity,
            |unit: UnitOfWork| unit.run(),
        );
        Self {
            backend,
            store,
            evaluator,
            gate,
            pool,
        }
    }

    /// Read-only concurrency diagnostics.
    pub fn gate_metrics(&self) -> GateMetrics {
        self.gate.metrics()
    }

    /// Evaluate every variant of one batch. Returns immediately with the
    /// batch future; admission and dispatch proceed in a driver task.
    ///
    /// Each variant's terminal outcome feeds the aggregator; the future
    /// resolves once when the last one lands, or rejects on the first fatal
    /// system failure.
    pub fn run_batch(&self, batch: VariantBatch, token: CancellationToken) -> BatchFuture {
        let (aggregator, future) = BatchAggregator::new(batch.variants.len());
        let driver = BatchDriver {
            experiment_id: batch.experiment_id,
            backend: self.backend.clone(),
            store: self.store.clone(),
            evaluator: self.evaluator.clone(),
            gate: self.gate.clone(),
            pool: self.pool.clone(),
            aggregator,
            token,
            configuration: batch.configuration,
            query_text: batch.query_text,
            ratings: batch.ratings,
            size: batch.size,
        };
        tokio::spawn(driver.drive(batch.variants));
        future
    }
}

struct BatchDriver {
    experiment_id: String,
    backend: Arc<dyn SearchBackend>,
    store: Arc<dyn PersistenceStore>,
    evaluator: Arc<dyn Evaluator>,
    gate: ConcurrencyGate,
    pool: DispatchPool<UnitOfWork>,
    aggregator: BatchAggregator,
    token: CancellationToken,
    configuration: Arc<SearchConfiguration>,
    query_text: Arc<str>,
    ratings: Option<Arc<RelevanceRatings>>,
    size: usize,
}

impl BatchDriver {
    async fn drive(self, variants: Vec<Variant>) {
        let _batch_guard = self.gate.batch_guard();
        tracing::debug!(
            experiment_id = %self.experiment_id,
            configuration_id = %self.configuration.id,
            variants = variants.len(),
            "batch started"
        );

        for variant in variants {
            // Checkpoint before admission: a failed batch or cancelled run
            // short-circuits the rest of the fan-out without dispatch.
            if self.short_circuit(&variant) {
                continue;
            }

            let Some(permit) = self.admit().await else {
                self.record_skipped(&variant);
                continue;
            };

            let unit = UnitOfWork {
                variant,
                permit: Some(permit),
                backend: self.backend.clone(),
                store: self.store.clone(),
                evaluator: self.evaluator.clone(),
                aggregator: self.aggregator.clone(),
                configuration: self.configuration.clone(),
                query_text: self.query_text.clone(),
                ratings: self.ratings.clone(),
                size: self.size,
            };
            self.dispatch_with_backpressure(unit).await;
        }
    }

    fn short_circuit(&self, variant: &Variant) -> bool {
        if self.aggregator.is_failed() {
            self.aggregator.complete_failure();
            return true;
        }
        if self.token.is_cancelled() {
            tracing::debug!(
                variant_id = %variant.id,
                owner = %self.token.owner(),
                "variant skipped after cancellation"
            );
            self.aggregator.complete_failure();
            return true;
        }
        false
    }

    async fn admit(&self) -> Option<GatePermit> {
        let aggregator = self.aggregator.clone();
        let token = self.token.clone();
        self.gate
            .admit_with_backpressure(move || aggregator.is_failed() || token.is_cancelled())
            .await
    }

    fn record_skipped(&self, variant: &Variant) {
        tracing::debug!(
            variant_id = %variant.id,
            "admission aborted before dispatch"
        );
        self.aggregator.complete_failure();
    }

    /// Dispatch on the bounded executor. A full queue releases the permit
    /// and retries the whole admission attempt after the fixed delay.
    async fn dispatch_with_backpressure(&self, mut unit: UnitOfWork) {
        loop {
            match self.pool.try_dispatch(unit) {
                Ok(()) => return,
                Err(mut bounced) => {
                    bounced.permit = None;
                    tracing::debug!(
                        variant_id = %bounced.variant.id,
                        "dispatch queue full, backing off"
                    );
                    sleep(self.gate.backpressure_delay()).await;

                    let Some(permit) = self.admit().await else {
                        bounced.aggregator.complete_failure();
                        return;
                    };
                    bounced.permit = Some(permit);
                    unit = bounced;
                }
            }
        }
    }
}

/// One admitted, dispatchable search evaluation.
struct UnitOfWork {
    variant: Variant,
    /// Held for the full duration of the search call.
    permit: Option<GatePermit>,
    backend: Arc<dyn SearchBackend>,
    store: Arc<dyn PersistenceStore>,
    evaluator: Arc<dyn Evaluator>,
    aggregator: BatchAggregator,
    configuration: Arc<SearchConfiguration>,
    query_text: Arc<str>,
    ratings: Option<Arc<RelevanceRatings>>,
    size: usize,
}

impl UnitOfWork {
    async fn run(mut self) {
        // The permit spans queue wait plus the search call itself; it is
        // returned before the outcome is aggregated.
        let permit = self.permit.take();
        let result = self
            .backend
            .execute(&self.configuration, &self.query_text, self.size)
            .await;
        drop(permit);

        match result {
            Ok(ranked) if ranked.is_empty() => {
                tracing::debug!(
                    variant_id = %self.variant.id,
                    configuration_id = %self.configuration.id,
                    query = %self.query_text,
                    "search returned no hits"
                );
                self.variant.fail(NO_HITS_MESSAGE);
                self.persist().await;
                self.aggregator.complete_failure();
            }
            Ok(ranked) => {
                let metrics = self.score(&ranked);
                self.variant.complete(metrics);
                self.persist().await;
                self.aggregator.complete_success();
            }
            Err(error) if error.is_fatal() => {
                tracing::error!(
                    configuration_id = %self.configuration.id,
                    code = error.code(),
                    error = %error,
                    "fatal search failure, aborting batch"
                );
                self.aggregator.fail_fatal(error);
            }
            Err(error) => {
                tracing::warn!(
                    variant_id = %self.variant.id,
                    configuration_id = %self.configuration.id,
                    code = error.code(),
                    error = %error,
                    "variant search failed"
                );
                self.variant.fail(error.to_string());
                self.persist().await;
                self.aggregator.complete_failure();
            }
        }
    }

    fn score(&self, ranked: &RankedDocIds) -> serde_json::Value {
        match self.ratings.as_deref() {
            Some(ratings) => self.evaluator.score(ranked, ratings),
            None => self.evaluator.score(ranked, &RelevanceRatings::default()),
        }
    }

    async fn persist(&self) {
        if let Err(error) = self.store.put_variant(&self.variant).await {
            tracing::warn!(
                variant_id = %self.variant.id,
                error = %error,
                "failed to persist variant"
            );
        }
    }
}
