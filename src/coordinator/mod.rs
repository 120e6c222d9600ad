//! Full-run sequencing.
//!
//! The coordinator fetches run inputs, fans out per query text, branches by
//! experiment kind, merges cross-configuration results and finalizes the
//! terminal experiment state exactly once. Scheduled runs are registered so
//! a schedule id can have at most one live run, and a wall-clock timeout
//! cancels the whole run tree through its cancellation token.

pub mod registry;

pub use registry::{RegistryError, RunHandle, RunRegistry};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use thiserror::Error;

use crate::cancel::{CancellationToken, CompletionLatch};
use crate::collaborators::{
    Evaluator, InputCatalog, JudgmentSource, PersistenceStore, RankedDocIds, RelevanceRatings,
    ResultSink, SearchBackend, SearchConfiguration, TerminalState,
};
use crate::experiment::{
    ConfigBatchReport, ExperimentKind, ExperimentResult, ExperimentSpec, ExperimentStatus,
    QueryOutcome, Variant,
};
use crate::orchestrator::{
    BatchError, GateMetrics, OrchestratorConfig, TaskOrchestrator, VariantBatch,
};
use crate::sweep::{expand_variant_space, WeightsRange};

/// Query texts evaluated concurrently within one run.
const QUERY_TEXT_CONCURRENCY: usize = 4;

/// Fallback sweep range when weights are fixed (not consulted).
const UNUSED_RANGE: WeightsRange = WeightsRange {
    min: 0.0,
    max: 1.0,
    increment: 0.1,
};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("invalid run request: {0}")]
    InvalidRequest(String),
}

/// One run of one experiment.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub experiment: ExperimentSpec,
    /// Present for scheduled runs; enforces one live run per schedule.
    #[serde(default)]
    pub schedule_id: Option<String>,
    /// Wall-clock timeout for the whole run.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

/// Sequences full experiment runs over injected collaborators.
pub struct RunCoordinator {
    catalog: Arc<dyn InputCatalog>,
    judgments: Arc<dyn JudgmentSource>,
    backend: Arc<dyn SearchBackend>,
    store: Arc<dyn PersistenceStore>,
    sink: Arc<dyn ResultSink>,
    evaluator: Arc<dyn Evaluator>,
    registry: Arc<RunRegistry>,
    orchestrator: Arc<TaskOrchestrator>,
}

impl RunCoordinator {
    /// Must be called from within a tokio runtime (spawns executor workers).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn InputCatalog>,
        judgments: Arc<dyn JudgmentSource>,
        backend: Arc<dyn SearchBackend>,
        store: Arc<dyn PersistenceStore>,
        sink: Arc<dyn ResultSink>,
        evaluator: Arc<dyn Evaluator>,
        registry: Arc<RunRegistry>,
        config: &OrchestratorConfig,
    ) -> Self {
        let orchestrator = Arc::new(TaskOrchestrator::new(
            backend.clone(),
            store.clone(),
            evaluator.clone(),
            config,
        ));
        Self {
            catalog,
            judgments,
            backend,
            store,
            sink,
            evaluator,
            registry,
            orchestrator,
        }
    }

    /// Read-only concurrency diagnostics.
    pub fn gate_metrics(&self) -> GateMetrics {
        self.orchestrator.gate_metrics()
    }

    /// Validate, register and launch one run.
    ///
    /// Input-state errors (duplicate schedule id, malformed request) fail
    /// fast before any dispatch. On success the run proceeds in the
    /// background; the caller observes completion through `latch`, which is
    /// released exactly once - by finalize or by the cancellation callback.
    pub fn start_run(
        &self,
        run_id: impl Into<String>,
        request: RunRequest,
        token: CancellationToken,
        latch: CompletionLatch,
    ) -> Result<(), RunError> {
        let run_id = run_id.into();
        validate_request(&request.experiment)?;

        if let Some(schedule_id) = &request.schedule_id {
            self.registry.register(schedule_id, &run_id)?;
        }

        let context = Arc::new(RunContext {
            run_id: run_id.clone(),
            schedule_id: request.schedule_id.clone(),
            result: Mutex::new(ExperimentResult::processing(
                run_id.as_str(),
                &request.experiment,
            )),
            spec: request.experiment,
            catalog: self.catalog.clone(),
            judgments: self.judgments.clone(),
            backend: self.backend.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
            evaluator: self.evaluator.clone(),
            orchestrator: self.orchestrator.clone(),
            registry: self.registry.clone(),
            token: token.clone(),
            latch: latch.clone(),
            finalized: AtomicBool::new(false),
        });

        // Cancellation cleanup: abort registered handles, drop the registry
        // entry, force the completion signal, then persist the terminal
        // state off the canceller's thread.
        {
            let context = context.clone();
            token.on_cancel(move || {
                if let Some(schedule_id) = &context.schedule_id {
                    let cancelled = context
                        .registry
                        .cancel_and_remove(schedule_id, &context.run_id);
                    tracing::warn!(
                        run_id = %context.run_id,
                        schedule_id = %schedule_id,
                        handles = cancelled,
                        "scheduled run cancelled"
                    );
                }
                context.latch.release();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let context = context.clone();
                    handle.spawn(async move {
                        context
                            .finalize(None, TerminalState::cancelled("run cancelled"))
                            .await;
                    });
                }
            });
        }

        if let Some(timeout) = request.timeout {
            let token = token.clone();
            let latch = latch.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !latch.is_released() {
                    tracing::warn!(run_id = %run_id, ?timeout, "run timed out, cancelling");
                    token.cancel();
                }
            });
        }

        let body = tokio::spawn({
            let context = context.clone();
            async move { context.execute().await }
        });
        if let Some(schedule_id) = &context.schedule_id {
            if let Err(handle) = self.registry.append(
                schedule_id,
                &context.run_id,
                RunHandle::new(body.abort_handle()),
            ) {
                // Cancellation raced the spawn; the entry is gone.
                handle.cancel();
            }
        }

        Ok(())
    }
}

fn validate_request(spec: &ExperimentSpec) -> Result<(), RunError> {
    if spec.configuration_ids.is_empty() {
        return Err(RunError::InvalidRequest(
            "at least one search configuration is required".into(),
        ));
    }
    if spec.kind == ExperimentKind::PairwiseComparison && spec.configuration_ids.len() < 2 {
        return Err(RunError::InvalidRequest(
            "pairwise comparison requires at least two search configurations".into(),
        ));
    }
    if spec.kind == ExperimentKind::HybridOptimizer && spec.include_weights {
        match spec.weights_range {
            Some(range) => range
                .validate()
                .map_err(|e| RunError::InvalidRequest(e.to_string()))?,
            None => {
                return Err(RunError::InvalidRequest(
                    "include_weights requires a weights range".into(),
                ))
            }
        }
    }
    Ok(())
}

/// Why a run did not complete.
enum RunFailure {
    Cancelled,
    Failed(String),
}

struct RunContext {
    run_id: String,
    schedule_id: Option<String>,
    spec: ExperimentSpec,
    result: Mutex<ExperimentResult>,
    catalog: Arc<dyn InputCatalog>,
    judgments: Arc<dyn JudgmentSource>,
    backend: Arc<dyn SearchBackend>,
    store: Arc<dyn PersistenceStore>,
    sink: Arc<dyn ResultSink>,
    evaluator: Arc<dyn Evaluator>,
    orchestrator: Arc<TaskOrchestrator>,
    registry: Arc<RunRegistry>,
    token: CancellationToken,
    latch: CompletionLatch,
    finalized: AtomicBool,
}

impl RunContext {
    async fn execute(self: Arc<Self>) {
        if self.finalized.load(Ordering::Acquire) {
            return;
        }
        tracing::info!(
            run_id = %self.run_id,
            experiment_id = %self.spec.id,
            kind = self.spec.kind.as_str(),
            "run started"
        );

        // Initial PROCESSING record; failures here are logged, not fatal.
        let initial = self
            .result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Err(error) = self.store.update_experiment(&initial).await {
            tracing::warn!(run_id = %self.run_id, error = %error, "failed to persist run start");
        }

        match self.clone().run_inner().await {
            Ok(outcomes) => {
                self.finalize(Some(outcomes), TerminalState::Completed).await;
            }
            Err(RunFailure::Cancelled) => {
                self.finalize(None, TerminalState::cancelled("run cancelled"))
                    .await;
            }
            Err(RunFailure::Failed(message)) => {
                self.finalize(None, TerminalState::error(message)).await;
            }
        }
    }

    async fn run_inner(self: Arc<Self>) -> Result<Vec<QueryOutcome>, RunFailure> {
        if self.token.is_cancelled() {
            return Err(RunFailure::Cancelled);
        }

        let query_set = self
            .catalog
            .fetch_query_set(&self.spec.query_set_id)
            .await
            .map_err(|e| {
                RunFailure::Failed(format!(
                    "failed to fetch query set {}: {e}",
                    self.spec.query_set_id
                ))
            })?;
        let configurations: Vec<Arc<SearchConfiguration>> = self
            .catalog
            .fetch_configurations(&self.spec.configuration_ids)
            .await
            .map_err(|e| RunFailure::Failed(format!("failed to fetch configurations: {e}")))?
            .into_iter()
            .map(Arc::new)
            .collect();

        if query_set.queries.is_empty() {
            tracing::info!(run_id = %self.run_id, "query set is empty, finalizing immediately");
            return Ok(Vec::new());
        }

        let evaluations = query_set.queries.into_iter().map(|query| {
            let context = self.clone();
            let configurations = configurations.clone();
            async move { context.evaluate_query(&configurations, query).await }
        });
        let collected: Vec<Result<QueryOutcome, RunFailure>> = stream::iter(evaluations)
            .buffer_unordered(QUERY_TEXT_CONCURRENCY)
            .collect()
            .await;

        // Fan-in barrier: everything has resolved; surface a genuine failure
        // over a cancellation marker when both occurred.
        let mut outcomes = Vec::with_capacity(collected.len());
        let mut cancelled = false;
        let mut failed: Option<String> = None;
        for item in collected {
            match item {
                Ok(outcome) => outcomes.push(outcome),
                Err(RunFailure::Cancelled) => cancelled = true,
                Err(RunFailure::Failed(message)) => {
                    failed.get_or_insert(message);
                }
            }
        }
        if let Some(message) = failed {
            return Err(RunFailure::Failed(message));
        }
        if cancelled {
            return Err(RunFailure::Cancelled);
        }
        Ok(outcomes)
    }

    async fn evaluate_query(
        &self,
        configurations: &[Arc<SearchConfiguration>],
        query: String,
    ) -> Result<QueryOutcome, RunFailure> {
        if self.token.is_cancelled() {
            return Err(RunFailure::Cancelled);
        }
        match self.spec.kind {
            ExperimentKind::HybridOptimizer => {
                let params = expand_variant_space(
                    &self.spec.normalization_techniques,
                    &self.spec.combination_techniques,
                    self.spec.weights_range.unwrap_or(UNUSED_RANGE),
                    self.spec.include_weights,
                )
                .map_err(|e| RunFailure::Failed(e.to_string()))?;
                let ratings = self.fetch_ratings(&query).await;
                let variants_for = |_: &SearchConfiguration| {
                    params
                        .iter()
                        .map(|p| {
                            Variant::new(self.spec.id.as_str(), self.spec.kind, Some(p.clone()))
                        })
                        .collect::<Vec<_>>()
                };
                self.batched_outcome(configurations, query, ratings, variants_for)
                    .await
            }
            ExperimentKind::PointwiseEvaluation => {
                let ratings = self.fetch_ratings(&query).await;
                let variants_for = |_: &SearchConfiguration| {
                    vec![Variant::new(self.spec.id.as_str(), self.spec.kind, None)]
                };
                self.batched_outcome(configurations, query, ratings, variants_for)
                    .await
            }
            ExperimentKind::PairwiseComparison => {
                self.pairwise_outcome(configurations, query).await
            }
        }
    }

    /// Hybrid and pointwise paths: one batch per configuration, joined as a
    /// fan-in barrier before the query text counts as done.
    async fn batched_outcome(
        &self,
        configurations: &[Arc<SearchConfiguration>],
        query: String,
        ratings: Option<Arc<RelevanceRatings>>,
        variants_for: impl Fn(&SearchConfiguration) -> Vec<Variant>,
    ) -> Result<QueryOutcome, RunFailure> {
        let query_text: Arc<str> = Arc::from(query.as_str());

        let mut pending = Vec::with_capacity(configurations.len());
        for configuration in configurations {
            if self.token.is_cancelled() {
                return Err(RunFailure::Cancelled);
            }
            let batch = VariantBatch {
                experiment_id: self.spec.id.clone(),
                configuration: configuration.clone(),
                query_text: query_text.clone(),
                variants: variants_for(configuration),
                ratings: ratings.clone(),
                size: self.spec.size,
            };
            let future = self.orchestrator.run_batch(batch, self.token.clone());
            pending.push((configuration.id.clone(), future));
        }

        let mut reports = Vec::with_capacity(pending.len());
        for (configuration_id, future) in pending {
            match future.wait().await {
                Ok(outcome) => reports.push(ConfigBatchReport {
                    configuration_id,
                    batch: Some(outcome),
                    metrics: serde_json::Value::Null,
                }),
                Err(BatchError::Fatal(error)) => {
                    return Err(RunFailure::Failed(format!(
                        "batch aborted for configuration {configuration_id}: {error}"
                    )));
                }
                Err(BatchError::Dropped) => {
                    return Err(RunFailure::Failed(format!(
                        "batch dropped for configuration {configuration_id}"
                    )));
                }
            }
        }
        Ok(QueryOutcome { query, reports })
    }

    /// Pairwise path: execute the query against every configuration, then
    /// compare ranked lists per configuration pair. Recoverable search
    /// failures leave an empty list that still participates in comparison.
    async fn pairwise_outcome(
        &self,
        configurations: &[Arc<SearchConfiguration>],
        query: String,
    ) -> Result<QueryOutcome, RunFailure> {
        let mut ranked: Vec<(String, RankedDocIds)> = Vec::with_capacity(configurations.len());
        for configuration in configurations {
            if self.token.is_cancelled() {
                return Err(RunFailure::Cancelled);
            }
            match self
                .backend
                .execute(configuration, &query, self.spec.size)
                .await
            {
                Ok(result) => ranked.push((configuration.id.clone(), result)),
                Err(error) if error.is_fatal() => {
                    return Err(RunFailure::Failed(format!(
                        "fatal search failure for configuration {}: {error}",
                        configuration.id
                    )));
                }
                Err(error) => {
                    tracing::warn!(
                        configuration_id = %configuration.id,
                        query = %query,
                        code = error.code(),
                        error = %error,
                        "pairwise search failed"
                    );
                    ranked.push((configuration.id.clone(), RankedDocIds::default()));
                }
            }
        }

        let mut reports = Vec::new();
        for left in 0..ranked.len() {
            for right in (left + 1)..ranked.len() {
                let (left_id, left_ranked) = &ranked[left];
                let (right_id, right_ranked) = &ranked[right];
                let comparison = self.evaluator.compare(left_ranked, right_ranked);
                reports.push(ConfigBatchReport {
                    configuration_id: format!("{left_id}::{right_id}"),
                    batch: None,
                    metrics: serde_json::json!({
                        "left": left_id,
                        "right": right_id,
                        "comparison": comparison,
                    }),
                });
            }
        }
        Ok(QueryOutcome { query, reports })
    }

    /// First resolvable judgment list wins; misses and errors are logged
    /// and skipped.
    async fn fetch_ratings(&self, query: &str) -> Option<Arc<RelevanceRatings>> {
        for judgment_id in &self.spec.judgment_ids {
            match self.judgments.fetch(judgment_id, query).await {
                Ok(ratings) if !ratings.is_empty() => return Some(Arc::new(ratings)),
                Ok(_) => continue,
                Err(error) => {
                    tracing::warn!(
                        judgment_id = %judgment_id,
                        query = %query,
                        error = %error,
                        "failed to fetch judgments"
                    );
                }
            }
        }
        None
    }

    /// Persist the terminal state, notify the sink, deregister and release
    /// the latch. Runs exactly once per run regardless of which path
    /// (natural completion, failure, cancellation) reaches it first.
    async fn finalize(&self, outcomes: Option<Vec<QueryOutcome>>, state: TerminalState) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        let snapshot = {
            let mut result = self
                .result
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(outcomes) = outcomes {
                result.outcomes = outcomes;
            }
            match &state {
                TerminalState::Completed => {
                    result.status = ExperimentStatus::Completed;
                }
                TerminalState::Error { message, .. } => {
                    result.status = ExperimentStatus::Error;
                    result.message = Some(message.clone());
                }
            }
            result.clone()
        };

        if let Err(error) = self.store.update_experiment(&snapshot).await {
            tracing::warn!(
                run_id = %self.run_id,
                error = %error,
                "failed to persist terminal experiment state"
            );
        }
        self.sink.finalize(&self.run_id, &state).await;

        if let Some(schedule_id) = &self.schedule_id {
            self.registry.remove(schedule_id, &self.run_id);
        }
        self.latch.release();

        match &state {
            TerminalState::Completed => {
                tracing::info!(run_id = %self.run_id, "run completed");
            }
            TerminalState::Error { message, cancelled } => {
                tracing::warn!(
                    run_id = %self.run_id,
                    cancelled = cancelled,
                    message = %message,
                    "run ended in error"
                );
            }
        }
    }
}
