//! Experiment domain types: kinds, specs, variants and result records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sweep::{VariantParams, WeightsRange};

/// The closed set of experiment kinds. Dispatch is by enum match, never by
/// runtime type inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentKind {
    HybridOptimizer,
    PointwiseEvaluation,
    PairwiseComparison,
}

impl ExperimentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HybridOptimizer => "hybrid_optimizer",
            Self::PointwiseEvaluation => "pointwise_evaluation",
            Self::PairwiseComparison => "pairwise_comparison",
        }
    }
}

/// Run request payload: what to evaluate and against which inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub id: String,
    pub kind: ExperimentKind,
    pub query_set_id: String,
    pub configuration_ids: Vec<String>,

    /// Judgment lists consulted for graded metrics; first resolvable wins.
    #[serde(default)]
    pub judgment_ids: Vec<String>,

    /// Hybrid-optimizer sweep inputs.
    #[serde(default)]
    pub normalization_techniques: Vec<String>,
    #[serde(default)]
    pub combination_techniques: Vec<String>,
    #[serde(default)]
    pub weights_range: Option<WeightsRange>,
    #[serde(default)]
    pub include_weights: bool,

    /// Result size limit passed to every search execution.
    #[serde(default = "default_size")]
    pub size: usize,
}

fn default_size() -> usize {
    10
}

/// Lifecycle status of a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    Processing,
    Completed,
    Error,
}

/// One parameterized unit of evaluation work.
///
/// Parameters are fixed at construction; `status`, `results` and `message`
/// are written exactly once by the orchestrator when the unit finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub kind: ExperimentKind,
    pub status: VariantStatus,
    pub experiment_id: String,
    /// Sweep parameters; `None` for kinds that do not sweep.
    pub parameters: Option<VariantParams>,
    /// Metric payload recorded on completion.
    #[serde(default)]
    pub results: serde_json::Value,
    /// Failure message recorded on error.
    #[serde(default)]
    pub message: Option<String>,
}

impl Variant {
    pub fn new(
        experiment_id: impl Into<String>,
        kind: ExperimentKind,
        parameters: Option<VariantParams>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            kind,
            status: VariantStatus::Processing,
            experiment_id: experiment_id.into(),
            parameters,
            results: serde_json::Value::Null,
            message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != VariantStatus::Processing
    }

    /// Record a successful outcome. Must be called at most once.
    pub fn complete(&mut self, results: serde_json::Value) {
        debug_assert!(!self.is_terminal(), "variant completed twice");
        self.status = VariantStatus::Completed;
        self.results = results;
    }

    /// Record a failure. Must be called at most once.
    pub fn fail(&mut self, message: impl Into<String>) {
        debug_assert!(!self.is_terminal(), "variant failed after terminal state");
        self.status = VariantStatus::Error;
        self.message = Some(message.into());
    }
}

/// Lifecycle status of an experiment run. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Processing,
    Completed,
    Error,
}

/// Per-configuration report inside one query text's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigBatchReport {
    pub configuration_id: String,
    /// Batch classification and counters, absent for pairwise outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<crate::orchestrator::BatchOutcome>,
    /// Metric payload for paths that record directly (pairwise comparison).
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metrics: serde_json::Value,
}

/// Merged cross-configuration results for one query text.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub query: String,
    pub reports: Vec<ConfigBatchReport>,
}

/// The terminal experiment record persisted at finalize.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResult {
    pub run_id: String,
    pub experiment_id: String,
    pub kind: ExperimentKind,
    pub status: ExperimentStatus,
    pub outcomes: Vec<QueryOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExperimentResult {
    pub fn processing(run_id: impl Into<String>, spec: &ExperimentSpec) -> Self {
        Self {
            run_id: run_id.into(),
            experiment_id: spec.id.clone(),
            kind: spec.kind,
            status: ExperimentStatus::Processing,
            outcomes: Vec::new(),
            message: None,
        }
    }
}
