#![forbid(unsafe_code)]

//! # relevance-harness
//!
//! Concurrency-controlled orchestration for search relevance experiments.
//!
//! A run evaluates many parameterized search variants against one or more
//! backend query configurations, for every query text in a query set, and
//! aggregates per-variant outcomes into a single experiment result. The
//! search itself, persistence and metric math live behind collaborator
//! traits; this crate owns the hard part - running a large, dynamically
//! sized fan-out of asynchronous evaluation tasks under a fixed concurrency
//! budget, with admission backpressure, cooperative cancellation,
//! per-variant failure isolation versus fatal-system-failure detection, and
//! resolve-once aggregation of every batch.

pub mod cancel;
pub mod collaborators;
pub mod coordinator;
pub mod experiment;
pub mod orchestrator;
pub mod sweep;

pub use cancel::{CancellationToken, CompletionLatch};
pub use collaborators::{
    CollaboratorError, Evaluator, InputCatalog, JudgmentSource, NoopResultSink, PersistenceStore,
    QuerySet, RankedDocIds, RelevanceRatings, ResultSink, SearchBackend, SearchConfiguration,
    SearchError, TerminalState,
};
pub use coordinator::{RegistryError, RunCoordinator, RunError, RunRegistry, RunRequest};
pub use experiment::{
    ConfigBatchReport, ExperimentKind, ExperimentResult, ExperimentSpec, ExperimentStatus,
    QueryOutcome, Variant, VariantStatus,
};
pub use orchestrator::{
    BatchError, BatchOutcome, BatchStatus, BatchSummary, ConcurrencyGate, GateMetrics,
    OrchestratorConfig, TaskOrchestrator, VariantBatch,
};
pub use sweep::{expand_variant_space, SweepError, VariantParams, WeightsRange};
