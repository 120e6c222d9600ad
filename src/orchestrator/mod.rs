//! Task orchestration and concurrency-control engine.
//!
//! Wires together:
//! - ConcurrencyGate (bounded admission with delay-and-retry backpressure)
//! - DispatchPool (dedicated bounded executor for search dispatch)
//! - BatchAggregator (resolve-once completion aggregation per batch)
//! - TaskOrchestrator (admission, dispatch and outcome classification)

pub mod batch;
pub mod gate;
pub mod tasks;

pub use batch::{BatchAggregator, BatchError, BatchFuture, BatchOutcome, BatchStatus, BatchSummary};
pub use gate::{
    permit_count, ConcurrencyGate, DispatchPool, GateMetrics, GatePermit, BACKPRESSURE_DELAY,
    GATE_CEILING, GATE_FLOOR, WORKER_DIVISOR,
};
pub use tasks::{OrchestratorConfig, TaskOrchestrator, VariantBatch, NO_HITS_MESSAGE};
