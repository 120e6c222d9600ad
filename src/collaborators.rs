//! Abstract collaborator interfaces the orchestration core talks to.
//!
//! The core stays transport-agnostic: query execution, judgment storage,
//! persistence and metric math all live behind these traits. Production
//! callers inject concrete implementations (HTTP search client, key-value
//! store); tests inject mocks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiment::{ExperimentResult, Variant};

// =============================================================================
// Data types
// =============================================================================

/// A named set of query texts evaluated together in one experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySet {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub queries: Vec<String>,
}

/// One backend query configuration a variant is evaluated against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfiguration {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Target index or collection.
    pub index: String,
    /// Query template; the backend substitutes the query text.
    pub query_body: String,
}

/// Ranked document ids returned by one search execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankedDocIds {
    pub doc_ids: Vec<String>,
}

impl RankedDocIds {
    pub fn new(doc_ids: Vec<String>) -> Self {
        Self { doc_ids }
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }
}

/// Relevance ratings for one query text: document id -> graded rating.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelevanceRatings {
    pub ratings: HashMap<String, f64>,
}

impl RelevanceRatings {
    pub fn new(ratings: HashMap<String, f64>) -> Self {
        Self { ratings }
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }
}

/// Terminal state of a run, handed to the result sink exactly once.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    Error {
        message: String,
        /// Distinguishes timeout/cancellation from genuine failure.
        cancelled: bool,
    },
}

impl TerminalState {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            cancelled: false,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            cancelled: true,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

// =============================================================================
// Error taxonomy
// =============================================================================

/// Errors surfaced by search execution.
///
/// Fatal variants signal that the host environment itself is unhealthy;
/// they abort the whole batch instead of being isolated per variant.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Node ran out of memory while executing the query.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Resource circuit breaker tripped.
    #[error("circuit breaker tripped: {0}")]
    CircuitBreaker(String),

    /// Cluster blocked or unreachable.
    #[error("cluster unavailable: {0}")]
    ClusterUnavailable(String),

    /// Query rejected or failed to execute - recoverable per variant.
    #[error("query failed: {0}")]
    Query(String),

    /// Search call exceeded its deadline - recoverable per variant.
    #[error("search timed out after {0:?}")]
    Timeout(Duration),

    /// Response could not be decoded into ranked ids.
    #[error("malformed search response: {0}")]
    Decode(String),
}

impl SearchError {
    /// Whether this error aborts the whole batch instead of a single variant.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory(_) | Self::CircuitBreaker(_) | Self::ClusterUnavailable(_)
        )
    }

    /// Short code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfMemory(_) => "out_of_memory",
            Self::CircuitBreaker(_) => "circuit_breaker",
            Self::ClusterUnavailable(_) => "cluster_unavailable",
            Self::Query(_) => "query_failed",
            Self::Timeout(_) => "timeout",
            Self::Decode(_) => "decode_error",
        }
    }
}

/// Errors from the non-search collaborators (catalog, judgments, store).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl CollaboratorError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Executes one query text against one backend configuration.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn execute(
        &self,
        configuration: &SearchConfiguration,
        query_text: &str,
        size: usize,
    ) -> Result<RankedDocIds, SearchError>;
}

/// Fetches relevance ratings for a query text from a judgment list.
#[async_trait]
pub trait JudgmentSource: Send + Sync {
    async fn fetch(
        &self,
        judgment_id: &str,
        query_text: &str,
    ) -> Result<RelevanceRatings, CollaboratorError>;
}

/// Write-side persistence for variants and the experiment record.
///
/// Writes either succeed or fail through the returned result; the
/// orchestrator logs failures and keeps going.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn put_variant(&self, variant: &Variant) -> Result<(), CollaboratorError>;

    async fn update_experiment(&self, result: &ExperimentResult) -> Result<(), CollaboratorError>;
}

/// Receives the terminal state of a run, exactly once.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn finalize(&self, run_id: &str, state: &TerminalState);
}

/// Read-side catalog for run inputs.
#[async_trait]
pub trait InputCatalog: Send + Sync {
    async fn fetch_query_set(&self, id: &str) -> Result<QuerySet, CollaboratorError>;

    async fn fetch_configurations(
        &self,
        ids: &[String],
    ) -> Result<Vec<SearchConfiguration>, CollaboratorError>;
}

/// Computes metric payloads over ranked ids. The math itself (precision,
/// NDCG, list similarity) is the implementor's concern.
pub trait Evaluator: Send + Sync {
    /// Score a ranked list against relevance ratings.
    fn score(&self, ranked: &RankedDocIds, ratings: &RelevanceRatings) -> serde_json::Value;

    /// Compare two ranked lists produced by different configurations.
    fn compare(&self, left: &RankedDocIds, right: &RankedDocIds) -> serde_json::Value;
}

/// Result sink that discards terminal states. Useful for tools and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResultSink;

#[async_trait]
impl ResultSink for NoopResultSink {
    async fn finalize(&self, _run_id: &str, _state: &TerminalState) {
        // Discard
    }
}
