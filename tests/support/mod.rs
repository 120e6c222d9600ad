//! Mock collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use relevance_harness::collaborators::{
    CollaboratorError, Evaluator, InputCatalog, JudgmentSource, PersistenceStore, QuerySet,
    RankedDocIds, RelevanceRatings, ResultSink, SearchBackend, SearchConfiguration, SearchError,
    TerminalState,
};
use relevance_harness::experiment::{ExperimentResult, Variant};

/// One scripted search response.
#[derive(Debug, Clone)]
pub enum Script {
    Hits(Vec<&'static str>),
    Empty,
    QueryError,
    Fatal,
}

impl Script {
    fn into_result(self) -> Result<RankedDocIds, SearchError> {
        match self {
            Script::Hits(ids) => Ok(RankedDocIds::new(
                ids.into_iter().map(String::from).collect(),
            )),
            Script::Empty => Ok(RankedDocIds::default()),
            Script::QueryError => Err(SearchError::Query("shard failure".into())),
            Script::Fatal => Err(SearchError::CircuitBreaker("parent circuit tripped".into())),
        }
    }
}

/// Backend that pops scripted responses in call order, falling back to a
/// default. Optionally sleeps per call to keep work in flight.
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    default: Script,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn answering(default: Script) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            default,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_scripts(self, scripts: impl IntoIterator<Item = Script>) -> Self {
        *self.scripts.lock().unwrap() = scripts.into_iter().collect();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchBackend for ScriptedBackend {
    async fn execute(
        &self,
        _configuration: &SearchConfiguration,
        _query_text: &str,
        _size: usize,
    ) -> Result<RankedDocIds, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        script.into_result()
    }
}

/// In-memory persistence capturing every write.
#[derive(Default)]
pub struct MemoryStore {
    variants: Mutex<Vec<Variant>>,
    experiments: Mutex<Vec<ExperimentResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variants(&self) -> Vec<Variant> {
        self.variants.lock().unwrap().clone()
    }

    pub fn last_experiment(&self) -> Option<ExperimentResult> {
        self.experiments.lock().unwrap().last().cloned()
    }

    pub fn experiment_updates(&self) -> usize {
        self.experiments.lock().unwrap().len()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn put_variant(&self, variant: &Variant) -> Result<(), CollaboratorError> {
        self.variants.lock().unwrap().push(variant.clone());
        Ok(())
    }

    async fn update_experiment(&self, result: &ExperimentResult) -> Result<(), CollaboratorError> {
        self.experiments.lock().unwrap().push(result.clone());
        Ok(())
    }
}

/// Sink recording every finalize call.
#[derive(Default)]
pub struct RecordingSink {
    states: Mutex<Vec<(String, TerminalState)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalized(&self) -> Vec<(String, TerminalState)> {
        self.states.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn finalize(&self, run_id: &str, state: &TerminalState) {
        self.states
            .lock()
            .unwrap()
            .push((run_id.to_string(), state.clone()));
    }
}

/// Catalog serving a fixed query set and configurations.
pub struct StaticCatalog {
    query_set: QuerySet,
    configurations: Vec<SearchConfiguration>,
}

impl StaticCatalog {
    pub fn new(queries: &[&str], configuration_ids: &[&str]) -> Self {
        Self {
            query_set: QuerySet {
                id: "qs-1".into(),
                name: "test queries".into(),
                queries: queries.iter().map(|q| q.to_string()).collect(),
            },
            configurations: configuration_ids
                .iter()
                .map(|id| SearchConfiguration {
                    id: id.to_string(),
                    name: id.to_string(),
                    index: "products".into(),
                    query_body: r#"{"query":{"match":{"title":"%query%"}}}"#.into(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl InputCatalog for StaticCatalog {
    async fn fetch_query_set(&self, id: &str) -> Result<QuerySet, CollaboratorError> {
        if id == self.query_set.id {
            Ok(self.query_set.clone())
        } else {
            Err(CollaboratorError::not_found(format!("query set {id}")))
        }
    }

    async fn fetch_configurations(
        &self,
        ids: &[String],
    ) -> Result<Vec<SearchConfiguration>, CollaboratorError> {
        ids.iter()
            .map(|id| {
                self.configurations
                    .iter()
                    .find(|c| &c.id == id)
                    .cloned()
                    .ok_or_else(|| CollaboratorError::not_found(format!("configuration {id}")))
            })
            .collect()
    }
}

/// Judgment source with one fixed ratings map for every query.
pub struct StaticJudgments {
    ratings: HashMap<String, f64>,
}

impl StaticJudgments {
    pub fn new() -> Self {
        let mut ratings = HashMap::new();
        ratings.insert("doc-1".to_string(), 1.0);
        ratings.insert("doc-2".to_string(), 0.5);
        Self { ratings }
    }
}

#[async_trait]
impl JudgmentSource for StaticJudgments {
    async fn fetch(
        &self,
        _judgment_id: &str,
        _query_text: &str,
    ) -> Result<RelevanceRatings, CollaboratorError> {
        Ok(RelevanceRatings::new(self.ratings.clone()))
    }
}

/// Evaluator producing a trivial metric payload and counting calls.
#[derive(Default)]
pub struct CountingEvaluator {
    scores: AtomicUsize,
    comparisons: AtomicUsize,
}

impl CountingEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scores(&self) -> usize {
        self.scores.load(Ordering::SeqCst)
    }

    pub fn comparisons(&self) -> usize {
        self.comparisons.load(Ordering::SeqCst)
    }
}

impl Evaluator for CountingEvaluator {
    fn score(&self, ranked: &RankedDocIds, ratings: &RelevanceRatings) -> serde_json::Value {
        self.scores.fetch_add(1, Ordering::SeqCst);
        let judged = ranked
            .doc_ids
            .iter()
            .filter(|id| ratings.ratings.contains_key(*id))
            .count();
        serde_json::json!({ "hits": ranked.len(), "judged": judged })
    }

    fn compare(&self, left: &RankedDocIds, right: &RankedDocIds) -> serde_json::Value {
        self.comparisons.fetch_add(1, Ordering::SeqCst);
        let overlap = left
            .doc_ids
            .iter()
            .filter(|id| right.doc_ids.contains(id))
            .count();
        serde_json::json!({ "overlap": overlap })
    }
}
