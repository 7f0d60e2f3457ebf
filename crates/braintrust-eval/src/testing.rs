//! In-memory stand-ins and assertion helpers for testing evals.
//!
//! ```ignore
//! #[tokio::test]
//! async fn test_my_agent() -> anyhow::Result<()> {
//!     let tracer = RecordingTracer::new();
//!     let evaluator = Evaluator::new(config, session, backend, Arc::new(tracer.clone()));
//!     let result = evaluator.run(opts).await?;
//!
//!     assert_eval_succeeded(&result)?;
//!     assert_avg_score(&tracer, "exact_match", 0.8)?;
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use braintrust_api::{ApiError, RegisterOpts};
use braintrust_types::{
    DatasetInfo, DatasetQueryParams, Experiment, FetchResponse, Function, FunctionQueryParams, Project,
};
use parking_lot::Mutex;
use serde_json::Value;

use crate::backend::Backend;
use crate::report::EvalResult;
use crate::trace::{attr, AttrValue, SpanBackend, SpanHandle, Tracer};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub name: String,
    pub attributes: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSpan {
    pub id: usize,
    pub parent: Option<usize>,
    pub name: String,
    pub attributes: BTreeMap<String, AttrValue>,
    pub events: Vec<RecordedEvent>,
    /// Error status message, if the span was marked as failed.
    pub error: Option<String>,
    pub ended: bool,
}

impl RecordedSpan {
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttrValue::as_str)
    }

    /// Parse a JSON-encoded attribute.
    pub fn attr_json(&self, key: &str) -> Option<Value> {
        self.attr_str(key).and_then(|s| serde_json::from_str(s).ok())
    }

    pub fn attr_strings(&self, key: &str) -> Option<&[String]> {
        match self.attributes.get(key) {
            Some(AttrValue::StringArray(items)) => Some(items),
            _ => None,
        }
    }
}

/// Tracer that keeps every span in memory.
#[derive(Clone, Default)]
pub struct RecordingTracer {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.spans.lock().clone()
    }

    pub fn spans_named(&self, name: &str) -> Vec<RecordedSpan> {
        self.spans.lock().iter().filter(|s| s.name == name).cloned().collect()
    }

    pub fn children_of(&self, id: usize) -> Vec<RecordedSpan> {
        self.spans.lock().iter().filter(|s| s.parent == Some(id)).cloned().collect()
    }

    /// Mean of each named score across all recorded score spans.
    pub fn score_averages(&self) -> BTreeMap<String, f64> {
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for span in self.spans_named("score") {
            let Some(Value::Object(scores)) = span.attr_json(attr::SCORES) else {
                continue;
            };
            for (name, value) in scores {
                let entry = sums.entry(name).or_default();
                entry.0 += value.as_f64().unwrap_or_default();
                entry.1 += 1;
            }
        }
        sums.into_iter().map(|(name, (sum, n))| (name, sum / n as f64)).collect()
    }

    fn open(&self, name: &str, parent: Option<usize>) -> SpanHandle {
        let mut spans = self.spans.lock();
        let id = spans.len();
        spans.push(RecordedSpan {
            id,
            parent,
            name: name.to_string(),
            attributes: BTreeMap::new(),
            events: Vec::new(),
            error: None,
            ended: false,
        });
        SpanHandle::new(RecordingSpan { id, tracer: self.clone() })
    }

    fn update(&self, id: usize, f: impl FnOnce(&mut RecordedSpan)) {
        if let Some(span) = self.spans.lock().get_mut(id) {
            f(span);
        }
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, name: &str) -> SpanHandle {
        self.open(name, None)
    }
}

struct RecordingSpan {
    id: usize,
    tracer: RecordingTracer,
}

impl SpanBackend for RecordingSpan {
    fn set_attribute(&self, key: &str, value: AttrValue) {
        self.tracer.update(self.id, |s| {
            s.attributes.insert(key.to_string(), value);
        });
    }

    fn add_event(&self, name: &str, attributes: Vec<(String, AttrValue)>) {
        self.tracer.update(self.id, |s| {
            s.events.push(RecordedEvent {
                name: name.to_string(),
                attributes: attributes.into_iter().collect(),
            });
        });
    }

    fn set_error(&self, message: &str) {
        self.tracer.update(self.id, |s| s.error = Some(message.to_string()));
    }

    fn start_child(&self, name: &str) -> SpanHandle {
        self.tracer.open(name, Some(self.id))
    }

    fn end(&self) {
        self.tracer.update(self.id, |s| s.ended = true);
    }
}

/// One `fetch_dataset` call seen by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub dataset_id: String,
    pub cursor: Option<String>,
    pub limit: usize,
}

type Handler = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    projects: Vec<Project>,
    experiments: Vec<Experiment>,
    registrations: Vec<(String, RegisterOpts)>,
    datasets: Vec<(DatasetInfo, Vec<Value>)>,
    functions: Vec<(Function, Handler)>,
    fetches: Vec<FetchCall>,
    invocations: Vec<(String, Value)>,
    fail_projects: bool,
}

/// [`Backend`] that keeps projects, experiments, datasets and functions in
/// memory. Dataset cursors are record offsets.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(self, id: &str, name: &str, records: Vec<Value>) -> Self {
        let info = DatasetInfo {
            id: id.to_string(),
            project_id: "proj-datasets".to_string(),
            name: name.to_string(),
            description: None,
            metadata: None,
        };
        self.state.lock().datasets.push((info, records));
        self
    }

    /// Register a function that always returns `response`.
    pub fn with_function(self, function: Function, response: Value) -> Self {
        self.with_function_handler(function, move |_| response.clone())
    }

    pub fn with_function_handler(
        self,
        function: Function,
        handler: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.state.lock().functions.push((function, Arc::new(handler)));
        self
    }

    /// Make project creation fail with a server error.
    pub fn failing_projects(self) -> Self {
        self.state.lock().fail_projects = true;
        self
    }

    pub fn experiments(&self) -> Vec<Experiment> {
        self.state.lock().experiments.clone()
    }

    /// Options passed to each experiment registration, keyed by experiment name.
    pub fn registrations(&self) -> Vec<(String, RegisterOpts)> {
        self.state.lock().registrations.clone()
    }

    pub fn fetches(&self) -> Vec<FetchCall> {
        self.state.lock().fetches.clone()
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.state.lock().invocations.clone()
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError::Status { status: 404, body: format!("{what} not found") }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_project(&self, name: &str) -> Result<Project, ApiError> {
        let mut state = self.state.lock();
        if state.fail_projects {
            return Err(ApiError::Status { status: 500, body: "project service unavailable".into() });
        }
        if let Some(project) = state.projects.iter().find(|p| p.name == name) {
            return Ok(project.clone());
        }
        let project = Project {
            id: format!("proj-{}", state.projects.len() + 1),
            name: name.to_string(),
            org_id: Some("org-1".to_string()),
            created: None,
        };
        state.projects.push(project.clone());
        Ok(project)
    }

    async fn register_experiment(
        &self,
        name: &str,
        project_id: &str,
        opts: RegisterOpts,
    ) -> Result<Experiment, ApiError> {
        let mut state = self.state.lock();
        state.registrations.push((name.to_string(), opts.clone()));

        let existing = state
            .experiments
            .iter()
            .filter(|e| e.project_id == project_id && (e.name == name || e.name.starts_with(&format!("{name}-"))))
            .count();
        if opts.update {
            if let Some(found) = state.experiments.iter().find(|e| e.project_id == project_id && e.name == name) {
                return Ok(found.clone());
            }
        }

        let experiment = Experiment {
            id: format!("exp-{}", state.experiments.len() + 1),
            name: if existing == 0 { name.to_string() } else { format!("{name}-{existing}") },
            project_id: project_id.to_string(),
            created: None,
            tags: (!opts.tags.is_empty()).then(|| opts.tags.clone()),
            metadata: opts.metadata.clone(),
        };
        state.experiments.push(experiment.clone());
        Ok(experiment)
    }

    async fn fetch_dataset(
        &self,
        dataset_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<FetchResponse, ApiError> {
        let mut state = self.state.lock();
        state.fetches.push(FetchCall {
            dataset_id: dataset_id.to_string(),
            cursor: cursor.map(str::to_string),
            limit,
        });

        let (_, records) = state
            .datasets
            .iter()
            .find(|(info, _)| info.id == dataset_id)
            .ok_or_else(|| not_found("dataset"))?;
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0).min(records.len());
        let end = (start + limit).min(records.len());
        Ok(FetchResponse {
            events: records[start..end].to_vec(),
            cursor: Some(if end < records.len() { end.to_string() } else { String::new() }),
        })
    }

    async fn query_datasets(&self, params: &DatasetQueryParams) -> Result<Vec<DatasetInfo>, ApiError> {
        let state = self.state.lock();
        let limit = params.limit.unwrap_or(usize::MAX);
        Ok(state
            .datasets
            .iter()
            .rev()
            .map(|(info, _)| info)
            .filter(|info| params.id.as_ref().map_or(true, |id| &info.id == id))
            .filter(|info| params.name.as_ref().map_or(true, |name| &info.name == name))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn query_functions(&self, params: &FunctionQueryParams) -> Result<Vec<Function>, ApiError> {
        let state = self.state.lock();
        let limit = params.limit.unwrap_or(usize::MAX);
        Ok(state
            .functions
            .iter()
            .map(|(function, _)| function)
            .filter(|f| params.slug.as_ref().map_or(true, |slug| &f.slug == slug))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn invoke_function(&self, function_id: &str, input: Value) -> Result<Value, ApiError> {
        let handler = {
            let mut state = self.state.lock();
            state.invocations.push((function_id.to_string(), input.clone()));
            state
                .functions
                .iter()
                .find(|(f, _)| f.id == function_id)
                .map(|(_, handler)| handler.clone())
                .ok_or_else(|| not_found("function"))?
        };
        Ok(handler(&input))
    }
}

/// Fail unless the run finished without any case errors.
pub fn assert_eval_succeeded(result: &EvalResult) -> Result<()> {
    if let Some(errors) = result.error() {
        anyhow::bail!("Evaluation failed with {} error(s)\n{}", errors.len(), result);
    }
    Ok(())
}

/// Fail unless the named score averages at least `min_avg_score`.
pub fn assert_avg_score(tracer: &RecordingTracer, name: &str, min_avg_score: f64) -> Result<()> {
    let averages = tracer.score_averages();
    let Some(avg) = averages.get(name) else {
        anyhow::bail!("Evaluation failed: no scores named {name:?} were recorded");
    };
    if *avg < min_avg_score {
        anyhow::bail!(
            "Evaluation failed: avg {name} score {:.3} is below threshold {:.3}",
            avg,
            min_avg_score
        );
    }
    Ok(())
}
