use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use braintrust_api::{Client, RegisterOpts};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::Config;
use crate::dataset::{Dataset, DatasetError, DatasetLoader};
use crate::error::{ConnectError, EvalError, EvalErrors};
use crate::functions::FunctionLoader;
use crate::report::{permalink, EvalResult};
use crate::scorer::Scorer;
use crate::session::{LoginOptions, LoginSession, Session};
use crate::task::{Task, TaskHooks};
use crate::trace::{attr, OtelTracer, SpanHandle, Tracer};
use crate::types::{Case, CaseOrigin, EvalValue, Metadata, Score, TaskResult};

const MAX_QUEUE_CAPACITY: usize = 100;

/// Everything one eval run needs. Built with [`Opts::builder`].
pub struct Opts<I, R> {
	experiment: String,
	dataset: Box<dyn Dataset<I, R>>,
	task: Arc<dyn Task<I, R>>,
	scorers: Vec<Arc<dyn Scorer<I, R>>>,
	project_name: Option<String>,
	tags: Vec<String>,
	metadata: Option<Metadata>,
	update: bool,
	parallelism: usize,
	quiet: bool,
	cancellation: CancellationToken,
}

impl<I, R> Opts<I, R> {
	pub fn builder() -> OptsBuilder<I, R> {
		OptsBuilder::new()
	}
}

pub struct OptsBuilder<I, R> {
	experiment: Option<String>,
	dataset: Option<Box<dyn Dataset<I, R>>>,
	task: Option<Arc<dyn Task<I, R>>>,
	scorers: Vec<Arc<dyn Scorer<I, R>>>,
	project_name: Option<String>,
	tags: Vec<String>,
	metadata: Option<Metadata>,
	update: bool,
	parallelism: usize,
	quiet: bool,
	cancellation: Option<CancellationToken>,
}

impl<I, R> Default for OptsBuilder<I, R> {
	fn default() -> Self {
		Self::new()
	}
}

impl<I, R> OptsBuilder<I, R> {
	pub fn new() -> Self {
		Self {
			experiment: None,
			dataset: None,
			task: None,
			scorers: Vec::new(),
			project_name: None,
			tags: Vec::new(),
			metadata: None,
			update: false,
			parallelism: 1,
			quiet: false,
			cancellation: None,
		}
	}

	pub fn experiment(mut self, name: impl Into<String>) -> Self {
		self.experiment = Some(name.into());
		self
	}

	pub fn dataset<D>(mut self, dataset: D) -> Self
	where
		D: Dataset<I, R> + 'static,
	{
		self.dataset = Some(Box::new(dataset));
		self
	}

	pub fn boxed_dataset(mut self, dataset: Box<dyn Dataset<I, R>>) -> Self {
		self.dataset = Some(dataset);
		self
	}

	pub fn task(mut self, task: Arc<dyn Task<I, R>>) -> Self {
		self.task = Some(task);
		self
	}

	pub fn scorers<S>(mut self, scorers: S) -> Self
	where
		S: IntoIterator<Item = Arc<dyn Scorer<I, R>>>,
	{
		self.scorers = scorers.into_iter().collect();
		self
	}

	pub fn add_scorer(mut self, scorer: Arc<dyn Scorer<I, R>>) -> Self {
		self.scorers.push(scorer);
		self
	}

	pub fn scorer<S>(self, scorer: S) -> Self
	where
		S: Scorer<I, R> + 'static,
	{
		self.add_scorer(Arc::new(scorer))
	}

	/// Overrides the configured default project.
	pub fn project_name(mut self, name: impl Into<String>) -> Self {
		self.project_name = Some(name.into());
		self
	}

	pub fn tags<T: Into<String>>(mut self, tags: impl IntoIterator<Item = T>) -> Self {
		self.tags = tags.into_iter().map(Into::into).collect();
		self
	}

	pub fn metadata(mut self, metadata: Metadata) -> Self {
		self.metadata = Some(metadata);
		self
	}

	/// Append to an existing experiment of the same name instead of creating a new one.
	pub fn update(mut self, update: bool) -> Self {
		self.update = update;
		self
	}

	pub fn parallelism(mut self, n: usize) -> Self {
		self.parallelism = n.max(1);
		self
	}

	/// Don't print the result summary.
	pub fn quiet(mut self, quiet: bool) -> Self {
		self.quiet = quiet;
		self
	}

	pub fn cancellation(mut self, token: CancellationToken) -> Self {
		self.cancellation = Some(token);
		self
	}

	pub fn build(self) -> Result<Opts<I, R>, EvalError> {
		let experiment = self
			.experiment
			.filter(|e| !e.is_empty())
			.ok_or_else(|| EvalError::validation("experiment is required"))?;
		Ok(Opts {
			experiment,
			dataset: self.dataset.ok_or_else(|| EvalError::validation("dataset is required"))?,
			task: self.task.ok_or_else(|| EvalError::validation("task is required"))?,
			scorers: self.scorers,
			project_name: self.project_name,
			tags: self.tags,
			metadata: self.metadata,
			update: self.update,
			parallelism: self.parallelism,
			quiet: self.quiet,
			cancellation: self.cancellation.unwrap_or_default(),
		})
	}
}

/// Runs evals against one account, reporting spans to one tracer.
pub struct Evaluator<I, R> {
	config: Arc<Config>,
	session: Arc<dyn Session>,
	backend: Arc<dyn Backend>,
	tracer: Arc<dyn Tracer>,
	_types: PhantomData<fn() -> (I, R)>,
}

impl<I, R> Clone for Evaluator<I, R> {
	fn clone(&self) -> Self {
		Self {
			config: self.config.clone(),
			session: self.session.clone(),
			backend: self.backend.clone(),
			tracer: self.tracer.clone(),
			_types: PhantomData,
		}
	}
}

impl<I: EvalValue, R: EvalValue> Evaluator<I, R> {
	pub fn new(config: Config, session: Arc<dyn Session>, backend: Arc<dyn Backend>, tracer: Arc<dyn Tracer>) -> Self {
		Self { config: Arc::new(config), session, backend, tracer, _types: PhantomData }
	}

	/// Log in, connect to the API and export spans through the global
	/// OpenTelemetry provider.
	pub async fn connect(config: Config) -> Result<Self, ConnectError> {
		config.validate()?;
		let session = LoginSession::start(LoginOptions {
			api_key: config.api_key.clone(),
			app_url: config.app_url.clone(),
			app_public_url: None,
			org_name: config.org_name.clone(),
		})?;

		let mut api_url = config.api_url.clone();
		if config.blocking_login {
			let info = session.wait().await?;
			if let Some(url) = info.api_url.filter(|u| !u.is_empty()) {
				api_url = url;
			}
		}
		let client = Client::new(config.api_key.clone(), api_url)?;
		Ok(Self::new(config, Arc::new(session), Arc::new(client), Arc::new(OtelTracer::global())))
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn datasets(&self) -> DatasetLoader<I, R> {
		DatasetLoader::new(self.backend.clone())
	}

	pub fn functions(&self) -> FunctionLoader<I, R> {
		FunctionLoader::new(self.backend.clone(), self.config.default_project_name.clone())
	}

	/// Register the experiment and push every case through the task and scorers.
	///
	/// Validation and registration failures return `Err` before any case
	/// runs. Case-level failures never abort the run; they are collected in
	/// [`EvalResult::error`].
	pub async fn run(&self, opts: Opts<I, R>) -> Result<EvalResult, EvalError> {
		let quiet = opts.quiet;
		debug!(experiment = %opts.experiment, "eval: registering");
		let executor = self.register(opts).await?;

		debug!(
			experiment_id = %executor.experiment_id,
			workers = executor.workers,
			"eval: running"
		);
		let result = executor.run(&self.config, self.session.as_ref()).await;
		debug!(experiment_id = %result.experiment_id(), errors = result.error().map_or(0, EvalErrors::len), "eval: done");

		if !quiet {
			println!("{result}");
		}
		Ok(result)
	}

	async fn register(&self, opts: Opts<I, R>) -> Result<Executor<I, R>, EvalError> {
		let Opts {
			experiment,
			dataset,
			task,
			scorers,
			project_name,
			tags,
			metadata,
			update,
			parallelism,
			quiet: _,
			cancellation,
		} = opts;

		if experiment.is_empty() {
			return Err(EvalError::validation("experiment is required"));
		}
		let project_name = project_name
			.filter(|p| !p.is_empty())
			.or_else(|| self.config.default_project_name.clone().filter(|p| !p.is_empty()))
			.ok_or_else(|| {
				EvalError::validation("project name is required (set it on the options or as the configured default project)")
			})?;

		let project = self.backend.create_project(&project_name).await.map_err(EvalError::Project)?;

		let dataset_id = dataset.id().to_string();
		let register = RegisterOpts {
			tags,
			metadata,
			update,
			dataset_id: Some(dataset_id.clone()).filter(|id| !id.is_empty()),
			dataset_version: Some(dataset.version().to_string()).filter(|v| !v.is_empty()),
		};
		let registered = self
			.backend
			.register_experiment(&experiment, &project.id, register)
			.await
			.map_err(EvalError::Registration)?;

		Ok(Executor {
			experiment_id: registered.id.clone(),
			experiment_name: registered.name,
			project_id: project.id,
			project_name: project.name,
			dataset,
			workers: parallelism.max(1),
			cases: Arc::new(CaseRunner {
				tracer: self.tracer.clone(),
				parent: format!("experiment_id:{}", registered.id),
				dataset_id,
				task,
				scorers,
				cancellation,
			}),
		})
	}
}

fn queue_capacity(workers: usize) -> usize {
	workers.saturating_mul(2).min(MAX_QUEUE_CAPACITY)
}

/// One run's resolved state, consumed by [`Executor::run`].
struct Executor<I, R> {
	experiment_id: String,
	experiment_name: String,
	project_id: String,
	project_name: String,
	dataset: Box<dyn Dataset<I, R>>,
	workers: usize,
	cases: Arc<CaseRunner<I, R>>,
}

type NextCase<I, R> = Result<Case<I, R>, DatasetError>;

impl<I: EvalValue, R: EvalValue> Executor<I, R> {
	async fn run(self, config: &Config, session: &dyn Session) -> EvalResult {
		let Executor { experiment_id, experiment_name, project_id, project_name, mut dataset, workers, cases } = self;

		let start = Instant::now();
		let (tx, rx) = mpsc::channel::<NextCase<I, R>>(queue_capacity(workers));
		let rx = Arc::new(tokio::sync::Mutex::new(rx));
		let errors = Arc::new(Mutex::new(Vec::<EvalError>::new()));

		let mut pool = JoinSet::new();
		for _ in 0..workers {
			let rx = rx.clone();
			let cases = cases.clone();
			let errors = errors.clone();
			pool.spawn(async move {
				loop {
					let next = rx.lock().await.recv().await;
					let Some(next) = next else { break };
					let case_errors = cases.run(next).await;
					if !case_errors.is_empty() {
						errors.lock().extend(case_errors);
					}
				}
			});
		}
		// Workers hold the only receivers, so sends fail once the last one exits.
		drop(rx);

		let mut produced = 0usize;
		while let Some(next) = dataset.next().await {
			produced += 1;
			if tx.send(next).await.is_err() {
				warn!("all eval workers exited before the dataset was drained");
				break;
			}
		}
		drop(tx);
		debug!(cases = produced, "eval: draining");

		while let Some(joined) = pool.join_next().await {
			if let Err(err) = joined {
				errors.lock().push(EvalError::Worker(err.to_string()));
			}
		}
		let elapsed = start.elapsed();

		let errors = std::mem::take(&mut *errors.lock());
		let link = permalink(config, session.info().as_ref(), &experiment_id);
		EvalResult::new(
			experiment_id,
			experiment_name,
			project_id,
			project_name,
			EvalErrors::from_vec(errors),
			elapsed,
			link,
		)
	}
}

/// Per-case work shared by all workers of a run.
struct CaseRunner<I, R> {
	tracer: Arc<dyn Tracer>,
	parent: String,
	dataset_id: String,
	task: Arc<dyn Task<I, R>>,
	scorers: Vec<Arc<dyn Scorer<I, R>>>,
	cancellation: CancellationToken,
}

impl<I: EvalValue, R: EvalValue> CaseRunner<I, R> {
	async fn run(&self, next: NextCase<I, R>) -> Vec<EvalError> {
		let span = self.start_span(None, "eval");
		let errors = match next {
			Ok(case) => match AssertUnwindSafe(self.run_case(&span, case)).catch_unwind().await {
				Ok(errors) => errors,
				Err(panic) => {
					let err = EvalError::Worker(format!("case panicked: {}", panic_message(panic.as_ref())));
					span.record_error(err.label(), &err.to_string());
					vec![err]
				}
			},
			Err(err) => {
				let err = EvalError::CaseIterator(err);
				span.record_error(err.label(), &err.to_string());
				vec![err]
			}
		};
		span.end();
		errors
	}

	async fn run_case(&self, span: &SpanHandle, case: Case<I, R>) -> Vec<EvalError> {
		let mut errors = Vec::new();
		if !case.tags.is_empty() {
			span.set_attribute(attr::TAGS, case.tags.clone());
		}
		let output = match self.run_task(span, &case, &mut errors).await {
			Ok(output) => output,
			Err(err) => {
				// The task span already carries the exception event.
				span.set_error(&err.to_string());
				errors.push(err);
				return errors;
			}
		};

		let Case { input, expected, tags: _, metadata, origin } = case;
		let result = TaskResult { input, expected, output, metadata };
		self.run_scorers(span, &result, &mut errors).await;

		encode(span, attr::SPAN_ATTRIBUTES, &json!({"type": "eval"}), &mut errors);
		encode(span, attr::INPUT_JSON, &result.input, &mut errors);
		encode(span, attr::OUTPUT_JSON, &result.output, &mut errors);
		encode(span, attr::EXPECTED, &result.expected, &mut errors);
		if let Some(metadata) = &result.metadata {
			encode(span, attr::METADATA, metadata, &mut errors);
		}
		if let Some(origin) = origin {
			encode(span, attr::ORIGIN, &self.origin(origin), &mut errors);
		}

		if !errors.is_empty() {
			let message = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n");
			span.set_error(&message);
		}
		errors
	}

	async fn run_task(&self, eval_span: &SpanHandle, case: &Case<I, R>, errors: &mut Vec<EvalError>) -> Result<R, EvalError> {
		let span = self.start_span(Some(eval_span), "task");
		encode(&span, attr::SPAN_ATTRIBUTES, &json!({"type": "task"}), errors);
		encode(&span, attr::INPUT_JSON, &case.input, errors);
		encode(&span, attr::EXPECTED, &case.expected, errors);

		let hooks = TaskHooks::new(
			span.clone(),
			eval_span.clone(),
			case.expected.clone(),
			case.metadata.clone(),
			case.tags.clone(),
			self.cancellation.clone(),
		);
		let outcome = match self.task.run(&case.input, hooks).await {
			Ok(output) => {
				encode(&span, attr::OUTPUT_JSON, &output, errors);
				Ok(output)
			}
			Err(source) => {
				let err = EvalError::TaskRun(source);
				span.record_error(err.label(), &err.to_string());
				Err(err)
			}
		};
		span.end();
		outcome
	}

	async fn run_scorers(&self, eval_span: &SpanHandle, result: &TaskResult<I, R>, errors: &mut Vec<EvalError>) {
		let span = self.start_span(Some(eval_span), "score");
		encode(&span, attr::SPAN_ATTRIBUTES, &json!({"type": "score"}), errors);

		let mut scores: Vec<Score> = Vec::new();
		for scorer in &self.scorers {
			match scorer.run(result).await {
				Ok(batch) => scores.extend(batch.into_iter().map(|mut score| {
					if score.name.is_empty() {
						score.name = scorer.name().to_string();
					}
					score
				})),
				Err(source) => {
					let err = EvalError::Scorer { name: scorer.name().to_string(), source };
					span.record_error(err.label(), &err.to_string());
					errors.push(err);
				}
			}
		}

		let by_name: BTreeMap<&str, f64> = scores.iter().map(|s| (s.name.as_str(), s.score)).collect();
		encode(&span, attr::SCORES, &by_name, errors);

		match scores.as_slice() {
			[] => {}
			[only] => {
				if let Some(metadata) = &only.metadata {
					encode(&span, attr::METADATA, metadata, errors);
				}
				encode(&span, attr::OUTPUT, &json!({"score": only.score}), errors);
			}
			many => {
				let metadata: Metadata = many
					.iter()
					.filter_map(|s| s.metadata.clone().map(|m| (s.name.clone(), Value::Object(m))))
					.collect();
				if !metadata.is_empty() {
					encode(&span, attr::METADATA, &metadata, errors);
				}
				let output: Metadata = many.iter().map(|s| (s.name.clone(), json!({"score": s.score}))).collect();
				encode(&span, attr::OUTPUT, &output, errors);
			}
		}
		span.end();
	}

	fn origin(&self, origin: CaseOrigin) -> Value {
		json!({
			"object_type": "dataset",
			"object_id": self.dataset_id,
			"id": origin.id,
			"created": origin.created,
			"_xact_id": origin.xact_id,
		})
	}

	fn start_span(&self, parent: Option<&SpanHandle>, name: &str) -> SpanHandle {
		let span = match parent {
			Some(parent) => parent.child(name),
			None => self.tracer.start_span(name),
		};
		span.set_attribute(attr::PARENT, self.parent.as_str());
		span
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
	if let Some(message) = payload.downcast_ref::<&'static str>() {
		message
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message
	} else {
		"unknown panic"
	}
}

/// Best-effort JSON attribute; failures are reported but never stop the case.
fn encode<T: Serialize + ?Sized>(span: &SpanHandle, key: &'static str, value: &T, errors: &mut Vec<EvalError>) {
	if let Err(source) = span.set_json_attribute(key, value) {
		errors.push(EvalError::Encode { key, source });
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use anyhow::anyhow;
	use pretty_assertions::assert_eq;
	use serde::de::{self, Deserializer};
	use serde::ser::{self, Serializer};
	use serde::Deserialize;

	use crate::dataset::{JsonlDataset, RemoteDataset, VecDataset};
	use crate::error::ErrorKind;
	use crate::scorer::{self, single};
	use crate::scorers::ExactMatchScorer;
	use crate::session::{LoginInfo, StaticSession};
	use crate::task;
	use crate::testing::{assert_avg_score, assert_eval_succeeded, MemoryBackend, RecordingTracer};

	fn config() -> Config {
		Config {
			org_name: Some("acme".into()),
			default_project_name: Some("demo".into()),
			..Config::default()
		}
	}

	fn evaluator<I: EvalValue, R: EvalValue>(backend: &Arc<MemoryBackend>, tracer: &RecordingTracer) -> Evaluator<I, R> {
		Evaluator::new(config(), Arc::new(StaticSession::logged_out()), backend.clone(), Arc::new(tracer.clone()))
	}

	fn greetings() -> VecDataset<String, String> {
		VecDataset::new(vec![
			Case::new("World".to_string(), "Hello World".to_string()),
			Case::new("Alice".to_string(), "Hello Alice".to_string()),
		])
	}

	fn hello_task() -> Arc<dyn Task<String, String>> {
		task::from_async_fn(|input: String| async move { Ok(format!("Hello {input}")) })
	}

	fn counting_task(counter: Arc<AtomicUsize>) -> Arc<dyn Task<String, String>> {
		task::from_async_fn(move |input: String| {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(input)
			}
		})
	}

	fn constant_scorer(name: &str, value: f64) -> Arc<dyn Scorer<String, String>> {
		scorer::from_async_fn(name, move |_r: TaskResult<String, String>| async move { Ok(single(value)) })
	}

	#[tokio::test]
	async fn hello_world_scores_perfectly() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let opts = Opts::builder()
			.experiment("greetings")
			.dataset(greetings())
			.task(hello_task())
			.scorer(ExactMatchScorer)
			.quiet(true)
			.build()
			.unwrap();

		let result = evaluator(&backend, &tracer).run(opts).await.unwrap();

		assert!(result.error().is_none());
		assert!(!result.to_string().contains("Errors:"));
		assert_eval_succeeded(&result).unwrap();
		let scores: Vec<Value> = tracer.spans_named("score").iter().map(|s| s.attr_json(attr::SCORES).unwrap()).collect();
		assert_eq!(scores, vec![json!({"exact_match": 1.0}), json!({"exact_match": 1.0})]);
		assert_avg_score(&tracer, "exact_match", 1.0).unwrap();
		assert_eq!(result.project_name(), "demo");
		assert_eq!(
			result.permalink(),
			format!("https://www.braintrust.dev/app/acme/object?object_type=experiment&object_id={}", result.experiment_id())
		);
	}

	#[tokio::test]
	async fn task_runs_once_per_case_at_any_parallelism() {
		for parallelism in [0, 1, 3, 16, 250] {
			let backend = Arc::new(MemoryBackend::new());
			let tracer = RecordingTracer::new();
			let counter = Arc::new(AtomicUsize::new(0));
			let cases = (0..37).map(|i| Case::new(format!("in-{i}"), format!("in-{i}"))).collect();
			let opts = Opts::builder()
				.experiment("count")
				.dataset(VecDataset::new(cases))
				.task(counting_task(counter.clone()))
				.parallelism(parallelism)
				.quiet(true)
				.build()
				.unwrap();

			let result = evaluator(&backend, &tracer).run(opts).await.unwrap();
			assert!(result.is_success());
			assert_eq!(counter.load(Ordering::SeqCst), 37, "parallelism {parallelism}");
			assert_eq!(tracer.spans_named("eval").len(), 37);
		}
	}

	#[test]
	fn queue_is_bounded() {
		assert_eq!(queue_capacity(1), 2);
		assert_eq!(queue_capacity(10), 20);
		assert_eq!(queue_capacity(500), 100);
	}

	#[tokio::test]
	async fn iterator_error_does_not_stop_other_cases() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let dataset: JsonlDataset<String, String> = JsonlDataset::from_lines(
			"{\"input\": \"a\", \"expected\": \"a\"}\n{broken\n{\"input\": \"b\", \"expected\": \"b\"}\n",
		);
		let opts = Opts::builder()
			.experiment("partial")
			.dataset(dataset)
			.task(task::from_async_fn(|input: String| async move { Ok(input) }))
			.scorer(ExactMatchScorer)
			.quiet(true)
			.build()
			.unwrap();

		let result = evaluator(&backend, &tracer).run(opts).await.unwrap();

		let errors = result.error().unwrap();
		assert_eq!(errors.len(), 1);
		assert!(errors.has_kind(ErrorKind::CaseIterator));
		assert_eq!(tracer.score_averages().get("exact_match"), Some(&1.0));
		assert_eq!(tracer.spans_named("score").len(), 2);

		let failed: Vec<_> = tracer.spans_named("eval").into_iter().filter(|s| s.error.is_some()).collect();
		assert_eq!(failed.len(), 1);
		assert_eq!(
			failed[0].events[0].attributes.get(attr::EXCEPTION_TYPE).and_then(|v| v.as_str()),
			Some("ErrCaseIterator")
		);
	}

	#[tokio::test]
	async fn failing_scorer_does_not_hide_other_scores() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let broken = scorer::from_async_fn("broken", |_r: TaskResult<String, String>| async move {
			Err::<Vec<Score>, _>(anyhow!("scorer exploded"))
		});
		let opts = Opts::builder()
			.experiment("scorers")
			.dataset(VecDataset::new(vec![Case::new("x".to_string(), "x".to_string())]))
			.task(task::from_async_fn(|input: String| async move { Ok(input) }))
			.add_scorer(broken)
			.scorer(ExactMatchScorer)
			.quiet(true)
			.build()
			.unwrap();

		let result = evaluator(&backend, &tracer).run(opts).await.unwrap();

		let score_span = &tracer.spans_named("score")[0];
		assert_eq!(score_span.attr_json(attr::SCORES), Some(json!({"exact_match": 1.0})));
		assert_eq!(score_span.attr_json(attr::OUTPUT), Some(json!({"score": 1.0})));
		assert_eq!(score_span.events.len(), 1);

		let errors = result.error().unwrap();
		assert_eq!(errors.kinds(), vec![ErrorKind::Scorer]);
		let message = errors.to_string();
		assert!(message.contains("broken") && message.contains("scorer exploded"), "{message}");
		assert!(tracer.spans_named("eval")[0].error.is_some());
	}

	#[tokio::test]
	async fn single_score_is_flattened() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let with_meta = scorer::from_async_fn("judge", |_r: TaskResult<String, String>| async move {
			let mut metadata = Metadata::new();
			metadata.insert("reason".into(), json!("close enough"));
			Ok(vec![Score::new("", 0.5).with_metadata(metadata)])
		});
		let opts = Opts::builder()
			.experiment("single")
			.dataset(VecDataset::new(vec![Case::input_only("x".to_string())]))
			.task(task::from_async_fn(|input: String| async move { Ok(input) }))
			.add_scorer(with_meta)
			.quiet(true)
			.build()
			.unwrap();

		evaluator(&backend, &tracer).run(opts).await.unwrap();

		let span = &tracer.spans_named("score")[0];
		assert_eq!(span.attr_json(attr::OUTPUT), Some(json!({"score": 0.5})));
		assert_eq!(span.attr_json(attr::METADATA), Some(json!({"reason": "close enough"})));
		assert_eq!(span.attr_json(attr::SCORES), Some(json!({"judge": 0.5})));
		assert_eq!(span.attr_json(attr::SPAN_ATTRIBUTES), Some(json!({"type": "score"})));
	}

	#[tokio::test]
	async fn multiple_scores_are_nested_by_name() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let pair = scorer::from_async_fn("pair", |_r: TaskResult<String, String>| async move {
			let mut metadata = Metadata::new();
			metadata.insert("note".into(), json!("second"));
			Ok(vec![Score::new("first", 1.0), Score::new("second", 0.25).with_metadata(metadata)])
		});
		let opts = Opts::builder()
			.experiment("multi")
			.dataset(VecDataset::new(vec![Case::input_only("x".to_string())]))
			.task(task::from_async_fn(|input: String| async move { Ok(input) }))
			.add_scorer(pair)
			.add_scorer(constant_scorer("third", 0.0))
			.quiet(true)
			.build()
			.unwrap();

		evaluator(&backend, &tracer).run(opts).await.unwrap();

		let span = &tracer.spans_named("score")[0];
		assert_eq!(
			span.attr_json(attr::OUTPUT),
			Some(json!({"first": {"score": 1.0}, "second": {"score": 0.25}, "third": {"score": 0.0}}))
		);
		assert_eq!(span.attr_json(attr::METADATA), Some(json!({"second": {"note": "second"}})));
	}

	#[tokio::test]
	async fn update_flag_controls_experiment_reuse() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let eval = evaluator::<String, String>(&backend, &tracer);
		let opts = |update: bool| {
			Opts::builder()
				.experiment("nightly")
				.dataset(greetings())
				.task(hello_task())
				.update(update)
				.quiet(true)
				.build()
				.unwrap()
		};

		let first = eval.run(opts(false)).await.unwrap();
		let second = eval.run(opts(false)).await.unwrap();
		assert_ne!(first.experiment_id(), second.experiment_id());

		let reused = eval.run(opts(true)).await.unwrap();
		assert_eq!(reused.experiment_id(), first.experiment_id());
		assert_eq!(backend.experiments().len(), 2);
	}

	#[tokio::test]
	async fn missing_project_name_fails_before_any_case() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let counter = Arc::new(AtomicUsize::new(0));
		let eval: Evaluator<String, String> = Evaluator::new(
			Config::default(),
			Arc::new(StaticSession::logged_out()),
			backend.clone(),
			Arc::new(tracer.clone()),
		);
		let opts = Opts::builder()
			.experiment("orphan")
			.dataset(greetings())
			.task(counting_task(counter.clone()))
			.quiet(true)
			.build()
			.unwrap();

		let err = eval.run(opts).await.unwrap_err();
		assert!(err.to_string().contains("project name is required"), "{err}");
		assert_eq!(err.kind(), Some(ErrorKind::Eval));
		assert_eq!(counter.load(Ordering::SeqCst), 0);
		assert!(tracer.spans().is_empty());
		assert!(backend.experiments().is_empty());
	}

	#[tokio::test]
	async fn registration_failure_aborts_run() {
		let backend = Arc::new(MemoryBackend::new().failing_projects());
		let tracer = RecordingTracer::new();
		let counter = Arc::new(AtomicUsize::new(0));
		let opts = Opts::builder()
			.experiment("doomed")
			.dataset(greetings())
			.task(counting_task(counter.clone()))
			.quiet(true)
			.build()
			.unwrap();

		let err = evaluator(&backend, &tracer).run(opts).await.unwrap_err();
		assert!(matches!(err, EvalError::Project(_)));
		assert_eq!(counter.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn builder_requires_fields() {
		let err = Opts::<String, String>::builder().experiment("x").task(hello_task()).build().err().unwrap();
		assert_eq!(err.to_string(), "eval error: dataset is required");
		let err = Opts::<String, String>::builder().dataset(greetings()).task(hello_task()).build().err().unwrap();
		assert_eq!(err.to_string(), "eval error: experiment is required");
		let err = Opts::<String, String>::builder().experiment("x").dataset(greetings()).build().err().unwrap();
		assert_eq!(err.to_string(), "eval error: task is required");
	}

	#[tokio::test]
	async fn task_failure_skips_scorers() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let scored = Arc::new(AtomicUsize::new(0));
		let watched = {
			let scored = scored.clone();
			scorer::from_async_fn("watched", move |_r: TaskResult<String, String>| {
				let scored = scored.clone();
				async move {
					scored.fetch_add(1, Ordering::SeqCst);
					Ok(single(1.0))
				}
			})
		};
		let opts = Opts::builder()
			.experiment("failing-task")
			.dataset(greetings())
			.task(task::from_async_fn(|input: String| async move {
				if input == "Alice" {
					anyhow::bail!("no greeting for {input}");
				}
				Ok(input)
			}))
			.add_scorer(watched)
			.parallelism(2)
			.quiet(true)
			.build()
			.unwrap();

		let result = evaluator(&backend, &tracer).run(opts).await.unwrap();

		assert_eq!(scored.load(Ordering::SeqCst), 1);
		let errors = result.error().unwrap();
		assert_eq!(errors.kinds(), vec![ErrorKind::TaskRun]);
		assert!(errors.to_string().contains("no greeting for Alice"));
		assert!(result.to_string().contains("Errors:\n  task run error: no greeting for Alice"));

		let failed_tasks: Vec<_> = tracer.spans_named("task").into_iter().filter(|s| s.error.is_some()).collect();
		assert_eq!(failed_tasks.len(), 1);
		assert_eq!(
			failed_tasks[0].events[0].attributes.get(attr::EXCEPTION_TYPE).and_then(|v| v.as_str()),
			Some("ErrTaskRun")
		);
		assert_eq!(tracer.spans_named("score").len(), 1);
	}

	#[tokio::test]
	async fn panicking_task_does_not_stall_the_run() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let cases = (0..10)
			.map(|n| Case::new(n.to_string(), n.to_string()))
			.collect::<Vec<_>>();
		let opts = Opts::builder()
			.experiment("panics")
			.dataset(VecDataset::new(cases))
			.task(task::from_async_fn(|input: String| async move {
				if input.parse::<u32>().unwrap() % 2 == 0 {
					panic!("task blew up on {input}");
				}
				Ok(input)
			}))
			.scorer(ExactMatchScorer)
			.parallelism(1)
			.quiet(true)
			.build()
			.unwrap();

		let result = tokio::time::timeout(Duration::from_secs(5), evaluator(&backend, &tracer).run(opts))
			.await
			.expect("run stalled after a panicking case")
			.unwrap();

		let errors = result.error().unwrap();
		assert_eq!(errors.len(), 5);
		assert_eq!(errors.count_kind(ErrorKind::Eval), 5);
		assert!(errors.to_string().contains("case panicked: task blew up on 0"));
		assert_eq!(tracer.spans_named("score").len(), 5);
		assert!(tracer.spans_named("eval").iter().all(|s| s.ended));
	}

	#[tokio::test]
	async fn failed_task_keeps_case_tags_on_eval_span() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let case = Case::new("World".to_string(), "Hello World".to_string()).with_tags(["smoke"]);
		let opts = Opts::builder()
			.experiment("failing-tags")
			.dataset(VecDataset::new(vec![case]))
			.task(task::from_async_fn(|_input: String| async move { Err::<String, _>(anyhow!("offline")) }))
			.scorer(ExactMatchScorer)
			.quiet(true)
			.build()
			.unwrap();

		let result = evaluator(&backend, &tracer).run(opts).await.unwrap();
		assert_eq!(result.error().unwrap().kinds(), vec![ErrorKind::TaskRun]);

		let eval = &tracer.spans_named("eval")[0];
		assert_eq!(eval.attr_strings(attr::TAGS), Some(&["smoke".to_string()][..]));
		assert!(eval.events.is_empty());
		assert!(eval.error.as_deref().unwrap().contains("offline"));

		let failed_task = &tracer.spans_named("task")[0];
		assert_eq!(failed_task.events.len(), 1);
		assert_eq!(failed_task.events[0].name, "exception");
	}

	#[tokio::test]
	async fn spans_carry_parent_and_case_attributes() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let mut metadata = Metadata::new();
		metadata.insert("source".into(), json!("unit"));
		let case = Case::new("World".to_string(), "Hello World".to_string())
			.with_tags(["smoke"])
			.with_metadata(metadata);
		let opts = Opts::builder()
			.experiment("attrs")
			.dataset(VecDataset::new(vec![case]))
			.task(hello_task())
			.scorer(ExactMatchScorer)
			.quiet(true)
			.build()
			.unwrap();

		let result = evaluator(&backend, &tracer).run(opts).await.unwrap();

		let parent = format!("experiment_id:{}", result.experiment_id());
		let spans = tracer.spans();
		assert_eq!(spans.len(), 3);
		assert!(spans.iter().all(|s| s.attr_str(attr::PARENT) == Some(parent.as_str()) && s.ended));

		let eval = &tracer.spans_named("eval")[0];
		assert_eq!(tracer.children_of(eval.id).iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["task", "score"]);
		assert_eq!(eval.attr_json(attr::SPAN_ATTRIBUTES), Some(json!({"type": "eval"})));
		assert_eq!(eval.attr_json(attr::INPUT_JSON), Some(json!("World")));
		assert_eq!(eval.attr_json(attr::OUTPUT_JSON), Some(json!("Hello World")));
		assert_eq!(eval.attr_json(attr::EXPECTED), Some(json!("Hello World")));
		assert_eq!(eval.attr_json(attr::METADATA), Some(json!({"source": "unit"})));
		assert_eq!(eval.attr_strings(attr::TAGS), Some(&["smoke".to_string()][..]));
		assert!(eval.attr_str(attr::ORIGIN).is_none());

		let task = &tracer.spans_named("task")[0];
		assert_eq!(task.attr_json(attr::SPAN_ATTRIBUTES), Some(json!({"type": "task"})));
		assert_eq!(task.attr_json(attr::OUTPUT_JSON), Some(json!("Hello World")));
	}

	#[tokio::test]
	async fn dataset_lineage_sets_origin_and_registration() {
		let backend = Arc::new(MemoryBackend::new().with_dataset(
			"ds-1",
			"golden",
			vec![json!({
				"id": "row-1",
				"_xact_id": "1000",
				"created": "2024-05-01T00:00:00Z",
				"input": "World",
				"expected": "Hello World"
			})],
		));
		let tracer = RecordingTracer::new();
		let dataset: RemoteDataset<String, String> = RemoteDataset::new(backend.clone(), "ds-1").with_version("v3");
		let opts = Opts::builder()
			.experiment("lineage")
			.dataset(dataset)
			.task(hello_task())
			.tags(["nightly"])
			.quiet(true)
			.build()
			.unwrap();

		evaluator(&backend, &tracer).run(opts).await.unwrap();

		let eval = &tracer.spans_named("eval")[0];
		assert_eq!(
			eval.attr_json(attr::ORIGIN),
			Some(json!({
				"object_type": "dataset",
				"object_id": "ds-1",
				"id": "row-1",
				"created": "2024-05-01T00:00:00Z",
				"_xact_id": "1000"
			}))
		);
		let (_, registered) = &backend.registrations()[0];
		assert_eq!(registered.dataset_id.as_deref(), Some("ds-1"));
		assert_eq!(registered.dataset_version.as_deref(), Some("v3"));
		assert_eq!(registered.tags, vec!["nightly"]);
		assert!(!registered.update);
	}

	#[tokio::test]
	async fn hooks_expose_spans_and_case_fields() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let cancel = CancellationToken::new();
		let task = task::from_async_fn_with_hooks(|input: String, hooks: TaskHooks<String>| async move {
			hooks.eval_span().set_attribute("custom.eval", "seen");
			hooks.task_span().add_event("thinking", Vec::new());
			assert!(!hooks.cancellation().is_cancelled());
			Ok(format!("{input}/{}", hooks.expected().cloned().unwrap_or_default()))
		});
		let opts = Opts::builder()
			.experiment("hooks")
			.dataset(greetings())
			.task(task)
			.scorer(ExactMatchScorer)
			.cancellation(cancel)
			.quiet(true)
			.build()
			.unwrap();

		evaluator(&backend, &tracer).run(opts).await.unwrap();

		assert!(tracer.spans_named("eval").iter().all(|s| s.attr_str("custom.eval") == Some("seen")));
		assert!(tracer.spans_named("task").iter().all(|s| s.events.iter().any(|e| e.name == "thinking")));
		assert_eq!(tracer.score_averages().get("exact_match"), Some(&0.0));
	}

	#[tokio::test]
	async fn permalink_uses_session_org_when_unconfigured() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let session = StaticSession::logged_in(LoginInfo {
			org_id: "org-9".into(),
			org_name: "from-session".into(),
			..Default::default()
		});
		let config = Config { default_project_name: Some("demo".into()), ..Config::default() };
		let eval: Evaluator<String, String> =
			Evaluator::new(config, Arc::new(session), backend, Arc::new(tracer.clone()));
		let opts = Opts::builder()
			.experiment("link")
			.dataset(greetings())
			.task(hello_task())
			.project_name("override")
			.quiet(true)
			.build()
			.unwrap();

		let result = eval.run(opts).await.unwrap();
		assert_eq!(result.project_name(), "override");
		assert!(result.permalink().starts_with("https://www.braintrust.dev/app/from-session/object?"));
	}

	/// Output type whose JSON encoding always fails.
	#[derive(Debug, Clone, PartialEq)]
	struct Opaque;

	impl Serialize for Opaque {
		fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
			Err(ser::Error::custom("opaque values cannot be encoded"))
		}
	}

	impl<'de> Deserialize<'de> for Opaque {
		fn deserialize<D: Deserializer<'de>>(_deserializer: D) -> Result<Self, D::Error> {
			Err(de::Error::custom("opaque values cannot be decoded"))
		}
	}

	#[tokio::test]
	async fn encode_errors_do_not_block_scorers() {
		let backend = Arc::new(MemoryBackend::new());
		let tracer = RecordingTracer::new();
		let seen = scorer::from_async_fn("seen", |r: TaskResult<String, Opaque>| async move {
			Ok(single(if r.output == Opaque { 1.0 } else { 0.0 }))
		});
		let opts = Opts::builder()
			.experiment("opaque")
			.dataset(VecDataset::new(vec![Case::input_only("x".to_string())]))
			.task(task::from_async_fn(|_input: String| async move { Ok(Opaque) }))
			.add_scorer(seen)
			.quiet(true)
			.build()
			.unwrap();

		let result = evaluator::<String, Opaque>(&backend, &tracer).run(opts).await.unwrap();

		assert_eq!(tracer.score_averages().get("seen"), Some(&1.0));
		let errors = result.error().unwrap();
		assert!(errors.iter().all(|e| matches!(e, EvalError::Encode { key: attr::OUTPUT_JSON, .. })));
		assert_eq!(errors.len(), 2);
	}
}
