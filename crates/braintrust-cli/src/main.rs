mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use braintrust_eval::{
	task, Config, ContainsScorer, Dataset, DatasetQuery, Evaluator, ExactMatchScorer, FunctionOpts,
	JsonlDataset, LevenshteinScorer, Opts, RegexScorer, Scorer, Task,
};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::{DataConfig, EvalFileConfig, ScorerConfig, TaskConfig};

#[derive(Debug, Parser)]
#[command(name = "braintrust", about = "Run evaluations and record them as braintrust experiments")]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	Run(RunArgs),
}

#[derive(Debug, Clone, Parser)]
struct RunArgs {
	/// JSONL file containing lines with fields: { "input": any, "expected"?: any, "tags"?: [string], "metadata"?: object }
	#[arg(long, conflicts_with = "config", required_unless_present = "config")]
	data: Option<PathBuf>,

	/// YAML file describing the whole run; flags below override it
	#[arg(long)]
	config: Option<PathBuf>,

	/// Experiment name (defaults to the data file name)
	#[arg(long)]
	experiment: Option<String>,

	/// Project name (defaults to BRAINTRUST_DEFAULT_PROJECT)
	#[arg(long)]
	project: Option<String>,

	/// Hosted function to use as the task instead of echoing the input
	#[arg(long)]
	task_slug: Option<String>,

	/// Hosted scorer function (repeatable)
	#[arg(long = "scorer-slug")]
	scorer_slugs: Vec<String>,

	/// Use exact-match scorer
	#[arg(long, action = ArgAction::SetTrue)]
	exact: bool,

	/// Use Levenshtein scorer with given min similarity (0.0..=1.0)
	#[arg(long)]
	levenshtein: Option<f64>,

	/// Check if output contains substring (case-sensitive)
	#[arg(long)]
	contains: Option<String>,

	/// Check if output contains substring (case-insensitive)
	#[arg(long)]
	contains_i: Option<String>,

	/// Validate output matches regex pattern
	#[arg(long)]
	regex: Option<String>,

	/// Cases in flight
	#[arg(long)]
	parallelism: Option<usize>,

	/// Append to an existing experiment of the same name
	#[arg(long, action = ArgAction::SetTrue)]
	update: bool,

	/// Don't print the summary
	#[arg(long, action = ArgAction::SetTrue)]
	quiet: bool,

	/// Output JSON result to a file
	#[arg(long)]
	json_out: Option<PathBuf>,
}

impl RunArgs {
	/// Merge flags over an optional YAML config.
	fn file_config(&self, yaml: Option<&str>) -> Result<EvalFileConfig> {
		let mut config = match (yaml, &self.data) {
			(Some(yaml), _) => EvalFileConfig::from_yaml(yaml)?,
			(None, Some(path)) => EvalFileConfig {
				experiment: None,
				project: None,
				task: TaskConfig::Echo,
				data: DataConfig::Jsonl { path: path.clone() },
				scorers: Vec::new(),
				parallelism: config::default_parallelism(),
				update: false,
				tags: Vec::new(),
			},
			(None, None) => anyhow::bail!("either --data or --config is required"),
		};

		if self.experiment.is_some() {
			config.experiment = self.experiment.clone();
		}
		if self.project.is_some() {
			config.project = self.project.clone();
		}
		if let Some(slug) = &self.task_slug {
			config.task = TaskConfig::Function { slug: slug.clone(), project: None, version: None };
		}
		if let Some(n) = self.parallelism {
			config.parallelism = n;
		}
		config.update |= self.update;

		if self.exact {
			config.scorers.push(ScorerConfig::Exact);
		}
		if let Some(threshold) = self.levenshtein {
			config.scorers.push(ScorerConfig::Levenshtein { threshold });
		}
		if let Some(substring) = &self.contains {
			config.scorers.push(ScorerConfig::Contains { substring: substring.clone(), case_sensitive: true });
		}
		if let Some(substring) = &self.contains_i {
			config.scorers.push(ScorerConfig::Contains { substring: substring.clone(), case_sensitive: false });
		}
		if let Some(pattern) = &self.regex {
			config.scorers.push(ScorerConfig::Regex { pattern: pattern.clone() });
		}
		for slug in &self.scorer_slugs {
			config.scorers.push(ScorerConfig::Function { slug: slug.clone(), project: None });
		}

		// Default to exact if no scorers specified
		if config.scorers.is_empty() {
			config.scorers.push(ScorerConfig::Exact);
		}
		Ok(config)
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
		.with_writer(std::io::stderr)
		.init();

	let cli = Cli::parse();
	match cli.command {
		Commands::Run(args) => run(args).await?,
	}
	Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
	let yaml = match &args.config {
		Some(path) => Some(
			tokio::fs::read_to_string(path)
				.await
				.with_context(|| format!("failed to read {}", path.display()))?,
		),
		None => None,
	};
	let file = args.file_config(yaml.as_deref())?;
	debug!(?file, "resolved eval config");

	let evaluator = Evaluator::<Value, Value>::connect(Config::from_env()).await?;
	let dataset = load_dataset(&evaluator, &file.data).await?;
	let task = load_task(&evaluator, &file.task, file.project.as_deref()).await?;
	let mut scorers = Vec::with_capacity(file.scorers.len());
	for scorer in &file.scorers {
		scorers.push(load_scorer(&evaluator, scorer, file.project.as_deref()).await?);
	}

	let mut opts = Opts::builder()
		.experiment(file.experiment_name())
		.boxed_dataset(dataset)
		.task(task)
		.scorers(scorers)
		.tags(file.tags.clone())
		.update(file.update)
		.parallelism(file.parallelism)
		.quiet(args.quiet);
	if let Some(project) = &file.project {
		opts = opts.project_name(project.clone());
	}

	let result = evaluator.run(opts.build()?).await?;

	if let Some(path) = args.json_out {
		let json = serde_json::to_string_pretty(&result.summary())?;
		tokio::fs::write(path, json).await?;
	}

	if let Some(errors) = result.error() {
		anyhow::bail!("{} case(s) failed", errors.len());
	}
	Ok(())
}

async fn load_dataset(evaluator: &Evaluator<Value, Value>, data: &DataConfig) -> Result<Box<dyn Dataset<Value, Value>>> {
	let dataset: Box<dyn Dataset<Value, Value>> = match data {
		DataConfig::Jsonl { path } => Box::new(JsonlDataset::open(path).await?),
		DataConfig::Dataset { id, name, version, limit } => Box::new(
			evaluator
				.datasets()
				.query(DatasetQuery { id: id.clone(), name: name.clone(), version: version.clone(), limit: *limit })
				.await?,
		),
	};
	Ok(dataset)
}

async fn load_task(
	evaluator: &Evaluator<Value, Value>,
	config: &TaskConfig,
	project: Option<&str>,
) -> Result<Arc<dyn Task<Value, Value>>> {
	match config {
		TaskConfig::Echo => Ok(task::from_async_fn(|input: Value| async move { Ok(input) })),
		TaskConfig::Function { slug, project: own, version } => {
			let mut opts = FunctionOpts::slug(slug.clone());
			if let Some(project) = own.as_deref().or(project) {
				opts = opts.project(project);
			}
			if let Some(version) = version {
				opts = opts.version(version.clone());
			}
			Ok(evaluator.functions().task(opts).await?)
		}
	}
}

async fn load_scorer(
	evaluator: &Evaluator<Value, Value>,
	config: &ScorerConfig,
	project: Option<&str>,
) -> Result<Arc<dyn Scorer<Value, Value>>> {
	let scorer: Arc<dyn Scorer<Value, Value>> = match config {
		ScorerConfig::Exact => Arc::new(ExactMatchScorer),
		ScorerConfig::Levenshtein { threshold } => Arc::new(LevenshteinScorer::new(*threshold)),
		ScorerConfig::Contains { substring, case_sensitive: true } => Arc::new(ContainsScorer::new(substring.clone())),
		ScorerConfig::Contains { substring, case_sensitive: false } => {
			Arc::new(ContainsScorer::case_insensitive(substring.clone()))
		}
		ScorerConfig::Regex { pattern } => Arc::new(RegexScorer::new(pattern)?),
		ScorerConfig::Function { slug, project: own } => {
			let mut opts = FunctionOpts::slug(slug.clone());
			if let Some(project) = own.as_deref().or(project) {
				opts = opts.project(project);
			}
			evaluator.functions().scorer(opts).await?
		}
	};
	Ok(scorer)
}
