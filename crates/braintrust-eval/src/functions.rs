//! Tasks and scorers backed by functions hosted on the server.

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use braintrust_api::ApiError;
use braintrust_types::{Function, FunctionQueryParams};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::backend::Backend;
use crate::scorer::Scorer;
use crate::task::{Task, TaskHooks};
use crate::types::{EvalValue, Score, Scores, TaskResult};

#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("slug is required")]
    MissingSlug,

    #[error("project name is required")]
    MissingProject,

    #[error("function not found: project={project} slug={slug}")]
    NotFound { project: String, slug: String },

    #[error("scorer not found: project={project} slug={slug}")]
    ScorerNotFound { project: String, slug: String },

    #[error("failed to query functions: {0}")]
    Query(#[source] ApiError),

    #[error("failed to invoke function: {0}")]
    Invoke(#[source] ApiError),

    #[error("failed to encode function input: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to convert function output to {target}: {reason}")]
    Conversion { target: &'static str, reason: String },

    #[error("scorer returned null")]
    NullScore,

    #[error("unexpected scorer output: expected object or number, got {0}")]
    ScoreShape(&'static str),
}

impl FunctionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ScorerNotFound { .. })
    }
}

/// Which hosted function to load.
#[derive(Debug, Clone, Default)]
pub struct FunctionOpts {
    pub slug: String,
    /// Defaults to the configured project when unset.
    pub project: Option<String>,
    pub version: Option<String>,
    pub environment: Option<String>,
}

impl FunctionOpts {
    pub fn slug(slug: impl Into<String>) -> Self {
        Self { slug: slug.into(), ..Default::default() }
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}

/// Resolves hosted functions into typed tasks and scorers.
pub struct FunctionLoader<I, R> {
    backend: Arc<dyn Backend>,
    default_project: Option<String>,
    _types: PhantomData<fn() -> (I, R)>,
}

impl<I: EvalValue, R: EvalValue> FunctionLoader<I, R> {
    pub fn new(backend: Arc<dyn Backend>, default_project: Option<String>) -> Self {
        Self {
            backend,
            default_project: default_project.filter(|p| !p.is_empty()),
            _types: PhantomData,
        }
    }

    /// Load a hosted function as a task. Inputs are sent as-is and outputs
    /// converted to `R`.
    pub async fn task(&self, opts: FunctionOpts) -> Result<Arc<dyn Task<I, R>>, FunctionError> {
        let function = self
            .resolve(&opts, |project, slug| FunctionError::NotFound { project, slug })
            .await?;
        Ok(Arc::new(RemoteTask { backend: self.backend.clone(), function }))
    }

    /// Load a hosted function as a scorer named after the function.
    pub async fn scorer(&self, opts: FunctionOpts) -> Result<Arc<dyn Scorer<I, R>>, FunctionError> {
        let function = self
            .resolve(&opts, |project, slug| FunctionError::ScorerNotFound { project, slug })
            .await?;
        Ok(Arc::new(RemoteScorer { backend: self.backend.clone(), function }))
    }

    async fn resolve(
        &self,
        opts: &FunctionOpts,
        not_found: fn(String, String) -> FunctionError,
    ) -> Result<Function, FunctionError> {
        if opts.slug.is_empty() {
            return Err(FunctionError::MissingSlug);
        }
        let project = opts
            .project
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| self.default_project.clone())
            .ok_or(FunctionError::MissingProject)?;

        let params = FunctionQueryParams {
            project_name: Some(project.clone()),
            slug: Some(opts.slug.clone()),
            version: opts.version.clone(),
            environment: opts.environment.clone(),
            limit: Some(1),
            ..Default::default()
        };
        let found = self.backend.query_functions(&params).await.map_err(FunctionError::Query)?;
        debug!(project = %project, slug = %opts.slug, matches = found.len(), "resolved function");

        found
            .into_iter()
            .next()
            .ok_or_else(|| not_found(project, opts.slug.clone()))
    }
}

struct RemoteTask {
    backend: Arc<dyn Backend>,
    function: Function,
}

#[async_trait]
impl<I: EvalValue, R: EvalValue> Task<I, R> for RemoteTask {
    async fn run(&self, input: &I, _hooks: TaskHooks<R>) -> Result<R> {
        let input = serde_json::to_value(input).map_err(FunctionError::Encode)?;
        let output = self
            .backend
            .invoke_function(&self.function.id, input)
            .await
            .map_err(FunctionError::Invoke)?;
        Ok(coerce::<R>(output)?)
    }
}

#[derive(Serialize)]
struct ScorerInput<'a, I, R> {
    input: &'a I,
    output: &'a R,
    expected: &'a Option<R>,
}

struct RemoteScorer {
    backend: Arc<dyn Backend>,
    function: Function,
}

#[async_trait]
impl<I: EvalValue, R: EvalValue> Scorer<I, R> for RemoteScorer {
    fn name(&self) -> &str {
        &self.function.name
    }

    async fn run(&self, result: &TaskResult<I, R>) -> Result<Scores> {
        let envelope = serde_json::to_value(ScorerInput {
            input: &result.input,
            output: &result.output,
            expected: &result.expected,
        })
        .map_err(FunctionError::Encode)?;
        let output = self
            .backend
            .invoke_function(&self.function.id, envelope)
            .await
            .map_err(FunctionError::Invoke)?;
        Ok(vec![parse_score(output)?])
    }
}

/// Remote scorer responses: a `{name?, score, metadata?}` object or a bare number.
fn parse_score(value: Value) -> Result<Score, FunctionError> {
    #[derive(Deserialize)]
    struct Wire {
        #[serde(default)]
        name: String,
        #[serde(default)]
        score: Option<f64>,
        #[serde(default)]
        metadata: Option<crate::types::Metadata>,
    }

    match value {
        Value::Null => Err(FunctionError::NullScore),
        Value::Number(n) => Ok(Score::new("", n.as_f64().unwrap_or_default())),
        Value::Object(_) => {
            let wire: Wire = serde_json::from_value(value).map_err(|e| FunctionError::Conversion {
                target: type_name::<Score>(),
                reason: e.to_string(),
            })?;
            Ok(Score {
                name: wire.name,
                score: wire.score.unwrap_or_default(),
                metadata: wire.metadata,
            })
        }
        Value::Bool(_) => Err(FunctionError::ScoreShape("boolean")),
        Value::String(_) => Err(FunctionError::ScoreShape("string")),
        Value::Array(_) => Err(FunctionError::ScoreShape("array")),
    }
}

/// Convert a function's JSON output into `R`.
///
/// The value is decoded directly first, which also covers `null` for
/// `Option`/unit targets and string-like targets receiving a string. A string
/// that doesn't decode directly is parsed as JSON text. Any other `null`
/// becomes the target's empty value (`""`, `0`, `false`, `[]` or `{}`) when it
/// accepts one.
pub fn coerce<R: DeserializeOwned>(value: Value) -> Result<R, FunctionError> {
    let direct = match R::deserialize(&value) {
        Ok(decoded) => return Ok(decoded),
        Err(err) => err,
    };

    let failure = |reason: String| FunctionError::Conversion { target: type_name::<R>(), reason };
    match value {
        Value::String(text) => serde_json::from_str::<R>(&text).map_err(|e| failure(e.to_string())),
        Value::Null => empty_value::<R>().ok_or_else(|| failure(direct.to_string())),
        _ => Err(failure(direct.to_string())),
    }
}

fn empty_value<R: DeserializeOwned>() -> Option<R> {
    [json!(""), json!(0), json!(false), json!([]), json!({})]
        .iter()
        .find_map(|empty| R::deserialize(empty).ok())
}
