use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::trace::SpanHandle;
use crate::types::{EvalValue, Metadata};

/// Per-case context handed to a task alongside its input.
#[derive(Debug, Clone)]
pub struct TaskHooks<R> {
	task_span: SpanHandle,
	eval_span: SpanHandle,
	expected: Option<R>,
	metadata: Option<Metadata>,
	tags: Vec<String>,
	cancellation: CancellationToken,
}

impl<R> TaskHooks<R> {
	pub(crate) fn new(
		task_span: SpanHandle,
		eval_span: SpanHandle,
		expected: Option<R>,
		metadata: Option<Metadata>,
		tags: Vec<String>,
		cancellation: CancellationToken,
	) -> Self {
		Self { task_span, eval_span, expected, metadata, tags, cancellation }
	}

	/// Span covering this task invocation.
	pub fn task_span(&self) -> &SpanHandle {
		&self.task_span
	}

	/// Span covering the whole case.
	pub fn eval_span(&self) -> &SpanHandle {
		&self.eval_span
	}

	pub fn expected(&self) -> Option<&R> {
		self.expected.as_ref()
	}

	pub fn metadata(&self) -> Option<&Metadata> {
		self.metadata.as_ref()
	}

	pub fn tags(&self) -> &[String] {
		&self.tags
	}

	/// Fires when the caller cancels the run. Tasks may watch it to stop early.
	pub fn cancellation(&self) -> &CancellationToken {
		&self.cancellation
	}
}

#[async_trait]
pub trait Task<I, R>: Send + Sync {
	async fn run(&self, input: &I, hooks: TaskHooks<R>) -> Result<R>;
}

/// Wrap an async closure over the input as a `Task`.
pub fn from_async_fn<I, R, F, Fut>(f: F) -> Arc<dyn Task<I, R>>
where
	I: EvalValue,
	R: EvalValue,
	F: Send + Sync + 'static + Fn(I) -> Fut,
	Fut: Future<Output = Result<R>> + Send + 'static,
{
	struct ClosureTask<F> {
		f: F,
	}

	#[async_trait]
	impl<I, R, F, Fut> Task<I, R> for ClosureTask<F>
	where
		I: EvalValue,
		R: EvalValue,
		F: Send + Sync + 'static + Fn(I) -> Fut,
		Fut: Future<Output = Result<R>> + Send + 'static,
	{
		async fn run(&self, input: &I, _hooks: TaskHooks<R>) -> Result<R> {
			(self.f)(input.clone()).await
		}
	}

	Arc::new(ClosureTask { f })
}

/// Like [`from_async_fn`], but the closure also receives the case's [`TaskHooks`].
pub fn from_async_fn_with_hooks<I, R, F, Fut>(f: F) -> Arc<dyn Task<I, R>>
where
	I: EvalValue,
	R: EvalValue,
	F: Send + Sync + 'static + Fn(I, TaskHooks<R>) -> Fut,
	Fut: Future<Output = Result<R>> + Send + 'static,
{
	struct HookedTask<F> {
		f: F,
	}

	#[async_trait]
	impl<I, R, F, Fut> Task<I, R> for HookedTask<F>
	where
		I: EvalValue,
		R: EvalValue,
		F: Send + Sync + 'static + Fn(I, TaskHooks<R>) -> Fut,
		Fut: Future<Output = Result<R>> + Send + 'static,
	{
		async fn run(&self, input: &I, hooks: TaskHooks<R>) -> Result<R> {
			(self.f)(input.clone(), hooks).await
		}
	}

	Arc::new(HookedTask { f })
}
