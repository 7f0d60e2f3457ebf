use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{EvalValue, Score, Scores, TaskResult};

#[async_trait]
pub trait Scorer<I, R>: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, result: &TaskResult<I, R>) -> Result<Scores>;
}

/// A single unnamed score; the engine fills in the scorer's name.
pub fn single(value: f64) -> Scores {
    vec![Score::new("", value)]
}

/// Wrap an async closure as a named `Scorer`.
pub fn from_async_fn<I, R, F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn Scorer<I, R>>
where
    I: EvalValue,
    R: EvalValue,
    F: Send + Sync + 'static + Fn(TaskResult<I, R>) -> Fut,
    Fut: Future<Output = Result<Scores>> + Send + 'static,
{
    struct ClosureScorer<F> {
        name: String,
        f: F,
    }

    #[async_trait]
    impl<I, R, F, Fut> Scorer<I, R> for ClosureScorer<F>
    where
        I: EvalValue,
        R: EvalValue,
        F: Send + Sync + 'static + Fn(TaskResult<I, R>) -> Fut,
        Fut: Future<Output = Result<Scores>> + Send + 'static,
    {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, result: &TaskResult<I, R>) -> Result<Scores> {
            (self.f)(result.clone()).await
        }
    }

    Arc::new(ClosureScorer { name: name.into(), f })
}
