use anyhow::Result;
use async_trait::async_trait;

use crate::scorer::{single, Scorer};
use crate::types::{EvalValue, Scores, TaskResult};

/// 1.0 when the output equals the expected value, 0.0 otherwise (including
/// when there is no expected value).
pub struct ExactMatchScorer;

#[async_trait]
impl<I, R> Scorer<I, R> for ExactMatchScorer
where
	I: EvalValue,
	R: EvalValue + PartialEq,
{
	fn name(&self) -> &str {
		"exact_match"
	}

	async fn run(&self, result: &TaskResult<I, R>) -> Result<Scores> {
		let passed = result.expected.as_ref() == Some(&result.output);
		Ok(single(if passed { 1.0 } else { 0.0 }))
	}
}
