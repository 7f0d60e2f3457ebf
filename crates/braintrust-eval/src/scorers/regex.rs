use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use crate::scorer::Scorer;
use crate::scorers::render;
use crate::types::{EvalValue, Metadata, Score, Scores, TaskResult};

/// Checks if output matches a regex pattern.
pub struct RegexScorer {
	pattern: Regex,
}

impl RegexScorer {
	pub fn new(pattern: &str) -> Result<Self> {
		Ok(Self { pattern: Regex::new(pattern)? })
	}
}

#[async_trait]
impl<I: EvalValue, R: EvalValue> Scorer<I, R> for RegexScorer {
	fn name(&self) -> &str {
		"regex"
	}

	async fn run(&self, result: &TaskResult<I, R>) -> Result<Scores> {
		let output = render(&result.output)?;
		let captures: Option<Vec<String>> = self.pattern.captures(&output).map(|caps| {
			caps.iter().flatten().map(|m| m.as_str().to_string()).collect()
		});

		let mut metadata = Metadata::new();
		metadata.insert("pattern".into(), json!(self.pattern.as_str()));
		if let Some(captures) = &captures {
			metadata.insert("captures".into(), json!(captures));
		}
		Ok(vec![Score::new("", if captures.is_some() { 1.0 } else { 0.0 }).with_metadata(metadata)])
	}
}
