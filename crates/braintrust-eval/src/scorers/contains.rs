use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::scorer::Scorer;
use crate::scorers::render;
use crate::types::{EvalValue, Metadata, Score, Scores, TaskResult};

/// Checks if output contains a substring.
pub struct ContainsScorer {
    substring: String,
    case_sensitive: bool,
}

impl ContainsScorer {
    pub fn new(substring: impl Into<String>) -> Self {
        Self {
            substring: substring.into(),
            case_sensitive: true,
        }
    }

    pub fn case_insensitive(substring: impl Into<String>) -> Self {
        Self {
            substring: substring.into(),
            case_sensitive: false,
        }
    }
}

#[async_trait]
impl<I: EvalValue, R: EvalValue> Scorer<I, R> for ContainsScorer {
    fn name(&self) -> &str {
        "contains"
    }

    async fn run(&self, result: &TaskResult<I, R>) -> Result<Scores> {
        let output = render(&result.output)?;
        let found = if self.case_sensitive {
            output.contains(&self.substring)
        } else {
            output.to_lowercase().contains(&self.substring.to_lowercase())
        };

        let mut metadata = Metadata::new();
        metadata.insert("substring".into(), json!(self.substring));
        metadata.insert("case_sensitive".into(), json!(self.case_sensitive));
        Ok(vec![Score::new("", if found { 1.0 } else { 0.0 }).with_metadata(metadata)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorers::task_result;

    async fn score(scorer: &ContainsScorer, output: &str) -> f64 {
        scorer.run(&task_result(output.to_string(), None)).await.unwrap()[0].score
    }

    #[tokio::test]
    async fn test_contains_found() {
        assert_eq!(score(&ContainsScorer::new("Paris"), "The capital of France is Paris").await, 1.0);
    }

    #[tokio::test]
    async fn test_contains_not_found() {
        assert_eq!(score(&ContainsScorer::new("London"), "The capital of France is Paris").await, 0.0);
    }

    #[tokio::test]
    async fn test_contains_case_insensitive() {
        let scorer = ContainsScorer::case_insensitive("PARIS");
        assert_eq!(score(&scorer, "The capital of France is paris").await, 1.0);
        assert_eq!(score(&ContainsScorer::new("PARIS"), "The capital of France is paris").await, 0.0);
    }

    #[tokio::test]
    async fn structured_output_is_searched_as_json() {
        let scorer = ContainsScorer::new("\"city\":\"Paris\"");
        let result = task_result(json!({"city": "Paris"}), None);
        assert_eq!(scorer.run(&result).await.unwrap()[0].score, 1.0);
    }
}
