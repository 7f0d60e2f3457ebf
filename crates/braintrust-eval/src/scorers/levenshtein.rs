use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use strsim::levenshtein;

use crate::scorer::Scorer;
use crate::scorers::render;
use crate::types::{EvalValue, Score, Scores, TaskResult};

/// Normalized edit-distance similarity between output and expected.
pub struct LevenshteinScorer {
    pub min_similarity: f64,
}

impl LevenshteinScorer {
    pub fn new(min_similarity: f64) -> Self {
        Self { min_similarity }
    }
}

#[async_trait]
impl<I: EvalValue, R: EvalValue> Scorer<I, R> for LevenshteinScorer {
    fn name(&self) -> &str {
        "levenshtein"
    }

    async fn run(&self, result: &TaskResult<I, R>) -> Result<Scores> {
        let e = render(&result.expected)?;
        let o = render(&result.output)?;
        let max_len = e.chars().count().max(o.chars().count()).max(1) as f64;
        let similarity = 1.0 - (levenshtein(&e, &o) as f64 / max_len);
        let mut metadata = crate::types::Metadata::new();
        metadata.insert("min_similarity".into(), json!(self.min_similarity));
        metadata.insert("passed".into(), json!(similarity >= self.min_similarity));
        Ok(vec![Score::new("", similarity).with_metadata(metadata)])
    }
}
