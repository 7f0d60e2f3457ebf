//! Built-in scorers for common output checks.

pub mod contains;
pub mod exact;
pub mod levenshtein;
pub mod regex;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

pub use contains::ContainsScorer;
pub use exact::ExactMatchScorer;
pub use levenshtein::LevenshteinScorer;
pub use regex::RegexScorer;

/// Text form of a value: JSON strings verbatim, null as empty, anything else
/// as compact JSON.
pub(crate) fn render<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(match serde_json::to_value(value)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[cfg(test)]
pub(crate) fn task_result<R>(output: R, expected: Option<R>) -> crate::types::TaskResult<String, R> {
    crate::types::TaskResult { input: String::new(), expected, output, metadata: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_forms() {
        assert_eq!(render("plain").unwrap(), "plain");
        assert_eq!(render(&json!(null)).unwrap(), "");
        assert_eq!(render(&json!({"a": 1})).unwrap(), r#"{"a":1}"#);
        assert_eq!(render(&4.5).unwrap(), "4.5");
    }
}
