use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Free-form JSON object attached to cases and scores.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Bound shared by every input and output type flowing through an eval.
pub trait EvalValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> EvalValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Where a case came from when it was read out of a stored dataset.
///
/// Present only when the record carried both its id and its transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseOrigin {
	pub id: String,
	pub xact_id: String,
	pub created: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case<I, R> {
	pub input: I,
	pub expected: Option<R>,
	#[serde(default)]
	pub tags: Vec<String>,
	pub metadata: Option<Metadata>,
	#[serde(skip)]
	pub origin: Option<CaseOrigin>,
}

impl<I, R> Case<I, R> {
	pub fn new(input: I, expected: R) -> Self {
		Self { input, expected: Some(expected), tags: Vec::new(), metadata: None, origin: None }
	}

	pub fn input_only(input: I) -> Self {
		Self { input, expected: None, tags: Vec::new(), metadata: None, origin: None }
	}

	pub fn with_tags<T: Into<String>>(mut self, tags: impl IntoIterator<Item = T>) -> Self {
		self.tags = tags.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_metadata(mut self, metadata: Metadata) -> Self {
		self.metadata = Some(metadata);
		self
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
	/// Empty names are replaced by the producing scorer's name.
	#[serde(default)]
	pub name: String,
	pub score: f64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Metadata>,
}

impl Score {
	pub fn new(name: impl Into<String>, score: f64) -> Self {
		Self { name: name.into(), score, metadata: None }
	}

	pub fn with_metadata(mut self, metadata: Metadata) -> Self {
		self.metadata = Some(metadata);
		self
	}
}

pub type Scores = Vec<Score>;

/// What a scorer sees for one case: the case inputs plus the task's output.
#[derive(Debug, Clone)]
pub struct TaskResult<I, R> {
	pub input: I,
	pub expected: Option<R>,
	pub output: R,
	pub metadata: Option<Metadata>,
}
