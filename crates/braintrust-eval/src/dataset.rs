use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use braintrust_api::ApiError;
use braintrust_types::DatasetQueryParams;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::backend::Backend;
use crate::types::{Case, CaseOrigin, EvalValue, Metadata};

const FETCH_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to fetch dataset events: {0}")]
    Fetch(#[source] ApiError),

    #[error("failed to decode dataset record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid JSON on line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset ID is required")]
    MissingId,

    #[error("failed to query datasets: {0}")]
    Query(#[source] ApiError),

    #[error("no datasets found matching the criteria")]
    NotFound,
}

/// A forward-only source of cases.
///
/// `None` means the dataset is exhausted and stays exhausted. `Some(Err(_))`
/// reports a problem with one item; iteration may continue afterwards.
#[async_trait]
pub trait Dataset<I, R>: Send {
    async fn next(&mut self) -> Option<Result<Case<I, R>, DatasetError>>;

    /// Identifier of the stored dataset, empty for ad hoc sets.
    fn id(&self) -> &str {
        ""
    }

    fn version(&self) -> &str {
        ""
    }
}

pub struct VecDataset<I, R> {
    cases: std::vec::IntoIter<Case<I, R>>,
}

impl<I, R> VecDataset<I, R> {
    pub fn new(cases: Vec<Case<I, R>>) -> Self {
        Self { cases: cases.into_iter() }
    }
}

impl<I, R> From<Vec<Case<I, R>>> for VecDataset<I, R> {
    fn from(cases: Vec<Case<I, R>>) -> Self {
        Self::new(cases)
    }
}

#[async_trait]
impl<I: Send, R: Send> Dataset<I, R> for VecDataset<I, R> {
    async fn next(&mut self) -> Option<Result<Case<I, R>, DatasetError>> {
        self.cases.next().map(Ok)
    }
}

/// Cases read from a JSONL file, one `{input, expected?, tags?, metadata?}`
/// object per line. Blank lines are skipped.
pub struct JsonlDataset<I, R> {
    lines: std::vec::IntoIter<(usize, String)>,
    _types: PhantomData<fn() -> (I, R)>,
}

impl<I, R> JsonlDataset<I, R> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_lines(&content))
    }

    pub fn from_lines(content: &str) -> Self {
        let lines: Vec<(usize, String)> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| (idx + 1, line.to_string()))
            .collect();
        Self { lines: lines.into_iter(), _types: PhantomData }
    }
}

#[async_trait]
impl<I: EvalValue, R: EvalValue> Dataset<I, R> for JsonlDataset<I, R> {
    async fn next(&mut self) -> Option<Result<Case<I, R>, DatasetError>> {
        let (line, text) = self.lines.next()?;
        Some(serde_json::from_str(&text).map_err(|source| DatasetError::Line { line, source }))
    }
}

/// Raw shape of a stored dataset record.
#[derive(Deserialize)]
struct StoredRecord<I, R> {
    input: I,
    expected: Option<R>,
    tags: Option<Vec<String>>,
    metadata: Option<Metadata>,
    id: Option<String>,
    #[serde(rename = "_xact_id")]
    xact_id: Option<String>,
    created: Option<String>,
}

impl<I, R> From<StoredRecord<I, R>> for Case<I, R> {
    fn from(record: StoredRecord<I, R>) -> Self {
        let origin = match (record.id, record.xact_id) {
            (Some(id), Some(xact_id)) if !id.is_empty() && !xact_id.is_empty() => Some(CaseOrigin {
                id,
                xact_id,
                created: record.created.unwrap_or_default(),
            }),
            _ => None,
        };
        Case {
            input: record.input,
            expected: record.expected,
            tags: record.tags.unwrap_or_default(),
            metadata: record.metadata,
            origin,
        }
    }
}

/// Pages through a stored dataset, decoding each record as it is consumed.
pub struct RemoteDataset<I, R> {
    backend: Arc<dyn Backend>,
    dataset_id: String,
    version: String,
    events: Vec<Value>,
    index: usize,
    cursor: Option<String>,
    exhausted: bool,
    max_records: usize,
    consumed: usize,
    _types: PhantomData<fn() -> (I, R)>,
}

impl<I, R> RemoteDataset<I, R> {
    pub fn new(backend: Arc<dyn Backend>, dataset_id: impl Into<String>) -> Self {
        Self {
            backend,
            dataset_id: dataset_id.into(),
            version: String::new(),
            events: Vec::new(),
            index: 0,
            cursor: None,
            exhausted: false,
            max_records: 0,
            consumed: 0,
            _types: PhantomData,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Stop after `max` records. Zero means no limit.
    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = max;
        self
    }

    fn budget_spent(&self) -> bool {
        self.max_records > 0 && self.consumed >= self.max_records
    }

    async fn fetch_next_batch(&mut self) -> Result<(), DatasetError> {
        let mut batch = FETCH_BATCH_SIZE;
        if self.max_records > 0 {
            batch = batch.min(self.max_records - self.consumed);
        }

        let page = self
            .backend
            .fetch_dataset(&self.dataset_id, self.cursor.as_deref(), batch)
            .await
            .map_err(DatasetError::Fetch)?;

        debug!(dataset_id = %self.dataset_id, records = page.events.len(), "fetched dataset page");
        self.cursor = page.cursor.filter(|c| !c.is_empty());
        self.exhausted = self.cursor.is_none() || page.events.is_empty();
        self.events = page.events;
        self.index = 0;
        Ok(())
    }
}

#[async_trait]
impl<I: EvalValue, R: EvalValue> Dataset<I, R> for RemoteDataset<I, R> {
    async fn next(&mut self) -> Option<Result<Case<I, R>, DatasetError>> {
        if self.budget_spent() {
            self.exhausted = true;
            return None;
        }

        if self.index >= self.events.len() {
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.fetch_next_batch().await {
                self.exhausted = true;
                self.events.clear();
                self.index = 0;
                return Some(Err(err));
            }
            if self.index >= self.events.len() {
                return None;
            }
        }

        let raw = std::mem::take(&mut self.events[self.index]);
        self.index += 1;
        self.consumed += 1;
        Some(
            serde_json::from_value::<StoredRecord<I, R>>(raw)
                .map(Case::from)
                .map_err(DatasetError::Decode),
        )
    }

    fn id(&self) -> &str {
        &self.dataset_id
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// Lookup criteria for [`DatasetLoader::query`].
#[derive(Debug, Clone, Default)]
pub struct DatasetQuery {
    pub name: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    /// Record budget for the returned iterator. Zero means no limit.
    pub limit: usize,
}

/// Opens stored datasets as typed iterators.
pub struct DatasetLoader<I, R> {
    backend: Arc<dyn Backend>,
    _types: PhantomData<fn() -> (I, R)>,
}

impl<I, R> DatasetLoader<I, R> {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend, _types: PhantomData }
    }

    pub fn get(&self, dataset_id: &str) -> Result<RemoteDataset<I, R>, DatasetError> {
        if dataset_id.is_empty() {
            return Err(DatasetError::MissingId);
        }
        Ok(RemoteDataset::new(self.backend.clone(), dataset_id))
    }

    /// Resolve a dataset by id, or by name to the most recent match.
    pub async fn query(&self, query: DatasetQuery) -> Result<RemoteDataset<I, R>, DatasetError> {
        let version = query.version.clone().unwrap_or_default();
        if let Some(id) = query.id.filter(|id| !id.is_empty()) {
            return Ok(self
                .get(&id)?
                .with_version(version)
                .with_max_records(query.limit));
        }

        let params = DatasetQueryParams {
            name: query.name,
            version: query.version,
            limit: Some(1),
            ..Default::default()
        };
        let found = self.backend.query_datasets(&params).await.map_err(DatasetError::Query)?;
        let info = found.into_iter().next().ok_or(DatasetError::NotFound)?;
        Ok(RemoteDataset::new(self.backend.clone(), info.id)
            .with_version(version)
            .with_max_records(query.limit))
    }
}
