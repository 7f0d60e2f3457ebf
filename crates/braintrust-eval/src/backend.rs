use async_trait::async_trait;
use braintrust_api::{ApiError, Client, RegisterOpts};
use braintrust_types::{
    DatasetInfo, DatasetQueryParams, Experiment, FetchResponse, Function, FunctionQueryParams, Project,
};
use serde_json::Value;

/// The remote operations an eval run depends on.
///
/// Implemented for [`braintrust_api::Client`]; tests use
/// [`crate::testing::MemoryBackend`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create the project, or return it if it already exists.
    async fn create_project(&self, name: &str) -> Result<Project, ApiError>;

    async fn register_experiment(
        &self,
        name: &str,
        project_id: &str,
        opts: RegisterOpts,
    ) -> Result<Experiment, ApiError>;

    async fn fetch_dataset(
        &self,
        dataset_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<FetchResponse, ApiError>;

    async fn query_datasets(&self, params: &DatasetQueryParams) -> Result<Vec<DatasetInfo>, ApiError>;

    async fn query_functions(&self, params: &FunctionQueryParams) -> Result<Vec<Function>, ApiError>;

    async fn invoke_function(&self, function_id: &str, input: Value) -> Result<Value, ApiError>;
}

#[async_trait]
impl Backend for Client {
    async fn create_project(&self, name: &str) -> Result<Project, ApiError> {
        self.projects().create(name).await
    }

    async fn register_experiment(
        &self,
        name: &str,
        project_id: &str,
        opts: RegisterOpts,
    ) -> Result<Experiment, ApiError> {
        self.experiments().register(name, project_id, opts).await
    }

    async fn fetch_dataset(
        &self,
        dataset_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<FetchResponse, ApiError> {
        self.datasets().fetch(dataset_id, cursor, limit).await
    }

    async fn query_datasets(&self, params: &DatasetQueryParams) -> Result<Vec<DatasetInfo>, ApiError> {
        self.datasets().query(params).await
    }

    async fn query_functions(&self, params: &FunctionQueryParams) -> Result<Vec<Function>, ApiError> {
        self.functions().query(params).await
    }

    async fn invoke_function(&self, function_id: &str, input: Value) -> Result<Value, ApiError> {
        self.functions().invoke(function_id, &input).await
    }
}
