use braintrust_types::{CreateExperiment, Experiment, ListResponse};
use serde_json::{Map, Value};

use crate::{push_param, ApiError, Client, Result};

/// Options for [`Experiments::register`].
#[derive(Debug, Clone, Default)]
pub struct RegisterOpts {
    pub tags: Vec<String>,
    pub metadata: Option<Map<String, Value>>,
    /// Reuse an existing experiment with the same name instead of creating a new one.
    pub update: bool,
    pub dataset_id: Option<String>,
    pub dataset_version: Option<String>,
}

pub struct Experiments<'a> {
    client: &'a Client,
}

impl<'a> Experiments<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn create(&self, params: &CreateExperiment) -> Result<Experiment> {
        if params.project_id.is_empty() {
            return Err(ApiError::InvalidArgument("project ID is required"));
        }
        self.client.post("/v1/experiment", params).await
    }

    /// Create or get an experiment by name within a project.
    pub async fn register(&self, name: &str, project_id: &str, opts: RegisterOpts) -> Result<Experiment> {
        if name.is_empty() {
            return Err(ApiError::InvalidArgument("experiment name is required"));
        }
        let params = CreateExperiment {
            project_id: project_id.to_string(),
            name: name.to_string(),
            ensure_new: !opts.update,
            tags: (!opts.tags.is_empty()).then_some(opts.tags),
            metadata: opts.metadata,
            dataset_id: opts.dataset_id.filter(|s| !s.is_empty()),
            dataset_version: opts.dataset_version.filter(|s| !s.is_empty()),
        };
        self.create(&params).await
    }

    pub async fn get(&self, id: &str) -> Result<Experiment> {
        if id.is_empty() {
            return Err(ApiError::InvalidArgument("experiment ID is required"));
        }
        self.client.get(&format!("/v1/experiment/{id}"), &[]).await
    }

    pub async fn list(&self, project_id: Option<&String>, name: Option<&String>) -> Result<Vec<Experiment>> {
        let mut query = Vec::new();
        push_param(&mut query, "project_id", project_id);
        push_param(&mut query, "experiment_name", name);
        let resp: ListResponse<Experiment> = self.client.get("/v1/experiment", &query).await?;
        Ok(resp.objects)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(ApiError::InvalidArgument("experiment ID is required"));
        }
        self.client.delete(&format!("/v1/experiment/{id}")).await
    }
}
