use braintrust_types::{CreateProject, ListResponse, Project};

use crate::{ApiError, Client, Result};

pub struct Projects<'a> {
    client: &'a Client,
}

impl<'a> Projects<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Create a project, or return the existing one with the same name.
    pub async fn create(&self, name: &str) -> Result<Project> {
        if name.is_empty() {
            return Err(ApiError::InvalidArgument("project name is required"));
        }
        self.client
            .post("/v1/project", &CreateProject { name: name.to_string() })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Project> {
        if id.is_empty() {
            return Err(ApiError::InvalidArgument("project ID is required"));
        }
        self.client.get(&format!("/v1/project/{id}"), &[]).await
    }

    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<Project>> {
        let mut query = Vec::new();
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        let resp: ListResponse<Project> = self.client.get("/v1/project", &query).await?;
        Ok(resp.objects)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(ApiError::InvalidArgument("project ID is required"));
        }
        self.client.delete(&format!("/v1/project/{id}")).await
    }
}
