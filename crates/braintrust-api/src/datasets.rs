use braintrust_types::{
    CreateDataset, DatasetEvent, DatasetInfo, DatasetQueryParams, FetchRequest, FetchResponse, InsertEvents,
    ListResponse,
};

use crate::{push_param, ApiError, Client, Result};

pub struct Datasets<'a> {
    client: &'a Client,
}

impl<'a> Datasets<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn create(&self, params: &CreateDataset) -> Result<DatasetInfo> {
        if params.project_id.is_empty() {
            return Err(ApiError::InvalidArgument("project ID is required"));
        }
        if params.name.is_empty() {
            return Err(ApiError::InvalidArgument("dataset name is required"));
        }
        self.client.post("/v1/dataset", params).await
    }

    pub async fn insert(&self, dataset_id: &str, events: Vec<DatasetEvent>) -> Result<()> {
        if dataset_id.is_empty() {
            return Err(ApiError::InvalidArgument("dataset ID is required"));
        }
        self.client
            .post_raw(&format!("/v1/dataset/{dataset_id}/insert"), &InsertEvents { events })
            .await
            .map(|_| ())
    }

    /// Fetch one page of records. An empty cursor asks for the first page.
    pub async fn fetch(&self, dataset_id: &str, cursor: Option<&str>, limit: usize) -> Result<FetchResponse> {
        if dataset_id.is_empty() {
            return Err(ApiError::InvalidArgument("dataset ID is required"));
        }
        let body = FetchRequest {
            limit,
            cursor: cursor.filter(|c| !c.is_empty()).map(str::to_string),
        };
        self.client.post(&format!("/v1/dataset/{dataset_id}/fetch"), &body).await
    }

    pub async fn query(&self, params: &DatasetQueryParams) -> Result<Vec<DatasetInfo>> {
        let mut query = Vec::new();
        push_param(&mut query, "id", params.id.as_ref());
        push_param(&mut query, "dataset_name", params.name.as_ref());
        push_param(&mut query, "version", params.version.as_ref());
        push_param(&mut query, "project_id", params.project_id.as_ref());
        push_param(&mut query, "project_name", params.project_name.as_ref());
        if let Some(limit) = params.limit.filter(|l| *l > 0) {
            query.push(("limit", limit.to_string()));
        }
        let resp: ListResponse<DatasetInfo> = self.client.get("/v1/dataset", &query).await?;
        Ok(resp.objects)
    }

    pub async fn delete(&self, dataset_id: &str) -> Result<()> {
        if dataset_id.is_empty() {
            return Err(ApiError::InvalidArgument("dataset ID is required"));
        }
        self.client.delete(&format!("/v1/dataset/{dataset_id}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_sends_cursor_only_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/dataset/ds1/fetch"))
            .and(body_json(json!({"limit": 100})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "events": [{"id": "r1", "input": "a"}],
                "cursor": "next"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/dataset/ds1/fetch"))
            .and(body_json(json!({"limit": 100, "cursor": "next"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"events": [], "cursor": ""})))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new("k", server.uri()).unwrap();
        let first = client.datasets().fetch("ds1", None, 100).await.unwrap();
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.cursor.as_deref(), Some("next"));

        let second = client.datasets().fetch("ds1", Some("next"), 100).await.unwrap();
        assert!(second.events.is_empty());
    }

    #[tokio::test]
    async fn query_by_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/dataset"))
            .and(query_param("dataset_name", "golden"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "objects": [{"id": "ds1", "project_id": "p1", "name": "golden"}]
            })))
            .mount(&server)
            .await;

        let client = Client::new("k", server.uri()).unwrap();
        let found = client
            .datasets()
            .query(&DatasetQueryParams {
                name: Some("golden".into()),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "ds1");
    }
}
