use braintrust_types::{CreateFunction, Function, FunctionQueryParams, InvokeRequest, ListResponse};
use serde::Serialize;
use serde_json::Value;

use crate::{push_param, ApiError, Client, Result};

pub struct Functions<'a> {
    client: &'a Client,
}

impl<'a> Functions<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn query(&self, params: &FunctionQueryParams) -> Result<Vec<Function>> {
        let mut query = Vec::new();
        push_param(&mut query, "project_name", params.project_name.as_ref());
        push_param(&mut query, "project_id", params.project_id.as_ref());
        push_param(&mut query, "slug", params.slug.as_ref());
        push_param(&mut query, "function_name", params.function_name.as_ref());
        push_param(&mut query, "version", params.version.as_ref());
        push_param(&mut query, "environment", params.environment.as_ref());
        if let Some(limit) = params.limit.filter(|l| *l > 0) {
            query.push(("limit", limit.to_string()));
        }
        let resp: ListResponse<Function> = self.client.get("/v1/function", &query).await?;
        Ok(resp.objects)
    }

    pub async fn create(&self, params: &CreateFunction) -> Result<Function> {
        if params.project_id.is_empty() {
            return Err(ApiError::InvalidArgument("project ID is required"));
        }
        if params.name.is_empty() {
            return Err(ApiError::InvalidArgument("name is required"));
        }
        if params.slug.is_empty() {
            return Err(ApiError::InvalidArgument("slug is required"));
        }
        self.client.post("/v1/function", params).await
    }

    /// Invoke a function and return its output.
    ///
    /// Object responses carrying an `output` key are unwrapped; any other JSON
    /// body is returned as-is.
    pub async fn invoke<I: Serialize + ?Sized>(&self, function_id: &str, input: &I) -> Result<Value> {
        if function_id.is_empty() {
            return Err(ApiError::InvalidArgument("function ID is required"));
        }
        let body = InvokeRequest {
            input: serde_json::to_value(input)?,
        };
        let raw = self
            .client
            .post_raw(&format!("/v1/function/{function_id}/invoke"), &body)
            .await?;
        let value: Value = serde_json::from_slice(&raw)?;
        Ok(unwrap_output(value))
    }

    pub async fn delete(&self, function_id: &str) -> Result<()> {
        if function_id.is_empty() {
            return Err(ApiError::InvalidArgument("function ID is required"));
        }
        self.client.delete(&format!("/v1/function/{function_id}")).await
    }
}

fn unwrap_output(value: Value) -> Value {
    match value {
        Value::Object(mut map) => match map.remove("output") {
            Some(output) => output,
            None => Value::Object(map),
        },
        other => other,
    }
}
