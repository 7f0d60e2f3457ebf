//! braintrust-api: a small async client for the braintrust REST API.
//!
//! Only the resources the evaluation engine needs are covered: projects,
//! experiments, datasets, functions and the API key login.

use std::time::{Duration, Instant};

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

mod datasets;
mod experiments;
mod functions;
mod login;
mod projects;

pub use datasets::Datasets;
pub use experiments::{Experiments, RegisterOpts};
pub use functions::Functions;
pub use projects::Projects;

pub const DEFAULT_API_URL: &str = "https://api.braintrust.dev";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("error making request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {status}, body: {body}")]
    Status { status: u16, body: String },

    #[error("error decoding response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    InvalidArgument(&'static str),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Network failures and 5xx responses may succeed if tried again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Authenticated HTTP client bound to one base URL.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl Client {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_http_client(http, api_key, base_url))
    }

    /// Use a preconfigured `reqwest::Client` (proxies, custom TLS, test doubles).
    pub fn with_http_client(
        http: reqwest::Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn projects(&self) -> Projects<'_> {
        Projects::new(self)
    }

    pub fn experiments(&self) -> Experiments<'_> {
        Experiments::new(self)
    }

    pub fn datasets(&self) -> Datasets<'_> {
        Datasets::new(self)
    }

    pub fn functions(&self) -> Functions<'_> {
        Functions::new(self)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let req = self.http.request(Method::GET, self.url(path)).query(query);
        let body = self.send(req).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub(crate) async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let bytes = self.post_raw(path, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub(crate) async fn post_raw<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(body)?;
        debug!(path, body = %String::from_utf8_lossy(&payload), "http request body");
        let req = self
            .http
            .request(Method::POST, self.url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);
        self.send(req).await
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<()> {
        let req = self.http.request(Method::DELETE, self.url(path));
        self.send(req).await.map(|_| ())
    }

    async fn send(&self, req: RequestBuilder) -> Result<Vec<u8>> {
        let req = req.bearer_auth(&self.api_key).build()?;
        let method = req.method().clone();
        let url = req.url().to_string();
        let start = Instant::now();

        let resp = match self.http.execute(req).await {
            Ok(resp) => resp,
            Err(err) => {
                debug!(%method, %url, error = %err, elapsed = ?start.elapsed(), "http request failed");
                return Err(err.into());
            }
        };

        let status = resp.status();
        debug!(%method, %url, status = status.as_u16(), elapsed = ?start.elapsed(), "http response");

        let body = resp.bytes().await?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&body).into_owned();
            debug!(%method, %url, status = status.as_u16(), %body, "http error response");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body.to_vec())
    }
}

/// Push `(key, value)` onto a query string when the value is set and non-empty.
pub(crate) fn push_param(query: &mut Vec<(&'static str, String)>, key: &'static str, value: Option<&String>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        query.push((key, v.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/function/f1"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new("secret", server.uri()).unwrap();
        client.functions().delete("f1").await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/project"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let client = Client::new("k", server.uri()).unwrap();
        let err = client.projects().create("demo").await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("down"));
    }

    #[test]
    fn url_joining_trims_slashes() {
        let client = Client::new("k", "http://localhost:1234/").unwrap();
        assert_eq!(client.url("/v1/project"), "http://localhost:1234/v1/project");
    }
}
