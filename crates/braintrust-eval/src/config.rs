use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_API_URL: &str = braintrust_api::DEFAULT_API_URL;
pub const DEFAULT_APP_URL: &str = "https://www.braintrust.dev";
pub const DEFAULT_PROJECT_NAME: &str = "default-rust-project";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("API key is required (set BRAINTRUST_API_KEY)")]
    MissingApiKey,
    #[error("API URL is required")]
    MissingApiUrl,
    #[error("app URL is required")]
    MissingAppUrl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_app_url")]
    pub app_url: String,
    #[serde(default)]
    pub org_name: Option<String>,
    #[serde(default)]
    pub default_project_name: Option<String>,
    /// Wait for login to finish before the first request.
    #[serde(default)]
    pub blocking_login: bool,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_app_url() -> String {
    DEFAULT_APP_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: default_api_url(),
            app_url: default_app_url(),
            org_name: None,
            default_project_name: None,
            blocking_login: false,
        }
    }
}

impl Config {
    /// Read `BRAINTRUST_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            api_key: get("BRAINTRUST_API_KEY").unwrap_or_default(),
            api_url: get("BRAINTRUST_API_URL").unwrap_or_else(default_api_url),
            app_url: get("BRAINTRUST_APP_URL").unwrap_or_else(default_app_url),
            org_name: get("BRAINTRUST_ORG_NAME"),
            default_project_name: Some(
                get("BRAINTRUST_DEFAULT_PROJECT").unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string()),
            ),
            blocking_login: get("BRAINTRUST_BLOCKING_LOGIN")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.api_url.is_empty() {
            return Err(ConfigError::MissingApiUrl);
        }
        if self.app_url.is_empty() {
            return Err(ConfigError::MissingAppUrl);
        }
        Ok(())
    }
}
