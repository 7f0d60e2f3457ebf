//! Login state shared by an evaluator.
//!
//! [`LoginSession`] logs in on a background task so construction never
//! blocks; callers that need the organization details either peek with
//! [`Session::info`] or wait with [`Session::wait`].

use std::time::Duration;

use async_trait::async_trait;
use braintrust_api::{ApiError, Client};
use braintrust_types::LoginResponse;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("API key is required")]
    MissingApiKey,
    #[error("app URL is required")]
    MissingAppUrl,
    #[error("invalid API key: {0}")]
    InvalidApiKey(String),
    #[error("organization {0:?} not found for this API key")]
    OrgNotFound(String),
    #[error("no organizations found for this API key")]
    NoOrganizations,
    #[error("login failed: {0}")]
    Failed(String),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("login was cancelled")]
    Cancelled,
}

/// Organization details resolved at login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginInfo {
    pub org_id: String,
    pub org_name: String,
    pub api_url: Option<String>,
    pub app_public_url: Option<String>,
}

#[async_trait]
pub trait Session: Send + Sync {
    /// Login details if login has already succeeded.
    fn info(&self) -> Option<LoginInfo>;

    /// Wait for login to finish.
    async fn wait(&self) -> Result<LoginInfo, AuthError>;
}

#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    pub api_key: String,
    pub app_url: String,
    pub app_public_url: Option<String>,
    pub org_name: Option<String>,
}

type LoginState = Option<Result<LoginInfo, AuthError>>;

/// Session that logs in on a background task, retrying transient failures.
pub struct LoginSession {
    state: watch::Receiver<LoginState>,
    cancel: CancellationToken,
}

impl LoginSession {
    /// Start logging in. Must be called from within a tokio runtime.
    pub fn start(opts: LoginOptions) -> Result<Self, AuthError> {
        if opts.api_key.is_empty() {
            return Err(AuthError::MissingApiKey);
        }
        if opts.app_url.is_empty() {
            return Err(AuthError::MissingAppUrl);
        }
        let client = Client::new(opts.api_key.clone(), opts.app_url.clone()).map_err(|e| AuthError::Failed(e.to_string()))?;

        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        tokio::spawn(login_with_retry(client, opts, tx, cancel.clone()));
        Ok(Self { state: rx, cancel })
    }

    /// Stop any in-flight login attempt.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LoginSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Session for LoginSession {
    fn info(&self) -> Option<LoginInfo> {
        match &*self.state.borrow() {
            Some(Ok(info)) => Some(info.clone()),
            _ => None,
        }
    }

    async fn wait(&self) -> Result<LoginInfo, AuthError> {
        let mut state = self.state.clone();
        let done = state.wait_for(Option::is_some).await.map_err(|_| AuthError::Cancelled)?;
        match &*done {
            Some(outcome) => outcome.clone(),
            None => Err(AuthError::Cancelled),
        }
    }
}

async fn login_with_retry(
    client: Client,
    opts: LoginOptions,
    tx: watch::Sender<LoginState>,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1u32;
    loop {
        debug!(attempt, "logging in");
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                tx.send_replace(Some(Err(AuthError::Cancelled)));
                return;
            }
            response = client.login() => response,
        };

        let outcome = match response {
            Ok(resp) => select_org(resp, &opts),
            Err(err) if matches!(err.status(), Some(401 | 403)) => Err(AuthError::InvalidApiKey(err.to_string())),
            Err(err) if err.is_retryable() => {
                warn!(attempt, error = %err, "login failed, retrying in {:?}", backoff);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tx.send_replace(Some(Err(AuthError::Cancelled)));
                        return;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                attempt += 1;
                continue;
            }
            Err(err) => Err(login_failed(err)),
        };

        match &outcome {
            Ok(info) => debug!(org = %info.org_name, "logged in"),
            Err(err) => warn!(error = %err, "login failed permanently"),
        }
        tx.send_replace(Some(outcome));
        return;
    }
}

fn login_failed(err: ApiError) -> AuthError {
    AuthError::Failed(err.to_string())
}

fn select_org(resp: LoginResponse, opts: &LoginOptions) -> Result<LoginInfo, AuthError> {
    let wanted = opts.org_name.as_deref().filter(|n| !n.is_empty());
    let org = match wanted {
        Some(name) => resp
            .org_info
            .into_iter()
            .find(|o| o.name == name)
            .ok_or_else(|| AuthError::OrgNotFound(name.to_string()))?,
        None => resp.org_info.into_iter().next().ok_or(AuthError::NoOrganizations)?,
    };
    Ok(LoginInfo {
        org_id: org.id,
        org_name: org.name,
        api_url: org.api_url,
        app_public_url: opts.app_public_url.clone(),
    })
}

/// Session with fixed login details, resolved immediately.
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    info: Option<LoginInfo>,
}

impl StaticSession {
    pub fn logged_in(info: LoginInfo) -> Self {
        Self { info: Some(info) }
    }

    pub fn logged_out() -> Self {
        Self { info: None }
    }
}

#[async_trait]
impl Session for StaticSession {
    fn info(&self) -> Option<LoginInfo> {
        self.info.clone()
    }

    async fn wait(&self) -> Result<LoginInfo, AuthError> {
        self.info.clone().ok_or(AuthError::NotLoggedIn)
    }
}
