use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::{Config, DEFAULT_APP_URL};
use crate::error::EvalErrors;
use crate::session::LoginInfo;

/// Outcome of one eval run.
#[derive(Debug)]
pub struct EvalResult {
    experiment_id: String,
    name: String,
    project_id: String,
    project_name: String,
    error: Option<EvalErrors>,
    elapsed: Duration,
    permalink: String,
}

/// Serializable view of an [`EvalResult`].
#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    pub experiment_id: String,
    pub name: String,
    pub project_id: String,
    pub project_name: String,
    pub elapsed_secs: f64,
    pub permalink: String,
    pub errors: Vec<String>,
}

impl EvalResult {
    pub(crate) fn new(
        experiment_id: String,
        name: String,
        project_id: String,
        project_name: String,
        error: Option<EvalErrors>,
        elapsed: Duration,
        permalink: String,
    ) -> Self {
        Self { experiment_id, name, project_id, project_name, error, elapsed, permalink }
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Every case-level failure, or `None` if all cases completed cleanly.
    pub fn error(&self) -> Option<&EvalErrors> {
        self.error.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Link to the experiment in the web app. Empty when no organization is known.
    pub fn permalink(&self) -> &str {
        &self.permalink
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn summary(&self) -> EvalSummary {
        EvalSummary {
            experiment_id: self.experiment_id.clone(),
            name: self.name.clone(),
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            elapsed_secs: self.elapsed.as_secs_f64(),
            permalink: self.permalink.clone(),
            errors: self.error.iter().flat_map(|e| e.iter().map(ToString::to_string)).collect(),
        }
    }

    /// Split into the result and its aggregated error, if any.
    pub fn into_parts(mut self) -> (Self, Option<EvalErrors>) {
        let error = self.error.take();
        (self, error)
    }

    /// `Err` carries the aggregated case errors; the result itself is dropped.
    pub fn into_result(self) -> Result<Self, EvalErrors> {
        match self.into_parts() {
            (result, None) => Ok(result),
            (_, Some(errors)) => Err(errors),
        }
    }
}

impl fmt::Display for EvalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let project = if self.project_name.is_empty() { &self.project_id } else { &self.project_name };
        writeln!(f)?;
        writeln!(f, "=== Experiment: {} ===", self.name)?;
        writeln!(f, "Name: {}", self.name)?;
        writeln!(f, "Project: {project}")?;
        writeln!(f, "Duration: {:.1}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "Link: {}", self.permalink)?;
        if let Some(errors) = &self.error {
            writeln!(f, "Errors:")?;
            for line in errors.to_string().lines() {
                writeln!(f, "  {line}")?;
            }
        }
        Ok(())
    }
}

/// `{app}/app/{org}/object?object_type=experiment&object_id={id}`, or empty
/// without an organization name.
pub(crate) fn permalink(config: &Config, login: Option<&LoginInfo>, experiment_id: &str) -> String {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

    let app_url = non_empty(&config.app_url)
        .or_else(|| login.and_then(|l| l.app_public_url.clone()).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| DEFAULT_APP_URL.to_string());
    let org_name = config
        .org_name
        .as_deref()
        .and_then(non_empty)
        .or_else(|| login.map(|l| l.org_name.clone()).filter(|s| !s.is_empty()));

    match org_name {
        Some(org) if !experiment_id.is_empty() => format!(
            "{}/app/{}/object?object_type=experiment&object_id={}",
            app_url.trim_end_matches('/'),
            org,
            experiment_id
        ),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvalError;
    use pretty_assertions::assert_eq;

    fn result(error: Option<EvalErrors>) -> EvalResult {
        EvalResult::new(
            "exp-1".into(),
            "nightly".into(),
            "proj-1".into(),
            "demo".into(),
            error,
            Duration::from_millis(1234),
            "https://www.braintrust.dev/app/acme/object?object_type=experiment&object_id=exp-1".into(),
        )
    }

    #[test]
    fn renders_without_errors() {
        assert_eq!(
            result(None).to_string(),
            "\n=== Experiment: nightly ===\nName: nightly\nProject: demo\nDuration: 1.2s\n\
             Link: https://www.braintrust.dev/app/acme/object?object_type=experiment&object_id=exp-1\n"
        );
    }

    #[test]
    fn renders_errors_indented() {
        let errors = EvalErrors::from_vec(vec![EvalError::TaskRun(anyhow::anyhow!("boom"))]);
        let text = result(errors).to_string();
        assert!(text.ends_with("Errors:\n  task run error: boom\n"), "{text}");
    }

    #[test]
    fn project_falls_back_to_id() {
        let r = EvalResult::new(
            "exp-1".into(),
            "n".into(),
            "proj-1".into(),
            String::new(),
            None,
            Duration::ZERO,
            String::new(),
        );
        assert!(r.to_string().contains("Project: proj-1\n"));
    }

    #[test]
    fn into_result_is_symmetric() {
        assert!(result(None).into_result().is_ok());
        let errors = EvalErrors::from_vec(vec![EvalError::TaskRun(anyhow::anyhow!("boom"))]);
        assert_eq!(result(errors).into_result().unwrap_err().len(), 1);
    }

    #[test]
    fn permalink_fallbacks() {
        let login = LoginInfo {
            org_name: "session-org".into(),
            app_public_url: Some("https://app.example.com".into()),
            ..Default::default()
        };

        let mut config = Config { org_name: Some("acme".into()), ..Config::default() };
        assert_eq!(
            permalink(&config, Some(&login), "e1"),
            "https://www.braintrust.dev/app/acme/object?object_type=experiment&object_id=e1"
        );

        config.app_url = String::new();
        config.org_name = None;
        assert_eq!(
            permalink(&config, Some(&login), "e1"),
            "https://app.example.com/app/session-org/object?object_type=experiment&object_id=e1"
        );

        assert_eq!(
            permalink(&config, None, "e1"),
            ""
        );
        config.org_name = Some("acme".into());
        assert_eq!(
            permalink(&config, None, "e1"),
            "https://www.braintrust.dev/app/acme/object?object_type=experiment&object_id=e1"
        );
    }
}
