//! Error taxonomy for evaluation runs.
//!
//! Fatal errors (validation, registration) abort [`Evaluator::run`] before any
//! case is processed. Per-case errors are collected into [`EvalErrors`] and
//! reported once the run has drained.
//!
//! [`Evaluator::run`]: crate::Evaluator::run

use std::fmt;

use braintrust_api::ApiError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::dataset::DatasetError;
use crate::session::AuthError;

/// Stable classification of an [`EvalError`], attached to span error events
/// so failures stay distinguishable after export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Eval,
    TaskRun,
    Scorer,
    CaseIterator,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Eval => "ErrEval",
            Self::TaskRun => "ErrTaskRun",
            Self::Scorer => "ErrScorer",
            Self::CaseIterator => "ErrCaseIterator",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("eval error: {0}")]
    Validation(String),

    #[error("eval error: failed to create project: {0}")]
    Project(#[source] ApiError),

    #[error("eval error: failed to register experiment: {0}")]
    Registration(#[source] ApiError),

    #[error("eval error: worker failed: {0}")]
    Worker(String),

    #[error("task run error: {0:#}")]
    TaskRun(#[source] anyhow::Error),

    #[error("scorer error: scorer {name:?} failed: {source:#}")]
    Scorer {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("case iterator error: {0}")]
    CaseIterator(#[source] DatasetError),

    #[error("failed to encode {key} as JSON: {source}")]
    Encode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl EvalError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// `None` for attribute encoding failures, which belong to no kind.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Validation(_) | Self::Project(_) | Self::Registration(_) | Self::Worker(_) => {
                Some(ErrorKind::Eval)
            }
            Self::TaskRun(_) => Some(ErrorKind::TaskRun),
            Self::Scorer { .. } => Some(ErrorKind::Scorer),
            Self::CaseIterator(_) => Some(ErrorKind::CaseIterator),
            Self::Encode { .. } => None,
        }
    }

    /// Label recorded as `exception.type` on span error events.
    pub fn label(&self) -> &'static str {
        self.kind().map(ErrorKind::label).unwrap_or("ErrEncode")
    }
}

/// Failure to build an [`Evaluator`](crate::Evaluator) from configuration.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("failed to create API client: {0}")]
    Api(#[from] ApiError),
}

/// Every per-case failure of one run, in the order workers reported them.
///
/// Rendered one error per line. Never empty.
#[derive(Debug)]
pub struct EvalErrors(Vec<EvalError>);

impl EvalErrors {
    pub(crate) fn from_vec(errors: Vec<EvalError>) -> Option<Self> {
        (!errors.is_empty()).then_some(Self(errors))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EvalError> {
        self.0.iter()
    }

    /// Distinct kinds present, in first-seen order.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        let mut kinds = Vec::new();
        for kind in self.0.iter().filter_map(EvalError::kind) {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.0.iter().any(|e| e.kind() == Some(kind))
    }

    pub fn count_kind(&self, kind: ErrorKind) -> usize {
        self.0.iter().filter(|e| e.kind() == Some(kind)).count()
    }

    pub fn into_vec(self) -> Vec<EvalError> {
        self.0
    }
}

impl fmt::Display for EvalErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for EvalErrors {}

impl<'a> IntoIterator for &'a EvalErrors {
    type Item = &'a EvalError;
    type IntoIter = std::slice::Iter<'a, EvalError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for EvalErrors {
    type Item = EvalError;
    type IntoIter = std::vec::IntoIter<EvalError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
