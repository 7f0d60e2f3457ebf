//! braintrust-eval: run evaluations against braintrust and trace them as
//! OpenTelemetry spans.
//! Compose a dataset, a task (your model or agent) and scorers; run them with
//! bounded parallelism. See `examples/simple.rs` for a quickstart.

pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod functions;
pub mod report;
pub mod runner;
pub mod scorer;
pub mod scorers;
pub mod session;
pub mod task;
pub mod testing;
pub mod trace;
pub mod types;

pub use backend::Backend;
pub use config::{Config, ConfigError};
pub use dataset::{Dataset, DatasetError, DatasetLoader, DatasetQuery, JsonlDataset, RemoteDataset, VecDataset};
pub use error::{ConnectError, ErrorKind, EvalError, EvalErrors};
pub use functions::{FunctionError, FunctionLoader, FunctionOpts};
pub use report::{EvalResult, EvalSummary};
pub use runner::{Evaluator, Opts, OptsBuilder};
pub use scorer::Scorer;
pub use scorers::{ContainsScorer, ExactMatchScorer, LevenshteinScorer, RegexScorer};
pub use session::{AuthError, LoginInfo, LoginSession, Session, StaticSession};
pub use task::{Task, TaskHooks};
pub use trace::{OtelTracer, SpanHandle, Tracer};
pub use types::{Case, CaseOrigin, EvalValue, Metadata, Score, Scores, TaskResult};
