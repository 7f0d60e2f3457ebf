use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A complete eval run described in YAML.
///
/// ```yaml
/// experiment: nightly
/// project: my-project
/// task:
///   type: function
///   slug: summarize
/// data:
///   type: dataset
///   name: golden-set
/// scorers:
///   - type: exact
///   - type: levenshtein
///     threshold: 0.8
/// parallelism: 4
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalFileConfig {
    #[serde(default)]
    pub experiment: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub task: TaskConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub scorers: Vec<ScorerConfig>,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub fn default_parallelism() -> usize {
    8
}

impl EvalFileConfig {
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Experiment name, falling back to the data source's name.
    pub fn experiment_name(&self) -> String {
        if let Some(name) = self.experiment.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        match &self.data {
            DataConfig::Jsonl { path } => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "eval".to_string()),
            DataConfig::Dataset { name: Some(name), .. } => name.clone(),
            DataConfig::Dataset { id, .. } => id.clone().unwrap_or_else(|| "eval".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum TaskConfig {
    /// Output is the input, unchanged.
    #[default]
    Echo,
    Function {
        slug: String,
        #[serde(default)]
        project: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum DataConfig {
    Jsonl {
        path: PathBuf,
    },
    Dataset {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        limit: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ScorerConfig {
    Exact,
    Levenshtein {
        threshold: f64,
    },
    Contains {
        substring: String,
        #[serde(default = "default_case_sensitive")]
        case_sensitive: bool,
    },
    Regex {
        pattern: String,
    },
    Function {
        slug: String,
        #[serde(default)]
        project: Option<String>,
    },
}

fn default_case_sensitive() -> bool {
    true
}
