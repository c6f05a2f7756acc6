//! SuperGLUE splits in their native JSONL layout.
//!
//! Each line is one record with `premise`, `hypothesis`, `idx` and an
//! optional `label` (an index or a label name). Records without a label, as in
//! the test split, get [`NO_LABEL`].

use std::fs;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::data::example::{InputExample, NO_LABEL};
use crate::error::{PromptError, Result};
use crate::traits::AdapterConfig;

/// Premise/hypothesis task whose labels are known by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    /// CommitmentBank: entailment, contradiction, neutral.
    #[default]
    Cb,
}

impl Task {
    /// Label names in index order.
    #[must_use]
    pub fn label_names(self) -> &'static [&'static str] {
        match self {
            Self::Cb => &["entailment", "contradiction", "neutral"],
        }
    }

    /// Number of classes.
    #[must_use]
    pub fn num_classes(self) -> usize {
        self.label_names().len()
    }

    fn label_index(self, name: &str) -> Option<i64> {
        self.label_names()
            .iter()
            .position(|n| *n == name)
            .and_then(|i| i64::try_from(i).ok())
    }
}

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// Training data.
    Train,
    /// Held-out data with labels.
    Validation,
    /// Held-out data without labels.
    Test,
}

impl Split {
    /// All splits in load order.
    pub const ALL: [Self; 3] = [Self::Train, Self::Validation, Self::Test];

    /// Accepted file names, first match wins.
    #[must_use]
    pub fn file_names(self) -> &'static [&'static str] {
        match self {
            Self::Train => &["train.jsonl"],
            Self::Validation => &["val.jsonl", "validation.jsonl"],
            Self::Test => &["test.jsonl"],
        }
    }
}

/// Where the JSONL files come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DatasetSource {
    /// A local directory.
    Disk {
        /// Directory holding the split files.
        dir: PathBuf,
    },
    /// A HuggingFace dataset repository.
    Hub {
        /// Dataset repository id.
        repo_id: String,
        /// Revision, `main` when unset.
        #[serde(default)]
        revision: Option<String>,
        /// Sub-directory of the repository holding the split files.
        #[serde(default)]
        dir: Option<String>,
    },
}

/// Dataset section of the pipeline config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Label scheme.
    #[serde(default)]
    pub task: Task,
    /// File location.
    pub source: DatasetSource,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            task: Task::Cb,
            source: DatasetSource::Disk {
                dir: PathBuf::from("datasets/super_glue.cb"),
            },
        }
    }
}

impl AdapterConfig for DatasetConfig {
    fn validate(&self) -> Result<()> {
        match &self.source {
            DatasetSource::Disk { dir } if dir.as_os_str().is_empty() => {
                Err(PromptError::InvalidConfig("dataset dir cannot be empty".into()))
            }
            DatasetSource::Hub { repo_id, .. } if repo_id.is_empty() => {
                Err(PromptError::InvalidConfig("dataset repo_id cannot be empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// The three loaded splits.
#[derive(Debug, Clone, Default)]
pub struct DatasetSplits {
    /// Training examples.
    pub train: Vec<InputExample>,
    /// Validation examples.
    pub validation: Vec<InputExample>,
    /// Test examples, usually unlabeled.
    pub test: Vec<InputExample>,
}

impl DatasetSplits {
    /// Examples of one split.
    #[must_use]
    pub fn get(&self, split: Split) -> &[InputExample] {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }
}

#[derive(Deserialize)]
struct Record {
    premise: String,
    hypothesis: String,
    idx: i64,
    #[serde(default)]
    label: Option<Value>,
}

fn parse_label(value: Option<&Value>, task: Task) -> std::result::Result<i64, String> {
    match value {
        None | Some(Value::Null) => Ok(NO_LABEL),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| format!("label {n} is not an integer")),
        Some(Value::String(name)) => task
            .label_index(name)
            .ok_or_else(|| format!("unknown label '{name}' for {task:?}")),
        Some(other) => Err(format!("unsupported label {other}")),
    }
}

/// Parse JSONL `content`; `origin` names the source in error messages.
///
/// # Errors
/// Returns a `Dataset` error naming the line of the first malformed record.
pub fn parse_jsonl(content: &str, task: Task, origin: &str) -> Result<Vec<InputExample>> {
    let mut examples = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let dataset_err = |message: String| {
            PromptError::Dataset(format!("{origin}:{}: {message}", line_num + 1))
        };
        let record: Record = serde_json::from_str(line).map_err(|e| dataset_err(e.to_string()))?;
        let label = parse_label(record.label.as_ref(), task).map_err(dataset_err)?;
        examples.push(InputExample::new(record.premise, record.hypothesis, label, record.idx));
    }
    Ok(examples)
}

fn read_split(path: &Path, task: Task) -> Result<Vec<InputExample>> {
    let content = fs::read_to_string(path)
        .map_err(|e| PromptError::Dataset(format!("failed to read {}: {e}", path.display())))?;
    parse_jsonl(&content, task, &path.display().to_string())
}

fn disk_path(dir: &Path, split: Split) -> Result<PathBuf> {
    split
        .file_names()
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            PromptError::Dataset(format!(
                "no {} file in {}",
                split.file_names().join(" or "),
                dir.display()
            ))
        })
}

fn hub_path(repo_id: &str, revision: Option<&str>, dir: Option<&str>, split: Split) -> Result<PathBuf> {
    let api = Api::new().map_err(|e| PromptError::Dataset(format!("hub client: {e}")))?;
    let repo = api.repo(Repo::with_revision(
        repo_id.to_string(),
        RepoType::Dataset,
        revision.unwrap_or("main").to_string(),
    ));
    let mut last_err = None;
    for name in split.file_names() {
        let remote = match dir {
            Some(dir) => format!("{}/{name}", dir.trim_end_matches('/')),
            None => (*name).to_string(),
        };
        match repo.get(&remote) {
            Ok(path) => return Ok(path),
            Err(e) => last_err = Some(format!("{repo_id}/{remote}: {e}")),
        }
    }
    Err(PromptError::Dataset(format!(
        "failed to fetch {split:?} split: {}",
        last_err.unwrap_or_default()
    )))
}

/// Load the train, validation and test splits.
///
/// # Errors
/// Returns a `Dataset` error if a split is missing or malformed.
pub fn load_dataset(config: &DatasetConfig) -> Result<DatasetSplits> {
    config.validate()?;
    let mut splits = DatasetSplits::default();
    for split in Split::ALL {
        let path = match &config.source {
            DatasetSource::Disk { dir } => disk_path(dir, split)?,
            DatasetSource::Hub {
                repo_id,
                revision,
                dir,
            } => hub_path(repo_id, revision.as_deref(), dir.as_deref(), split)?,
        };
        let examples = read_split(&path, config.task)?;
        info!(?split, count = examples.len(), path = %path.display(), "loaded split");
        match split {
            Split::Train => splits.train = examples,
            Split::Validation => splits.validation = examples,
            Split::Test => splits.test = examples,
        }
    }
    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TRAIN: &str = r#"{"premise": "It was raining.", "hypothesis": "The street was wet.", "label": "entailment", "idx": 0}
{"premise": "He left early.", "hypothesis": "He stayed late.", "label": "contradiction", "idx": 1}

{"premise": "She might come.", "hypothesis": "She will come.", "label": 2, "idx": 2}
"#;

    #[test]
    fn test_parse_labels_by_name_and_index() -> anyhow::Result<()> {
        let examples = parse_jsonl(TRAIN, Task::Cb, "train.jsonl")?;
        assert_eq!(examples.len(), 3);
        assert_eq!(
            examples.iter().map(|e| e.label).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(examples[0].text_a, "It was raining.");
        assert_eq!(examples[0].text_b, "The street was wet.");
        assert_eq!(examples[2].guid, 2);
        Ok(())
    }

    #[test]
    fn test_missing_label_is_unlabeled() -> anyhow::Result<()> {
        let line = r#"{"premise": "a", "hypothesis": "b", "idx": 5}"#;
        let examples = parse_jsonl(line, Task::Cb, "test.jsonl")?;
        assert_eq!(examples[0].label, NO_LABEL);
        Ok(())
    }

    #[test]
    fn test_unknown_label_name_rejected() {
        let line = r#"{"premise": "a", "hypothesis": "b", "idx": 0, "label": "not_entailment"}"#;
        assert!(matches!(
            parse_jsonl(line, Task::Cb, "x"),
            Err(PromptError::Dataset(_))
        ));
    }

    #[test]
    fn test_errors_name_file_and_line() {
        let content = "{\"premise\": \"a\", \"hypothesis\": \"b\", \"idx\": 0}\n{\"premise\": \"a\"}";
        match parse_jsonl(content, Task::Cb, "val.jsonl") {
            Err(PromptError::Dataset(msg)) => assert!(msg.starts_with("val.jsonl:2:"), "{msg}"),
            other => panic!("expected dataset error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_disk() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("train.jsonl"), TRAIN)?;
        fs::write(dir.path().join("validation.jsonl"), TRAIN)?;
        fs::write(
            dir.path().join("test.jsonl"),
            r#"{"premise": "a", "hypothesis": "b", "idx": 0, "label": -1}"#,
        )?;

        let config = DatasetConfig {
            task: Task::Cb,
            source: DatasetSource::Disk {
                dir: dir.path().to_path_buf(),
            },
        };
        let splits = load_dataset(&config)?;
        assert_eq!(splits.get(Split::Train).len(), 3);
        assert_eq!(splits.validation.len(), 3);
        assert_eq!(splits.test[0].label, NO_LABEL);
        Ok(())
    }

    #[test]
    fn test_missing_split_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("train.jsonl"), TRAIN)?;
        let config = DatasetConfig {
            task: Task::Cb,
            source: DatasetSource::Disk {
                dir: dir.path().to_path_buf(),
            },
        };
        assert!(matches!(load_dataset(&config), Err(PromptError::Dataset(_))));
        Ok(())
    }
}
