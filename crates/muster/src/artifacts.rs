//! Worker-side artifact store.
//!
//! Completed runs live under `<root>/<model>/` as `<model>.pth`
//! (weights), `<model>.json` (structured report) and `<model>.txt`
//! (raw run log). The inventory advertised to the coordinator is the
//! set of subdirectory names.

use std::path::{Path, PathBuf};

use crate::job::ModelArtifact;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("report not found: {}", .path.display())]
    ReportMissing { path: PathBuf },

    #[error("malformed report {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("i/o error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("training report for '{model}' is missing field '{field}'")]
    MissingField { model: String, field: &'static str },
}

/// Inputs for an inference run, resolved from a model's training report.
#[derive(Debug, Clone)]
pub struct InferenceInputs {
    pub model_path: PathBuf,
    pub base_model: String,
    pub class_names_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self, model: &str) -> PathBuf {
        self.root.join(model)
    }

    pub fn artifact(&self, model: &str) -> ModelArtifact {
        let dir = self.model_dir(model);
        ModelArtifact {
            model: model.to_string(),
            weights: dir.join(format!("{model}.pth")),
            report: dir.join(format!("{model}.json")),
            log: dir.join(format!("{model}.txt")),
            dir,
        }
    }

    /// Current inventory: names of subdirectories under the root.
    /// A missing root means no models yet, not an error.
    pub async fn list_models(&self) -> Vec<String> {
        let mut models = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return models,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir && let Ok(name) = entry.file_name().into_string() {
                models.push(name);
            }
        }
        models.sort();
        models
    }

    /// Load the training report for `model`.
    pub async fn load_report(&self, model: &str) -> Result<serde_json::Value, ArtifactError> {
        load_json(&self.artifact(model).report).await
    }

    /// Resolve the inputs an inference run needs from the training
    /// report: the saved weights, the architecture it was trained with,
    /// and the class-names file next to the training data.
    pub async fn inference_inputs(&self, model: &str) -> Result<InferenceInputs, ArtifactError> {
        let report = self.load_report(model).await?;

        let model_path = report
            .get("model_save_path")
            .and_then(serde_json::Value::as_str)
            .ok_or(ArtifactError::MissingField {
                model: model.to_string(),
                field: "model_save_path",
            })?;
        let base_model = report
            .pointer("/arguments/base_model")
            .and_then(serde_json::Value::as_str)
            .ok_or(ArtifactError::MissingField {
                model: model.to_string(),
                field: "arguments.base_model",
            })?;
        let data_dir = report
            .pointer("/arguments/data_dir")
            .and_then(serde_json::Value::as_str)
            .ok_or(ArtifactError::MissingField {
                model: model.to_string(),
                field: "arguments.data_dir",
            })?;

        Ok(InferenceInputs {
            model_path: PathBuf::from(model_path),
            base_model: base_model.to_string(),
            class_names_path: Path::new(data_dir).join("classes.txt"),
        })
    }
}

/// Read and parse a JSON file, mapping a missing file to
/// `ReportMissing` - the supervisor's signal that a job engine run
/// failed, independent of its exit code.
pub async fn load_json(path: &Path) -> Result<serde_json::Value, ArtifactError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArtifactError::ReportMissing {
                path: path.to_path_buf(),
            });
        }
        Err(err) => {
            return Err(ArtifactError::Io {
                path: path.to_path_buf(),
                source: err,
            });
        }
    };
    serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_root_lists_no_models() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("models"));
        assert!(store.list_models().await.is_empty());
    }

    #[tokio::test]
    async fn lists_model_directories_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("models");
        std::fs::create_dir_all(root.join("dogs")).unwrap();
        std::fs::create_dir_all(root.join("cats")).unwrap();
        std::fs::write(root.join("stray.txt"), b"not a model").unwrap();

        let store = ArtifactStore::new(&root);
        assert_eq!(
            store.list_models().await,
            vec!["cats".to_string(), "dogs".to_string()]
        );
    }

    #[tokio::test]
    async fn artifact_paths_follow_the_layout() {
        let store = ArtifactStore::new("models");
        let artifact = store.artifact("cats");
        assert_eq!(artifact.weights, PathBuf::from("models/cats/cats.pth"));
        assert_eq!(artifact.report, PathBuf::from("models/cats/cats.json"));
        assert_eq!(artifact.log, PathBuf::from("models/cats/cats.txt"));
    }

    #[tokio::test]
    async fn missing_report_is_distinguished_from_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let err = store.load_report("cats").await.unwrap_err();
        assert!(matches!(err, ArtifactError::ReportMissing { .. }));

        std::fs::create_dir_all(store.model_dir("cats")).unwrap();
        std::fs::write(store.artifact("cats").report, b"{ nope").unwrap();
        let err = store.load_report("cats").await.unwrap_err();
        assert!(matches!(err, ArtifactError::Malformed { .. }));
    }

    #[tokio::test]
    async fn inference_inputs_come_from_the_training_report() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        std::fs::create_dir_all(store.model_dir("cats")).unwrap();
        let report = json!({
            "timestamp": "2025-01-01T00:00:00Z",
            "arguments": { "base_model": "resnet", "data_dir": "./images" },
            "results": [],
            "model_save_path": "/abs/models/cats/cats.pth"
        });
        std::fs::write(
            store.artifact("cats").report,
            serde_json::to_vec(&report).unwrap(),
        )
        .unwrap();

        let inputs = store.inference_inputs("cats").await.unwrap();
        assert_eq!(inputs.model_path, PathBuf::from("/abs/models/cats/cats.pth"));
        assert_eq!(inputs.base_model, "resnet");
        assert_eq!(inputs.class_names_path, PathBuf::from("./images/classes.txt"));
    }

    #[tokio::test]
    async fn incomplete_report_names_the_missing_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        std::fs::create_dir_all(store.model_dir("cats")).unwrap();
        std::fs::write(store.artifact("cats").report, b"{\"results\":[]}").unwrap();

        let err = store.inference_inputs("cats").await.unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::MissingField { field: "model_save_path", .. }
        ));
    }
}
