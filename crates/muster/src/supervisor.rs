//! Worker-side job supervisor.
//!
//! Runs one job engine child process per job, tails its log while it
//! runs, and reports the outcome back over the node connection:
//! TRAINING_COMPLETED / ARTIFACT_RESPONSE plus a NEW_MODEL inventory
//! announcement on success, or ERROR carrying the job's correlation
//! key so the coordinator's waiting caller unblocks instead of timing
//! out. The report file's presence - not the exit code - is the
//! success signal.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::bridge::protocol::{JobKey, NodeMessage};
use crate::job::{JobPhase, JobRun, TrainingSpec};
use crate::tail::{LogCache, spawn_tailer};

/// One job engine invocation, fully resolved.
#[derive(Debug, Clone)]
pub enum EngineInvocation {
    Training {
        data_dir: PathBuf,
        base_model: String,
        epochs: u32,
        batch_size: u32,
        learning_rate: f64,
        model_save_path: PathBuf,
        report_path: PathBuf,
        log_path: PathBuf,
    },
    Inference {
        image_path: PathBuf,
        model_path: PathBuf,
        base_model: String,
        class_names_path: PathBuf,
        report_path: PathBuf,
    },
}

impl EngineInvocation {
    pub fn report_path(&self) -> &PathBuf {
        match self {
            Self::Training { report_path, .. } | Self::Inference { report_path, .. } => report_path,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn job engine: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("job engine command is empty")]
    EmptyCommand,
}

/// Extension point for how the job engine is launched.
pub trait EngineSpawner: Send + Sync {
    fn spawn(&self, invocation: EngineInvocation) -> Result<Child, SpawnError>;
}

/// Spawner invoking the engine programs with the fixed argument
/// contract. Training output is redirected into the run log file.
pub struct CommandSpawner {
    train: Vec<String>,
    infer: Vec<String>,
}

impl CommandSpawner {
    pub fn new(train: Vec<String>, infer: Vec<String>) -> Self {
        Self { train, infer }
    }

    fn command(prefix: &[String]) -> Result<Command, SpawnError> {
        let (program, args) = prefix.split_first().ok_or(SpawnError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl EngineSpawner for CommandSpawner {
    fn spawn(&self, invocation: EngineInvocation) -> Result<Child, SpawnError> {
        match invocation {
            EngineInvocation::Training {
                data_dir,
                base_model,
                epochs,
                batch_size,
                learning_rate,
                model_save_path,
                report_path,
                log_path,
            } => {
                let log = std::fs::File::create(&log_path)?;
                let mut cmd = Self::command(&self.train)?;
                cmd.arg("--data-dir")
                    .arg(&data_dir)
                    .arg("--base-model")
                    .arg(&base_model)
                    .arg("--epochs")
                    .arg(epochs.to_string())
                    .arg("--batch-size")
                    .arg(batch_size.to_string())
                    .arg("--learning-rate")
                    .arg(learning_rate.to_string())
                    .arg("--model-save-path")
                    .arg(&model_save_path)
                    .arg("--report")
                    .arg(&report_path)
                    .arg("--output-file")
                    .arg(&log_path)
                    .stdin(Stdio::null())
                    .stdout(Stdio::from(log.try_clone()?))
                    .stderr(Stdio::from(log));
                Ok(cmd.spawn()?)
            }
            EngineInvocation::Inference {
                image_path,
                model_path,
                base_model,
                class_names_path,
                report_path,
            } => {
                let mut cmd = Self::command(&self.infer)?;
                cmd.arg("--image-path")
                    .arg(&image_path)
                    .arg("--model-path")
                    .arg(&model_path)
                    .arg("--base-model")
                    .arg(&base_model)
                    .arg("--class-names-path")
                    .arg(&class_names_path)
                    .arg("--report")
                    .arg(&report_path)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
                Ok(cmd.spawn()?)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct JobSupervisor {
    node: String,
    store: ArtifactStore,
    data_dir: PathBuf,
    spawner: Arc<dyn EngineSpawner>,
    logs: Arc<LogCache>,
    jobs: DashMap<String, JobRun>,
    outbound: mpsc::UnboundedSender<NodeMessage>,
}

impl JobSupervisor {
    pub fn new(
        node: impl Into<String>,
        store: ArtifactStore,
        data_dir: impl Into<PathBuf>,
        spawner: Arc<dyn EngineSpawner>,
        outbound: mpsc::UnboundedSender<NodeMessage>,
    ) -> Self {
        Self {
            node: node.into(),
            store,
            data_dir: data_dir.into(),
            spawner,
            logs: Arc::new(LogCache::new()),
            jobs: DashMap::new(),
            outbound,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Recent log lines of a job, from the bounded tail cache.
    pub fn job_log(&self, job: &str) -> Vec<String> {
        self.logs.tail(job)
    }

    /// Jobs currently running (terminal runs drop back to idle).
    pub fn active_jobs(&self) -> Vec<JobRun> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Execute a training run to completion and report the outcome.
    pub async fn run_training(&self, spec: TrainingSpec, key: JobKey) {
        let model = spec.model_name.clone();
        self.begin(&model);

        match self.train(&spec).await {
            Ok(data) => {
                self.finish(&model, JobPhase::Completed);
                self.send(NodeMessage::TrainingCompleted {
                    name: self.node.clone(),
                    key,
                    model_name: model.clone(),
                    data,
                });
                // Inventory announcement is separate from completion.
                let models = self.store.list_models().await;
                self.send(NodeMessage::NewModel {
                    name: self.node.clone(),
                    model_name: model,
                    models,
                });
            }
            Err(err) => {
                self.finish(&model, JobPhase::Failed);
                tracing::error!(model = %model, error = %err, "training job failed");
                self.send(NodeMessage::Error {
                    name: self.node.clone(),
                    key: Some(key),
                    message: err.to_string(),
                });
            }
        }
    }

    async fn train(&self, spec: &TrainingSpec) -> Result<serde_json::Value, SupervisorError> {
        let artifact = self.store.artifact(&spec.model_name);
        tokio::fs::create_dir_all(&artifact.dir).await?;
        // The log exists before both the tailer and the engine touch it.
        tokio::fs::File::create(&artifact.log).await?;

        let token = CancellationToken::new();
        let tailer = spawn_tailer(
            artifact.log.clone(),
            spec.model_name.clone(),
            Arc::clone(&self.logs),
            token.clone(),
        );

        let invocation = EngineInvocation::Training {
            data_dir: self.data_dir.clone(),
            base_model: spec.model_type.clone(),
            epochs: spec.epochs,
            batch_size: spec.batch_size,
            learning_rate: spec.learning_rate,
            model_save_path: artifact.weights.clone(),
            report_path: artifact.report.clone(),
            log_path: artifact.log.clone(),
        };

        tracing::info!(model = %spec.model_name, "launching training engine");
        let status = match self.spawner.spawn(invocation) {
            Ok(mut child) => child.wait().await?,
            Err(err) => {
                token.cancel();
                let _ = tailer.await;
                return Err(err.into());
            }
        };
        token.cancel();
        let _ = tailer.await;
        tracing::info!(model = %spec.model_name, code = ?status.code(), "training engine exited");

        // Missing report = failed run, regardless of exit code.
        self.store.load_report(&spec.model_name).await?;
        let output_contents = tokio::fs::read_to_string(&artifact.log)
            .await
            .unwrap_or_default();

        Ok(serde_json::json!({
            "model_path": artifact.weights,
            "report_path": artifact.report,
            "output_file": artifact.log,
            "output_contents": output_contents,
        }))
    }

    /// Execute an inference run to completion and report the outcome.
    pub async fn run_inference(&self, image_path: String, model_name: String, key: JobKey) {
        self.begin(key.as_str());

        match self.infer(&image_path, &model_name, &key).await {
            Ok(data) => {
                self.finish(key.as_str(), JobPhase::Completed);
                self.send(NodeMessage::ArtifactResponse {
                    name: self.node.clone(),
                    key,
                    data,
                });
            }
            Err(err) => {
                self.finish(key.as_str(), JobPhase::Failed);
                tracing::error!(model = %model_name, error = %err, "inference job failed");
                self.send(NodeMessage::Error {
                    name: self.node.clone(),
                    key: Some(key),
                    message: err.to_string(),
                });
            }
        }
    }

    async fn infer(
        &self,
        image_path: &str,
        model_name: &str,
        key: &JobKey,
    ) -> Result<serde_json::Value, SupervisorError> {
        let inputs = self.store.inference_inputs(model_name).await?;
        let report_path = self.store.model_dir(model_name).join(format!("{key}.json"));

        let invocation = EngineInvocation::Inference {
            image_path: PathBuf::from(image_path),
            model_path: inputs.model_path,
            base_model: inputs.base_model,
            class_names_path: inputs.class_names_path,
            report_path: report_path.clone(),
        };

        tracing::info!(model = %model_name, image = %image_path, "launching inference engine");
        let mut child = self.spawner.spawn(invocation)?;
        let status = child.wait().await?;
        tracing::info!(model = %model_name, code = ?status.code(), "inference engine exited");

        Ok(crate::artifacts::load_json(&report_path).await?)
    }

    fn begin(&self, job: &str) {
        tracing::info!(job, "job idle -> running");
        self.jobs.insert(job.to_string(), JobRun::running(job));
    }

    fn finish(&self, job: &str, phase: JobPhase) {
        if let Some(mut run) = self.jobs.get_mut(job) {
            run.finish(phase);
        }
        tracing::info!(job, phase = phase.as_str(), "job running -> terminal -> idle");
        self.jobs.remove(job);
    }

    fn send(&self, message: NodeMessage) {
        if self.outbound.send(message).is_err() {
            tracing::warn!("coordinator connection closed, dropping outbound message");
        }
    }
}
