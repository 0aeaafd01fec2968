//! Job descriptors and per-job run state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Parameters of a requested training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSpec {
    pub model_name: String,
    /// Base architecture selector passed through to the job engine
    /// (e.g. "mobilenet", "efficientnet", "resnet").
    pub model_type: String,
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
}

/// Immutable description of a requested unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDescriptor {
    Training(TrainingSpec),
    Inference {
        image_path: String,
        model_name: String,
    },
}

impl JobDescriptor {
    pub fn model_name(&self) -> &str {
        match self {
            Self::Training(spec) => &spec.model_name,
            Self::Inference { model_name, .. } => model_name,
        }
    }
}

/// Lifecycle of a job on a worker: Idle -> Running -> {Completed, Failed} -> Idle.
///
/// Idle is the absence of an active run; the supervisor drops the run
/// record once it reaches a terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Snapshot of one active job run.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub job: String,
    pub phase: JobPhase,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl JobRun {
    pub fn running(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            phase: JobPhase::Running,
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, phase: JobPhase) {
        self.phase = phase;
        self.finished_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// On-disk layout of a completed training run, owned by the worker that
/// produced it. Advertised to the coordinator by name only; the files
/// themselves are never transferred.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub model: String,
    pub dir: PathBuf,
    pub weights: PathBuf,
    pub report: PathBuf,
    pub log: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_terminality() {
        assert!(!JobPhase::Idle.is_terminal());
        assert!(!JobPhase::Running.is_terminal());
        assert!(JobPhase::Completed.is_terminal());
        assert!(JobPhase::Failed.is_terminal());
    }

    #[test]
    fn run_starts_running_and_finishes() {
        let mut run = JobRun::running("cats");
        assert_eq!(run.phase, JobPhase::Running);
        assert!(run.finished_at.is_none());

        run.finish(JobPhase::Completed);
        assert_eq!(run.phase, JobPhase::Completed);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn descriptor_model_name() {
        let training = JobDescriptor::Training(TrainingSpec {
            model_name: "cats".to_string(),
            model_type: "resnet".to_string(),
            epochs: 1,
            batch_size: 8,
            learning_rate: 0.001,
        });
        assert_eq!(training.model_name(), "cats");

        let inference = JobDescriptor::Inference {
            image_path: "images/cat.jpg".to_string(),
            model_name: "cats".to_string(),
        };
        assert_eq!(inference.model_name(), "cats");
    }
}
