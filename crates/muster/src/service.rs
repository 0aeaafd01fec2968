//! CoordinatorService: transport-agnostic front-end facade.
//!
//! Owns the registry, the correlation bridge, and the forwarder, and
//! exposes the few request/response contracts the front-end needs.
//! Submitting a job is the only intentional blocking point: the caller
//! waits on the correlation bridge with a bounded budget, never on a
//! poll loop.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::bridge::protocol::{CoordMessage, JobKey};
use crate::forwarder::{ForwardError, JobForwarder};
use crate::job::{JobDescriptor, TrainingSpec};
use crate::pending::PendingRequests;
use crate::registry::NodeRegistry;

/// Per-operation wait budgets for correlated replies.
#[derive(Debug, Clone, Copy)]
pub struct ServiceTimeouts {
    pub train: Duration,
    pub inference: Duration,
    pub artifact: Duration,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            train: Duration::from_secs(60),
            inference: Duration::from_secs(15),
            artifact: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error("timed out waiting for the worker to reply")]
    Timeout,
}

/// Outcome of a training submission: the completion payload when it
/// arrives inside the budget, otherwise an "initiated" acknowledgment
/// (the job keeps running on the worker either way).
#[derive(Debug)]
pub enum TrainOutcome {
    Completed(serde_json::Value),
    Initiated,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub models: Vec<String>,
}

pub struct CoordinatorService {
    registry: Arc<NodeRegistry>,
    pending: Arc<PendingRequests>,
    forwarder: JobForwarder,
    timeouts: ServiceTimeouts,
}

impl CoordinatorService {
    pub fn new(registry: Arc<NodeRegistry>, pending: Arc<PendingRequests>) -> Self {
        let forwarder = JobForwarder::new(Arc::clone(&registry));
        Self {
            registry,
            pending,
            forwarder,
            timeouts: ServiceTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ServiceTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn list_nodes(&self) -> Vec<NodeSummary> {
        self.registry
            .list_all()
            .into_iter()
            .map(|(name, models)| NodeSummary { name, models })
            .collect()
    }

    /// Dispatch a training job and wait up to the training budget for
    /// its completion.
    pub async fn submit_training(
        &self,
        node: Option<String>,
        spec: TrainingSpec,
    ) -> Result<TrainOutcome, SubmitError> {
        let key = JobKey::training();
        let ticket = self.pending.create(key.as_str(), self.timeouts.train);

        let descriptor = JobDescriptor::Training(spec);
        let session = self
            .forwarder
            .forward_job(node.as_deref(), &descriptor, &key)
            .await?;
        tracing::info!(
            node = session.name(),
            model = descriptor.model_name(),
            key = %key,
            "training job dispatched"
        );

        match ticket.wait().await {
            Ok(payload) => Ok(TrainOutcome::Completed(payload)),
            Err(_) => Ok(TrainOutcome::Initiated),
        }
    }

    /// Dispatch an inference job and wait up to the inference budget.
    pub async fn submit_inference(
        &self,
        node: &str,
        image_path: &str,
        model_name: &str,
    ) -> Result<serde_json::Value, SubmitError> {
        let key = JobKey::inference();
        let ticket = self.pending.create(key.as_str(), self.timeouts.inference);

        let descriptor = JobDescriptor::Inference {
            image_path: image_path.to_string(),
            model_name: model_name.to_string(),
        };
        self.forwarder
            .forward_job(Some(node), &descriptor, &key)
            .await?;
        tracing::info!(node, model = model_name, key = %key, "inference job dispatched");

        ticket.wait().await.map_err(|_| SubmitError::Timeout)
    }

    /// Fetch a named JSON artifact from a worker.
    pub async fn fetch_artifact(
        &self,
        node: &str,
        artifact: &str,
    ) -> Result<serde_json::Value, SubmitError> {
        let key = JobKey::artifact(node, artifact);
        let ticket = self.pending.create(key.as_str(), self.timeouts.artifact);

        self.forwarder
            .forward(
                Some(node),
                CoordMessage::GetArtifact {
                    artifact: artifact.to_string(),
                    key: key.clone(),
                },
            )
            .await?;

        ticket.wait().await.map_err(|_| SubmitError::Timeout)
    }
}
