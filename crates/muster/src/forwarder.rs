//! Job forwarder - relays job descriptors to worker sessions.
//!
//! Forwarding is fire-and-forget: a successful relay only means the
//! message was written to the worker's connection. Any eventual result
//! arrives asynchronously and is matched through the correlation
//! bridge by the job's key.

use std::sync::Arc;

use crate::bridge::codec::FrameError;
use crate::bridge::protocol::{CoordMessage, JobKey};
use crate::job::JobDescriptor;
use crate::registry::{NodeRegistry, NodeSession};

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("no worker nodes are connected")]
    NoNodesAvailable,

    #[error("worker node '{0}' not found")]
    NodeNotFound(String),

    #[error("failed to send to worker '{name}': {source}")]
    Send {
        name: String,
        #[source]
        source: FrameError,
    },
}

pub struct JobForwarder {
    registry: Arc<NodeRegistry>,
}

impl JobForwarder {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve `target` to a live session: by name when given,
    /// otherwise the first-registered fallback.
    fn resolve(&self, target: Option<&str>) -> Result<Arc<NodeSession>, ForwardError> {
        match target {
            Some(name) => self
                .registry
                .find(name)
                .ok_or_else(|| ForwardError::NodeNotFound(name.to_string())),
            None => self
                .registry
                .default_session()
                .ok_or(ForwardError::NoNodesAvailable),
        }
    }

    /// Relay one message to the resolved session and return it.
    pub async fn forward(
        &self,
        target: Option<&str>,
        message: CoordMessage,
    ) -> Result<Arc<NodeSession>, ForwardError> {
        let session = self.resolve(target)?;
        session
            .send(message)
            .await
            .map_err(|source| ForwardError::Send {
                name: session.name().to_string(),
                source,
            })?;
        tracing::debug!(node = session.name(), "forwarded message to worker");
        Ok(session)
    }

    /// Relay a job descriptor under `key`.
    pub async fn forward_job(
        &self,
        target: Option<&str>,
        descriptor: &JobDescriptor,
        key: &JobKey,
    ) -> Result<Arc<NodeSession>, ForwardError> {
        let message = match descriptor {
            JobDescriptor::Training(spec) => CoordMessage::Train {
                model_name: spec.model_name.clone(),
                model_type: spec.model_type.clone(),
                epochs: spec.epochs,
                batch_size: spec.batch_size,
                learning_rate: spec.learning_rate,
                key: key.clone(),
            },
            JobDescriptor::Inference {
                image_path,
                model_name,
            } => CoordMessage::InferenceRequest {
                image_path: image_path.clone(),
                model_name: model_name.clone(),
                key: key.clone(),
            },
        };
        self.forward(target, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::JsonLinesCodec;
    use crate::job::TrainingSpec;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn descriptor() -> JobDescriptor {
        JobDescriptor::Training(TrainingSpec {
            model_name: "cats".to_string(),
            model_type: "resnet".to_string(),
            epochs: 1,
            batch_size: 8,
            learning_rate: 0.001,
        })
    }

    #[tokio::test]
    async fn empty_registry_reports_no_nodes() {
        let registry = Arc::new(NodeRegistry::new());
        let forwarder = JobForwarder::new(registry);

        let err = forwarder
            .forward_job(None, &descriptor(), &JobKey::from("train_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::NoNodesAvailable));
    }

    #[tokio::test]
    async fn named_target_must_exist() {
        let registry = Arc::new(NodeRegistry::new());
        let (_rx, tx) = tokio::io::duplex(1024);
        registry.register("w1", "127.0.0.1", 9000, Box::new(tx));
        let forwarder = JobForwarder::new(registry);

        let err = forwarder
            .forward_job(Some("w9"), &descriptor(), &JobKey::from("train_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::NodeNotFound(name) if name == "w9"));
    }

    #[tokio::test]
    async fn forwards_training_job_over_the_session() {
        let registry = Arc::new(NodeRegistry::new());
        let (rx, tx) = tokio::io::duplex(4096);
        registry.register("w1", "127.0.0.1", 9000, Box::new(tx));
        let forwarder = JobForwarder::new(registry);

        let session = forwarder
            .forward_job(Some("w1"), &descriptor(), &JobKey::from("train_1"))
            .await
            .unwrap();
        assert_eq!(session.name(), "w1");

        let mut frames = FramedRead::new(rx, JsonLinesCodec::<CoordMessage>::new());
        match frames.next().await.unwrap().unwrap() {
            CoordMessage::Train {
                model_name,
                model_type,
                epochs,
                key,
                ..
            } => {
                assert_eq!(model_name, "cats");
                assert_eq!(model_type, "resnet");
                assert_eq!(epochs, 1);
                assert_eq!(key.as_str(), "train_1");
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unnamed_target_falls_back_to_first_registered() {
        let registry = Arc::new(NodeRegistry::new());
        let (rx1, tx1) = tokio::io::duplex(4096);
        let (_rx2, tx2) = tokio::io::duplex(4096);
        registry.register("w1", "127.0.0.1", 9000, Box::new(tx1));
        registry.register("w2", "127.0.0.1", 9001, Box::new(tx2));
        let forwarder = JobForwarder::new(registry);

        let session = forwarder
            .forward_job(None, &descriptor(), &JobKey::from("train_1"))
            .await
            .unwrap();
        assert_eq!(session.name(), "w1");

        let mut frames = FramedRead::new(rx1, JsonLinesCodec::<CoordMessage>::new());
        assert!(matches!(
            frames.next().await.unwrap().unwrap(),
            CoordMessage::Train { .. }
        ));
    }
}
