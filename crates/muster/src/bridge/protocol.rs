//! Wire protocol types for coordinator-worker communication.
//!
//! One persistent stream per worker; the worker connects and sends
//! `CONNECT` before anything else. Replies to asynchronous jobs carry a
//! correlation key so the coordinator can match them to the request
//! that caused them.

use serde::{Deserialize, Serialize};

/// Opaque correlation key binding an asynchronous reply to its request.
///
/// Job keys are freshly generated per dispatch; artifact keys are derived
/// from the worker and artifact names so independent fetches cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn training() -> Self {
        Self(format!("train_{}", uuid::Uuid::new_v4()))
    }

    pub fn inference() -> Self {
        Self(format!("infer_{}", uuid::Uuid::new_v4()))
    }

    pub fn artifact(node: &str, artifact: &str) -> Self {
        Self(format!("{node}:{artifact}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for JobKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages from worker to coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeMessage {
    /// Register a session. Must be the first message on a connection.
    Connect {
        name: String,
    },

    Ping {
        name: String,
    },

    /// Graceful session teardown.
    Disconnect {
        name: String,
    },

    /// Declare the worker's current model inventory.
    NodeInfo {
        name: String,
        models: Vec<String>,
    },

    /// Training accepted - liveness feedback, distinct from completion.
    TrainStarted {
        name: String,
        job: String,
    },

    /// Finished training run with the artifact paths and raw run log.
    TrainingCompleted {
        name: String,
        key: JobKey,
        model_name: String,
        data: serde_json::Value,
    },

    /// Inventory change after a completed run.
    NewModel {
        name: String,
        model_name: String,
        models: Vec<String>,
    },

    /// Requested artifact (or inference report) delivered.
    ArtifactResponse {
        name: String,
        key: JobKey,
        data: serde_json::Value,
    },

    /// Failure tied to a prior request when a key is present.
    Error {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<JobKey>,
        message: String,
    },
}

impl NodeMessage {
    /// Sender identity carried by every worker message.
    pub fn sender(&self) -> &str {
        match self {
            Self::Connect { name }
            | Self::Ping { name }
            | Self::Disconnect { name }
            | Self::NodeInfo { name, .. }
            | Self::TrainStarted { name, .. }
            | Self::TrainingCompleted { name, .. }
            | Self::NewModel { name, .. }
            | Self::ArtifactResponse { name, .. }
            | Self::Error { name, .. } => name,
        }
    }
}

/// Messages from coordinator to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordMessage {
    /// Confirm registration or disconnect.
    Ack,

    Pong,

    /// Request a training run.
    Train {
        model_name: String,
        model_type: String,
        epochs: u32,
        batch_size: u32,
        learning_rate: f64,
        key: JobKey,
    },

    /// Request an inference run against a trained model.
    InferenceRequest {
        image_path: String,
        model_name: String,
        key: JobKey,
    },

    /// Request a stored JSON artifact by name.
    GetArtifact {
        artifact: String,
        key: JobKey,
    },

    /// Failure tied to a prior request.
    Error {
        key: JobKey,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_serializes() {
        let msg = NodeMessage::Connect {
            name: "w1".to_string(),
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "kind": "CONNECT",
          "name": "w1"
        }
        "#);
    }

    #[test]
    fn ack_serializes() {
        insta::assert_json_snapshot!(CoordMessage::Ack, @r#"
        {
          "kind": "ACK"
        }
        "#);
    }

    #[test]
    fn train_serializes() {
        let msg = CoordMessage::Train {
            model_name: "cats".to_string(),
            model_type: "resnet".to_string(),
            epochs: 1,
            batch_size: 8,
            learning_rate: 0.001,
            key: JobKey::from("train_1"),
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "kind": "TRAIN",
          "model_name": "cats",
          "model_type": "resnet",
          "epochs": 1,
          "batch_size": 8,
          "learning_rate": 0.001,
          "key": "train_1"
        }
        "#);
    }

    #[test]
    fn error_without_key_omits_field() {
        let msg = NodeMessage::Error {
            name: "w1".to_string(),
            key: None,
            message: "boom".to_string(),
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "kind": "ERROR",
          "name": "w1",
          "message": "boom"
        }
        "#);
    }

    #[test]
    fn training_completed_roundtrips() {
        let msg = NodeMessage::TrainingCompleted {
            name: "w1".to_string(),
            key: JobKey::from("train_1"),
            model_name: "cats".to_string(),
            data: json!({"model_path": "models/cats/cats.pth"}),
        };
        let wire = serde_json::to_string(&msg).unwrap();
        assert!(wire.contains("\"kind\":\"TRAINING_COMPLETED\""));

        let parsed: NodeMessage = serde_json::from_str(&wire).unwrap();
        match parsed {
            NodeMessage::TrainingCompleted {
                name,
                key,
                model_name,
                data,
            } => {
                assert_eq!(name, "w1");
                assert_eq!(key.as_str(), "train_1");
                assert_eq!(model_name, "cats");
                assert_eq!(data["model_path"], "models/cats/cats.pth");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn kind_names_match_the_wire_contract() {
        let msg = NodeMessage::NodeInfo {
            name: "w1".to_string(),
            models: vec![],
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["kind"], "NODE_INFO");

        let msg = CoordMessage::GetArtifact {
            artifact: "cats".to_string(),
            key: JobKey::artifact("w1", "cats"),
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["kind"], "GET_ARTIFACT");
        assert_eq!(wire["key"], "w1:cats");
    }

    #[test]
    fn sender_extracts_name_from_every_variant() {
        let msg = NodeMessage::Ping {
            name: "w2".to_string(),
        };
        assert_eq!(msg.sender(), "w2");

        let msg = NodeMessage::Error {
            name: "w3".to_string(),
            key: Some(JobKey::from("infer_9")),
            message: "engine died".to_string(),
        };
        assert_eq!(msg.sender(), "w3");
    }

    #[test]
    fn unknown_kind_fails_to_decode() {
        let err = serde_json::from_str::<NodeMessage>(r#"{"kind":"BOGUS","name":"w1"}"#);
        assert!(err.is_err());
    }
}
