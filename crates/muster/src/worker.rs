//! Worker agent: the node side of the coordinator connection.
//!
//! Connects, registers with CONNECT + NODE_INFO, then dispatches
//! coordinator messages: training and inference jobs go to the job
//! supervisor on their own tasks, artifact requests are served from
//! the store. All outbound traffic funnels through one writer task so
//! concurrent producers never interleave frames.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactStore;
use crate::bridge::codec::{FrameError, JsonLinesCodec};
use crate::bridge::protocol::{CoordMessage, NodeMessage};
use crate::job::TrainingSpec;
use crate::supervisor::{CommandSpawner, JobSupervisor};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub coordinator_host: String,
    pub coordinator_port: u16,
    pub name: String,
    pub models_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Command prefix for the training engine, e.g. ["python3", "train.py"].
    pub train_engine: Vec<String>,
    /// Command prefix for the inference engine.
    pub infer_engine: Vec<String>,
    pub ping_interval: Duration,
}

impl WorkerConfig {
    pub fn new(
        coordinator_host: impl Into<String>,
        coordinator_port: u16,
        name: impl Into<String>,
    ) -> Self {
        Self {
            coordinator_host: coordinator_host.into(),
            coordinator_port,
            name: name.into(),
            models_dir: PathBuf::from("models"),
            data_dir: PathBuf::from("images"),
            train_engine: vec!["python3".to_string(), "train.py".to_string()],
            infer_engine: vec!["python3".to_string(), "inference.py".to_string()],
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to connect to coordinator: {0}")]
    Connect(#[source] std::io::Error),

    #[error("coordinator closed the connection during handshake")]
    HandshakeClosed,

    #[error("timed out waiting for registration ack")]
    HandshakeTimeout,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Run the worker until the connection drops or `shutdown` fires.
/// Shutdown sends DISCONNECT and waits briefly for the ack.
pub async fn run_worker(config: WorkerConfig, shutdown: CancellationToken) -> Result<(), WorkerError> {
    let stream = TcpStream::connect((config.coordinator_host.as_str(), config.coordinator_port))
        .await
        .map_err(WorkerError::Connect)?;
    tracing::info!(
        coordinator = %format!("{}:{}", config.coordinator_host, config.coordinator_port),
        name = %config.name,
        "connected to coordinator"
    );

    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, JsonLinesCodec::<CoordMessage>::new());
    let mut sink = FramedWrite::new(write_half, JsonLinesCodec::<NodeMessage>::new());

    let store = ArtifactStore::new(config.models_dir.clone());

    // Register, then declare the current inventory.
    sink.send(NodeMessage::Connect {
        name: config.name.clone(),
    })
    .await?;
    sink.send(NodeMessage::NodeInfo {
        name: config.name.clone(),
        models: store.list_models().await,
    })
    .await?;
    wait_for_ack(&mut frames).await?;
    tracing::info!(name = %config.name, "registered with coordinator");

    // Single writer task; every producer goes through the channel.
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<NodeMessage>();
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(err) = sink.send(message).await {
                tracing::warn!(error = %err, "outbound write failed, stopping writer");
                break;
            }
        }
    });

    let spawner = Arc::new(CommandSpawner::new(
        config.train_engine.clone(),
        config.infer_engine.clone(),
    ));
    let supervisor = Arc::new(JobSupervisor::new(
        config.name.clone(),
        store.clone(),
        config.data_dir.clone(),
        spawner,
        outbound.clone(),
    ));

    spawn_keepalive(config.name.clone(), config.ping_interval, outbound.clone());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(name = %config.name, "shutting down, notifying coordinator");
                let _ = outbound.send(NodeMessage::Disconnect {
                    name: config.name.clone(),
                });
                let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
                    while let Some(frame) = frames.next().await {
                        if matches!(frame, Ok(CoordMessage::Ack)) {
                            tracing::info!("disconnected successfully");
                            break;
                        }
                    }
                })
                .await;
                break;
            }

            frame = frames.next() => match frame {
                Some(Ok(CoordMessage::Train {
                    model_name,
                    model_type,
                    epochs,
                    batch_size,
                    learning_rate,
                    key,
                })) => {
                    let spec = TrainingSpec {
                        model_name,
                        model_type,
                        epochs,
                        batch_size,
                        learning_rate,
                    };
                    // Liveness feedback before the engine produces anything.
                    let _ = outbound.send(NodeMessage::TrainStarted {
                        name: config.name.clone(),
                        job: spec.model_name.clone(),
                    });
                    let supervisor = Arc::clone(&supervisor);
                    tokio::spawn(async move {
                        supervisor.run_training(spec, key).await;
                    });
                }
                Some(Ok(CoordMessage::InferenceRequest {
                    image_path,
                    model_name,
                    key,
                })) => {
                    let supervisor = Arc::clone(&supervisor);
                    tokio::spawn(async move {
                        supervisor.run_inference(image_path, model_name, key).await;
                    });
                }
                Some(Ok(CoordMessage::GetArtifact { artifact, key })) => {
                    let store = store.clone();
                    let outbound = outbound.clone();
                    let name = config.name.clone();
                    tokio::spawn(async move {
                        let message = match store.load_report(&artifact).await {
                            Ok(data) => NodeMessage::ArtifactResponse { name, key, data },
                            Err(err) => NodeMessage::Error {
                                name,
                                key: Some(key),
                                message: err.to_string(),
                            },
                        };
                        let _ = outbound.send(message);
                    });
                }
                Some(Ok(CoordMessage::Pong)) => {
                    tracing::trace!("pong");
                }
                Some(Ok(CoordMessage::Ack)) => {
                    tracing::trace!("stray ack");
                }
                Some(Ok(CoordMessage::Error { key, message })) => {
                    tracing::warn!(key = %key, %message, "coordinator reported an error");
                }
                Some(Err(err)) => {
                    tracing::error!(error = %err, "connection to coordinator lost");
                    break;
                }
                None => {
                    tracing::warn!("coordinator closed the connection");
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn wait_for_ack(
    frames: &mut FramedRead<OwnedReadHalf, JsonLinesCodec<CoordMessage>>,
) -> Result<(), WorkerError> {
    let handshake = async {
        loop {
            match frames.next().await {
                Some(Ok(CoordMessage::Ack)) => return Ok(()),
                Some(Ok(other)) => {
                    tracing::warn!(message = ?other, "unexpected message before ack");
                }
                Some(Err(err)) => return Err(WorkerError::Frame(err)),
                None => return Err(WorkerError::HandshakeClosed),
            }
        }
    };

    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
        .await
        .map_err(|_| WorkerError::HandshakeTimeout)?
}

fn spawn_keepalive(
    name: String,
    interval: Duration,
    outbound: mpsc::UnboundedSender<NodeMessage>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            if outbound.send(NodeMessage::Ping { name: name.clone() }).is_err() {
                break;
            }
        }
    });
}
