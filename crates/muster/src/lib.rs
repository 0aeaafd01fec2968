//! muster: coordination layer for a small fleet of ML worker nodes.
//!
//! The coordinator (`musterd`) tracks connected workers, relays
//! training/inference jobs to them, and bridges synchronous front-end
//! callers to the asynchronous completions workers report back. Each
//! worker (`muster-node`) holds one persistent connection, executes
//! jobs as job engine child processes, and advertises the model
//! artifacts it holds.

pub mod artifacts;
pub mod bridge;
pub mod dispatcher;
pub mod forwarder;
pub mod job;
pub mod pending;
pub mod registry;
pub mod service;
pub mod supervisor;
pub mod tail;
pub mod transport;
pub mod worker;

pub use artifacts::{ArtifactError, ArtifactStore, InferenceInputs};
pub use bridge::codec::{FrameError, JsonLinesCodec};
pub use bridge::protocol::{CoordMessage, JobKey, NodeMessage};
pub use forwarder::{ForwardError, JobForwarder};
pub use job::{JobDescriptor, JobPhase, JobRun, ModelArtifact, TrainingSpec};
pub use pending::{PendingRequests, PendingTicket, WaitError};
pub use registry::{NodeRegistry, NodeSession, SessionState};
pub use service::{
    CoordinatorService, NodeSummary, ServiceTimeouts, SubmitError, TrainOutcome,
};
pub use supervisor::{
    CommandSpawner, EngineInvocation, EngineSpawner, JobSupervisor, SpawnError, SupervisorError,
};
pub use tail::{LOG_CACHE_LINES, LogCache, spawn_tailer};
pub use tokio_util::sync::CancellationToken;
pub use worker::{WorkerConfig, WorkerError, run_worker};
