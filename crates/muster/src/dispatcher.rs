//! Coordinator-side protocol dispatcher.
//!
//! One task per accepted connection. The handshake waits for CONNECT,
//! registers the session and replies ACK; the receive loop then routes
//! every decoded message to the registry, the correlation bridge, or a
//! direct reply. Malformed frames are logged and skipped; only a
//! stream failure or EOF ends the loop, unregistering the session.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{CoordMessage, NodeMessage};
use crate::pending::PendingRequests;
use crate::registry::{NodeRegistry, NodeSession};

/// Accept worker connections forever, spawning a handler per stream.
pub async fn run_listener(
    listener: TcpListener,
    registry: Arc<NodeRegistry>,
    pending: Arc<PendingRequests>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let registry = Arc::clone(&registry);
                let pending = Arc::clone(&pending);
                tokio::spawn(async move {
                    handle_connection(stream, peer, registry, pending).await;
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to accept worker connection");
            }
        }
    }
}

pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<NodeRegistry>,
    pending: Arc<PendingRequests>,
) {
    tracing::debug!(%peer, "worker connection accepted");

    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, JsonLinesCodec::<NodeMessage>::new());
    let mut writer = Some(write_half);

    // Handshake: nothing is registered until CONNECT arrives.
    let session = loop {
        match frames.next().await {
            Some(Ok(NodeMessage::Connect { name })) => {
                let Some(write_half) = writer.take() else {
                    return;
                };
                let (session, replaced) = registry.register(
                    &name,
                    peer.ip().to_string(),
                    peer.port(),
                    Box::new(write_half),
                );
                if replaced.is_some() {
                    tracing::info!(node = %name, %peer, "reconnect replaced a live session");
                }
                break session;
            }
            // A bare DISCONNECT over a fresh connection tears down the
            // named session without registering this one.
            Some(Ok(NodeMessage::Disconnect { name })) => {
                registry.unregister(&name);
                if let Some(write_half) = writer.take() {
                    ack_raw(write_half).await;
                }
                return;
            }
            Some(Ok(NodeMessage::NodeInfo { name, models })) => {
                registry.update_models(&name, models);
            }
            Some(Ok(other)) => {
                tracing::warn!(%peer, kind = ?other, "message before CONNECT, ignoring");
            }
            Some(Err(err)) => {
                tracing::warn!(%peer, error = %err, "stream failed before handshake");
                return;
            }
            None => {
                tracing::debug!(%peer, "connection closed before handshake");
                return;
            }
        }
    };

    if let Err(err) = session.send(CoordMessage::Ack).await {
        tracing::warn!(node = session.name(), error = %err, "failed to ack registration");
        registry.remove_session(&session);
        return;
    }

    receive_loop(&mut frames, &session, &registry, &pending).await;

    // Idempotent: a graceful DISCONNECT already removed the session,
    // and a replaced session must not tear down its replacement.
    registry.remove_session(&session);
    tracing::debug!(node = session.name(), "connection handler exiting");
}

async fn receive_loop(
    frames: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, JsonLinesCodec<NodeMessage>>,
    session: &Arc<NodeSession>,
    registry: &NodeRegistry,
    pending: &PendingRequests,
) {
    loop {
        match frames.next().await {
            Some(Ok(NodeMessage::Ping { .. })) => {
                if let Err(err) = session.send(CoordMessage::Pong).await {
                    tracing::warn!(node = session.name(), error = %err, "failed to send pong");
                    break;
                }
            }
            Some(Ok(NodeMessage::Disconnect { .. })) => {
                registry.remove_session(session);
                if let Err(err) = session.send(CoordMessage::Ack).await {
                    tracing::debug!(node = session.name(), error = %err, "failed to ack disconnect");
                }
                tracing::info!(node = session.name(), "worker disconnected gracefully");
                break;
            }
            Some(Ok(NodeMessage::NodeInfo { name, models })) => {
                registry.update_models(&name, models);
            }
            Some(Ok(NodeMessage::NewModel {
                name,
                model_name,
                models,
            })) => {
                tracing::info!(node = %name, model = %model_name, "worker added a model");
                registry.update_models(&name, models);
            }
            Some(Ok(NodeMessage::TrainStarted { name, job })) => {
                tracing::info!(node = %name, job = %job, "training accepted by worker");
            }
            Some(Ok(NodeMessage::TrainingCompleted {
                name,
                key,
                model_name,
                data,
            })) => {
                tracing::info!(node = %name, model = %model_name, key = %key, "training completed");
                registry.add_model(&name, &model_name);
                pending.fulfill(key.as_str(), data);
            }
            Some(Ok(NodeMessage::ArtifactResponse { name, key, data })) => {
                tracing::debug!(node = %name, key = %key, "artifact response received");
                pending.fulfill(key.as_str(), data);
            }
            Some(Ok(NodeMessage::Error { name, key, message })) => match key {
                Some(key) => {
                    tracing::warn!(node = %name, key = %key, %message, "worker reported a job failure");
                    pending.fulfill(key.as_str(), serde_json::json!({ "error": message }));
                }
                None => {
                    tracing::warn!(node = %name, %message, "worker reported an error with no key");
                }
            },
            Some(Ok(NodeMessage::Connect { name })) => {
                tracing::warn!(node = %name, "duplicate CONNECT on an established connection, ignoring");
            }
            Some(Err(err)) => {
                tracing::warn!(node = session.name(), error = %err, "connection lost");
                break;
            }
            None => {
                tracing::info!(node = session.name(), "worker connection closed");
                break;
            }
        }
    }
}

/// Acknowledge on a connection that never registered a session.
async fn ack_raw(write_half: OwnedWriteHalf) {
    use futures::SinkExt;
    let mut sink = FramedWrite::new(write_half, JsonLinesCodec::<CoordMessage>::new());
    if let Err(err) = sink.send(CoordMessage::Ack).await {
        tracing::debug!(error = %err, "failed to ack bare disconnect");
    }
}
