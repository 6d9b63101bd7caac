//! One session per accepted connection.
//!
//! A session is single-tasked: it owns the reading half of its endpoint
//! and drives the handshake, then the request loop. State machine:
//! `AwaitingHandshake -> Running -> Closing`. Closing unregisters the
//! session's watchers (firing `unwatch` for ids that emptied) and invokes
//! the `disconnect` callback exactly once — only if `connect` accepted.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::UnixStream;
use tokio::sync::watch;

use crate::error::{Error, Status};
use crate::protocol::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
use crate::server::dispatch::{self, SessionCtx};
use crate::server::service::SessionInfo;
use crate::server::Shared;
use crate::transport::endpoint::{self, OutboundFrame};

/// Why a running session ended.
enum SessionEnd {
    /// Peer closed its side on a frame boundary.
    Disconnected,
    /// Server is shutting down.
    Shutdown,
    /// Protocol violation or transport failure.
    Failed(Error),
}

/// Drive one connection from handshake to teardown.
pub(crate) async fn run(stream: UnixStream, shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    // AwaitingHandshake
    let pid = stream
        .peer_cred()
        .ok()
        .and_then(|cred| cred.pid())
        .map(|pid| pid as u32);
    let (mut reader, writer, _writer_task) = endpoint::split(stream);

    let first = tokio::select! {
        _ = stop.changed() => return,
        frame = reader.recv() => frame,
    };
    let (version, wire_pid, argv) = match first {
        Ok(Some(frame)) => match ClientMessage::decode(frame.raw_type, &frame.body) {
            Ok(ClientMessage::Handshake { version, pid, argv }) => (version, pid, argv),
            Ok(other) => {
                tracing::warn!("first frame is not a handshake: {:?}", other);
                return;
            }
            Err(e) => {
                tracing::warn!("handshake decode failed: {}", e);
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            tracing::debug!("connection lost before handshake: {}", e);
            return;
        }
    };

    if version != PROTOCOL_VERSION {
        tracing::warn!(
            "rejecting client with protocol version 0x{:08x} (want 0x{:08x})",
            version,
            PROTOCOL_VERSION
        );
        send_ack(&writer, Status::NotSupported).await;
        return;
    }

    let session_id = shared.alloc_session_id();
    let info = SessionInfo {
        id: session_id,
        // Socket credentials outrank the self-reported pid.
        pid: pid.or(Some(wire_pid)).filter(|&p| p != 0),
    };
    if let (Some(cred), wire) = (pid, wire_pid) {
        if wire != 0 && cred != wire {
            tracing::warn!(
                "session {}: handshake pid {} disagrees with socket credentials {}",
                session_id,
                wire,
                cred
            );
        }
    }

    let status = shared.service.connect(&info, &argv);
    if !status.is_success() {
        tracing::debug!("session {} refused by connect callback: {:?}", session_id, status);
        send_ack(&writer, status).await;
        return;
    }

    shared.insert_session(session_id, writer.clone());
    if writer
        .send(OutboundFrame::new(
            ServerMessage::HandshakeAck {
                status: Status::Success,
            }
            .encode(),
        ))
        .await
        .is_err()
    {
        close_session(&shared, &info);
        return;
    }

    // Running
    tracing::debug!("session {} running (peer pid {:?})", session_id, info.pid);
    let mut ctx = SessionCtx {
        shared: shared.clone(),
        info,
        writer,
        watchers: HashMap::new(),
    };

    let end = loop {
        let frame = tokio::select! {
            _ = stop.changed() => break SessionEnd::Shutdown,
            frame = reader.recv() => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if let Err(e) = dispatch::handle_frame(&mut ctx, frame).await {
                    break SessionEnd::Failed(e);
                }
            }
            Ok(None) => break SessionEnd::Disconnected,
            Err(e) => break SessionEnd::Failed(e),
        }
    };

    // Closing
    match end {
        SessionEnd::Disconnected => {
            tracing::debug!("session {} disconnected", session_id);
        }
        SessionEnd::Shutdown => {
            tracing::debug!("session {} closing for shutdown", session_id);
        }
        SessionEnd::Failed(e) => {
            tracing::warn!("session {} torn down: {}", session_id, e);
        }
    }
    close_session(&shared, &ctx.info);
}

/// Unregister the session everywhere, then run the disconnect callback.
///
/// Watchers leave the registry before `disconnect` so no broadcast started
/// afterwards can observe the dead session.
fn close_session(shared: &Arc<Shared>, info: &SessionInfo) {
    shared.remove_session(info.id);
    shared.registry.remove_session(info.id);
    shared.registry.notify_edges(&*shared.service);
    shared.service.disconnect(info);
}

async fn send_ack(writer: &endpoint::WriterHandle, status: Status) {
    let frame = ServerMessage::HandshakeAck { status }.encode();
    // The writer task flushes queued frames before the socket drops.
    let _ = writer.send(OutboundFrame::new(frame)).await;
}
