//! Request dispatcher: one inbound frame in, one response out.
//!
//! Every post-handshake request is answered with a single
//! `SV_COMMON_RESPONSE`. Events synthesized as a consequence of a request
//! are enqueued after its response on the same write queue, which is what
//! gives the per-session ordering guarantee.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result, Status};
use crate::protocol::{ClientMessage, CommonResponse, ResourceOp, ServerMessage};
use crate::server::handle::TransferredHandle;
use crate::server::service::SessionInfo;
use crate::server::Shared;
use crate::transport::endpoint::{InboundFrame, OutboundFrame, WriterHandle};
use crate::types::{EventKind, OpenFlags, ResourceId, ResourceState, WatcherId};

/// Per-session dispatch state, owned by the session task.
pub(crate) struct SessionCtx {
    pub shared: Arc<Shared>,
    pub info: SessionInfo,
    pub writer: WriterHandle,
    /// Watchers this session owns, for watcher-id resolution and teardown.
    pub watchers: HashMap<WatcherId, ResourceId>,
}

/// Handle one inbound frame. An error tears the session down.
pub(crate) async fn handle_frame(ctx: &mut SessionCtx, frame: InboundFrame) -> Result<()> {
    if frame.fd.is_some() {
        // Clients have no business sending descriptors; drop it, keep going.
        tracing::warn!("session {}: discarding unexpected descriptor", ctx.info.id);
    }
    let msg = ClientMessage::decode(frame.raw_type, &frame.body)?;
    match msg {
        ClientMessage::Handshake { .. } => {
            Err(Error::Protocol("second handshake on a running session".into()))
        }
        ClientMessage::Resource { op, flags, id } => resource_request(ctx, op, flags, id).await,
        ClientMessage::WatcherOpen { watcher_id, flags } => {
            watcher_open(ctx, watcher_id, flags).await
        }
        ClientMessage::CloseWatcher { watcher_id } => close_watcher(ctx, watcher_id).await,
    }
}

/// The five resource requests share one flow: watch first, then open
/// and/or stat, respond, then any synthesized event.
async fn resource_request(
    ctx: &mut SessionCtx,
    op: ResourceOp,
    flags: OpenFlags,
    id: ResourceId,
) -> Result<()> {
    let mut resp = CommonResponse::with_status(Status::Success);
    let mut transfer = None;

    let registered = if op.registers_watcher() {
        match ctx.shared.alloc_watcher_id() {
            Some(watcher_id) => {
                ctx.shared.registry.add(&id, ctx.info.id, watcher_id);
                ctx.watchers.insert(watcher_id, id.clone());
                ctx.shared.registry.notify_edges(&*ctx.shared.service);
                resp.watcher_id = watcher_id;
                Some(watcher_id)
            }
            None => {
                // Watcher id space exhausted; fail loudly instead of reusing.
                tracing::error!("watcher id generator wrapped");
                return respond(ctx, CommonResponse::with_status(Status::ServerErr), None).await;
            }
        }
    } else {
        None
    };

    if matches!(op, ResourceOp::Open | ResourceOp::OpenWatch) {
        transfer = do_open(ctx, &id, flags, &mut resp);
    }

    if matches!(op, ResourceOp::Stat | ResourceOp::StatWatch) {
        match ctx.shared.service.stat(&ctx.info, &id) {
            Ok(stat) => resp.stat = stat,
            Err(status) => resp.status = sanitize(status),
        }
    }

    // Immediate READY: plain watch probes; open-watch only when the open
    // failed (a successful open already proves readiness); stat-watch never
    // (the response itself carries the state).
    let ready_event = registered.filter(|_| match op {
        ResourceOp::Watch => probe_ready(ctx, &id),
        ResourceOp::OpenWatch => transfer.is_none() && probe_ready(ctx, &id),
        _ => false,
    });

    respond(ctx, resp, transfer).await?;

    if let Some(watcher_id) = ready_event {
        let frame = ServerMessage::Event {
            watcher_id,
            kind: EventKind::Ready,
        }
        .encode();
        ctx.writer.send(OutboundFrame::new(frame)).await?;
    }
    Ok(())
}

/// Open the resource a previously created watcher points at.
async fn watcher_open(ctx: &mut SessionCtx, watcher_id: WatcherId, flags: OpenFlags) -> Result<()> {
    let id = ctx
        .watchers
        .get(&watcher_id)
        .cloned()
        .ok_or_else(|| Error::Protocol(format!("watcher-open for unknown watcher {watcher_id}")))?;

    let mut resp = CommonResponse::with_status(Status::Success);
    let transfer = do_open(ctx, &id, flags, &mut resp);
    respond(ctx, resp, transfer).await
}

/// Destroy one of this session's watchers. Unknown ids are a protocol
/// error, not a no-op.
async fn close_watcher(ctx: &mut SessionCtx, watcher_id: WatcherId) -> Result<()> {
    let id = ctx
        .watchers
        .remove(&watcher_id)
        .ok_or_else(|| Error::Protocol(format!("close for unknown watcher {watcher_id}")))?;

    ctx.shared.registry.remove(&id, ctx.info.id, watcher_id);
    ctx.shared.registry.notify_edges(&*ctx.shared.service);
    respond(ctx, CommonResponse::with_status(Status::Success), None).await
}

/// Run the open callback and normalize its result into the response.
fn do_open(
    ctx: &SessionCtx,
    id: &ResourceId,
    flags: OpenFlags,
    resp: &mut CommonResponse,
) -> Option<TransferredHandle> {
    if !resp.status.is_success() {
        return None;
    }
    match ctx.shared.service.open(&ctx.info, id, flags) {
        Ok(source) => match TransferredHandle::prepare(source, flags) {
            Ok(handle) => {
                resp.open_flags = flags;
                resp.handle = handle.wire_value();
                return Some(handle);
            }
            Err(status) => resp.status = status,
        },
        Err(status) => resp.status = sanitize(status),
    }
    None
}

fn probe_ready(ctx: &SessionCtx, id: &ResourceId) -> bool {
    ctx.shared
        .service
        .stat(&ctx.info, id)
        .map(|stat| stat.state == ResourceState::Ready)
        .unwrap_or(false)
}

/// A callback signalling failure with `Success` is its own kind of bug.
fn sanitize(status: Status) -> Status {
    if status.is_success() {
        Status::ServerImpl
    } else {
        status
    }
}

async fn respond(
    ctx: &SessionCtx,
    resp: CommonResponse,
    transfer: Option<TransferredHandle>,
) -> Result<()> {
    let frame = ServerMessage::CommonResponse(resp).encode();
    let outbound = match transfer {
        Some(handle) => OutboundFrame::with_fd(frame, handle.into_fd()),
        None => OutboundFrame::new(frame),
    };
    ctx.writer.send(outbound).await
}
