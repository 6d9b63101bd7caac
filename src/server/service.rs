//! The embedder capability set.
//!
//! The broker knows nothing about where resources come from; the embedding
//! application supplies that through a [`Service`] implementation, one per
//! server. Callbacks run on worker threads — any thread, concurrently for
//! distinct sessions — and must not block for long.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use crate::error::Status;
use crate::types::{OpenFlags, ResourceId, ResourceStatus, SessionId};

/// Identity of a connected client session, passed to every session-scoped
/// callback.
///
/// Embedders needing per-session state should key it by [`SessionInfo::id`];
/// ids are unique for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Server-assigned session id.
    pub id: SessionId,
    /// Peer process id from the socket credentials, when the OS reports it.
    pub pid: Option<u32>,
}

/// What the `open` callback hands back: either a path the broker opens
/// itself, or an already-open descriptor the broker takes ownership of.
#[derive(Debug)]
pub enum OpenSource {
    /// Open this path with access derived from the granted flags.
    Path(PathBuf),
    /// Transfer this descriptor as-is. Its access mode must cover the
    /// granted flags; a shortfall is a server implementation error.
    Fd(OwnedFd),
}

/// Capability set supplied by the embedding application.
///
/// `open` and `stat` are required; the rest default to accept/no-op, the
/// same shape as the original optional callback slots.
pub trait Service: Send + Sync + 'static {
    /// A client finished its handshake. Anything but [`Status::Success`]
    /// rejects the connection and `disconnect` will not be called.
    fn connect(&self, session: &SessionInfo, argv: &[String]) -> Status {
        let _ = (session, argv);
        Status::Success
    }

    /// A session ended. Called exactly once per accepted session.
    fn disconnect(&self, session: &SessionInfo) {
        let _ = session;
    }

    /// Produce the byte stream behind `id` for this client.
    fn open(
        &self,
        session: &SessionInfo,
        id: &ResourceId,
        flags: OpenFlags,
    ) -> std::result::Result<OpenSource, Status>;

    /// Report availability, size and modification time of `id`.
    fn stat(
        &self,
        session: &SessionInfo,
        id: &ResourceId,
    ) -> std::result::Result<ResourceStatus, Status>;

    /// First watcher appeared on `id`.
    fn watch(&self, id: &ResourceId) -> Status {
        let _ = id;
        Status::Success
    }

    /// Last watcher left `id`.
    fn unwatch(&self, id: &ResourceId) -> Status {
        let _ = id;
        Status::Success
    }
}
