//! Client runtime: one connection to a broker server.
//!
//! The client lifecycle:
//! 1. Connect to the rendezvous socket
//! 2. Exchange the handshake
//! 3. Spawn the reader task (responses to the pending call, events to the
//!    event queue)
//!
//! Requests are blocking round-trips by contract: an async mutex
//! serializes them, so there is at most one in flight per client. Resource
//! I/O after an open goes straight to the kernel through the transferred
//! descriptor — the broker is out of the data path.
//!
//! # Example
//!
//! ```ignore
//! use reswire::client::Client;
//! use reswire::OpenFlags;
//!
//! let client = Client::connect("assets", &["renderer"]).await?;
//! let mut res = client.open("textures/grass.png", OpenFlags::READ).await?;
//! let mut buf = [0u8; 4096];
//! let n = res.read(&mut buf)?;
//! ```

mod resource;

pub mod global;

pub use resource::Resource;

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, Result, Status};
use crate::protocol::{
    ClientMessage, CommonResponse, ResourceOp, ServerMessage, PROTOCOL_VERSION,
};
use crate::transport::endpoint::{self, EndpointReader, OutboundFrame, WriterHandle};
use crate::transport::socket;
use crate::types::{EventKind, OpenFlags, ResourceId, ResourceStatus, WatcherId};

/// A server-managed subscription on one resource identifier.
///
/// Valid iff the id is non-zero; an open-watch that failed to register
/// hands back an invalid watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watcher {
    id: WatcherId,
}

impl Watcher {
    /// The server-assigned watcher id.
    #[inline]
    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Whether this watcher was actually registered.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.id != 0
    }
}

/// An event delivered through a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// The watcher this event belongs to.
    pub watcher: WatcherId,
    /// What happened.
    pub kind: EventKind,
}

/// Combined result of [`Client::open_watch`]: the watcher is registered
/// even when the open itself failed.
#[derive(Debug)]
pub struct OpenWatch {
    pub resource: std::result::Result<Resource, Status>,
    pub watcher: Watcher,
}

/// Combined result of [`Client::stat_watch`].
#[derive(Debug)]
pub struct StatWatch {
    pub stat: std::result::Result<ResourceStatus, Status>,
    pub watcher: Watcher,
}

type Reply = (CommonResponse, Option<OwnedFd>);

/// State the reader task shares with callers.
struct ReaderShared {
    pending: Mutex<Option<oneshot::Sender<Reply>>>,
    events: Mutex<VecDeque<Event>>,
    event_notify: Notify,
    closed: AtomicBool,
}

impl ReaderShared {
    fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping an unanswered pending sender aborts the blocked call.
        self.pending.lock().take();
        self.event_notify.notify_waiters();
    }
}

struct ClientInner {
    writer: WriterHandle,
    call_lock: tokio::sync::Mutex<()>,
    shared: Arc<ReaderShared>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shared.shut();
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
    }
}

/// A connected broker client. Cheap to clone; the connection closes when
/// the last clone drops (or [`Client::close`] is called on the last one).
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to the server named `server_name` and hand it `argv`.
    ///
    /// Fails with [`Error::Unavailable`] when no server is listening,
    /// [`Error::Status`] carrying the server's verdict when the connect
    /// callback refuses or the protocol versions disagree.
    pub async fn connect(server_name: &str, argv: &[&str]) -> Result<Client> {
        if argv.iter().any(|arg| arg.as_bytes().contains(&0)) {
            return Err(Error::InvalidArgument("argv entry contains NUL"));
        }
        let stream = socket::connect(server_name).await?;
        let (mut reader, writer, _writer_task) = endpoint::split(stream);

        let handshake = ClientMessage::Handshake {
            version: PROTOCOL_VERSION,
            pid: std::process::id(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
        };
        writer.send(OutboundFrame::new(handshake.encode())).await?;

        let frame = reader.recv().await?.ok_or(Error::Broken)?;
        match ServerMessage::decode(frame.raw_type, &frame.body)? {
            ServerMessage::HandshakeAck { status } if status.is_success() => {}
            ServerMessage::HandshakeAck { status } => return Err(Error::Status(status)),
            other => {
                return Err(Error::Protocol(format!(
                    "expected handshake ack, got {other:?}"
                )))
            }
        }

        let shared = Arc::new(ReaderShared {
            pending: Mutex::new(None),
            events: Mutex::new(VecDeque::new()),
            event_notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let read_task = tokio::spawn(read_loop(reader, shared.clone()));

        Ok(Client {
            inner: Arc::new(ClientInner {
                writer,
                call_lock: tokio::sync::Mutex::new(()),
                shared,
                read_task: Mutex::new(Some(read_task)),
            }),
        })
    }

    /// Open a resource; on success I/O goes directly to the returned
    /// handle.
    pub async fn open(&self, id: &str, flags: OpenFlags) -> Result<Resource> {
        let (resp, fd) = self
            .round_trip(resource_request(ResourceOp::Open, id, flags)?)
            .await?;
        take_resource(&resp, fd).map_err(Error::Status)
    }

    /// Subscribe to a resource. If it is already available a READY event
    /// follows.
    pub async fn watch(&self, id: &str) -> Result<Watcher> {
        let (resp, _fd) = self
            .round_trip(resource_request(ResourceOp::Watch, id, OpenFlags::empty())?)
            .await?;
        if !resp.status.is_success() {
            return Err(Error::Status(resp.status));
        }
        take_watcher(&resp)
    }

    /// Open and watch in one round-trip. The watcher is registered even
    /// when the open fails; a successful open suppresses the initial READY
    /// event.
    pub async fn open_watch(&self, id: &str, flags: OpenFlags) -> Result<OpenWatch> {
        let (resp, fd) = self
            .round_trip(resource_request(ResourceOp::OpenWatch, id, flags)?)
            .await?;
        Ok(OpenWatch {
            resource: take_resource(&resp, fd),
            watcher: Watcher {
                id: resp.watcher_id,
            },
        })
    }

    /// Query availability, size, and modification time.
    pub async fn stat(&self, id: &str) -> Result<ResourceStatus> {
        let (resp, _fd) = self
            .round_trip(resource_request(ResourceOp::Stat, id, OpenFlags::empty())?)
            .await?;
        if !resp.status.is_success() {
            return Err(Error::Status(resp.status));
        }
        Ok(resp.stat)
    }

    /// Stat and watch in one round-trip.
    pub async fn stat_watch(&self, id: &str) -> Result<StatWatch> {
        let (resp, _fd) = self
            .round_trip(resource_request(
                ResourceOp::StatWatch,
                id,
                OpenFlags::empty(),
            )?)
            .await?;
        let stat = if resp.status.is_success() {
            Ok(resp.stat)
        } else {
            Err(resp.status)
        };
        Ok(StatWatch {
            stat,
            watcher: Watcher {
                id: resp.watcher_id,
            },
        })
    }

    /// Open the resource an existing watcher points at.
    pub async fn watcher_open(&self, watcher: &Watcher, flags: OpenFlags) -> Result<Resource> {
        if !watcher.is_valid() {
            return Err(Error::InvalidArgument("watcher is not valid"));
        }
        let (resp, fd) = self
            .round_trip(ClientMessage::WatcherOpen {
                watcher_id: watcher.id,
                flags,
            })
            .await?;
        take_resource(&resp, fd).map_err(Error::Status)
    }

    /// Destroy a watcher. Events still queued for it are discarded by the
    /// caller simply ignoring them.
    pub async fn close_watcher(&self, watcher: Watcher) -> Result<()> {
        if !watcher.is_valid() {
            return Err(Error::InvalidArgument("watcher is not valid"));
        }
        let (resp, _fd) = self
            .round_trip(ClientMessage::CloseWatcher {
                watcher_id: watcher.id,
            })
            .await?;
        if !resp.status.is_success() {
            return Err(Error::Status(resp.status));
        }
        Ok(())
    }

    /// Dequeue the next event without blocking. `Ok(None)` means no event
    /// right now; [`Error::Broken`] means the connection is gone.
    pub fn poll_event(&self) -> Result<Option<Event>> {
        if let Some(event) = self.inner.shared.events.lock().pop_front() {
            return Ok(Some(event));
        }
        if self.inner.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Broken);
        }
        Ok(None)
    }

    /// Wait for the next event, or [`Error::Broken`] when the connection
    /// drops while waiting.
    pub async fn wait_event(&self) -> Result<Event> {
        loop {
            let notified = self.inner.shared.event_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.inner.shared.events.lock().pop_front() {
                return Ok(event);
            }
            if self.inner.shared.closed.load(Ordering::Acquire) {
                return Err(Error::Broken);
            }
            notified.await;
        }
    }

    /// Close this clone of the client. The underlying connection drops
    /// with the last clone.
    pub fn close(self) {
        drop(self);
    }

    /// One serialized request/response exchange.
    async fn round_trip(&self, msg: ClientMessage) -> Result<Reply> {
        let _call = self.inner.call_lock.lock().await;
        if self.inner.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Broken);
        }
        let (tx, rx) = oneshot::channel();
        *self.inner.shared.pending.lock() = Some(tx);

        if let Err(e) = self.inner.writer.send(OutboundFrame::new(msg.encode())).await {
            self.inner.shared.pending.lock().take();
            return Err(e);
        }
        rx.await.map_err(|_| Error::Broken)
    }
}

fn resource_request(op: ResourceOp, id: &str, flags: OpenFlags) -> Result<ClientMessage> {
    Ok(ClientMessage::Resource {
        op,
        flags,
        id: ResourceId::new(id)?,
    })
}

/// Build a resource handle from a successful open response.
fn take_resource(
    resp: &CommonResponse,
    fd: Option<OwnedFd>,
) -> std::result::Result<Resource, Status> {
    if !resp.status.is_success() {
        return Err(resp.status);
    }
    match fd {
        Some(fd) => Ok(Resource::new(fd, resp.open_flags)),
        // A success response without a descriptor is a server bug; surface
        // it as a protocol-level failure rather than an invalid handle.
        None => Err(Status::Protocol),
    }
}

fn take_watcher(resp: &CommonResponse) -> Result<Watcher> {
    if resp.watcher_id == 0 {
        return Err(Error::Protocol("response carries no watcher id".into()));
    }
    Ok(Watcher {
        id: resp.watcher_id,
    })
}

/// Route inbound frames until the connection ends, then wake everyone.
async fn read_loop(mut reader: EndpointReader, shared: Arc<ReaderShared>) {
    loop {
        match reader.recv().await {
            Ok(Some(frame)) => {
                let fd = frame.fd;
                match ServerMessage::decode(frame.raw_type, &frame.body) {
                    Ok(ServerMessage::CommonResponse(resp)) => {
                        match shared.pending.lock().take() {
                            Some(tx) => {
                                let _ = tx.send((resp, fd));
                            }
                            None => {
                                tracing::warn!("dropping unsolicited response");
                            }
                        }
                    }
                    Ok(ServerMessage::Event { watcher_id, kind }) => {
                        shared.events.lock().push_back(Event {
                            watcher: watcher_id,
                            kind,
                        });
                        shared.event_notify.notify_waiters();
                    }
                    Ok(ServerMessage::HandshakeAck { .. }) => {
                        tracing::warn!("handshake ack on a running connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("dropping connection on bad frame: {}", e);
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("connection lost: {}", e);
                break;
            }
        }
    }
    shared.shut();
}
