//! Server: publishes resources under a rendezvous name and serves client
//! sessions through the embedder's [`Service`] callbacks.
//!
//! ```ignore
//! use reswire::server::{Server, Service};
//!
//! let handle = Server::start("assets", Arc::new(MyService)).await?;
//! handle.push_event("textures/grass.png", EventKind::Update).await?;
//! handle.shutdown().await?;
//! ```

pub(crate) mod dispatch;
pub(crate) mod handle;
pub(crate) mod service;
pub(crate) mod session;
pub(crate) mod watchers;
pub(crate) mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use service::{OpenSource, Service, SessionInfo};

use crate::error::{Error, Result};
use crate::protocol::ServerMessage;
use crate::transport::endpoint::{OutboundFrame, WriterHandle};
use crate::transport::socket::{endpoint_path, Listener};
use crate::types::{EventKind, ResourceId, SessionId, WatcherId};
use watchers::WatcherRegistry;

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How many live sessions one worker multiplexes before the accept
    /// loop spawns another.
    pub sessions_per_worker: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            sessions_per_worker: 16,
        }
    }
}

/// State shared between the accept loop, workers, and sessions.
pub(crate) struct Shared {
    pub service: Arc<dyn Service>,
    pub registry: WatcherRegistry,
    next_session_id: AtomicU32,
    next_watcher_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, WriterHandle>>,
}

impl Shared {
    fn new(service: Arc<dyn Service>) -> Self {
        Shared {
            service,
            registry: WatcherRegistry::new(),
            next_session_id: AtomicU32::new(1),
            next_watcher_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn alloc_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Strictly increasing watcher ids; `None` once the space is spent.
    pub fn alloc_watcher_id(&self) -> Option<WatcherId> {
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        (id != u64::MAX).then_some(id)
    }

    pub fn insert_session(&self, id: SessionId, writer: WriterHandle) {
        self.sessions.lock().insert(id, writer);
    }

    pub fn remove_session(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    pub fn session_writer(&self, id: SessionId) -> Option<WriterHandle> {
        self.sessions.lock().get(&id).cloned()
    }
}

/// Server entry point.
pub struct Server;

impl Server {
    /// Start serving under `name` with default tunables.
    pub async fn start(name: &str, service: Arc<dyn Service>) -> Result<ServerHandle> {
        Self::start_with_config(name, service, ServerConfig::default()).await
    }

    /// Start serving under `name`.
    pub async fn start_with_config(
        name: &str,
        service: Arc<dyn Service>,
        config: ServerConfig,
    ) -> Result<ServerHandle> {
        let path = endpoint_path(name)?;
        let listener = Listener::bind(&path)?;
        let shared = Arc::new(Shared::new(service));
        let (stop_tx, stop_rx) = watch::channel(false);
        let accept = tokio::spawn(worker::accept_loop(
            listener,
            shared.clone(),
            config,
            stop_rx,
        ));
        tracing::debug!("server listening on {}", path.display());
        Ok(ServerHandle {
            shared,
            control: Arc::new(ServerControl {
                stop: stop_tx,
                accept: Mutex::new(Some(accept)),
            }),
        })
    }
}

struct ServerControl {
    stop: watch::Sender<bool>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running server. Cheap to clone; shutting down any clone
/// stops the server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
    control: Arc<ServerControl>,
}

impl ServerHandle {
    /// Deliver an event to every watcher currently subscribed to `id`.
    ///
    /// This is how the embedder reacts to its own resource changes; each
    /// subscriber receives one `SV_EVENT` on its session, ordered after
    /// any response already queued there.
    pub async fn push_event(&self, id: &str, kind: EventKind) -> Result<()> {
        let id = ResourceId::new(id)?;
        for (session_id, watcher_id) in self.shared.registry.subscribers(&id) {
            let Some(writer) = self.shared.session_writer(session_id) else {
                continue;
            };
            let frame = ServerMessage::Event { watcher_id, kind }.encode();
            // A session mid-teardown just misses the event.
            let _ = writer.send(OutboundFrame::new(frame)).await;
        }
        Ok(())
    }

    /// Stop accepting, close every session (running their disconnect
    /// callbacks), and wait for the whole pipeline to drain.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.control.stop.send(true);
        let accept = self.control.accept.lock().take();
        match accept {
            Some(task) => {
                task.await
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
                Ok(())
            }
            None => Err(Error::Unavailable),
        }
    }
}
