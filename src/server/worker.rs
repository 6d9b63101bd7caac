//! Worker pool and accept loop.
//!
//! One accept task per server. Each accepted connection is handed to an
//! existing worker with spare capacity, or a fresh worker when all are
//! full. A worker owns up to [`crate::server::ServerConfig::sessions_per_worker`]
//! live sessions as tasks in a `JoinSet`, admitting new ones over a channel
//! and reaping completed ones; readiness multiplexing and per-session
//! fairness belong to the runtime. On shutdown workers stop admitting and
//! wait for their sessions to run teardown (disconnect callbacks included).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::server::{session, ServerConfig, Shared};
use crate::transport::socket::Listener;

pub(crate) struct Worker {
    tx: mpsc::UnboundedSender<UnixStream>,
    active: Arc<AtomicUsize>,
    capacity: usize,
    join: JoinHandle<()>,
}

impl Worker {
    fn spawn(shared: Arc<Shared>, capacity: usize, stop: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicUsize::new(0));
        let join = tokio::spawn(worker_loop(shared, rx, active.clone(), stop));
        Worker {
            tx,
            active,
            capacity,
            join,
        }
    }

    /// Hand a connection to this worker unless it is at capacity.
    fn try_assign(&self, stream: UnixStream) -> std::result::Result<(), UnixStream> {
        if self.active.load(Ordering::Acquire) >= self.capacity {
            return Err(stream);
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        self.tx.send(stream).map_err(|e| {
            self.active.fetch_sub(1, Ordering::AcqRel);
            e.0
        })
    }

    async fn shutdown(self) {
        drop(self.tx);
        let _ = self.join.await;
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<UnixStream>,
    active: Arc<AtomicUsize>,
    stop: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            admitted = rx.recv() => match admitted {
                Some(stream) => {
                    sessions.spawn(session::run(stream, shared.clone(), stop.clone()));
                }
                None => break,
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {
                active.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
    // No more admissions; let live sessions finish their teardown.
    while sessions.join_next().await.is_some() {
        active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Accept connections until the stop signal, then wind the workers down.
pub(crate) async fn accept_loop(
    listener: Listener,
    shared: Arc<Shared>,
    config: ServerConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut workers: Vec<Worker> = Vec::new();

    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(stream) => {
                assign(stream, &mut workers, &shared, &config, &stop);
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }

    // Listener drops here, removing the rendezvous socket before the
    // remaining sessions drain.
    drop(listener);
    tracing::debug!("accept loop stopped, draining {} workers", workers.len());
    for worker in workers {
        worker.shutdown().await;
    }
}

fn assign(
    stream: UnixStream,
    workers: &mut Vec<Worker>,
    shared: &Arc<Shared>,
    config: &ServerConfig,
    stop: &watch::Receiver<bool>,
) {
    let mut stream = stream;
    for worker in workers.iter() {
        match worker.try_assign(stream) {
            Ok(()) => return,
            Err(back) => stream = back,
        }
    }

    let worker = Worker::spawn(shared.clone(), config.sessions_per_worker, stop.clone());
    match worker.try_assign(stream) {
        Ok(()) => workers.push(worker),
        Err(_) => {
            // A freshly spawned worker only refuses if the runtime is
            // already tearing it down.
            tracing::error!("failed to assign connection to a fresh worker");
        }
    }
}
