//! Watcher registry: per-resource fan-out with edge notifications.
//!
//! One coarse lock guards the whole map; contention is low because
//! registrations and events are infrequent. Empty/non-empty transitions
//! are decided under the map lock and queued; [`WatcherRegistry::notify_edges`]
//! drains the queue under a separate lock, so `watch`/`unwatch` callbacks
//! run outside the map lock, serialized, in the order the transitions were
//! decided — an `unwatch` can never overtake the `watch` that preceded it.

use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;

use crate::server::service::Service;
use crate::types::{ResourceId, SessionId, WatcherId};

/// An empty/non-empty transition awaiting its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Edge {
    Watch(ResourceId),
    Unwatch(ResourceId),
}

#[derive(Default)]
struct Inner {
    map: HashMap<ResourceId, BTreeSet<(SessionId, WatcherId)>>,
    pending: VecDeque<Edge>,
}

/// Process-wide `resource id -> ordered set of (session, watcher)` map.
#[derive(Default)]
pub(crate) struct WatcherRegistry {
    inner: Mutex<Inner>,
    edge_lock: Mutex<()>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watcher. Queues a `watch` edge when the id's set went
    /// empty -> non-empty.
    pub fn add(&self, id: &ResourceId, session: SessionId, watcher: WatcherId) {
        let mut inner = self.inner.lock();
        let set = inner.map.entry(id.clone()).or_default();
        let was_empty = set.is_empty();
        set.insert((session, watcher));
        if was_empty {
            inner.pending.push_back(Edge::Watch(id.clone()));
        }
    }

    /// Remove one watcher. Queues an `unwatch` edge when the id's set went
    /// non-empty -> empty.
    pub fn remove(&self, id: &ResourceId, session: SessionId, watcher: WatcherId) {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.map.get_mut(id) {
            set.remove(&(session, watcher));
            if set.is_empty() {
                inner.map.remove(id);
                inner.pending.push_back(Edge::Unwatch(id.clone()));
            }
        }
    }

    /// Remove every watcher a disappearing session owns, queueing the
    /// `unwatch` edges its departure causes.
    pub fn remove_session(&self, session: SessionId) {
        let mut inner = self.inner.lock();
        let mut emptied = Vec::new();
        for (id, set) in inner.map.iter_mut() {
            set.retain(|&(s, _)| s != session);
            if set.is_empty() {
                emptied.push(id.clone());
            }
        }
        for id in emptied {
            inner.map.remove(&id);
            inner.pending.push_back(Edge::Unwatch(id));
        }
    }

    /// Snapshot the current subscribers of `id` for a broadcast.
    pub fn subscribers(&self, id: &ResourceId) -> Vec<(SessionId, WatcherId)> {
        let inner = self.inner.lock();
        inner
            .map
            .get(id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fire queued `watch`/`unwatch` callbacks in decided order.
    ///
    /// Callers invoke this after any add/remove batch; holding `edge_lock`
    /// across the callbacks keeps them serialized without blocking the map.
    pub fn notify_edges(&self, service: &dyn Service) {
        let _serialized = self.edge_lock.lock();
        loop {
            let edge = { self.inner.lock().pending.pop_front() };
            match edge {
                None => break,
                Some(Edge::Watch(id)) => {
                    let status = service.watch(&id);
                    if !status.is_success() {
                        tracing::warn!("watch callback for {} failed: {:?}", id, status);
                    }
                }
                Some(Edge::Unwatch(id)) => {
                    let status = service.unwatch(&id);
                    if !status.is_success() {
                        tracing::warn!("unwatch callback for {} failed: {:?}", id, status);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
