//! Set of live subscriber connections shared by the acceptor (insert/remove)
//! and the broadcaster (snapshot).

use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use metrics::gauge;
use thiserror::Error;
use tracing::debug;

/// Handle assigned to a subscriber on registration. Never reused within a
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// Outbound half of a subscriber connection.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_text(&self, message: &str) -> Result<(), DeliveryError>;

    /// Tears the connection down after a failed delivery. Must not block on
    /// the peer.
    fn close(&self);
}

#[derive(Clone)]
pub struct Subscriber {
    id: SubscriberId,
    peer: Option<SocketAddr>,
    sink: Arc<dyn MessageSink>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn send_text(&self, message: &str) -> Result<(), DeliveryError> {
        self.sink.send_text(message).await
    }

    pub fn close(&self) {
        self.sink.close();
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Members are kept in registration order so snapshots are deterministic.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    members: Mutex<BTreeMap<SubscriberId, Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: Option<SocketAddr>, sink: Arc<dyn MessageSink>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Subscriber { id, peer, sink };
        let count = {
            let mut guard = self.members.lock().expect("mutex poisoned");
            guard.insert(id, subscriber);
            guard.len()
        };
        gauge!("relay_subscribers").set(count as f64);
        debug!(subscriber = %id, ?peer, count, "subscriber registered");
        id
    }

    /// Removing an absent handle is a no-op; returns whether a member was
    /// actually dropped.
    pub fn remove(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut guard = self.members.lock().expect("mutex poisoned");
            let removed = guard.remove(&id).is_some();
            (removed, guard.len())
        };
        if removed {
            gauge!("relay_subscribers").set(count as f64);
            debug!(subscriber = %id, count, "subscriber unregistered");
        }
        removed
    }

    /// Copies the current members out; the lock is released before the
    /// caller performs any I/O.
    pub fn snapshot(&self) -> Vec<Subscriber> {
        let guard = self.members.lock().expect("mutex poisoned");
        guard.values().cloned().collect()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        let guard = self.members.lock().expect("mutex poisoned");
        guard.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        let guard = self.members.lock().expect("mutex poisoned");
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
