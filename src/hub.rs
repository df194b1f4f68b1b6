//! Per-lobby fan-out of events to live subscribers.
//!
//! The registry is a single `RwLock`: subscribe/unsubscribe write, broadcast
//! reads. Delivery into a sink is `try_send`, so a stalled subscriber never
//! holds up the lock or the producer; when its queue is full the new event is
//! dropped for that subscriber only.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::db::{LobbyId, UserId};

/// SSE event name every push is sent under.
pub const EVENT_NAME: &str = "message";

/// A serialized event, shared by every sink it is delivered to.
pub type Payload = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle {
    pub lobby_id: LobbyId,
    id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Active,
    Closed,
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

struct Sink {
    user_id: UserId,
    tx: mpsc::Sender<Payload>,
    cancel: CancellationToken,
}

impl Sink {
    /// Signals the streaming task; dropping `tx` ends the data path once the
    /// receiver has drained what is already queued.
    fn close(self) {
        self.cancel.cancel();
    }
}

type Registry = HashMap<LobbyId, HashMap<u64, Sink>>;

struct Inner {
    lobbies: RwLock<Registry>,
    next_id: AtomicU64,
    buffer: usize,
}

/// Explicitly constructed at startup and handed to whoever needs it.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                lobbies: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    pub fn subscribe(&self, lobby_id: LobbyId, user_id: UserId) -> Subscription {
        let (tx, events) = mpsc::channel(self.inner.buffer);
        let cancel = CancellationToken::new();
        let handle = SubscriberHandle {
            lobby_id,
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
        };

        self.write()
            .entry(lobby_id)
            .or_default()
            .insert(handle.id, Sink { user_id, tx, cancel: cancel.clone() });
        tracing::debug!(%lobby_id, %user_id, subscriber = handle.id, "subscribed");

        Subscription {
            handle,
            events,
            cancel,
            hub: self.clone(),
        }
    }

    /// Removes and closes the sink. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriberHandle) -> bool {
        let sink = {
            let mut lobbies = self.write();
            let Some(sinks) = lobbies.get_mut(&handle.lobby_id) else {
                return false;
            };
            let sink = sinks.remove(&handle.id);
            if sinks.is_empty() {
                lobbies.remove(&handle.lobby_id);
            }
            sink
        };

        match sink {
            Some(sink) => {
                sink.close();
                tracing::debug!(lobby_id = %handle.lobby_id, subscriber = handle.id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Serializes `event` once and offers it to every sink of the lobby
    /// without waiting on any of them.
    pub fn broadcast<E: Serialize>(&self, lobby_id: LobbyId, event: &E) -> Result<Delivery, serde_json::Error> {
        let payload: Payload = serde_json::to_string(event)?.into();
        let mut delivery = Delivery::default();

        let lobbies = self.read();
        let Some(sinks) = lobbies.get(&lobby_id) else {
            return Ok(delivery);
        };

        for (id, sink) in sinks {
            match sink.tx.try_send(payload.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(%lobby_id, subscriber = id, "subscriber queue full, event dropped");
                    delivery.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => delivery.dropped += 1,
            }
        }

        Ok(delivery)
    }

    /// Closes every subscriber of the lobby.
    pub fn close_lobby(&self, lobby_id: LobbyId) -> usize {
        let sinks = self.write().remove(&lobby_id).unwrap_or_default();
        let closed = sinks.len();
        sinks.into_values().for_each(Sink::close);
        tracing::debug!(%lobby_id, closed, "lobby subscribers closed");
        closed
    }

    /// Closes the subscriptions `user_id` holds on the lobby.
    pub fn disconnect_user(&self, lobby_id: LobbyId, user_id: UserId) -> usize {
        let removed: Vec<Sink> = {
            let mut lobbies = self.write();
            let Some(sinks) = lobbies.get_mut(&lobby_id) else {
                return 0;
            };
            let ids: Vec<u64> = sinks
                .iter()
                .filter(|(_, sink)| sink.user_id == user_id)
                .map(|(id, _)| *id)
                .collect();
            let removed = ids.iter().filter_map(|id| sinks.remove(id)).collect();
            if sinks.is_empty() {
                lobbies.remove(&lobby_id);
            }
            removed
        };

        let closed = removed.len();
        removed.into_iter().for_each(Sink::close);
        closed
    }

    pub fn subscriber_count(&self, lobby_id: LobbyId) -> usize {
        self.read().get(&lobby_id).map_or(0, HashMap::len)
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.lobbies.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.lobbies.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The receiving end of one subscriber, owned by its streaming task.
/// Dropping it unsubscribes.
pub struct Subscription {
    handle: SubscriberHandle,
    events: mpsc::Receiver<Payload>,
    cancel: CancellationToken,
    hub: Hub,
}

impl Subscription {
    pub fn handle(&self) -> SubscriberHandle {
        self.handle
    }

    pub fn state(&self) -> SubscriberState {
        if self.cancel.is_cancelled() {
            SubscriberState::Closed
        } else {
            SubscriberState::Active
        }
    }

    /// Next event, or `None` once the subscription is closed and everything
    /// queued before the close has been handed out.
    pub async fn recv(&mut self) -> Option<Payload> {
        tokio::select! {
            biased;
            payload = self.events.recv() => payload,
            _ = self.cancel.cancelled() => self.events.try_recv().ok(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.handle);
    }
}
