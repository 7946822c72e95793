// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cartograph_core::ClientEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-client outbox capacity. A client slower than this is dropped rather
/// than allowed to block the hub (§5 concurrency model).
const OUTBOX_CAPACITY: usize = 256;

pub type ClientId = u64;

/// The sending half of a client's outbox, held by the hub.
pub type ClientSink = mpsc::Sender<ClientEvent>;

/// The receiving half, handed to the task that actually writes frames to the
/// socket so it can drain the outbox independently of the hub's mutex.
pub type ClientStream = mpsc::Receiver<ClientEvent>;

struct HubState {
    clients: HashMap<ClientId, ClientSink>,
    history: Vec<ClientEvent>,
}

/// Thread-safe fan-out: one producer (the supervisor), N consumers (browser
/// clients). All operations are serialized behind a single mutex; critical
/// sections never do I/O — sends go through each client's bounded outbox via
/// `try_send`, so a stalled client never blocks a broadcast to the rest.
pub struct EventHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                clients: HashMap::new(),
                history: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new client, synchronously delivering `init` followed by
    /// the full history replay in original order. Returns the assigned id
    /// and the receiving half of the client's outbox.
    pub fn connect(&self, init: ClientEvent) -> (ClientId, ClientStream) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().expect("hub mutex poisoned");
        let _ = tx.try_send(init);
        for event in &state.history {
            let _ = tx.try_send(event.clone());
        }
        state.clients.insert(id, tx);
        (id, rx)
    }

    pub fn disconnect(&self, id: ClientId) {
        self.state.lock().expect("hub mutex poisoned").clients.remove(&id);
    }

    /// Send one event to a single client's outbox without touching history.
    /// Used for per-connection data (e.g. the initial `chat_history` frame
    /// and `load_history` responses) that other clients must not replay.
    pub fn send_to(&self, id: ClientId, event: ClientEvent) {
        let state = self.state.lock().expect("hub mutex poisoned");
        if let Some(tx) = state.clients.get(&id) {
            let _ = tx.try_send(event);
        }
    }

    /// Append `event` to history, then fan it out to every connected client.
    /// Clients whose outbox is full or closed are dropped from the set.
    pub fn broadcast(&self, event: ClientEvent) {
        let mut state = self.state.lock().expect("hub mutex poisoned");
        state.history.push(event.clone());
        state.clients.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(client = id, "dropping client with full or closed outbox");
                false
            }
        });
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().expect("hub mutex poisoned").clients.len()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().expect("hub mutex poisoned").history.len()
    }

    /// Drop all clients and clear history. Used by `start`/`resume`, which
    /// reset the history buffer (crash-restart does not).
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("hub mutex poisoned");
        state.clients.clear();
        state.history.clear();
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_ready(path: &str) -> ClientEvent {
        ClientEvent::DocReady { path: path.to_string() }
    }

    fn init() -> ClientEvent {
        ClientEvent::AgentStopped
    }

    #[tokio::test]
    async fn connect_replays_history_in_order_after_init() {
        let hub = EventHub::new();
        hub.broadcast(doc_ready("a"));
        hub.broadcast(doc_ready("b"));

        let (_, mut rx) = hub.connect(init());
        assert!(matches!(rx.recv().await.unwrap(), ClientEvent::AgentStopped));
        assert!(matches!(rx.recv().await.unwrap(), ClientEvent::DocReady { path } if path == "a"));
        assert!(matches!(rx.recv().await.unwrap(), ClientEvent::DocReady { path } if path == "b"));
    }

    #[tokio::test]
    async fn late_client_then_sees_subsequent_live_events() {
        let hub = EventHub::new();
        hub.broadcast(doc_ready("a"));
        let (_, mut rx) = hub.connect(init());
        rx.recv().await.unwrap(); // init
        rx.recv().await.unwrap(); // history: a
        hub.broadcast(doc_ready("b"));
        assert!(matches!(rx.recv().await.unwrap(), ClientEvent::DocReady { path } if path == "b"));
    }

    #[tokio::test]
    async fn broadcast_reaches_all_connected_clients() {
        let hub = EventHub::new();
        let (_, mut rx1) = hub.connect(init());
        let (_, mut rx2) = hub.connect(init());
        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();

        hub.broadcast(doc_ready("shared"));
        assert!(matches!(rx1.recv().await.unwrap(), ClientEvent::DocReady { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), ClientEvent::DocReady { .. }));
    }

    #[tokio::test]
    async fn disconnect_removes_client_from_broadcast_set() {
        let hub = EventHub::new();
        let (id, _rx) = hub.connect(init());
        assert_eq!(hub.client_count(), 1);
        hub.disconnect(id);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_broadcast() {
        let hub = EventHub::new();
        let (_, rx) = hub.connect(init());
        drop(rx);
        hub.broadcast(doc_ready("x"));
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn reset_clears_history_and_clients() {
        let hub = EventHub::new();
        hub.broadcast(doc_ready("a"));
        let (_, _rx) = hub.connect(init());
        hub.reset();
        assert_eq!(hub.history_len(), 0);
        assert_eq!(hub.client_count(), 0);
    }
}
