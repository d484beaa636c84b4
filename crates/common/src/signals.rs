//! Request-completion signal
//!
//! Applications send [`RequestFinished`] after every response. The default
//! receiver closes every connection the serving thread can see, so each
//! request starts from a fresh connection.

use crate::db::Connections;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

/// Id of the receiver installed by [`RequestFinished::with_defaults`]
pub const CLOSE_CONNECTIONS: &str = "close_connections";

pub type Receiver = Arc<dyn Fn(&Connections) + Send + Sync>;

/// Process-wide signal fired once per finished request.
///
/// Clones share their receivers.
#[derive(Clone, Default)]
pub struct RequestFinished {
    receivers: Arc<RwLock<Vec<(String, Receiver)>>>,
}

impl RequestFinished {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal with the connection-closing receiver attached
    pub fn with_defaults() -> Self {
        let signal = Self::new();
        signal.connect(CLOSE_CONNECTIONS, close_connections());
        signal
    }

    /// Attach `receiver` under `id`, replacing any receiver with the same id
    pub fn connect(&self, id: &str, receiver: Receiver) {
        let mut receivers = self.receivers.write();
        receivers.retain(|(existing, _)| existing != id);
        receivers.push((id.to_string(), receiver));
    }

    /// Detach the receiver registered under `id` and hand it back
    pub fn disconnect(&self, id: &str) -> Option<Receiver> {
        let mut receivers = self.receivers.write();
        let index = receivers.iter().position(|(existing, _)| existing == id)?;
        Some(receivers.remove(index).1)
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.receivers.read().iter().any(|(existing, _)| existing == id)
    }

    pub fn send(&self, connections: &Connections) {
        // Snapshot so a receiver may connect/disconnect without deadlocking.
        let receivers: Vec<Receiver> = self.receivers.read().iter().map(|(_, r)| r.clone()).collect();
        for receiver in receivers {
            receiver(connections);
        }
    }
}

/// Receiver that closes every connection in the registry it is sent
pub fn close_connections() -> Receiver {
    Arc::new(|connections: &Connections| {
        for db in connections.all() {
            if let Err(e) = db.close() {
                warn!("failed to close connection '{}': {}", db.alias(), e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_receiver_closes_connections() {
        let db = Database::open_memory("default").unwrap();
        let mut connections = Connections::new();
        connections.insert(db.clone());

        RequestFinished::with_defaults().send(&connections);
        assert!(!db.is_open());
    }

    #[test]
    fn test_disconnect_returns_receiver() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let signal = RequestFinished::new();
        signal.connect(
            "count",
            Arc::new(move |_: &Connections| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        signal.send(&Connections::new());
        let receiver = signal.disconnect("count").unwrap();
        signal.send(&Connections::new());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!signal.is_connected("count"));
        assert!(signal.disconnect("count").is_none());

        signal.connect("count", receiver);
        signal.send(&Connections::new());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
