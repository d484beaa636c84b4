//! Connections lent from the test thread to the live server thread

use std::sync::Arc;

use ghostrunner_common::{Connections, Database};
use tracing::{debug, warn};

use crate::error::{E2eError, E2eResult};

/// Connections whose cross-thread use has been enabled for the duration of
/// a live-server session.
///
/// Only engines that expose a [`ThreadSharing`](ghostrunner_common::ThreadSharing)
/// capability are enrolled; the rest are left to connect privately on the
/// server thread. Every server thread built from the set holds a lease on it
/// until the thread exits.
#[derive(Debug, Default)]
pub struct SharedConnectionSet {
    databases: Vec<Database>,
    lease: Arc<()>,
}

impl SharedConnectionSet {
    /// Enable sharing on every connection in `connections` that supports it
    pub fn enable(connections: &Connections) -> Self {
        let mut databases = Vec::new();
        for db in connections.all() {
            match db.thread_sharing() {
                Some(sharing) => {
                    sharing.allow();
                    debug!("Sharing connection '{}' with the live server", db.alias());
                    databases.push(db.clone());
                }
                None => debug!("Connection '{}' ({}) stays thread-local", db.alias(), db.vendor()),
            }
        }
        Self {
            databases,
            lease: Arc::new(()),
        }
    }

    /// Held by a server thread for as long as it may use the connections
    pub(crate) fn lease(&self) -> Arc<()> {
        self.lease.clone()
    }

    /// Whether a server thread still holds a lease
    pub fn in_use(&self) -> bool {
        Arc::strong_count(&self.lease) > 1
    }

    pub fn databases(&self) -> impl Iterator<Item = &Database> {
        self.databases.iter()
    }

    pub fn aliases(&self) -> Vec<&str> {
        self.databases.iter().map(Database::alias).collect()
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.databases.iter().any(|db| db.alias() == alias)
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }

    /// Revoke sharing on every enrolled connection.
    ///
    /// Refused while a server thread is still running; the set is left intact
    /// so the caller can stop the server and retry.
    pub fn disable(&mut self) -> E2eResult<()> {
        if self.in_use() {
            return Err(E2eError::SharingInUse);
        }
        self.revoke_all();
        Ok(())
    }

    fn revoke_all(&mut self) {
        for db in self.databases.drain(..) {
            if let Some(sharing) = db.thread_sharing() {
                sharing.revoke();
                debug!("Stopped sharing connection '{}'", db.alias());
            }
        }
    }
}

impl Drop for SharedConnectionSet {
    fn drop(&mut self) {
        if !self.databases.is_empty() {
            warn!(
                "Revoking sharing left enabled on {:?}",
                self.aliases()
            );
            self.revoke_all();
        }
    }
}
