//! Registry of live client connections, keyed by user id.
//!
//! Each connection registers its outbound queue so the server can reach every
//! client at once, e.g. to close them all on shutdown. Entries are removed
//! when the returned [`Registration`] is dropped, including on panic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bridge::Outbound;

/// A registered client connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub connection_id: u64,
    pub user_id: String,
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
    sender: mpsc::UnboundedSender<Outbound>,
}

type UserTable = HashMap<String, HashMap<u64, ConnectionEntry>>;

/// Live connections grouped by user.
#[derive(Default)]
pub struct ConnectionRegistry {
    users: Arc<RwLock<UserTable>>,
    next_id: AtomicU64,
}

/// Keeps a connection registered until dropped.
pub struct Registration {
    users: Arc<RwLock<UserTable>>,
    user_id: String,
    connection_id: u64,
}

impl Registration {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Ok(mut users) = self.users.write() else {
            return;
        };
        if let Some(conns) = users.get_mut(&self.user_id) {
            if let Some(entry) = conns.remove(&self.connection_id) {
                debug!(
                    connection_id = self.connection_id,
                    user_id = %self.user_id,
                    secs = entry.connected_at.elapsed().as_secs(),
                    "client unregistered"
                );
            }
            if conns.is_empty() {
                users.remove(&self.user_id);
            }
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for `user_id`.
    pub fn register(
        &self,
        user_id: &str,
        remote_addr: SocketAddr,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Registration {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = ConnectionEntry {
            connection_id,
            user_id: user_id.to_string(),
            remote_addr,
            connected_at: Instant::now(),
            sender,
        };
        let sessions = match self.users.write() {
            Ok(mut users) => {
                let conns = users.entry(user_id.to_string()).or_default();
                conns.insert(connection_id, entry);
                conns.len()
            }
            Err(_) => 0,
        };
        info!(connection_id, user_id, remote = %remote_addr, sessions, "client registered");

        Registration {
            users: Arc::clone(&self.users),
            user_id: user_id.to_string(),
            connection_id,
        }
    }

    /// Queue `message` on every connection. Returns how many accepted it.
    pub fn broadcast(&self, message: &Outbound) -> usize {
        let Ok(users) = self.users.read() else {
            return 0;
        };
        users
            .values()
            .flat_map(HashMap::values)
            .filter(|entry| entry.sender.send(message.clone()).is_ok())
            .count()
    }

    pub fn list(&self) -> Vec<ConnectionEntry> {
        self.users
            .read()
            .map(|users| users.values().flat_map(|c| c.values().cloned()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.users
            .read()
            .map(|users| users.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }
}
