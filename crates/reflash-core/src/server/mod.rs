//! Client connection handling.
//!
//! Instrumented app processes dial in over TCP, validate themselves, then
//! stay connected for the life of the process: the daemon pushes commands
//! (load/inject/log/metrics) and the client reports platform, sandbox paths
//! and injection outcomes. All outbound writes go through one serial
//! delivery queue so a multi-part message can never interleave with another
//! client's traffic.

mod connection;
pub mod protocol;

pub use connection::{
    ClientHandle, ClientSnapshot, ConnectionServer, ConnectionStatus, ServerContext,
};
pub(crate) use connection::default_arch;

use crate::queue::SerialQueue;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Live client connections, most recently connected last.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<Arc<ClientHandle>>>,
}

impl ClientRegistry {
    pub fn register(&self, client: Arc<ClientHandle>) {
        self.clients.lock().unwrap().push(client);
    }

    pub fn unregister(&self, id: u64) {
        self.clients.lock().unwrap().retain(|c| c.id() != id);
    }

    /// All connections, oldest first.
    pub fn clients(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.lock().unwrap().clone()
    }

    /// Connections that reported a usable sandbox, oldest first.
    pub fn attached(&self) -> Vec<Arc<ClientHandle>> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.is_attached())
            .cloned()
            .collect()
    }

    /// The most recently connected client.
    pub fn current(&self) -> Option<Arc<ClientHandle>> {
        self.clients.lock().unwrap().last().cloned()
    }

    pub fn has_clients(&self) -> bool {
        !self.clients.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().unwrap().is_empty()
    }
}

/// Log `msg` locally and forward it to every connected client's console.
pub fn broadcast_log(registry: &ClientRegistry, delivery: &SerialQueue, msg: &str) {
    info!("{msg}");
    for client in registry.clients() {
        client.send_log(delivery, msg);
    }
}

/// Error variant of [`broadcast_log`], marked as such in client consoles.
pub fn broadcast_error(registry: &ClientRegistry, delivery: &SerialQueue, msg: &str) {
    error!("{msg}");
    let marked = format!("⚠️ {msg}");
    for client in registry.clients() {
        client.send_log(delivery, &marked);
    }
}
