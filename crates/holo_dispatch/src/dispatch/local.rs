//! In-process handlers reachable without the network.
//!
//! A node that serves batches in this process registers its handler under
//! its advertised RPC address. Transports with local calls enabled look the
//! address up before spawning an RPC and call the handler directly instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};

use super::LocalHandler;

type HandlerMap = HashMap<SocketAddr, Weak<dyn LocalHandler>>;

#[derive(Default)]
pub struct LocalRegistry {
    handlers: RwLock<HandlerMap>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `addr` until the returned guard is dropped.
    ///
    /// The registry only holds a weak reference; a handler dropped by its
    /// owner stops resolving even if the guard is still alive.
    pub fn register(
        self: &Arc<Self>,
        addr: SocketAddr,
        handler: &Arc<dyn LocalHandler>,
    ) -> LocalRegistration {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(addr, Arc::downgrade(handler));
        }
        tracing::debug!(addr = %addr, "registered local batch handler");
        LocalRegistration {
            registry: Arc::downgrade(self),
            addr,
        }
    }

    pub fn unregister(&self, addr: SocketAddr) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.remove(&addr);
        }
    }

    pub fn lookup(&self, addr: SocketAddr) -> Option<Arc<dyn LocalHandler>> {
        if let Ok(handlers) = self.handlers.read() {
            let entry = handlers.get(&addr)?;
            if let Some(handler) = entry.upgrade() {
                return Some(handler);
            }
        } else {
            return None;
        }

        // Drop entries whose handler has already shut down.
        if let Ok(mut handlers) = self.handlers.write() {
            let stale = handlers
                .get(&addr)
                .and_then(Weak::upgrade)
                .is_none();
            if stale {
                handlers.remove(&addr);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a local handler registered; unregisters on drop.
pub struct LocalRegistration {
    registry: Weak<LocalRegistry>,
    addr: SocketAddr,
}

impl LocalRegistration {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for LocalRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.addr);
        }
    }
}
