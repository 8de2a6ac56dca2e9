//! Connection context shared by all sessions of a node.
//!
//! Holds the dialer, a per-address client cache, per-address health and
//! circuit-breaker state, and the registry of in-process handlers. Sessions
//! only read from it: health is fed by the node's own probing through
//! `record_success`/`record_failure`, and by failed dials.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use super::{BatchClient, DialError, Dialer, LocalRegistry};

/// Circuit-breaker tuning.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time an open breaker refuses dials before letting one probe through.
    pub open_for: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_for: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
struct ConnHealth {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// A half-open probe dial is outstanding.
    probing: bool,
}

pub struct RpcContext {
    dialer: Arc<dyn Dialer>,
    breaker: BreakerConfig,
    conns: RwLock<HashMap<SocketAddr, Arc<dyn BatchClient>>>,
    health: Mutex<HashMap<SocketAddr, ConnHealth>>,
    local: Arc<LocalRegistry>,
}

impl RpcContext {
    pub fn new(dialer: Arc<dyn Dialer>, breaker: BreakerConfig) -> Self {
        Self {
            dialer,
            breaker: BreakerConfig {
                failure_threshold: breaker.failure_threshold.max(1),
                open_for: breaker.open_for,
            },
            conns: RwLock::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            local: Arc::new(LocalRegistry::new()),
        }
    }

    pub fn local_registry(&self) -> &Arc<LocalRegistry> {
        &self.local
    }

    /// Return a client for `addr`, dialing if none is cached.
    ///
    /// Fails with `DialError::BreakerOpen` while the address's breaker is
    /// open; once `open_for` has passed a single probe dial is admitted.
    pub async fn dial(&self, addr: SocketAddr) -> Result<Arc<dyn BatchClient>, DialError> {
        let probe = self.admit(addr)?;

        // A probe always dials fresh; the cached client is what failed.
        let _half_open = if probe {
            if let Ok(mut conns) = self.conns.write() {
                conns.remove(&addr);
            }
            Some(HalfOpenGuard { ctx: self, addr })
        } else {
            if let Some(client) = self.cached(addr) {
                return Ok(client);
            }
            None
        };

        match self.dialer.dial(addr).await {
            Ok(client) => {
                if let Ok(mut conns) = self.conns.write() {
                    conns.insert(addr, Arc::clone(&client));
                }
                self.record_success(addr);
                Ok(client)
            }
            Err(err) => {
                tracing::debug!(addr = %addr, error = ?err, "dial failed");
                self.record_failure(addr);
                Err(DialError::Failed(err))
            }
        }
    }

    /// Health snapshot: an address is healthy until a failure is recorded.
    pub fn is_conn_healthy(&self, addr: SocketAddr) -> bool {
        match self.health.lock() {
            Ok(health) => health
                .get(&addr)
                .map_or(true, |entry| entry.consecutive_failures == 0),
            Err(_) => false,
        }
    }

    pub fn is_breaker_open(&self, addr: SocketAddr) -> bool {
        match self.health.lock() {
            Ok(health) => health.get(&addr).is_some_and(|entry| entry.opened_at.is_some()),
            Err(_) => false,
        }
    }

    pub fn record_success(&self, addr: SocketAddr) {
        if let Ok(mut health) = self.health.lock() {
            if health.remove(&addr).is_some_and(|entry| entry.opened_at.is_some()) {
                tracing::info!(addr = %addr, "circuit breaker closed");
            }
        }
    }

    pub fn record_failure(&self, addr: SocketAddr) {
        let Ok(mut health) = self.health.lock() else {
            return;
        };
        let entry = health.entry(addr).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.probing = false;
        if entry.consecutive_failures >= self.breaker.failure_threshold {
            if entry.opened_at.is_none() {
                tracing::warn!(
                    addr = %addr,
                    failures = entry.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            // Re-arm on every failure so a failed probe waits a full interval.
            entry.opened_at = Some(Instant::now());
        }
    }

    /// Gate a dial on the breaker. `Ok(true)` means this dial is the
    /// half-open probe.
    fn admit(&self, addr: SocketAddr) -> Result<bool, DialError> {
        let Ok(mut health) = self.health.lock() else {
            return Ok(false);
        };
        let Some(entry) = health.get_mut(&addr) else {
            return Ok(false);
        };
        let Some(opened_at) = entry.opened_at else {
            return Ok(false);
        };
        if entry.probing || opened_at.elapsed() < self.breaker.open_for {
            return Err(DialError::BreakerOpen(addr));
        }
        entry.probing = true;
        Ok(true)
    }

    fn end_probe(&self, addr: SocketAddr) {
        if let Ok(mut health) = self.health.lock() {
            if let Some(entry) = health.get_mut(&addr) {
                entry.probing = false;
            }
        }
    }

    fn cached(&self, addr: SocketAddr) -> Option<Arc<dyn BatchClient>> {
        self.conns.read().ok()?.get(&addr).cloned()
    }
}

/// Clears the half-open flag however the probe dial ends, including when the
/// dial future is dropped.
struct HalfOpenGuard<'a> {
    ctx: &'a RpcContext,
    addr: SocketAddr,
}

impl Drop for HalfOpenGuard<'_> {
    fn drop(&mut self) {
        self.ctx.end_probe(self.addr);
    }
}
