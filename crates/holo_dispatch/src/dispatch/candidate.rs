//! Per-attempt replica candidates and health ordering.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use super::{BatchClient, BatchRequest, ReplicaDescriptor};

/// One replica a session may send to.
///
/// Built once per dispatch attempt; `args` is the caller's batch stamped with
/// this replica, and `healthy` is the connection health observed at build
/// time (never refreshed during the session).
#[derive(Clone)]
pub struct ReplicaCandidate {
    addr: SocketAddr,
    client: Arc<dyn BatchClient>,
    args: Arc<BatchRequest>,
    healthy: bool,
}

impl ReplicaCandidate {
    pub fn new(
        addr: SocketAddr,
        client: Arc<dyn BatchClient>,
        args: BatchRequest,
        healthy: bool,
    ) -> Self {
        Self {
            addr,
            client,
            args: Arc::new(args),
            healthy,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn replica(&self) -> &ReplicaDescriptor {
        &self.args.header.replica
    }

    pub fn args(&self) -> &BatchRequest {
        &self.args
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub(crate) fn client(&self) -> &Arc<dyn BatchClient> {
        &self.client
    }

    pub(crate) fn shared_args(&self) -> &Arc<BatchRequest> {
        &self.args
    }
}

impl fmt::Debug for ReplicaCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaCandidate")
            .field("addr", &self.addr)
            .field("replica", self.replica())
            .field("healthy", &self.healthy)
            .finish()
    }
}

/// Move known-unhealthy candidates behind healthy ones.
///
/// The partition is stable inside both groups. Returns the number of healthy
/// candidates.
pub fn split_healthy(candidates: &mut [ReplicaCandidate]) -> usize {
    // `sort_by_key` is stable, and `false < true` puts healthy entries first.
    candidates.sort_by_key(|c| !c.healthy);
    candidates.iter().take_while(|c| c.healthy).count()
}
