//! Dispatch sessions over a replica set.
//!
//! A `Transport` owns the ordered replicas for one logical call. The caller
//! drives it from a single task: check `is_exhausted`, call `send_next`, wait
//! on the result channel, and call `try_next` when it learns which replica
//! holds the lease. Remote sends run on spawned tasks and report through the
//! channel; local sends complete inline.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::order::{Promotion, ReplicaOrder};
use super::{
    BatchCall, BatchRequest, BatchResponse, DispatchError, LocalHandler, LocalRegistry,
    ReplicaCandidate, ReplicaDescriptor, SendOptions,
};

/// Sends one batch to one or more replicas of a range.
///
/// Not safe for concurrent use; every method is called from the task that
/// owns the session.
#[async_trait]
pub trait Transport: Send {
    /// True when there are no more replicas to try.
    fn is_exhausted(&self) -> bool;

    /// Send the batch to the next replica and return its address.
    ///
    /// Exactly one `BatchCall` is pushed to `done` for this send, possibly
    /// after this method returns and in any order relative to other sends.
    ///
    /// # Panics
    ///
    /// Panics if the transport is exhausted.
    async fn send_next(&mut self, done: &mpsc::UnboundedSender<BatchCall>) -> SocketAddr;

    /// Make `replica` the next one `send_next` will use.
    fn try_next(&mut self, replica: &ReplicaDescriptor) -> Result<(), DispatchError>;

    /// Release the session, abandoning in-flight sends on a best-effort basis.
    ///
    /// An abandoned send reports nothing; one that was already finishing may
    /// still report.
    fn close(self: Box<Self>);
}

/// Networked transport with an in-process fast path.
pub struct RpcTransport {
    opts: SendOptions,
    /// Child of `opts.cancel`, cancelled when the session closes.
    cancel: CancellationToken,
    local: Arc<LocalRegistry>,
    candidates: Vec<ReplicaCandidate>,
    order: ReplicaOrder,
}

impl RpcTransport {
    /// Build a session over `candidates` in the given order.
    pub fn new(
        opts: SendOptions,
        local: Arc<LocalRegistry>,
        candidates: Vec<ReplicaCandidate>,
    ) -> Self {
        let cancel = opts.cancel.child_token();
        let order = ReplicaOrder::new(candidates.len());
        Self {
            opts,
            cancel,
            local,
            candidates,
            order,
        }
    }

    /// Replicas still to be tried, in send order.
    pub fn remaining(&self) -> Vec<ReplicaDescriptor> {
        self.order
            .iter()
            .map(|index| *self.candidates[index].replica())
            .collect()
    }

    /// Every replica of the session, in the order it was built.
    pub fn candidates(&self) -> &[ReplicaCandidate] {
        &self.candidates
    }

    async fn send_local(
        &self,
        handler: Arc<dyn LocalHandler>,
        args: BatchRequest,
    ) -> anyhow::Result<BatchResponse> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow::anyhow!("local batch cancelled")),
            result = self.opts.with_timeout(handler.batch(args)) => result,
        }
    }
}

#[async_trait]
impl Transport for RpcTransport {
    fn is_exhausted(&self) -> bool {
        self.order.is_empty()
    }

    async fn send_next(&mut self, done: &mpsc::UnboundedSender<BatchCall>) -> SocketAddr {
        let Some(index) = self.order.pop_front() else {
            panic!("send_next called on an exhausted transport");
        };
        let candidate = &self.candidates[index];
        let addr = candidate.addr();
        tracing::debug!(
            addr = %addr,
            replica = %candidate.replica(),
            requests = candidate.args().requests.len(),
            "sending batch to replica"
        );

        if self.opts.enable_local_calls {
            if let Some(handler) = self.local.lookup(addr) {
                tracing::trace!(addr = %addr, "executing local batch");
                let result = self.send_local(handler, candidate.args().clone()).await;
                let _ = done.send(BatchCall { addr, result });
                return addr;
            }
        }

        let client = Arc::clone(candidate.client());
        let args = Arc::clone(candidate.shared_args());
        let opts = self.opts.clone();
        let cancel = self.cancel.clone();
        let done = done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(addr = %addr, "batch rpc abandoned");
                }
                result = opts.with_timeout(client.batch(BatchRequest::clone(&args))) => {
                    match &result {
                        Ok(reply) => verify_reply(addr, &args, reply),
                        Err(err) => tracing::warn!(addr = %addr, error = ?err, "batch rpc failed"),
                    }
                    let _ = done.send(BatchCall { addr, result });
                }
            }
        });

        addr
    }

    fn try_next(&mut self, replica: &ReplicaDescriptor) -> Result<(), DispatchError> {
        if self.is_exhausted() {
            return Err(DispatchError::Exhausted);
        }
        if !replica.is_valid() {
            return Err(DispatchError::InvalidReplica(*replica));
        }

        // There is no client for replicas outside the session's set, and no
        // way to resolve one from here; a retry at a higher layer has to.
        let Some(index) = self.candidates.iter().position(|c| c.replica() == replica) else {
            return Err(DispatchError::UnknownReplica(*replica));
        };

        match self.order.promote(index) {
            Some(Promotion::Moved) => {
                tracing::debug!(replica = %replica, "promoted pending replica");
                Ok(())
            }
            Some(Promotion::Reinserted { evicted }) => {
                tracing::debug!(
                    replica = %replica,
                    evicted = %self.candidates[evicted].replica(),
                    "retrying replica, evicted least preferred"
                );
                Ok(())
            }
            None => Err(DispatchError::Exhausted),
        }
    }

    fn close(self: Box<Self>) {
        tracing::trace!(remaining = self.order.len(), "closing transport");
        // Drop cancels the session token.
    }
}

impl Drop for RpcTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Log responses that do not match their requests. They are still delivered.
fn verify_reply(addr: SocketAddr, args: &BatchRequest, reply: &BatchResponse) {
    if reply.error.is_some() {
        return;
    }
    if reply.responses.len() != args.requests.len() {
        tracing::error!(
            addr = %addr,
            expected = args.requests.len(),
            got = reply.responses.len(),
            "batch response count mismatch"
        );
        return;
    }
    for (resp, req) in reply.responses.iter().zip(&args.requests) {
        if let Err(err) = resp.verify(req) {
            tracing::error!(addr = %addr, error = ?err, "batch response failed verification");
        }
    }
}
