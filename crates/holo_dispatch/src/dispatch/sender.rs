//! Single-process transport for tests.
//!
//! `SenderTransportFactory` skips replica selection and connection handling
//! entirely: every session it builds delivers the batch once to a fixed
//! in-process `Sender`. This lets callers run their dispatch loop against a
//! store without any RPC stack.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::factory::TransportFactory;
use super::{
    BatchCall, BatchRequest, BatchResponse, DispatchError, ReplicaDescriptor, ReplicaInfo,
    ReplyError, RpcContext, SendOptions, Transport,
};

/// In-process batch executor.
///
/// An application error is returned as `Err`; an `Ok` reply must not carry
/// an embedded error of its own.
#[async_trait]
pub trait Sender: Send + Sync + 'static {
    async fn send(&self, req: BatchRequest) -> Result<BatchResponse, ReplyError>;
}

#[derive(Clone)]
pub struct SenderTransportFactory {
    sender: Arc<dyn Sender>,
    addr: SocketAddr,
}

impl SenderTransportFactory {
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self {
            sender,
            addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    /// Address reported for every send; unspecified by default.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }
}

#[async_trait]
impl TransportFactory for SenderTransportFactory {
    async fn build(
        &self,
        _opts: SendOptions,
        _ctx: &RpcContext,
        _replicas: &[ReplicaInfo],
        args: BatchRequest,
    ) -> anyhow::Result<Box<dyn Transport>> {
        Ok(Box::new(SenderTransport {
            sender: Arc::clone(&self.sender),
            addr: self.addr,
            args,
            called: false,
        }))
    }
}

/// Transport that performs exactly one inline send.
pub struct SenderTransport {
    sender: Arc<dyn Sender>,
    addr: SocketAddr,
    args: BatchRequest,
    called: bool,
}

#[async_trait]
impl Transport for SenderTransport {
    fn is_exhausted(&self) -> bool {
        self.called
    }

    async fn send_next(&mut self, done: &mpsc::UnboundedSender<BatchCall>) -> SocketAddr {
        assert!(!self.called, "send_next called on an exhausted transport");
        self.called = true;

        let reply = match self.sender.send(self.args.clone()).await {
            Ok(reply) => {
                // A sender that reports errors in-band as well as through the
                // result has double-reported; the caller would see it twice.
                if let Some(err) = &reply.error {
                    panic!("sender reply unexpectedly carries error: {err}");
                }
                reply
            }
            Err(err) => {
                tracing::trace!(error = %err, "sender returned error");
                BatchResponse::with_error(err)
            }
        };
        let _ = done.send(BatchCall {
            addr: self.addr,
            result: Ok(reply),
        });
        self.addr
    }

    fn try_next(&mut self, replica: &ReplicaDescriptor) -> Result<(), DispatchError> {
        if self.called {
            return Err(DispatchError::Exhausted);
        }
        if !replica.is_valid() {
            return Err(DispatchError::InvalidReplica(*replica));
        }
        Err(DispatchError::UnknownReplica(*replica))
    }

    fn close(self: Box<Self>) {}
}
