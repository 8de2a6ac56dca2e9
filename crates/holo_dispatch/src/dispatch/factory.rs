use std::sync::Arc;

use async_trait::async_trait;

use super::{
    split_healthy, BatchRequest, DialError, ReplicaCandidate, ReplicaInfo, RpcContext,
    RpcTransport, SendOptions, Transport,
};

/// Builds a dispatch session for one batch against one replica set.
///
/// This is the seam that lets callers swap the networked transport for an
/// in-process one in tests.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(
        &self,
        opts: SendOptions,
        ctx: &RpcContext,
        replicas: &[ReplicaInfo],
        args: BatchRequest,
    ) -> anyhow::Result<Box<dyn Transport>>;
}

/// Default factory: dials every replica through the `RpcContext`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RpcTransportFactory;

impl RpcTransportFactory {
    /// Build the concrete session; `build` boxes this.
    pub async fn build_rpc(
        &self,
        opts: SendOptions,
        ctx: &RpcContext,
        replicas: &[ReplicaInfo],
        args: BatchRequest,
    ) -> anyhow::Result<RpcTransport> {
        let mut candidates = Vec::with_capacity(replicas.len());
        for replica in replicas {
            let client = match ctx.dial(replica.addr).await {
                Ok(client) => client,
                Err(DialError::BreakerOpen(addr)) => {
                    tracing::debug!(
                        addr = %addr,
                        replica = %replica.descriptor,
                        "skipping replica with open circuit breaker"
                    );
                    continue;
                }
                Err(DialError::Failed(err)) => {
                    return Err(err.context(format!(
                        "failed to connect to replica {} at {}",
                        replica.descriptor, replica.addr
                    )));
                }
            };
            candidates.push(ReplicaCandidate::new(
                replica.addr,
                client,
                args.for_replica(replica.descriptor),
                ctx.is_conn_healthy(replica.addr),
            ));
        }

        // Put known-unhealthy replicas last.
        let healthy = split_healthy(&mut candidates);
        tracing::debug!(
            range_id = args.header.range_id,
            replicas = replicas.len(),
            candidates = candidates.len(),
            healthy = healthy,
            "built replica transport"
        );

        Ok(RpcTransport::new(
            opts,
            Arc::clone(ctx.local_registry()),
            candidates,
        ))
    }
}

#[async_trait]
impl TransportFactory for RpcTransportFactory {
    async fn build(
        &self,
        opts: SendOptions,
        ctx: &RpcContext,
        replicas: &[ReplicaInfo],
        args: BatchRequest,
    ) -> anyhow::Result<Box<dyn Transport>> {
        let transport = self.build_rpc(opts, ctx, replicas, args).await?;
        Ok(Box::new(transport))
    }
}
