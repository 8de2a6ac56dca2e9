//! Shared types for replica dispatch.
//!
//! These types are kept free of session state because they are used by the
//! transports, the factories, and the connection layer that backs them.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Logical identifier for a key range.
pub type RangeId = u64;
/// Replica identifier within a range. Zero means unknown.
pub type ReplicaId = u64;
/// Store identifier on a node.
pub type StoreId = u64;
/// Cluster node identifier.
pub type NodeId = u64;

/// Identity of one replica of a range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub range_id: RangeId,
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

impl ReplicaDescriptor {
    pub const fn new(
        range_id: RangeId,
        node_id: NodeId,
        store_id: StoreId,
        replica_id: ReplicaId,
    ) -> Self {
        Self {
            range_id,
            node_id,
            store_id,
            replica_id,
        }
    }

    /// A replica id of zero never names a real replica.
    pub fn is_valid(&self) -> bool {
        self.replica_id != 0
    }
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r{}/{} (n{},s{})",
            self.range_id, self.replica_id, self.node_id, self.store_id
        )
    }
}

/// Replica descriptor plus the address of the node hosting it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub descriptor: ReplicaDescriptor,
    pub addr: SocketAddr,
}

impl ReplicaInfo {
    pub fn new(descriptor: ReplicaDescriptor, addr: SocketAddr) -> Self {
        Self { descriptor, addr }
    }
}

/// Header stamped on every batch; `replica` names the intended recipient.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub range_id: RangeId,
    pub replica: ReplicaDescriptor,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Get {
        key: Vec<u8>,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
    },
    Scan {
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        /// Zero means unbounded.
        limit: u32,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::Put { .. } => "put",
            Request::Delete { .. } => "delete",
            Request::Scan { .. } => "scan",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Get { value: Option<Vec<u8>> },
    Put,
    Delete { deleted: bool },
    Scan { entries: Vec<(Vec<u8>, Vec<u8>)> },
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Get { .. } => "get",
            Response::Put => "put",
            Response::Delete { .. } => "delete",
            Response::Scan { .. } => "scan",
        }
    }

    /// Check that this response is a plausible answer to `req`.
    pub fn verify(&self, req: &Request) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.kind() == req.kind(),
            "{} response returned for {} request",
            self.kind(),
            req.kind()
        );
        if let (Response::Scan { entries }, Request::Scan { limit, .. }) = (self, req) {
            anyhow::ensure!(
                *limit == 0 || entries.len() <= *limit as usize,
                "scan returned {} entries over limit {limit}",
                entries.len()
            );
        }
        Ok(())
    }
}

/// One batched operation against a single range.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub header: BatchHeader,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    pub fn new(range_id: RangeId, requests: Vec<Request>) -> Self {
        Self {
            header: BatchHeader {
                range_id,
                replica: ReplicaDescriptor::default(),
            },
            requests,
        }
    }

    /// Copy of this batch addressed to `replica`.
    pub fn for_replica(&self, replica: ReplicaDescriptor) -> Self {
        let mut copy = self.clone();
        copy.header.replica = replica;
        copy
    }
}

/// Application-level error carried inside a reply.
///
/// Dispatch never interprets these; callers inspect them and decide whether
/// to promote `leaseholder` or move on to the next replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    pub message: String,
    /// Replica the responder believes holds the range lease, if known.
    pub leaseholder: Option<ReplicaDescriptor>,
}

impl ReplyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            leaseholder: None,
        }
    }

    pub fn not_leaseholder(leaseholder: Option<ReplicaDescriptor>) -> Self {
        Self {
            message: "replica is not the leaseholder".to_string(),
            leaseholder,
        }
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.leaseholder {
            Some(leaseholder) => write!(f, "{} (leaseholder {leaseholder})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub responses: Vec<Response>,
    pub error: Option<ReplyError>,
}

impl BatchResponse {
    pub fn with_error(error: ReplyError) -> Self {
        Self {
            responses: Vec::new(),
            error: Some(error),
        }
    }
}

/// Outcome of one `send_next`: a reply or a transport error.
///
/// A reply may still carry an embedded `ReplyError`; that is not a transport
/// failure.
#[derive(Debug)]
pub struct BatchCall {
    pub addr: SocketAddr,
    pub result: anyhow::Result<BatchResponse>,
}

impl BatchCall {
    pub fn reply(&self) -> Option<&BatchResponse> {
        self.result.as_ref().ok()
    }
}

/// Algorithm parameters for sending one batch to a replica set.
///
/// Fixed for the life of a session.
#[derive(Clone, Debug)]
pub struct SendOptions {
    /// Cancelling this token abandons every in-flight send of the session.
    pub cancel: CancellationToken,
    /// Delay after which the caller should try another replica while an
    /// earlier send is still pending. Enforced by the caller, not here.
    pub send_next_timeout: Duration,
    /// Maximum duration of one RPC. `None` disables the deadline.
    pub timeout: Option<Duration>,
    /// Dispatch to in-process handlers without going through the network.
    pub enable_local_calls: bool,
}

impl SendOptions {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            send_next_timeout: Duration::from_millis(500),
            timeout: Some(Duration::from_secs(5)),
            enable_local_calls: true,
        }
    }

    /// Await `fut` under the per-call deadline.
    pub(crate) async fn with_timeout<T, F>(&self, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match self.timeout {
            Some(timeout) => time::timeout(timeout, fut)
                .await
                .map_err(|_| anyhow::anyhow!("batch rpc timed out after {timeout:?}"))?,
            None => fut.await,
        }
    }
}

/// Network RPC endpoint for one node.
#[async_trait]
pub trait BatchClient: Send + Sync + 'static {
    async fn batch(&self, req: BatchRequest) -> anyhow::Result<BatchResponse>;
}

/// Handler for batches addressed to a node living in this process.
#[async_trait]
pub trait LocalHandler: Send + Sync + 'static {
    async fn batch(&self, req: BatchRequest) -> anyhow::Result<BatchResponse>;
}

/// Connection establishment, supplied by the embedding node.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn BatchClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_rejects_mismatched_kind() {
        let req = Request::Get { key: b"a".to_vec() };
        assert!(Response::Get { value: None }.verify(&req).is_ok());
        let err = Response::Put.verify(&req).expect_err("kind mismatch");
        assert!(err.to_string().contains("put response returned for get request"));
    }

    #[test]
    fn verify_enforces_scan_limit() {
        let req = Request::Scan {
            start_key: Vec::new(),
            end_key: Vec::new(),
            limit: 1,
        };
        let entries = vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())];
        assert!(Response::Scan { entries }.verify(&req).is_err());
    }

    #[test]
    fn for_replica_stamps_header_only() {
        let args = BatchRequest::new(7, vec![Request::Get { key: b"k".to_vec() }]);
        let replica = ReplicaDescriptor::new(7, 2, 2, 3);
        let stamped = args.for_replica(replica);
        assert_eq!(stamped.header.replica, replica);
        assert_eq!(stamped.header.range_id, 7);
        assert_eq!(stamped.requests, args.requests);
        assert!(!args.header.replica.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_reports_elapsed_deadline() {
        let mut opts = SendOptions::new(CancellationToken::new());
        opts.timeout = Some(Duration::from_millis(10));
        let res: anyhow::Result<()> = opts
            .with_timeout(async {
                time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(res.expect_err("deadline").to_string().contains("timed out"));

        opts.timeout = None;
        let res = opts.with_timeout(async { Ok(5u8) }).await;
        assert_eq!(res.expect("no deadline"), 5);
    }
}
