//! Shared fakes and helpers for dispatch integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use holo_dispatch::dispatch::{
    BatchCall, BatchClient, BatchRequest, BatchResponse, BreakerConfig, Dialer, LocalHandler,
    ReplicaDescriptor, ReplicaInfo, ReplyError, Request, Response, RpcContext, SendOptions,
    TransportFactory,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const RANGE_ID: u64 = 7;

pub fn addr(node_id: u64) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40_000 + node_id as u16))
}

pub fn replica(node_id: u64) -> ReplicaDescriptor {
    ReplicaDescriptor::new(RANGE_ID, node_id, node_id, node_id)
}

/// Replicas 1..=n, one per node.
pub fn replicas(n: u64) -> Vec<ReplicaInfo> {
    (1..=n)
        .map(|id| ReplicaInfo::new(replica(id), addr(id)))
        .collect()
}

pub fn ids(replicas: &[ReplicaDescriptor]) -> Vec<u64> {
    replicas.iter().map(|r| r.replica_id).collect()
}

pub fn get(key: &str) -> BatchRequest {
    BatchRequest::new(RANGE_ID, vec![Request::Get { key: key.as_bytes().to_vec() }])
}

pub fn put(key: &str, value: &str) -> BatchRequest {
    BatchRequest::new(
        RANGE_ID,
        vec![Request::Put {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }],
    )
}

pub fn opts() -> SendOptions {
    SendOptions::new(CancellationToken::new())
}

/// Behaviour of one fake replica endpoint.
#[derive(Clone, Debug)]
pub enum Script {
    /// Serve the batch from the shared in-memory store.
    Serve,
    /// Reply with a not-leaseholder error naming `leaseholder`.
    Redirect(Option<ReplicaDescriptor>),
    /// Fail at the transport level.
    Fail,
    /// Serve after a delay.
    Slow(Duration),
}

/// Simple ordered KV map shared by fake replicas.
#[derive(Default)]
pub struct MemStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn apply(&self, req: &BatchRequest) -> BatchResponse {
        let mut data = self.data.lock().unwrap();
        let responses = req
            .requests
            .iter()
            .map(|r| match r {
                Request::Get { key } => Response::Get {
                    value: data.get(key).cloned(),
                },
                Request::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                    Response::Put
                }
                Request::Delete { key } => Response::Delete {
                    deleted: data.remove(key).is_some(),
                },
                Request::Scan {
                    start_key,
                    end_key,
                    limit,
                } => {
                    let entries = data
                        .range(start_key.clone()..)
                        .take_while(|(k, _)| end_key.is_empty() || k.as_slice() < end_key.as_slice())
                        .take(if *limit == 0 { usize::MAX } else { *limit as usize })
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    Response::Scan { entries }
                }
            })
            .collect();
        BatchResponse {
            responses,
            error: None,
        }
    }
}

#[async_trait]
impl LocalHandler for MemStore {
    async fn batch(&self, req: BatchRequest) -> anyhow::Result<BatchResponse> {
        Ok(self.apply(&req))
    }
}

pub struct ScriptedClient {
    pub addr: SocketAddr,
    pub script: Script,
    pub store: Arc<MemStore>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl BatchClient for ScriptedClient {
    async fn batch(&self, req: BatchRequest) -> anyhow::Result<BatchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Serve => Ok(self.store.apply(&req)),
            Script::Redirect(leaseholder) => {
                Ok(BatchResponse::with_error(ReplyError::not_leaseholder(*leaseholder)))
            }
            Script::Fail => anyhow::bail!("connection reset by {}", self.addr),
            Script::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(self.store.apply(&req))
            }
        }
    }
}

/// Dialer handing out scripted clients; unknown addresses fail to dial.
pub struct FakeDialer {
    clients: HashMap<SocketAddr, Arc<ScriptedClient>>,
    pub dials: AtomicUsize,
}

impl FakeDialer {
    pub fn new(store: Arc<MemStore>, scripts: &[(u64, Script)]) -> Arc<Self> {
        let clients = scripts
            .iter()
            .map(|(node_id, script)| {
                let client = Arc::new(ScriptedClient {
                    addr: addr(*node_id),
                    script: script.clone(),
                    store: Arc::clone(&store),
                    calls: AtomicUsize::new(0),
                });
                (addr(*node_id), client)
            })
            .collect();
        Arc::new(Self {
            clients,
            dials: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self, node_id: u64) -> usize {
        self.clients
            .get(&addr(node_id))
            .map_or(0, |c| c.calls.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn BatchClient>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        match self.clients.get(&addr) {
            Some(client) => Ok(Arc::clone(client) as Arc<dyn BatchClient>),
            None => anyhow::bail!("connection refused by {addr}"),
        }
    }
}

pub fn context(dialer: Arc<FakeDialer>, failure_threshold: u32) -> RpcContext {
    RpcContext::new(
        dialer,
        BreakerConfig {
            failure_threshold,
            open_for: Duration::from_secs(60),
        },
    )
}

/// Result of driving a session to completion.
#[derive(Debug)]
pub struct DispatchTrace {
    pub sent: Vec<SocketAddr>,
    pub reply: Option<BatchResponse>,
}

/// Drive a session the way a range coordinator does: send, wait, follow
/// leaseholder redirects, and move on after transport errors.
pub async fn dispatch(
    factory: &dyn TransportFactory,
    ctx: &RpcContext,
    replicas: &[ReplicaInfo],
    args: BatchRequest,
) -> anyhow::Result<DispatchTrace> {
    let mut transport = factory.build(opts(), ctx, replicas, args).await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<BatchCall>();
    let mut sent = Vec::new();
    let mut reply = None;

    while !transport.is_exhausted() {
        sent.push(transport.send_next(&tx).await);
        let Some(call) = rx.recv().await else {
            break;
        };
        match call.result {
            Ok(resp) => match resp.error.as_ref().and_then(|e| e.leaseholder) {
                Some(leaseholder) => {
                    // Unknown or invalid hints fall back to the remaining order.
                    let _ = transport.try_next(&leaseholder);
                    reply = Some(resp);
                }
                None => {
                    reply = Some(resp);
                    break;
                }
            },
            Err(_) => continue,
        }
    }

    transport.close();
    Ok(DispatchTrace { sent, reply })
}
