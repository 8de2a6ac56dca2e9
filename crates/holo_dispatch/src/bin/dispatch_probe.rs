//! Drives batches through a simulated replica set and prints every send.
//!
//! Replicas live in this process behind a loopback dialer, so the probe
//! exercises replica ordering, leaseholder redirects and local calls
//! without a running cluster. Each replica outcome is written to stdout as
//! one JSON object; logs go to stderr.

use std::collections::{BTreeMap, HashMap};
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use holo_dispatch::config::DispatchArgs;
use holo_dispatch::dispatch::{
    BatchCall, BatchClient, BatchRequest, BatchResponse, Dialer, LocalHandler, ReplicaDescriptor,
    ReplicaInfo, ReplyError, Request, Response, RpcContext, RpcTransportFactory, SendOptions,
    TransportFactory,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

const BASE_PORT: u16 = 26_000;
const MAX_REPLICAS: u64 = 64;

/// CLI options for the dispatch probe.
#[derive(Parser, Debug)]
#[command(name = "dispatch-probe")]
struct Args {
    #[command(flatten)]
    dispatch: DispatchArgs,

    /// Range id stamped on every batch.
    #[arg(long, default_value_t = 7)]
    range_id: u64,

    /// Number of replicas in the simulated range (one per node).
    #[arg(long, default_value_t = 3)]
    replicas: u64,

    /// Node holding the lease; other replicas redirect to it.
    #[arg(long, default_value_t = 1)]
    leaseholder: u64,

    /// Node served in-process through the local registry (`0` for none).
    #[arg(long, default_value_t = 0)]
    local_node: u64,

    /// Comma-separated nodes whose RPCs fail and whose connections are
    /// reported unhealthy before dispatch.
    #[arg(long, value_delimiter = ',')]
    down: Vec<u64>,

    #[arg(long, default_value = "probe")]
    key: String,

    #[arg(long, default_value = "value")]
    value: String,
}

/// Data shared by every replica of the simulated range.
struct SimRange {
    leaseholder: ReplicaDescriptor,
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl SimRange {
    fn apply(&self, req: &BatchRequest) -> anyhow::Result<BatchResponse> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| anyhow::anyhow!("range data lock poisoned"))?;
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
                } => Response::Scan {
                    entries: data
                        .range(start_key.clone()..)
                        .take_while(|(k, _)| end_key.is_empty() || k.as_slice() < end_key.as_slice())
                        .take(if *limit == 0 { usize::MAX } else { *limit as usize })
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                },
            })
            .collect();
        Ok(BatchResponse {
            responses,
            error: None,
        })
    }
}

/// One replica of the simulated range.
struct SimReplica {
    descriptor: ReplicaDescriptor,
    range: Arc<SimRange>,
    down: bool,
}

impl SimReplica {
    fn serve(&self, req: &BatchRequest) -> anyhow::Result<BatchResponse> {
        if self.down {
            anyhow::bail!("replica {} is down", self.descriptor);
        }
        if self.descriptor != self.range.leaseholder {
            return Ok(BatchResponse::with_error(ReplyError::not_leaseholder(Some(
                self.range.leaseholder,
            ))));
        }
        self.range.apply(req)
    }
}

#[async_trait]
impl BatchClient for SimReplica {
    async fn batch(&self, req: BatchRequest) -> anyhow::Result<BatchResponse> {
        self.serve(&req)
    }
}

#[async_trait]
impl LocalHandler for SimReplica {
    async fn batch(&self, req: BatchRequest) -> anyhow::Result<BatchResponse> {
        self.serve(&req)
    }
}

/// Hands out in-process replicas by address.
struct LoopbackDialer {
    replicas: HashMap<SocketAddr, Arc<SimReplica>>,
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn BatchClient>> {
        match self.replicas.get(&addr) {
            Some(replica) => Ok(Arc::clone(replica) as Arc<dyn BatchClient>),
            None => anyhow::bail!("no replica listening on {addr}"),
        }
    }
}

/// One line of probe output.
#[derive(Serialize)]
struct SendRecord<'a> {
    op: &'a str,
    addr: SocketAddr,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl<'a> SendRecord<'a> {
    fn from_call(op: &'a str, call: &BatchCall) -> Self {
        let (outcome, detail) = match &call.result {
            Ok(reply) => match &reply.error {
                Some(err) => ("reply_error", Some(err.to_string())),
                None => ("ok", None),
            },
            Err(err) => ("transport_error", Some(format!("{err:#}"))),
        };
        Self {
            op,
            addr: call.addr,
            outcome,
            detail,
        }
    }
}

fn node_addr(node_id: u64) -> SocketAddr {
    // Node ids are bounded by MAX_REPLICAS.
    SocketAddr::from(([127, 0, 0, 1], BASE_PORT + node_id as u16))
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the probe.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stderr is a terminal and NO_COLOR is unset.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    run(Args::parse()).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    anyhow::ensure!(args.range_id > 0, "--range-id must be > 0");
    anyhow::ensure!(
        (1..=MAX_REPLICAS).contains(&args.replicas),
        "--replicas must be between 1 and {MAX_REPLICAS}"
    );
    anyhow::ensure!(
        (1..=args.replicas).contains(&args.leaseholder),
        "--leaseholder must name one of the {} replicas",
        args.replicas
    );
    anyhow::ensure!(
        args.local_node <= args.replicas,
        "--local-node must be 0 or one of the replicas"
    );
    anyhow::ensure!(
        args.down.iter().all(|id| (1..=args.replicas).contains(id)),
        "--down must only name replicas"
    );

    let descriptor = |node_id: u64| ReplicaDescriptor::new(args.range_id, node_id, node_id, node_id);
    let range = Arc::new(SimRange {
        leaseholder: descriptor(args.leaseholder),
        data: Mutex::new(BTreeMap::new()),
    });

    let mut sims = HashMap::new();
    let mut replicas = Vec::new();
    for node_id in 1..=args.replicas {
        let sim = Arc::new(SimReplica {
            descriptor: descriptor(node_id),
            range: Arc::clone(&range),
            down: args.down.contains(&node_id),
        });
        sims.insert(node_addr(node_id), sim);
        replicas.push(ReplicaInfo::new(descriptor(node_id), node_addr(node_id)));
    }

    let dialer = Arc::new(LoopbackDialer {
        replicas: sims.clone(),
    });
    let ctx = RpcContext::new(dialer, args.dispatch.breaker_config());
    for node_id in &args.down {
        ctx.record_failure(node_addr(*node_id));
    }

    let _registration = if args.local_node > 0 {
        let handler: Arc<dyn LocalHandler> = sims
            .get(&node_addr(args.local_node))
            .cloned()
            .context("local node has no replica")?;
        Some(
            ctx.local_registry()
                .register(node_addr(args.local_node), &handler),
        )
    } else {
        None
    };

    tracing::info!(
        range_id = args.range_id,
        replicas = args.replicas,
        leaseholder = args.leaseholder,
        local_node = args.local_node,
        down = ?args.down,
        "starting dispatch probe"
    );

    let cancel = CancellationToken::new();
    let key = args.key.as_bytes().to_vec();
    let put = BatchRequest::new(
        args.range_id,
        vec![Request::Put {
            key: key.clone(),
            value: args.value.as_bytes().to_vec(),
        }],
    );
    let get = BatchRequest::new(args.range_id, vec![Request::Get { key }]);

    let opts = args.dispatch.send_options(cancel.child_token());
    let reply = send_batch("put", &RpcTransportFactory, &ctx, opts, &replicas, put).await?;
    anyhow::ensure!(reply.is_some(), "put was not acknowledged by any replica");

    let opts = args.dispatch.send_options(cancel.child_token());
    let reply = send_batch("get", &RpcTransportFactory, &ctx, opts, &replicas, get)
        .await?
        .context("get was not answered by any replica")?;
    if let Some(Response::Get { value }) = reply.responses.first() {
        let value = value.as_deref().map(String::from_utf8_lossy);
        println!("{}", serde_json::json!({ "op": "get", "value": value }));
    }
    Ok(())
}

/// Dispatch one batch: send to the first replica, fan out to the next one
/// when no outcome arrives within the send-next delay, follow leaseholder
/// hints and stop at the first reply without a redirect.
async fn send_batch(
    op: &str,
    factory: &dyn TransportFactory,
    ctx: &RpcContext,
    opts: SendOptions,
    replicas: &[ReplicaInfo],
    args: BatchRequest,
) -> anyhow::Result<Option<BatchResponse>> {
    let send_next_timeout = opts.send_next_timeout;
    let mut transport = factory
        .build(opts, ctx, replicas, args)
        .await
        .with_context(|| format!("build transport for {op}"))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut in_flight = 0usize;

    let reply = loop {
        if in_flight == 0 {
            if transport.is_exhausted() {
                break None;
            }
            let addr = transport.send_next(&tx).await;
            in_flight += 1;
            tracing::debug!(op, addr = %addr, "sent batch");
        }

        let call = match time::timeout(send_next_timeout, rx.recv()).await {
            Ok(Some(call)) => call,
            Ok(None) => break None,
            Err(_) => {
                if !transport.is_exhausted() {
                    let addr = transport.send_next(&tx).await;
                    in_flight += 1;
                    tracing::debug!(op, addr = %addr, "no outcome yet, sent to next replica");
                }
                continue;
            }
        };
        in_flight -= 1;
        println!("{}", serde_json::to_string(&SendRecord::from_call(op, &call))?);

        match call.result {
            Ok(resp) => match resp.error.as_ref().and_then(|e| e.leaseholder) {
                Some(leaseholder) => {
                    if let Err(err) = transport.try_next(&leaseholder) {
                        tracing::debug!(op, error = %err, "leaseholder hint not usable");
                    }
                }
                None => break Some(resp),
            },
            Err(err) => {
                tracing::warn!(op, addr = %call.addr, error = ?err, "replica send failed");
            }
        }
    };

    transport.close();
    Ok(reply)
}
