//! Dispatch module wiring.
//!
//! `types` defines the batch payloads and the client/handler contracts,
//! `candidate` and `order` hold the per-attempt replica ordering, `transport`
//! and `sender` implement the dispatch sessions, `factory` builds them, and
//! `context`/`local` provide the connection capabilities they consume.

mod candidate;
mod context;
mod error;
mod factory;
mod local;
mod order;
mod sender;
mod transport;
mod types;

pub use candidate::{split_healthy, ReplicaCandidate};
pub use context::{BreakerConfig, RpcContext};
pub use error::{DialError, DispatchError};
pub use factory::{RpcTransportFactory, TransportFactory};
pub use local::{LocalRegistration, LocalRegistry};
pub use sender::{Sender, SenderTransport, SenderTransportFactory};
pub use transport::{RpcTransport, Transport};
pub use types::{
    BatchCall, BatchClient, BatchHeader, BatchRequest, BatchResponse, Dialer, LocalHandler,
    NodeId, RangeId, ReplicaDescriptor, ReplicaId, ReplicaInfo, ReplyError, Request, Response,
    SendOptions, StoreId,
};
