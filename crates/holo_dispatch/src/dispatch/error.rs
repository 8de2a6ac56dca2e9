use std::fmt;
use std::net::SocketAddr;

use super::ReplicaDescriptor;

/// Reasons a transport refuses to reprioritize a replica.
///
/// None of these are fatal: the caller keeps draining the remaining replicas
/// or escalates to a retry at a higher layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// The replica id is zero, so there is nothing to promote.
    InvalidReplica(ReplicaDescriptor),
    /// The replica was never part of this session's replica set.
    UnknownReplica(ReplicaDescriptor),
    /// Every replica has already been sent to.
    Exhausted,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::InvalidReplica(replica) => {
                write!(f, "new leaseholder is unknown (got {replica})")
            }
            DispatchError::UnknownReplica(replica) => {
                write!(f, "couldn't find client for replica {replica}")
            }
            DispatchError::Exhausted => f.write_str("transport is exhausted"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Failure to obtain a connection for a replica address.
#[derive(Debug)]
pub enum DialError {
    /// The address's circuit breaker is open; the replica should be skipped.
    BreakerOpen(SocketAddr),
    Failed(anyhow::Error),
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::BreakerOpen(addr) => write!(f, "circuit breaker open for {addr}"),
            DialError::Failed(err) => write!(f, "dial failed: {err}"),
        }
    }
}

impl std::error::Error for DialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DialError::BreakerOpen(_) => None,
            DialError::Failed(err) => Some(&**err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_replica() {
        let replica = ReplicaDescriptor::new(4, 1, 1, 2);
        assert_eq!(
            DispatchError::UnknownReplica(replica).to_string(),
            "couldn't find client for replica r4/2 (n1,s1)"
        );
        assert!(DispatchError::InvalidReplica(ReplicaDescriptor::default())
            .to_string()
            .starts_with("new leaseholder is unknown"));
    }

    #[test]
    fn dial_error_exposes_source() {
        use std::error::Error as _;

        let err = DialError::Failed(anyhow::anyhow!("connection refused"));
        assert_eq!(err.to_string(), "dial failed: connection refused");
        assert!(err.source().is_some());
        assert!(DialError::BreakerOpen("127.0.0.1:1".parse().unwrap())
            .source()
            .is_none());
    }
}
