//! Replica dispatch crate.
//!
//! This crate sends one batched range request to the replicas that serve the
//! range. Higher layers supply the replica set and a `TransportFactory`, then
//! drive the returned `Transport` until a usable reply arrives or the replica
//! set is exhausted.

pub mod config;
pub mod dispatch;
