//! Runtime configuration for replica dispatch.
//!
//! Options follow the node binary's convention: a long flag plus a
//! `HOLO_*` environment override, with defaults suited to a LAN cluster.

use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{BreakerConfig, SendOptions};

/// Dispatch tuning knobs.
#[derive(Parser, Debug, Clone)]
pub struct DispatchArgs {
    /// Maximum duration of one replica RPC (ms). `0` disables the deadline.
    #[arg(long, env = "HOLO_DISPATCH_RPC_TIMEOUT_MS", default_value_t = 5_000)]
    pub rpc_timeout_ms: u64,

    /// Delay before the caller fans out to the next replica (ms).
    #[arg(long, env = "HOLO_DISPATCH_SEND_NEXT_TIMEOUT_MS", default_value_t = 500)]
    pub send_next_timeout_ms: u64,

    /// Serve batches for replicas hosted in this process without an RPC.
    #[arg(
        long,
        env = "HOLO_ENABLE_LOCAL_CALLS",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_parser = clap::value_parser!(bool)
    )]
    pub enable_local_calls: bool,

    /// Consecutive connection failures before a replica address is skipped.
    #[arg(long, env = "HOLO_DISPATCH_BREAKER_FAILURES", default_value_t = 3)]
    pub breaker_failure_threshold: u32,

    /// How long an open breaker skips an address before probing it again (ms).
    #[arg(long, env = "HOLO_DISPATCH_BREAKER_OPEN_MS", default_value_t = 1_000)]
    pub breaker_open_ms: u64,
}

impl DispatchArgs {
    pub fn send_options(&self, cancel: CancellationToken) -> SendOptions {
        SendOptions {
            cancel,
            send_next_timeout: Duration::from_millis(self.send_next_timeout_ms),
            timeout: (self.rpc_timeout_ms > 0).then(|| Duration::from_millis(self.rpc_timeout_ms)),
            enable_local_calls: self.enable_local_calls,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold.max(1),
            open_for: Duration::from_millis(self.breaker_open_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_local_calls_and_deadline() {
        let args = DispatchArgs::try_parse_from(["dispatch"]).expect("parse defaults");
        let opts = args.send_options(CancellationToken::new());
        assert!(opts.enable_local_calls);
        assert_eq!(opts.timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts.send_next_timeout, Duration::from_millis(500));
        assert_eq!(args.breaker_config().failure_threshold, 3);
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let args = DispatchArgs::try_parse_from([
            "dispatch",
            "--rpc-timeout-ms",
            "0",
            "--enable-local-calls",
            "false",
            "--breaker-failure-threshold",
            "0",
        ])
        .expect("parse flags");
        let opts = args.send_options(CancellationToken::new());
        assert_eq!(opts.timeout, None);
        assert!(!opts.enable_local_calls);
        assert_eq!(args.breaker_config().failure_threshold, 1);
    }
}
