use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid route key {key:?}: {reason}")]
    InvalidRouteKey { key: String, reason: String },
    #[error("priority {0} is outside the allowed range 0..={limit}", limit = crate::PRIORITY_LIMIT)]
    InvalidPriority(i64),
    #[error("bind TCP listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("get TCP listener socket address: {0}")]
    GetTCPListenerAddress(io::Error),
    #[error("close TCP listener: {0}")]
    Close(tokio::task::JoinError),
    #[error("req_count did not reach {target_count} within {timeout:?} (current count: {current_count})")]
    AwaitReqCountTimeout {
        current_count: u64,
        target_count: u64,
        timeout: Duration,
    },
}
