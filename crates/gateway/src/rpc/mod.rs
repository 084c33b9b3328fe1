//! Upstream RPC plumbing.
//!
//! [`conn::ResilientConnection`] keeps one live link per upstream and is
//! agnostic of the wire protocol; [`grpc`] plugs tonic into it and
//! [`jsonrpc`] talks JSON-RPC over HTTP for the chain nodes.

pub mod conn;
pub mod grpc;
pub mod jsonrpc;
pub mod proto;

use thiserror::Error;

/// Failure to establish a link. Always retried by the connection loop.
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("Credential error: {0}")]
    Credential(String),
    #[error("Connection failed: {0}")]
    Unavailable(String),
    #[error("Connection worker failed: {0}")]
    Worker(String),
}

/// Failure of a single upstream call.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("no client")]
    NoClient,
    #[error("deadline exceeded")]
    Timeout,
    #[error("rpc error: code = {:?} desc = {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{message} (code {code})")]
    Remote { code: i64, message: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// True when the upstream never answered: no link yet, unreachable or too slow.
    pub fn is_unreachable(&self) -> bool {
        match self {
            RpcError::NoClient | RpcError::Timeout => true,
            RpcError::Http(e) => e.is_connect() || e.is_timeout(),
            RpcError::Status(s) => s.code() == tonic::Code::Unavailable,
            _ => false,
        }
    }
}
