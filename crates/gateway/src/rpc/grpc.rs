//! gRPC connector: tonic channels with TLS trust and macaroon credentials.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic::{Request, Response, Status};
use tracing::debug;

use super::conn::Connect;
use super::{ConnectError, RpcError};
use crate::runtime::BoxFuture;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel with the macaroon attached to every call.
pub type AuthedChannel = InterceptedService<Channel, MacaroonInterceptor>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcTarget {
    pub host: String,
    pub port: u16,
    /// PEM certificate the upstream presents. Plaintext when absent.
    pub tls_cert: Option<PathBuf>,
    pub macaroon: Option<PathBuf>,
}

impl GrpcTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls_cert: None,
            macaroon: None,
        }
    }

    pub fn with_tls_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_cert = Some(path.into());
        self
    }

    pub fn with_macaroon(mut self, path: impl Into<PathBuf>) -> Self {
        self.macaroon = Some(path.into());
        self
    }

    fn uri(&self) -> String {
        let scheme = if self.tls_cert.is_some() { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl fmt::Display for GrpcTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Adds the hex-encoded macaroon as `macaroon` metadata.
#[derive(Clone, Default)]
pub struct MacaroonInterceptor {
    macaroon: Option<MetadataValue<Ascii>>,
}

impl MacaroonInterceptor {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ConnectError> {
        let value = hex::encode(raw)
            .parse::<MetadataValue<Ascii>>()
            .map_err(|e| ConnectError::Credential(format!("Invalid macaroon: {}", e)))?;
        Ok(Self {
            macaroon: Some(value),
        })
    }

    async fn load(path: Option<&PathBuf>) -> Result<Self, ConnectError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = tokio::fs::read(path).await.map_err(|e| {
            ConnectError::Credential(format!("Failed to read macaroon {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&raw)
    }
}

impl Interceptor for MacaroonInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(macaroon) = &self.macaroon {
            request.metadata_mut().insert("macaroon", macaroon.clone());
        }
        Ok(request)
    }
}

/// Dials a tonic channel and wraps it into a generated client.
pub struct GrpcConnector<C> {
    make_client: Box<dyn Fn(AuthedChannel) -> C + Send + Sync>,
}

impl<C> GrpcConnector<C> {
    pub fn new<F>(make_client: F) -> Self
    where
        F: Fn(AuthedChannel) -> C + Send + Sync + 'static,
    {
        Self {
            make_client: Box::new(make_client),
        }
    }
}

impl<C: Clone + Send + Sync + 'static> Connect for GrpcConnector<C> {
    type Target = GrpcTarget;
    type Client = C;

    fn connect<'a>(&'a self, target: &'a GrpcTarget) -> BoxFuture<'a, Result<C, ConnectError>> {
        Box::pin(async move {
            let mut endpoint = Channel::from_shared(target.uri())
                .map_err(|e| ConnectError::InvalidTarget(format!("Invalid address: {}", e)))?
                .connect_timeout(CONNECT_TIMEOUT)
                .tcp_keepalive(Some(Duration::from_secs(60)));

            if let Some(cert_path) = &target.tls_cert {
                let pem = tokio::fs::read(cert_path).await.map_err(|e| {
                    ConnectError::Tls(format!(
                        "Failed to read TLS certificate {}: {}",
                        cert_path.display(),
                        e
                    ))
                })?;
                // Node certificates are issued for localhost
                let tls_config = ClientTlsConfig::new()
                    .ca_certificate(Certificate::from_pem(pem))
                    .domain_name("localhost");
                endpoint = endpoint
                    .tls_config(tls_config)
                    .map_err(|e| ConnectError::Tls(format!("TLS config error: {}", e)))?;
            }

            let interceptor = MacaroonInterceptor::load(target.macaroon.as_ref()).await?;

            let channel = endpoint.connect().await.map_err(|e| {
                ConnectError::Unavailable(format!("Failed to connect to {}: {}", target, e))
            })?;

            debug!(target = %target, "gRPC channel established");
            Ok((self.make_client)(InterceptedService::new(channel, interceptor)))
        })
    }
}

/// Applies the remaining time before `deadline` as the call's `grpc-timeout`.
pub fn request_with_deadline<T>(message: T, deadline: Instant) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(deadline.saturating_duration_since(Instant::now()));
    request
}

/// Await a unary call, giving up locally at `deadline` as well.
pub async fn unary<T, F>(deadline: Instant, call: F) -> Result<T, RpcError>
where
    F: Future<Output = Result<Response<T>, Status>>,
{
    let response = tokio::time::timeout_at(deadline, call)
        .await
        .map_err(|_| RpcError::Timeout)??;
    Ok(response.into_inner())
}
