//! Docker client: core struct, constructor, error types.
//!
//! Domain methods live in sibling modules (`container`, `event`, `exec`)
//! which add `impl DockerClient` blocks.

use bollard::Docker;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("Docker connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Container not found: {0}")]
    ContainerNotFound(String),
    #[error("Stream closed")]
    StreamClosed,
    #[error("Invalid log range: {0}")]
    InvalidSince(String),
    #[error("Bollard error: {0}")]
    BollardError(#[from] bollard::errors::Error),
}

impl DockerError {
    /// Maps a 404 from the engine onto `ContainerNotFound`.
    pub(super) fn not_found(name: &str, err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => DockerError::ContainerNotFound(name.to_string()),
            other => DockerError::BollardError(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerClient {
    /// `pub(super)` so that domain modules in sibling files can call
    /// bollard APIs directly.
    pub(super) client: Docker,
}

impl DockerClient {
    pub fn new(socket_path: &str) -> Result<Self, DockerError> {
        let connection = if socket_path.is_empty() {
            Docker::connect_with_defaults()
                .map_err(|e| DockerError::ConnectionFailed(e.to_string()))?
        } else {
            let clean_path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(clean_path, 120, &bollard::API_DEFAULT_VERSION)
                .map_err(|e| DockerError::ConnectionFailed(e.to_string()))?
        };

        Ok(DockerClient { client: connection })
    }

    /// Round-trip to the daemon, used at boot to fail fast on a bad socket.
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.client.ping().await?;
        Ok(())
    }
}
