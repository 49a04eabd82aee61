use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures creating or serving a viewer session.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("port allocation failed: {0}")]
    PortAllocation(#[source] std::io::Error),
    #[error("no profile stored for {key}")]
    ProfileNotFound { key: String },
    #[error("artifact store error: {0}")]
    Store(#[from] proflink_store::StoreError),
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch viewer '{bin}': {source}")]
    Launch {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("viewer on port {port} did not announce a session within {timeout:?}")]
    DiscoveryTimeout { port: u16, timeout: Duration },
    #[error("viewer for {key} is not ready")]
    NotReady { key: String },
    #[error("proxy request to viewer on port {port} timed out")]
    ProxyTimeout { port: u16 },
    #[error("proxy request to viewer on port {port} failed: {source}")]
    Transport {
        port: u16,
        #[source]
        source: reqwest::Error,
    },
}
