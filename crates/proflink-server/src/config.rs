use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address for the public server.
    pub bind: SocketAddr,
    /// Path prefix routed to viewer sessions.
    pub route_prefix: String,
    /// Viewer executable, resolved through PATH.
    pub viewer_bin: String,
    /// Directory staging dirs are created under.
    pub work_root: PathBuf,
    /// Directory of prebuilt dashboard assets; None disables static serving.
    pub assets_dir: Option<PathBuf>,
    /// How long a session lives after registration. This is a fixed window:
    /// traffic does not extend it.
    pub session_ttl: Duration,
    /// Deadline for one proxied request.
    pub request_timeout: Duration,
    /// Total time to wait for a fresh viewer to announce itself.
    pub probe_timeout: Duration,
    /// Pause between discovery probes.
    pub probe_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            route_prefix: "/profile".into(),
            viewer_bin: "samply".into(),
            work_root: std::env::temp_dir(),
            assets_dir: None,
            session_ttl: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_millis(100),
        }
    }
}
