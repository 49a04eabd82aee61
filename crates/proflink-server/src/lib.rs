//! On-demand viewer pool and reverse proxy for stored profiling runs.
//!
//! Browser requests under the route prefix are keyed by their first six
//! path segments; each key lazily gets its own viewer process serving that
//! run, discovered by probing, evicted on a fixed ttl, and fronted by a
//! rewriting proxy.

pub mod artifacts;
pub mod assets;
pub mod config;
pub mod error;
pub mod http;
pub mod port;
pub mod probe;
pub mod proxy;
pub mod registry;
pub mod viewer;

pub use config::RelayConfig;
pub use error::PoolError;
pub use proxy::ProfileRoute;
pub use registry::{Session, SessionInfo, SessionRegistry};
