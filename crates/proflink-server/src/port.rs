use crate::error::PoolError;
use tokio::net::TcpListener;

/// Ask the OS for a currently-free loopback port.
///
/// The probe listener is dropped before returning, so the port is only free
/// in the sense that nothing held it at probe time. The viewer binds it
/// immediately afterwards; the window in between is accepted.
pub async fn allocate() -> Result<u16, PoolError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(PoolError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(PoolError::PortAllocation)?
        .port();
    Ok(port)
}
