//! Async TCP socket helpers.

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};
use vdqm_proto::{VdqmError, VdqmResult};

/// Connect to a VDQM server by address and port.
pub async fn connect_to(addr: &str, port: u16) -> VdqmResult<TcpStream> {
    let target = format!("{}:{}", addr, port);
    debug!("connecting to {}", target);

    let stream = TcpStream::connect(&target)
        .await
        .map_err(|_| VdqmError::NetworkError)?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Connect to a socket address.
pub async fn connect_to_addr(addr: SocketAddr) -> VdqmResult<TcpStream> {
    debug!("connecting to {}", addr);
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|_| VdqmError::NetworkError)?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Create a TCP listener on the given address and port.
pub async fn create_listen_socket(bind_addr: &str, port: u16) -> VdqmResult<TcpListener> {
    let addr = format!("{}:{}", bind_addr, port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!("failed to bind to {}: {}", addr, e);
        VdqmError::SystemError
    })?;

    debug!("listening on {}", addr);
    Ok(listener)
}
