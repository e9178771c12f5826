//! Shared utilities for the vdqmctl subcommands.

use tokio::net::TcpStream;

use vdqm_core::{net, Connection};
use vdqm_proto::{VdqmError, VdqmResult};

/// Connect to the VDQM server.
pub async fn connect(addr: &str, port: u16) -> VdqmResult<Connection<TcpStream>> {
    let stream = net::connect_to(addr, port).await.map_err(|e| {
        eprintln!("Failed to connect to {}:{}", addr, port);
        e
    })?;
    Ok(Connection::new(stream))
}

/// Print a failed exchange and exit non-zero.
pub fn fail(what: &str, err: VdqmError) -> ! {
    eprintln!("{} failed: {}", what, err);
    std::process::exit(1);
}

/// The effective user name for submissions, unless overridden.
pub fn current_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".into())
}
