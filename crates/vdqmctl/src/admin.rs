//! Administrative subcommands: hold, release, shutdown.
//!
//! These are the CLI face of the admin request codes; there is no
//! separate control channel.

use clap::{Args, Subcommand};

use vdqm_proto::VdqmRequest;

use crate::common;

#[derive(Args)]
pub struct AdminArgs {
    #[command(subcommand)]
    command: AdminCommand,
}

#[derive(Subcommand)]
enum AdminCommand {
    /// Stop admitting new requests
    Hold,
    /// Resume admitting requests
    Release,
    /// Hold and stop accepting connections
    Shutdown,
}

pub async fn run(addr: &str, port: u16, args: AdminArgs) {
    let (what, req) = match args.command {
        AdminCommand::Hold => ("hold", VdqmRequest::Hold),
        AdminCommand::Release => ("release", VdqmRequest::Release),
        AdminCommand::Shutdown => ("shutdown", VdqmRequest::Shutdown),
    };

    let mut conn = match common::connect(addr, port).await {
        Ok(conn) => conn,
        Err(e) => common::fail("connect", e),
    };
    match conn.exchange_no_body(&req).await {
        Ok(()) => println!("Server acknowledged {}", what),
        Err(e) => common::fail(what, e),
    }
}
