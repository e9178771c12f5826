//! VDQM admin and client tool (vdqmctl).
//!
//! The `vdqmctl` command is the administrative interface for a VDQM
//! queue manager: submit and cancel volume mount requests, configure
//! drives, set dedications, inspect the queues, and drive the global
//! hold/release/shutdown mode.
//!
//! # Usage
//!
//! ```text
//! vdqmctl [OPTIONS] <COMMAND>
//!
//! Commands:
//!   volume   Volume mount request operations
//!   drive    Drive configuration and dedication
//!   admin    Hold, release, and shutdown
//!
//! Options:
//!   -a, --address <ADDRESS>  VDQM server address [default: 127.0.0.1]
//!   -p, --port <PORT>        VDQM server port [default: 5012]
//! ```

mod admin;
mod common;
mod drive;
mod volume;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vdqm_proto::constants::VDQM_LISTEN_PORT;

/// VDQM queue manager admin tool.
#[derive(Parser)]
#[command(name = "vdqmctl", version, about = "VDQM queue manager admin tool")]
struct Cli {
    /// VDQM server address
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    address: String,

    /// VDQM server port
    #[arg(short = 'p', long, default_value_t = VDQM_LISTEN_PORT)]
    port: u16,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Volume mount request operations
    Volume(volume::VolumeArgs),
    /// Drive configuration and dedication
    Drive(drive::DriveArgs),
    /// Hold, release, and shutdown
    Admin(admin::AdminArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let addr = &cli.address;
    let port = cli.port;

    match cli.command {
        Commands::Volume(args) => {
            volume::run(addr, port, args).await;
        }
        Commands::Drive(args) => {
            drive::run(addr, port, args).await;
        }
        Commands::Admin(args) => {
            admin::run(addr, port, args).await;
        }
    }
}
