//! VDQM volume and drive queue manager daemon.
//!
//! Matches tape-mount requests to available tape drives, subject to
//! per-drive dedications, and keeps standby replicas synchronized so the
//! queue state survives a primary failover.
//!
//! Usage:
//!   vdqmd [OPTIONS] <DATA_DIR>
//!
//! The daemon runs a tokio runtime with:
//! 1. the client accept loop (one task per connection),
//! 2. the replication consumer when started with `--primary`.

mod admin;
mod config;
mod daemon;
mod queue;
mod replica;
mod request;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use vdqm_core::dedication::SystemAccounts;
use vdqm_proto::constants::VDQM_LISTEN_PORT;

use crate::daemon::SystemInfo;
use crate::queue::{MemQueueStore, QueueStore, TcpJobStarter};

/// VDQM queue manager daemon
#[derive(Parser, Debug)]
#[command(name = "vdqmd", version, about = "VDQM volume and drive queue manager daemon")]
struct Args {
    /// Data directory for queue persistence
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = VDQM_LISTEN_PORT)]
    port: u16,

    /// This server's name, announced on replica joins
    #[arg(long, default_value = "vdqm")]
    server_name: String,

    /// Host allowed to issue hold/release/shutdown (repeatable; loopback
    /// is always allowed)
    #[arg(long = "admin-host", value_name = "IP")]
    admin_hosts: Vec<IpAddr>,

    /// Host allowed to join as a replica (repeatable)
    #[arg(long = "replica-host", value_name = "IP")]
    replica_hosts: Vec<IpAddr>,

    /// Start as a replica of an existing primary (host or host:port)
    #[arg(long, value_name = "HOST[:PORT]")]
    primary: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("vdqmd v{} starting", env!("CARGO_PKG_VERSION"));

    let bind_addr: IpAddr = args
        .bind_addr
        .parse()
        .unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let listen_addr = SocketAddr::new(bind_addr, args.port);

    if let Err(e) = tokio::fs::create_dir_all(&args.dir).await {
        error!("failed to create data directory {}: {}", args.dir.display(), e);
        std::process::exit(1);
    }

    // Build the queue store over the local account database and the TCP
    // job starter
    let accounts = Arc::new(SystemAccounts::load());
    let store = Arc::new(MemQueueStore::new(
        accounts,
        Arc::new(TcpJobStarter),
        Some(args.dir.clone()),
    ));

    // Recover persisted queues (if any)
    match config::load_queues(&args.dir).await {
        Ok(Some((vols, drvs))) => {
            info!(
                "recovered {} volume requests and {} drives from disk",
                vols.len(),
                drvs.len()
            );
            store.replace_all(vols, drvs).await;
        }
        Ok(None) => {
            info!("no persisted queues, starting fresh");
        }
        Err(e) => {
            error!("failed to load persisted queues: {}", e);
            std::process::exit(1);
        }
    }

    let mut sys_info = SystemInfo::new(
        args.server_name,
        listen_addr,
        args.dir.clone(),
        store,
    );
    sys_info.admin_hosts = args.admin_hosts;
    sys_info.replica_hosts = args.replica_hosts;
    sys_info.primary = args.primary.clone();

    let sys = Arc::new(sys_info);

    // When configured with a primary, enter replication-consumer mode
    // before serving: hold is set and the primary's stream is applied in
    // the background until this node is promoted
    if let Some(ref primary) = args.primary {
        if let Err(e) = replica::run_as_replica(sys.clone(), primary).await {
            error!("cannot start replication from {}: {}", primary, e);
            std::process::exit(1);
        }
    }

    info!("vdqmd ready on {}", listen_addr);

    let sys_accept = sys.clone();
    tokio::spawn(async move {
        if let Err(e) = request::accept_loop(sys_accept).await {
            error!("accept loop failed: {}", e);
        }
    });

    // Wait for shutdown
    let shutdown = sys.shutdown_notify.clone();
    tokio::select! {
        _ = shutdown.notified() => {
            info!("shutdown request received");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
    }

    info!("vdqmd shutting down");

    // Drain in-flight work, then save the queues
    sys.admin.hold().await;
    sys.admin.wait_until_at_most(0).await;
    if let Err(e) = sys.store.persist().await {
        warn!("failed to persist queues on shutdown: {}", e);
    }

    info!("vdqmd stopped");
}
