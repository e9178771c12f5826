//! Primary/replica queue synchronization.
//!
//! A standby server joins the primary with a `ReplicaJoin` request. The
//! primary quiesces (hold + drain down to the joining request), takes a
//! consistent snapshot under the store's global lock, streams it, and
//! registers the connection; every committed mutation is then fanned out
//! to the registered replicas as a device-group update.
//!
//! When a join arrives from the host this node itself is configured to
//! replicate from, two servers both believe they are the primary. The
//! local node loses: it re-enters replication-consumer mode. If consumer
//! mode cannot even be started the process terminates — a replica that
//! cannot replicate must not continue serving.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use vdqm_core::{net, Connection};
use vdqm_proto::constants::VDQM_LISTEN_PORT;
use vdqm_proto::{Ack, ReplicaMessage, VdqmError, VdqmRequest, VdqmResult};

use crate::daemon::SharedSys;
use crate::queue::QueueStore;

/// One direction of a replica stream: primary to replica.
#[async_trait]
pub trait ReplicaLink: Send {
    async fn send(&mut self, msg: &ReplicaMessage) -> VdqmResult<()>;
}

#[async_trait]
impl<S> ReplicaLink for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &ReplicaMessage) -> VdqmResult<()> {
        self.send_replica(msg).await
    }
}

struct ReplicaTarget {
    server: String,
    link: Box<dyn ReplicaLink>,
}

/// The registered replication targets of a primary.
pub struct ReplicaSet {
    targets: Mutex<Vec<ReplicaTarget>>,
}

impl ReplicaSet {
    pub fn new() -> Self {
        Self {
            targets: Mutex::new(Vec::new()),
        }
    }

    pub async fn register(&self, server: String, link: Box<dyn ReplicaLink>) {
        info!("replica {} registered", server);
        self.targets.lock().await.push(ReplicaTarget { server, link });
    }

    pub async fn count(&self) -> usize {
        self.targets.lock().await.len()
    }

    /// Send a message to every replica, dropping the ones whose stream has
    /// died.
    pub async fn broadcast(&self, msg: &ReplicaMessage) {
        let mut targets = self.targets.lock().await;
        let mut alive = Vec::with_capacity(targets.len());
        for mut target in targets.drain(..) {
            match target.link.send(msg).await {
                Ok(()) => alive.push(target),
                Err(e) => warn!("dropping replica {}: {}", target.server, e),
            }
        }
        *targets = alive;
    }
}

impl Default for ReplicaSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle a `ReplicaJoin` request on the primary. Consumes the connection:
/// on success it becomes the replica's update stream.
pub async fn on_replica_join<S>(
    sys: SharedSys,
    mut conn: Connection<S>,
    peer_ip: IpAddr,
    server: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if !sys.is_replica_peer(peer_ip) {
        warn!("unauthorized replica join from {} ({})", server, peer_ip);
        let _ = conn.send_ack(&Ack::Rollback(VdqmError::NotAuthorized)).await;
        return;
    }

    if sys.is_primary_peer(&server, peer_ip) {
        // Both sides claim the primary role; the configured primary wins
        info!("replica conflict: {} is this node's primary", server);
        let _ = conn
            .send_ack(&Ack::Rollback(VdqmError::ReplicaConflict))
            .await;
        drop(conn);
        demote_to_replica(sys.clone(), sys.primary_addr(peer_ip)).await;
        return;
    }

    // Freeze admission and drain everything but this request, then dump
    // under the store's global lock. The operator's hold setting is
    // restored afterwards either way.
    let prev_hold = sys.admin.set_hold(true).await;
    sys.admin.wait_until_at_most(1).await;
    let (volumes, drives) = sys.store.snapshot_all().await;
    info!(
        "replica join from {}: snapshot of {} volume requests, {} drives",
        server,
        volumes.len(),
        drives.len()
    );

    let streamed = async {
        conn.send_ack(&Ack::Commit).await?;
        conn.send_replica(&ReplicaMessage::Snapshot { volumes, drives })
            .await
    }
    .await;
    sys.admin.set_hold(prev_hold).await;

    match streamed {
        Ok(()) => sys.replicas.register(server, Box::new(conn)).await,
        Err(e) => warn!("replica join from {} failed: {}", server, e),
    }
}

/// Re-enter replication-consumer mode after losing a primary conflict.
/// Terminates the process if consumer mode cannot be started.
pub async fn demote_to_replica(sys: SharedSys, primary: String) {
    warn!("demoting to replica of {}", primary);
    if let Err(e) = run_as_replica(sys, &primary).await {
        error!("cannot start replication from {}: {}", primary, e);
        std::process::exit(1);
    }
}

/// Join `primary` as a replica: hold locally, announce readiness, wait for
/// the primary's acknowledgement, and spawn the background task that
/// applies its stream.
pub async fn run_as_replica(sys: SharedSys, primary: &str) -> VdqmResult<()> {
    sys.admin.hold().await;

    let (host, port) = match primary.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>().map_err(|_| VdqmError::SystemError)?,
        ),
        None => (primary, VDQM_LISTEN_PORT),
    };

    let stream = net::connect_to(host, port).await?;
    let mut conn = Connection::new(stream);
    conn.send_request(&VdqmRequest::ReplicaJoin {
        server: sys.server_name.clone(),
    })
    .await?;

    match conn.recv_ack().await? {
        Ack::Commit => {}
        Ack::Rollback(err) => return Err(err),
        _ => return Err(VdqmError::ProtocolError),
    }

    info!("joined {} as replica, applying its stream", primary);
    let store = sys.store.clone();
    tokio::spawn(async move {
        apply_stream(store, conn).await;
    });
    Ok(())
}

/// Continuously install the primary's snapshot and group updates.
pub(crate) async fn apply_stream<S>(store: Arc<dyn QueueStore>, mut conn: Connection<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        match conn.recv_replica().await {
            Ok(ReplicaMessage::Snapshot { volumes, drives }) => {
                info!(
                    "installing snapshot: {} volume requests, {} drives",
                    volumes.len(),
                    drives.len()
                );
                store.replace_all(volumes, drives).await;
                if let Err(e) = store.persist().await {
                    warn!("failed to persist replicated snapshot: {}", e);
                }
            }
            Ok(ReplicaMessage::GroupUpdate { dgn, volumes, drives }) => {
                store.apply_group(&dgn, volumes, drives).await;
                if let Err(e) = store.persist().await {
                    warn!("failed to persist replicated update: {}", e);
                }
            }
            Err(e) => {
                // The primary is gone. Queue state is retained; the
                // operator promotes this node by releasing the hold.
                error!("replica stream ended: {}", e);
                break;
            }
        }
    }
}

/// Fan one device group's post-mutation state out to the replicas.
pub async fn replicate_group(sys: &SharedSys, dgn: &str) {
    if sys.replicas.count().await == 0 {
        return;
    }
    let (volumes, drives) = sys.store.dump_group(dgn).await;
    sys.replicas
        .broadcast(&ReplicaMessage::GroupUpdate {
            dgn: dgn.to_owned(),
            volumes,
            drives,
        })
        .await;
}
