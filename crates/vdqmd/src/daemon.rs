//! Daemon-wide state.
//!
//! In the C version this was a set of process globals (the hold flag, the
//! request counter, the replica table, the queue heads). Here everything
//! lives in one `SystemInfo` shared as `Arc`; the pieces that mutate carry
//! their own synchronization (the admin controller's mutex, the store's
//! per-group locks, the replica set's mutex).

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::admin::AdminMode;
use crate::queue::QueueStore;
use crate::replica::ReplicaSet;

/// Shared daemon state.
pub type SharedSys = Arc<SystemInfo>;

pub struct SystemInfo {
    /// This server's name, sent on replica joins
    pub server_name: String,

    /// Listen address for client and replica connections
    pub listen_addr: SocketAddr,

    /// Base directory for queue persistence
    pub data_dir: PathBuf,

    /// Hosts allowed to issue hold/release/shutdown (loopback is always
    /// allowed)
    pub admin_hosts: Vec<IpAddr>,

    /// Hosts allowed to join as replicas
    pub replica_hosts: Vec<IpAddr>,

    /// The primary this node replicates from, when configured
    pub primary: Option<String>,

    /// Global admission mode and quiescence counter
    pub admin: AdminMode,

    /// The queue store
    pub store: Arc<dyn QueueStore>,

    /// Registered replica targets
    pub replicas: ReplicaSet,

    /// Wakes the accept loop on shutdown
    pub shutdown_notify: Arc<Notify>,
}

impl SystemInfo {
    pub fn new(
        server_name: String,
        listen_addr: SocketAddr,
        data_dir: PathBuf,
        store: Arc<dyn QueueStore>,
    ) -> Self {
        let shutdown_notify = Arc::new(Notify::new());
        Self {
            server_name,
            listen_addr,
            data_dir,
            admin_hosts: Vec::new(),
            replica_hosts: Vec::new(),
            primary: None,
            admin: AdminMode::new(shutdown_notify.clone()),
            store,
            replicas: ReplicaSet::new(),
            shutdown_notify,
        }
    }

    /// Whether `peer` may issue administrative requests.
    pub fn is_admin_peer(&self, peer: IpAddr) -> bool {
        peer.is_loopback() || self.admin_hosts.contains(&peer)
    }

    /// Whether `peer` may join as a replica.
    pub fn is_replica_peer(&self, peer: IpAddr) -> bool {
        peer.is_loopback() || self.replica_hosts.contains(&peer)
    }

    /// Whether a replica join from `peer` comes from this node's own
    /// configured primary — the conflict that demotes this node.
    pub fn is_primary_peer(&self, server: &str, peer: IpAddr) -> bool {
        match self.primary {
            Some(ref primary) => {
                let host = primary.split(':').next().unwrap_or(primary);
                host == server || host == peer.to_string()
            }
            None => false,
        }
    }

    /// Address to reconnect to when demoting below the peer that caused a
    /// replica conflict.
    pub fn primary_addr(&self, peer: IpAddr) -> String {
        format!("{}:{}", peer, self.listen_addr.port())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_loopback_is_always_admin() {
        let (sys, _) = testing::test_sys();
        assert!(sys.is_admin_peer(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(!sys.is_admin_peer("10.0.0.9".parse().unwrap()));
    }

    #[test]
    fn test_configured_hosts_are_authorized() {
        let (mut sys, _) = testing::test_sys();
        sys.admin_hosts.push("10.0.0.9".parse().unwrap());
        sys.replica_hosts.push("10.0.0.10".parse().unwrap());
        assert!(sys.is_admin_peer("10.0.0.9".parse().unwrap()));
        assert!(sys.is_replica_peer("10.0.0.10".parse().unwrap()));
        assert!(!sys.is_replica_peer("10.0.0.9".parse().unwrap()));
    }

    #[test]
    fn test_primary_peer_detection() {
        let (mut sys, _) = testing::test_sys();
        assert!(!sys.is_primary_peer("vdqm2", "10.0.0.9".parse().unwrap()));
        sys.primary = Some("vdqm2:5012".into());
        assert!(sys.is_primary_peer("vdqm2", "10.0.0.9".parse().unwrap()));
        assert!(!sys.is_primary_peer("vdqm3", "10.0.0.9".parse().unwrap()));
    }
}
