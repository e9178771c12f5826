//! Request pipeline: accept, decode, admit, execute, handshake.
//!
//! One task per accepted connection; each connection carries exactly one
//! request. The per-connection protocol is:
//!
//! 1. decode the request frame (bad frames are logged and the connection
//!    closed with no further action);
//! 2. count the request in with the admin controller;
//! 3. administrative codes short-circuit to the controller; replica joins
//!    short-circuit to the replication coordinator;
//! 4. anything else is rejected with `OnHold` while the server is held;
//! 5. otherwise the queue store executes the operation;
//! 6. success answers `commit`, the reply body, then waits for the peer's
//!    acknowledgement of receipt; failure answers `rollback` and nothing
//!    else;
//! 7. if the peer acknowledgement never arrives after a mutation, the
//!    effect is undone — the caller cannot be assumed to retry;
//! 8. count the request out, close.
//!
//! Ping and hangup use a single acknowledgement and never compensate.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use vdqm_core::{net, Connection};
use vdqm_proto::constants::SENTINEL_ID;
use vdqm_proto::{
    Ack, DriveRequest, ReplyBody, VdqmError, VdqmRequest, VdqmResult, VolumeRequest,
};

use crate::daemon::SharedSys;
use crate::queue::QueueStore;
use crate::replica;

/// Accept loop: listen for incoming connections and spawn a handler per
/// connection until shutdown is signalled.
pub async fn accept_loop(sys: SharedSys) -> VdqmResult<()> {
    let listener = net::create_listen_socket(
        &sys.listen_addr.ip().to_string(),
        sys.listen_addr.port(),
    )
    .await?;

    info!("listening on {}", sys.listen_addr);

    let shutdown_notify = sys.shutdown_notify.clone();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        stream.set_nodelay(true).ok();
                        let sys = sys.clone();
                        tokio::spawn(async move {
                            serve_connection(sys, stream, peer.ip()).await;
                        });
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
            _ = shutdown_notify.notified() => {
                info!("accept loop shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Serve a single connection: one request, one handshake.
pub async fn serve_connection<S>(sys: SharedSys, stream: S, peer_ip: IpAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = Connection::new(stream);

    let (_, req) = match conn.recv_request().await {
        Ok(decoded) => decoded,
        Err(e) => {
            // Unknown or invalid request: close with no further action
            warn!("dropping connection from {}: {}", peer_ip, e);
            return;
        }
    };

    debug!("{} request from {}", req.name(), peer_ip);

    sys.admin.begin_request().await;
    handle_request(&sys, conn, peer_ip, req).await;
    sys.admin.end_request().await;
}

async fn rollback<S>(conn: &mut Connection<S>, err: VdqmError)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Err(e) = conn.send_ack(&Ack::Rollback(err)).await {
        debug!("rollback acknowledgement lost: {}", e);
    }
}

/// Commit handshake: acknowledgement, reply body, peer acknowledgement.
async fn commit_reply<S>(conn: &mut Connection<S>, body: Option<&ReplyBody>) -> VdqmResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    conn.send_ack(&Ack::Commit).await?;
    if let Some(body) = body {
        conn.send_body(body).await?;
    }
    conn.recv_ack().await?;
    Ok(())
}

async fn handle_request<S>(sys: &SharedSys, mut conn: Connection<S>, peer_ip: IpAddr, req: VdqmRequest)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Administrative codes go straight to the controller
    if req.is_admin() {
        info!("{} request from {}", req.name(), peer_ip);
        if !sys.is_admin_peer(peer_ip) {
            warn!("unauthorized {} request from {}", req.name(), peer_ip);
            rollback(&mut conn, VdqmError::NotAuthorized).await;
            return;
        }
        match req {
            VdqmRequest::Hold => sys.admin.hold().await,
            VdqmRequest::Release => sys.admin.release().await,
            VdqmRequest::Shutdown => sys.admin.shutdown().await,
            _ => unreachable!("is_admin covers exactly these codes"),
        }
        if let Err(e) = commit_reply(&mut conn, None).await {
            debug!("admin commit handshake incomplete: {}", e);
        }
        return;
    }

    // Replica joins are admitted even on hold so the system can grow
    // replicas while held
    if let VdqmRequest::ReplicaJoin { server } = req {
        replica::on_replica_join(sys.clone(), conn, peer_ip, server).await;
        return;
    }

    if sys.admin.is_on_hold().await {
        debug!("rejecting {} from {}: on hold", req.name(), peer_ip);
        rollback(&mut conn, VdqmError::OnHold).await;
        return;
    }

    match req {
        VdqmRequest::Ping(vol) => {
            let ack = match sys.store.queue_position(&vol).await {
                Ok(pos) => Ack::QueuePos(pos),
                Err(err) => Ack::QueuePos(-(err.to_code() as i32)),
            };
            if let Err(e) = conn.send_ack(&ack).await {
                debug!("ping acknowledgement lost: {}", e);
            }
        }

        VdqmRequest::Hangup => {
            if let Err(e) = conn.send_ack(&Ack::Hangup).await {
                debug!("hangup acknowledgement lost: {}", e);
            }
        }

        VdqmRequest::GetVolQueue { dgn } => {
            let records = sys.store.volume_queue(non_empty(&dgn)).await;
            let sentinel = VolumeRequest {
                vol_req_id: SENTINEL_ID,
                ..Default::default()
            };
            stream_records(
                &mut conn,
                records.into_iter().map(ReplyBody::Volume),
                ReplyBody::Volume(sentinel),
            )
            .await;
        }

        VdqmRequest::GetDrvQueue { dgn } => {
            let records = sys.store.drive_queue(non_empty(&dgn)).await;
            let sentinel = DriveRequest {
                drv_req_id: SENTINEL_ID,
                ..Default::default()
            };
            stream_records(
                &mut conn,
                records.into_iter().map(ReplyBody::Drive),
                ReplyBody::Drive(sentinel),
            )
            .await;
        }

        VdqmRequest::AddVolume(vol) => {
            let dgn = vol.dgn.clone();
            match sys.store.add_volume_request(vol).await {
                Ok(stored) => {
                    let reply = ReplyBody::Volume(stored.clone());
                    if let Err(e) = commit_reply(&mut conn, Some(&reply)).await {
                        // The peer never confirmed receipt: it does not
                        // know its request id and cannot be assumed to
                        // retry, so the request must not stay queued
                        error!(
                            "peer gone after AddVolume {} ({}); compensating",
                            stored.vol_req_id, e
                        );
                        if let Err(e) = sys.store.delete_volume_request(&stored).await {
                            error!("compensation failed for request {}: {}", stored.vol_req_id, e);
                        }
                    }
                    finish_mutation(sys, &dgn).await;
                }
                Err(err) => rollback(&mut conn, err).await,
            }
        }

        VdqmRequest::DeleteVolume(vol) => {
            let dgn = vol.dgn.clone();
            match sys.store.delete_volume_request(&vol).await {
                Ok(()) => {
                    let reply = ReplyBody::Volume(vol);
                    if let Err(e) = commit_reply(&mut conn, Some(&reply)).await {
                        // The deletion stands; nothing to restore
                        debug!("peer gone after DeleteVolume: {}", e);
                    }
                    finish_mutation(sys, &dgn).await;
                }
                Err(err) => rollback(&mut conn, err).await,
            }
        }

        VdqmRequest::AddDrive(drv) => {
            drive_mutation(sys, &mut conn, drv, |sys, drv| async move {
                sys.store.update_drive(drv).await
            })
            .await;
        }

        VdqmRequest::DedicateDrive(drv) => {
            drive_mutation(sys, &mut conn, drv, |sys, drv| async move {
                sys.store.set_dedication(&drv).await
            })
            .await;
        }

        VdqmRequest::DeleteDrive(drv) => {
            let dgn = drv.dgn.clone();
            match sys.store.delete_drive(&drv).await {
                Ok(()) => {
                    let reply = ReplyBody::Drive(drv);
                    if let Err(e) = commit_reply(&mut conn, Some(&reply)).await {
                        debug!("peer gone after DeleteDrive: {}", e);
                    }
                    finish_mutation(sys, &dgn).await;
                }
                Err(err) => rollback(&mut conn, err).await,
            }
        }

        VdqmRequest::Hold
        | VdqmRequest::Release
        | VdqmRequest::Shutdown
        | VdqmRequest::ReplicaJoin { .. } => {
            unreachable!("handled above")
        }
    }
}

/// Execute a drive operation with the commit handshake and the
/// rollback-of-drive-operation compensation.
async fn drive_mutation<S, F, Fut>(
    sys: &SharedSys,
    conn: &mut Connection<S>,
    drv: DriveRequest,
    op: F,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    F: FnOnce(SharedSys, DriveRequest) -> Fut,
    Fut: std::future::Future<Output = VdqmResult<DriveRequest>>,
{
    let dgn = drv.dgn.clone();
    let identity = drv.clone();
    match op(sys.clone(), drv).await {
        Ok(updated) => {
            let reply = ReplyBody::Drive(updated);
            if let Err(e) = commit_reply(conn, Some(&reply)).await {
                error!(
                    "peer gone after drive operation on {} ({}); rolling back",
                    identity.unit_name(),
                    e
                );
                if let Err(e) = sys.store.rollback_drive_op(&identity).await {
                    error!(
                        "drive rollback failed for {}: {}",
                        identity.unit_name(),
                        e
                    );
                }
            }
            finish_mutation(sys, &dgn).await;
        }
        Err(err) => rollback(conn, err).await,
    }
}

/// Stream enumeration records, the terminal sentinel, then wait for the
/// peer's acknowledgement.
async fn stream_records<S, I>(conn: &mut Connection<S>, records: I, sentinel: ReplyBody)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    I: Iterator<Item = ReplyBody>,
{
    let streamed = async {
        conn.send_ack(&Ack::Commit).await?;
        for record in records {
            conn.send_body(&record).await?;
        }
        conn.send_body(&sentinel).await?;
        conn.recv_ack().await?;
        Ok::<(), VdqmError>(())
    }
    .await;
    if let Err(e) = streamed {
        debug!("enumeration cut short: {}", e);
    }
}

/// Post-commit bookkeeping for a mutating operation: replicate the
/// affected device group and persist.
async fn finish_mutation(sys: &SharedSys, dgn: &str) {
    replica::replicate_group(sys, dgn).await;
    if let Err(e) = sys.store.persist().await {
        warn!("queue persistence failed: {}", e);
    }
}

fn non_empty(dgn: &str) -> Option<&str> {
    if dgn.is_empty() {
        None
    } else {
        Some(dgn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testing::test_sys;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use vdqm_proto::DriveStatus;

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    /// Spawn the server side of one connection and hand back the client
    /// end.
    fn connect(sys: &SharedSys) -> Connection<DuplexStream> {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let sys = sys.clone();
        tokio::spawn(async move {
            serve_connection(sys, server, loopback()).await;
        });
        Connection::new(client)
    }

    fn shared() -> SharedSys {
        let (sys, _) = test_sys();
        Arc::new(sys)
    }

    fn vol(volid: &str) -> VolumeRequest {
        VolumeRequest {
            volid: volid.into(),
            dgn: "SL8500".into(),
            client_host: "client01".into(),
            client_name: "stage".into(),
            client_uid: 100,
            client_gid: 200,
            ..Default::default()
        }
    }

    async fn submit(sys: &SharedSys, req: &VdqmRequest) -> VdqmResult<ReplyBody> {
        connect(sys).exchange(req).await
    }

    #[tokio::test]
    async fn test_add_volume_commits_and_replies() {
        let sys = shared();
        let body = submit(&sys, &VdqmRequest::AddVolume(vol("T00001")))
            .await
            .unwrap();
        match body {
            ReplyBody::Volume(stored) => {
                assert!(stored.vol_req_id > 0);
                assert_eq!(sys.store.queue_position(&stored).await.unwrap(), 0);
            }
            other => panic!("expected volume reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hold_gates_admission_until_release() {
        let sys = shared();

        // Hold, then an ordinary request must roll back with OnHold
        connect(&sys).exchange_no_body(&VdqmRequest::Hold).await.unwrap();
        assert_eq!(
            submit(&sys, &VdqmRequest::AddVolume(vol("T00001")))
                .await
                .unwrap_err(),
            VdqmError::OnHold
        );

        // Release, then the resubmission commits
        connect(&sys)
            .exchange_no_body(&VdqmRequest::Release)
            .await
            .unwrap();
        submit(&sys, &VdqmRequest::AddVolume(vol("T00001")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_admin_requires_authorized_peer() {
        let sys = shared();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let sys2 = sys.clone();
        tokio::spawn(async move {
            serve_connection(sys2, server, "10.7.7.7".parse().unwrap()).await;
        });
        let mut conn = Connection::new(client);
        assert_eq!(
            conn.exchange_no_body(&VdqmRequest::Hold).await.unwrap_err(),
            VdqmError::NotAuthorized
        );
        assert!(!sys.admin.is_on_hold().await);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_accept_loop_waiter() {
        let sys = shared();
        let notify = sys.shutdown_notify.clone();
        let woken = tokio::spawn(async move { notify.notified().await });
        tokio::task::yield_now().await;

        connect(&sys)
            .exchange_no_body(&VdqmRequest::Shutdown)
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), woken)
            .await
            .expect("shutdown must wake the accept loop")
            .unwrap();
        assert!(sys.admin.is_on_hold().await);
    }

    #[tokio::test]
    async fn test_ping_reports_queue_position() {
        let sys = shared();
        let stored = match submit(&sys, &VdqmRequest::AddVolume(vol("T00001")))
            .await
            .unwrap()
        {
            ReplyBody::Volume(v) => v,
            other => panic!("expected volume reply, got {:?}", other),
        };

        let pos = connect(&sys)
            .ping(&VdqmRequest::Ping(stored))
            .await
            .unwrap();
        assert_eq!(pos, 0);
    }

    #[tokio::test]
    async fn test_ping_unknown_request_carries_error_code() {
        let sys = shared();
        let mut ghost = vol("T00001");
        ghost.vol_req_id = 4242;
        let err = connect(&sys)
            .ping(&VdqmRequest::Ping(ghost))
            .await
            .unwrap_err();
        assert_eq!(err, VdqmError::NoVolumeRequest);
    }

    #[tokio::test]
    async fn test_hangup_answers_single_ack() {
        let sys = shared();
        let mut conn = connect(&sys);
        conn.send_request(&VdqmRequest::Hangup).await.unwrap();
        assert_eq!(conn.recv_ack().await.unwrap(), Ack::Hangup);
    }

    #[tokio::test]
    async fn test_enumeration_ends_with_sentinel() {
        let sys = shared();
        submit(&sys, &VdqmRequest::AddVolume(vol("T00001"))).await.unwrap();
        submit(&sys, &VdqmRequest::AddVolume(vol("T00002"))).await.unwrap();

        let records = connect(&sys)
            .fetch_queue(&VdqmRequest::GetVolQueue { dgn: String::new() })
            .await
            .unwrap();
        assert_eq!(records.len(), 2);

        // Empty enumeration: just the sentinel
        let records = connect(&sys)
            .fetch_queue(&VdqmRequest::GetDrvQueue { dgn: "SL8500".into() })
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_compensation_removes_unacknowledged_add() {
        let sys = shared();
        let mut conn = connect(&sys);

        conn.send_request(&VdqmRequest::AddVolume(vol("T00001")))
            .await
            .unwrap();
        assert_eq!(conn.recv_ack().await.unwrap(), Ack::Commit);
        let body = conn.recv_body().await.unwrap();
        assert!(body.id() > 0);

        // Vanish without the final acknowledgement
        drop(conn);

        // The dispatcher must delete the just-added request
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if sys.store.volume_queue(Some("SL8500")).await.is_empty() {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "request was not compensated away"
            );
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_drive_compensation_requeues_request() {
        let sys = shared();
        submit(&sys, &VdqmRequest::AddVolume(vol("T00001"))).await.unwrap();

        let drv = DriveRequest {
            status: DriveStatus::UP | DriveStatus::FREE,
            drive: "drv0".into(),
            server: "tps01".into(),
            dgn: "SL8500".into(),
            ..Default::default()
        };

        let mut conn = connect(&sys);
        conn.send_request(&VdqmRequest::AddDrive(drv)).await.unwrap();
        assert_eq!(conn.recv_ack().await.unwrap(), Ack::Commit);
        let _ = conn.recv_body().await.unwrap();
        drop(conn);

        // The pairing performed by the drive update must be undone
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let vols = sys.store.volume_queue(Some("SL8500")).await;
            if vols.len() == 1 {
                let drives = sys.store.drive_queue(Some("SL8500")).await;
                assert_eq!(drives[0].vol_req_id, 0);
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "drive operation was not rolled back"
            );
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_garbage_frame_closes_connection() {
        let sys = shared();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handler = tokio::spawn(serve_connection(sys.clone(), server, loopback()));

        use tokio::io::AsyncWriteExt;
        let mut raw = client;
        raw.write_u32(4).await.unwrap();
        raw.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), handler)
            .await
            .expect("handler must close on a bad frame")
            .unwrap();
        // Nothing was admitted or queued
        assert!(sys.store.volume_queue(None).await.is_empty());
        assert_eq!(sys.admin.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_replica_join_admitted_while_on_hold() {
        let (mut sys, _) = test_sys();
        sys.replica_hosts.push(loopback());
        let sys = Arc::new(sys);
        sys.admin.hold().await;

        let mut conn = connect(&sys);
        conn.send_request(&VdqmRequest::ReplicaJoin {
            server: "vdqm2".into(),
        })
        .await
        .unwrap();
        assert_eq!(conn.recv_ack().await.unwrap(), Ack::Commit);
        match conn.recv_replica().await.unwrap() {
            vdqm_proto::ReplicaMessage::Snapshot { .. } => {}
            other => panic!("expected snapshot, got {:?}", other),
        }
    }
}
