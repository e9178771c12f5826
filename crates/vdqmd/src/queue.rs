//! The volume and drive queue store.
//!
//! Queues are partitioned by device group name (dgn). Each group holds an
//! ordered volume queue (priority first, FIFO within a priority) and the
//! drive records of that group. A volume request leaves the queue when it
//! is paired with a drive and then lives on the drive record until the
//! drive is released or freed.
//!
//! The dispatcher consumes the store through the [`QueueStore`] trait;
//! [`MemQueueStore`] is the in-memory implementation. Ordinary operations
//! serialize on their device group only; `snapshot_all` is the one global
//! critical section, holding every group lock at once for a consistent
//! point-in-time dump.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use vdqm_core::dedication::{AccountDirectory, DedicationExpression, MountAttributes};
use vdqm_core::{net, Connection};
use vdqm_proto::{
    Ack, ClientInfo, DriveRequest, DriveStatus, VdqmError, VdqmResult, VolumeRequest,
};

use crate::config;

/// Starts the tape job once a drive has been assigned to a volume request.
///
/// The production implementation contacts the requesting client's callback
/// port; tests substitute a recorder.
#[async_trait]
pub trait JobStarter: Send + Sync {
    async fn start_job(&self, vol: &VolumeRequest, drv: &DriveRequest) -> VdqmResult<()>;
}

/// Sends the client-info message to `client_host:client_port` and waits
/// for the client's acknowledgement.
pub struct TcpJobStarter;

#[async_trait]
impl JobStarter for TcpJobStarter {
    async fn start_job(&self, vol: &VolumeRequest, drv: &DriveRequest) -> VdqmResult<()> {
        let stream = net::connect_to(&vol.client_host, vol.client_port).await?;
        let mut conn = Connection::new(stream);
        conn.send_client_info(&ClientInfo {
            vol_req_id: vol.vol_req_id,
            client_port: vol.client_port,
            client_uid: vol.client_uid,
            client_gid: vol.client_gid,
            client_host: vol.client_host.clone(),
            client_name: vol.client_name.clone(),
            dgn: drv.dgn.clone(),
            drive: drv.drive.clone(),
            server: drv.server.clone(),
        })
        .await?;
        match conn.recv_ack().await? {
            Ack::Commit => Ok(()),
            Ack::Rollback(err) => Err(err),
            _ => Err(VdqmError::ProtocolError),
        }
    }
}

/// The narrow interface the dispatcher and the replication coordinator
/// consume.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Queue a new volume request; returns the stored record with its
    /// assigned id.
    async fn add_volume_request(&self, req: VolumeRequest) -> VdqmResult<VolumeRequest>;
    /// Cancel a volume request, queued or already paired to a drive.
    async fn delete_volume_request(&self, req: &VolumeRequest) -> VdqmResult<()>;
    /// Create a drive record or apply a status transition to it; returns
    /// the updated record (the reply body).
    async fn update_drive(&self, req: DriveRequest) -> VdqmResult<DriveRequest>;
    /// Remove a drive record.
    async fn delete_drive(&self, req: &DriveRequest) -> VdqmResult<()>;
    /// Set or clear a drive's dedication.
    async fn set_dedication(&self, req: &DriveRequest) -> VdqmResult<DriveRequest>;
    /// 0-based queue position of a volume request.
    async fn queue_position(&self, req: &VolumeRequest) -> VdqmResult<i32>;
    /// Snapshot of the volume queue (`None` = every device group).
    async fn volume_queue(&self, dgn: Option<&str>) -> Vec<VolumeRequest>;
    /// Snapshot of the drive queue (`None` = every device group).
    async fn drive_queue(&self, dgn: Option<&str>) -> Vec<DriveRequest>;
    /// Undo the pairing effects of a drive operation whose commit handshake
    /// was cut short.
    async fn rollback_drive_op(&self, req: &DriveRequest) -> VdqmResult<()>;
    /// Consistent point-in-time dump of all groups, paired volume requests
    /// included.
    async fn snapshot_all(&self) -> (Vec<VolumeRequest>, Vec<DriveRequest>);
    /// Replace the entire store contents (replica-side snapshot install).
    async fn replace_all(&self, vols: Vec<VolumeRequest>, drives: Vec<DriveRequest>);
    /// Replace one device group's contents (replica-side update install).
    async fn apply_group(&self, dgn: &str, vols: Vec<VolumeRequest>, drives: Vec<DriveRequest>);
    /// Dump one device group, paired volume requests included.
    async fn dump_group(&self, dgn: &str) -> (Vec<VolumeRequest>, Vec<DriveRequest>);
    /// Write the queues to disk.
    async fn persist(&self) -> VdqmResult<()>;
}

/// A drive record: the wire-visible state plus the compiled dedication and
/// the volume request it is currently serving.
struct DriveRecord {
    drv: DriveRequest,
    /// Compiled form of `drv.dedicate`, rebuilt whenever it changes
    dedication: DedicationExpression,
    /// The paired volume request, held here while off the queue
    vol: Option<VolumeRequest>,
}

/// One device group's queues.
struct GroupQueues {
    dgn: String,
    vol_queue: Vec<VolumeRequest>,
    drv_queue: Vec<DriveRecord>,
}

impl GroupQueues {
    fn new(dgn: &str) -> Self {
        Self {
            dgn: dgn.to_owned(),
            vol_queue: Vec::new(),
            drv_queue: Vec::new(),
        }
    }

    /// Insert in queue order: higher priority first, FIFO within equal
    /// priority.
    fn insert_volume(&mut self, vol: VolumeRequest) {
        let at = self
            .vol_queue
            .iter()
            .position(|v| v.priority < vol.priority)
            .unwrap_or(self.vol_queue.len());
        self.vol_queue.insert(at, vol);
    }

    fn find_drive(&self, drive: &str, server: &str) -> Option<usize> {
        self.drv_queue
            .iter()
            .position(|r| r.drv.drive == drive && r.drv.server == server)
    }

    /// Whether `volid` is currently mounted or in use on some unit of this
    /// group.
    fn vol_in_use(&self, volid: &str) -> bool {
        self.drv_queue.iter().any(|r| {
            r.drv.volid == volid && r.drv.status.intersects(DriveStatus::BUSY | DriveStatus::ASSIGN)
        })
    }

    /// Find a free, compatible, dedication-satisfying drive for a volume
    /// request.
    fn select_drive(&self, vol: &VolumeRequest) -> Option<usize> {
        let attrs = MountAttributes::from_volume(vol, chrono::Local::now());
        self.drv_queue.iter().position(|r| {
            r.drv.status.contains(DriveStatus::UP | DriveStatus::FREE)
                && !r.drv.status.intersects(
                    DriveStatus::DOWN | DriveStatus::UNKNOWN | DriveStatus::BUSY,
                )
                && (vol.server.is_empty() || r.drv.server == vol.server)
                && (vol.drive.is_empty() || r.drv.drive == vol.drive)
                && r.dedication.matches(&attrs)
        })
    }
}

/// In-memory queue store with per-device-group locking.
pub struct MemQueueStore {
    groups: DashMap<String, Arc<Mutex<GroupQueues>>>,
    next_vol_id: AtomicI32,
    next_drv_id: AtomicI32,
    accounts: Arc<dyn AccountDirectory>,
    jobs: Arc<dyn JobStarter>,
    data_dir: Option<PathBuf>,
}

impl MemQueueStore {
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        jobs: Arc<dyn JobStarter>,
        data_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            groups: DashMap::new(),
            next_vol_id: AtomicI32::new(1),
            next_drv_id: AtomicI32::new(1),
            accounts,
            jobs,
            data_dir,
        }
    }

    fn group(&self, dgn: &str) -> Arc<Mutex<GroupQueues>> {
        self.groups
            .entry(dgn.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(GroupQueues::new(dgn))))
            .clone()
    }

    /// Device group names in deterministic order.
    fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn next_id(counter: &AtomicI32) -> i32 {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        if id == i32::MAX {
            counter.store(1, Ordering::Relaxed);
        }
        id
    }

    /// Lock every group at once, in name order. The returned guards are
    /// the store's global critical section; dropping them releases it on
    /// every exit path.
    async fn lock_all(&self) -> Vec<OwnedMutexGuard<GroupQueues>> {
        let mut guards = Vec::new();
        for name in self.group_names() {
            let group = self.group(&name);
            guards.push(group.lock_owned().await);
        }
        guards
    }

    /// Pair queued volume requests with free compatible drives until no
    /// further pair exists, starting the tape job for each pair.
    async fn schedule_jobs(&self, g: &mut GroupQueues) {
        loop {
            let candidate = g
                .vol_queue
                .iter()
                .enumerate()
                .filter(|(_, vol)| !g.vol_in_use(&vol.volid))
                .find_map(|(vi, vol)| g.select_drive(vol).map(|di| (vi, di)));

            let (vi, di) = match candidate {
                Some(pair) => pair,
                None => break,
            };

            let mut vol = g.vol_queue.remove(vi);
            let rec = &mut g.drv_queue[di];
            vol.drv_req_id = rec.drv.drv_req_id;
            rec.drv.vol_req_id = vol.vol_req_id;
            rec.drv.status = (rec.drv.status | DriveStatus::BUSY) - DriveStatus::FREE;
            rec.drv.mode = vol.mode;

            info!(
                "starting job: request {} volid {} on {} (dgn {})",
                vol.vol_req_id,
                vol.volid,
                rec.drv.unit_name(),
                g.dgn
            );

            match self.jobs.start_job(&vol, &rec.drv).await {
                Ok(()) => {
                    rec.drv.use_count += 1;
                    rec.vol = Some(vol);
                }
                Err(e) => {
                    // The job could not be started. Flag the unit so it is
                    // not immediately re-selected and requeue the request.
                    error!(
                        "job start for request {} on {} failed: {}",
                        vol.vol_req_id,
                        rec.drv.unit_name(),
                        e
                    );
                    rec.drv.status |= DriveStatus::UNKNOWN;
                    rec.drv.recv_time = chrono::Utc::now().timestamp();
                    rec.drv.vol_req_id = 0;
                    rec.drv.job_id = 0;
                    vol.drv_req_id = 0;
                    g.insert_volume(vol);
                    break;
                }
            }
        }
    }

    /// Apply a drive status-transition request to an existing record.
    /// Returns the reply to send back (status may carry an UNMOUNT order).
    async fn apply_drive_transition(
        &self,
        g: &mut GroupQueues,
        di: usize,
        req: &DriveRequest,
    ) -> VdqmResult<DriveRequest> {
        let now = chrono::Utc::now().timestamp();
        let mut unmount_order = false;

        {
            let rec = &mut g.drv_queue[di];
            rec.drv.recv_time = now;
            rec.drv.status -= DriveStatus::UNKNOWN;
        }

        if req.status.contains(DriveStatus::DOWN) {
            // Unit configured down: requeue any held request, then no
            // other status bits survive
            let held = {
                let rec = &mut g.drv_queue[di];
                if rec.drv.status.contains(DriveStatus::BUSY) {
                    rec.vol.take()
                } else {
                    None
                }
            };
            if let Some(mut vol) = held {
                vol.drv_req_id = 0;
                g.insert_volume(vol);
            }
            let rec = &mut g.drv_queue[di];
            rec.drv.volid.clear();
            rec.drv.vol_req_id = 0;
            rec.drv.job_id = 0;
            rec.drv.status = DriveStatus::DOWN;
        } else if req.status.contains(DriveStatus::UP) {
            let rec = &mut g.drv_queue[di];
            rec.drv.status -= DriveStatus::DOWN;
            rec.drv.status |= req.status;
        } else {
            {
                let rec = &mut g.drv_queue[di];
                if !rec.drv.status.contains(DriveStatus::UP) {
                    return Err(VdqmError::UnitNotUp);
                }
                if req.status.contains(DriveStatus::BUSY) {
                    if req.status.contains(DriveStatus::FREE) {
                        return Err(VdqmError::BadStatus);
                    }
                    rec.drv.status = req.status - DriveStatus::FREE;
                } else if req.status.contains(DriveStatus::FREE) {
                    // Cannot free an assigned unit without a release, nor a
                    // unit with a tape still mounted
                    if !req.status.contains(DriveStatus::RELEASE)
                        && rec.drv.status.contains(DriveStatus::ASSIGN)
                    {
                        return Err(VdqmError::BadStatus);
                    }
                    if !req.status.contains(DriveStatus::UNMOUNT) && !rec.drv.volid.is_empty() {
                        return Err(VdqmError::BadStatus);
                    }
                } else {
                    if rec.drv.status.contains(DriveStatus::BUSY)
                        && req.status.contains(DriveStatus::ASSIGN)
                    {
                        if rec.drv.vol_req_id != req.vol_req_id {
                            return Err(VdqmError::BadId);
                        }
                        rec.drv.job_id = req.job_id;
                    }
                    if rec.drv.status.contains(DriveStatus::BUSY)
                        && req.status.intersects(
                            DriveStatus::ASSIGN
                                | DriveStatus::RELEASE
                                | DriveStatus::MOUNT
                                | DriveStatus::UNMOUNT,
                        )
                        && rec.drv.job_id != req.job_id
                    {
                        return Err(VdqmError::BadId);
                    }
                    // A free unit must be marked busy by a job before it
                    // can be operated on
                    if !req.status.contains(DriveStatus::BUSY)
                        && rec.drv.status.contains(DriveStatus::FREE)
                        && req.status.intersects(
                            DriveStatus::ASSIGN
                                | DriveStatus::RELEASE
                                | DriveStatus::MOUNT
                                | DriveStatus::UNMOUNT,
                        )
                    {
                        return Err(VdqmError::BadStatus);
                    }
                    if req.status.contains(DriveStatus::ASSIGN)
                        && rec.drv.status.contains(DriveStatus::ASSIGN)
                        && rec.drv.job_id != req.job_id
                    {
                        return Err(VdqmError::BadId);
                    }
                    rec.drv.status |= req.status - (DriveStatus::MOUNT | DriveStatus::UNMOUNT);
                }
            }
        }

        let mut reply_volid = String::new();
        if g.drv_queue[di].drv.status.contains(DriveStatus::UP) {
            {
                let rec = &mut g.drv_queue[di];

                if req.status.contains(DriveStatus::ASSIGN) {
                    rec.drv.status =
                        (rec.drv.status | DriveStatus::BUSY)
                            - (DriveStatus::RELEASE | DriveStatus::FREE);
                }

                if req.status.contains(DriveStatus::MOUNT) {
                    // A mount needs an assigned unit and a volid consistent
                    // with the paired request
                    if !rec.drv.status.contains(DriveStatus::ASSIGN) {
                        return Err(VdqmError::NotAssigned);
                    }
                    if req.volid.is_empty() {
                        return Err(VdqmError::BadVolId);
                    }
                    if let Some(ref vol) = rec.vol {
                        if vol.volid != req.volid {
                            return Err(VdqmError::BadVolId);
                        }
                    }
                    rec.drv.volid = req.volid.clone();
                    rec.drv.status |= DriveStatus::BUSY;
                }

                if req.status.contains(DriveStatus::UNMOUNT) {
                    rec.drv.volid.clear();
                    rec.drv.status -= DriveStatus::RELEASE;
                }
            }

            if req.status.contains(DriveStatus::RELEASE)
                && !req.status.contains(DriveStatus::FREE)
                && (!req.volid.is_empty() || !g.drv_queue[di].drv.volid.is_empty())
            {
                let mounted = {
                    let rec = &mut g.drv_queue[di];
                    rec.drv.status -= DriveStatus::ASSIGN;
                    rec.drv.vol_req_id = 0;
                    rec.drv.job_id = 0;
                    rec.vol = None;
                    if !req.volid.is_empty() && req.volid != rec.drv.volid {
                        warn!(
                            "inconsistent release of {} on {} (mounted: {})",
                            req.volid,
                            rec.drv.unit_name(),
                            rec.drv.volid
                        );
                    }
                    rec.drv.volid.clone()
                };

                // The job ended with a volume still mounted: serve another
                // queued request for the same volume, or order an unmount
                let next = g
                    .vol_queue
                    .iter()
                    .position(|v| v.volid == mounted)
                    .map(|vi| g.vol_queue.remove(vi));
                let rec = &mut g.drv_queue[di];
                match next {
                    Some(mut vol) => {
                        vol.drv_req_id = rec.drv.drv_req_id;
                        rec.drv.vol_req_id = vol.vol_req_id;
                        rec.drv.status -= DriveStatus::RELEASE;
                        rec.vol = Some(vol);
                    }
                    None => {
                        unmount_order = true;
                        reply_volid = mounted;
                    }
                }
            }

            if req.status.contains(DriveStatus::FREE) {
                let rec = &mut g.drv_queue[di];
                rec.drv.status = (rec.drv.status | DriveStatus::FREE)
                    - (DriveStatus::ASSIGN | DriveStatus::RELEASE | DriveStatus::BUSY);
                rec.vol = None;
                rec.drv.vol_req_id = 0;
                rec.drv.job_id = 0;
            }

            self.schedule_jobs(g).await;
        } else if req.status.intersects(
            DriveStatus::FREE
                | DriveStatus::ASSIGN
                | DriveStatus::BUSY
                | DriveStatus::RELEASE
                | DriveStatus::MOUNT
                | DriveStatus::UNMOUNT,
        ) {
            return Err(VdqmError::UnitNotUp);
        }

        let mut reply = g.drv_queue[di].drv.clone();
        if unmount_order {
            reply.status = DriveStatus::UNMOUNT;
            reply.volid = reply_volid;
        }
        Ok(reply)
    }
}

#[async_trait]
impl QueueStore for MemQueueStore {
    async fn add_volume_request(&self, mut req: VolumeRequest) -> VdqmResult<VolumeRequest> {
        if req.volid.is_empty() || req.dgn.is_empty() {
            return Err(VdqmError::BadVolId);
        }

        req.vol_req_id = Self::next_id(&self.next_vol_id);
        req.drv_req_id = 0;
        req.recv_time = chrono::Utc::now().timestamp();

        let group = self.group(&req.dgn);
        let mut g = group.lock().await;
        debug!(
            "queueing request {} for volid {} (dgn {})",
            req.vol_req_id, req.volid, req.dgn
        );
        g.insert_volume(req.clone());
        self.schedule_jobs(&mut g).await;

        // Report the queued (or already paired) state back to the caller
        let stored = g
            .vol_queue
            .iter()
            .find(|v| v.vol_req_id == req.vol_req_id)
            .cloned()
            .or_else(|| {
                g.drv_queue
                    .iter()
                    .find_map(|r| r.vol.as_ref().filter(|v| v.vol_req_id == req.vol_req_id))
                    .cloned()
            })
            .unwrap_or(req);
        Ok(stored)
    }

    async fn delete_volume_request(&self, req: &VolumeRequest) -> VdqmResult<()> {
        let group = self.group(&req.dgn);
        let mut g = group.lock().await;

        if let Some(at) = g.vol_queue.iter().position(|v| v.vol_req_id == req.vol_req_id) {
            g.vol_queue.remove(at);
            return Ok(());
        }

        // Not queued: it may already be paired to a drive. Detach it but
        // leave the drive status alone; the client is expected to also
        // interrupt the tape job so the drive is reported ready again.
        if let Some(rec) = g
            .drv_queue
            .iter_mut()
            .find(|r| r.vol.as_ref().is_some_and(|v| v.vol_req_id == req.vol_req_id))
        {
            rec.vol = None;
            rec.drv.vol_req_id = 0;
            return Ok(());
        }

        Err(VdqmError::NoVolumeRequest)
    }

    async fn update_drive(&self, mut req: DriveRequest) -> VdqmResult<DriveRequest> {
        if req.drive.is_empty() || req.server.is_empty() || req.dgn.is_empty() {
            return Err(VdqmError::BadStatus);
        }

        let group = self.group(&req.dgn);
        let mut g = group.lock().await;

        let di = match g.find_drive(&req.drive, &req.server) {
            Some(di) => di,
            None => {
                info!("adding new drive {} (dgn {})", req.unit_name(), req.dgn);
                req.drv_req_id = Self::next_id(&self.next_drv_id);
                req.recv_time = chrono::Utc::now().timestamp();
                let dedication = DedicationExpression::compile(&req.dedicate, &*self.accounts);
                g.drv_queue.push(DriveRecord {
                    drv: req.clone(),
                    dedication,
                    vol: None,
                });
                g.drv_queue.len() - 1
            }
        };

        let reply = self.apply_drive_transition(&mut g, di, &req).await?;
        Ok(reply)
    }

    async fn delete_drive(&self, req: &DriveRequest) -> VdqmResult<()> {
        let group = self.group(&req.dgn);
        let mut g = group.lock().await;

        let di = g
            .find_drive(&req.drive, &req.server)
            .ok_or(VdqmError::NoDriveRecord)?;

        // Never remove a record with a running job
        let status = g.drv_queue[di].drv.status;
        if status.intersects(DriveStatus::BUSY | DriveStatus::ASSIGN)
            && !status.contains(DriveStatus::DOWN)
        {
            return Err(VdqmError::BadStatus);
        }

        let rec = g.drv_queue.remove(di);
        if rec.vol.is_some() {
            debug!(
                "drive {} removed with pending request {}",
                rec.drv.unit_name(),
                rec.drv.vol_req_id
            );
        }
        Ok(())
    }

    async fn set_dedication(&self, req: &DriveRequest) -> VdqmResult<DriveRequest> {
        let group = self.group(&req.dgn);
        let mut g = group.lock().await;

        let di = g
            .find_drive(&req.drive, &req.server)
            .ok_or(VdqmError::NoDriveRecord)?;

        {
            let rec = &mut g.drv_queue[di];
            info!(
                "dedicating {} to '{}'",
                rec.drv.unit_name(),
                if req.dedicate.is_empty() { "(cleared)" } else { &req.dedicate }
            );
            rec.drv.dedicate = req.dedicate.clone();
            // The old compiled expression is discarded with the assignment
            rec.dedication = DedicationExpression::compile(&req.dedicate, &*self.accounts);
        }

        // A narrower or cleared dedication can change which queued
        // requests are now serviceable
        self.schedule_jobs(&mut g).await;
        Ok(g.drv_queue[di].drv.clone())
    }

    async fn queue_position(&self, req: &VolumeRequest) -> VdqmResult<i32> {
        let group = self.group(&req.dgn);
        let g = group.lock().await;
        g.vol_queue
            .iter()
            .position(|v| v.vol_req_id == req.vol_req_id)
            .map(|p| p as i32)
            .ok_or(VdqmError::NoVolumeRequest)
    }

    async fn volume_queue(&self, dgn: Option<&str>) -> Vec<VolumeRequest> {
        let names = match dgn {
            Some(d) => vec![d.to_owned()],
            None => self.group_names(),
        };
        let mut out = Vec::new();
        for name in names {
            if let Some(group) = self.groups.get(&name).map(|e| e.value().clone()) {
                let g = group.lock().await;
                out.extend(g.vol_queue.iter().cloned());
            }
        }
        out
    }

    async fn drive_queue(&self, dgn: Option<&str>) -> Vec<DriveRequest> {
        let names = match dgn {
            Some(d) => vec![d.to_owned()],
            None => self.group_names(),
        };
        let mut out = Vec::new();
        for name in names {
            if let Some(group) = self.groups.get(&name).map(|e| e.value().clone()) {
                let g = group.lock().await;
                out.extend(g.drv_queue.iter().map(|r| r.drv.clone()));
            }
        }
        out
    }

    async fn rollback_drive_op(&self, req: &DriveRequest) -> VdqmResult<()> {
        let group = self.group(&req.dgn);
        let mut g = group.lock().await;

        let di = g
            .find_drive(&req.drive, &req.server)
            .ok_or(VdqmError::NoDriveRecord)?;

        let vol = {
            let rec = &mut g.drv_queue[di];
            rec.drv.vol_req_id = 0;
            rec.drv.job_id = 0;
            if rec.drv.status.contains(DriveStatus::UP) {
                rec.drv.status =
                    (rec.drv.status | DriveStatus::FREE) - (DriveStatus::BUSY | DriveStatus::ASSIGN);
            }
            rec.vol.take()
        };

        if let Some(mut vol) = vol {
            vol.drv_req_id = 0;
            g.insert_volume(vol);
        }
        Ok(())
    }

    async fn snapshot_all(&self) -> (Vec<VolumeRequest>, Vec<DriveRequest>) {
        let guards = self.lock_all().await;
        let mut vols = Vec::new();
        let mut drvs = Vec::new();
        for g in &guards {
            vols.extend(g.vol_queue.iter().cloned());
            for rec in &g.drv_queue {
                drvs.push(rec.drv.clone());
                if let Some(ref vol) = rec.vol {
                    vols.push(vol.clone());
                }
            }
        }
        (vols, drvs)
    }

    async fn replace_all(&self, vols: Vec<VolumeRequest>, drives: Vec<DriveRequest>) {
        // Drop current contents, then install group by group
        self.groups.clear();
        let mut max_vol = 0;
        let mut max_drv = 0;

        for drv in drives {
            max_drv = max_drv.max(drv.drv_req_id);
            let group = self.group(&drv.dgn);
            let mut g = group.lock().await;
            let dedication = DedicationExpression::compile(&drv.dedicate, &*self.accounts);
            g.drv_queue.push(DriveRecord {
                drv,
                dedication,
                vol: None,
            });
        }
        for vol in vols {
            max_vol = max_vol.max(vol.vol_req_id);
            let group = self.group(&vol.dgn);
            let mut g = group.lock().await;
            if vol.drv_req_id != 0 {
                // Re-attach to its drive record
                if let Some(rec) = g
                    .drv_queue
                    .iter_mut()
                    .find(|r| r.drv.drv_req_id == vol.drv_req_id)
                {
                    rec.vol = Some(vol);
                    continue;
                }
                warn!(
                    "snapshot request {} references unknown drive {}",
                    vol.vol_req_id, vol.drv_req_id
                );
            }
            g.insert_volume(vol);
        }

        // Keep id allocation ahead of everything just installed
        self.next_vol_id.store(max_vol.saturating_add(1).max(1), Ordering::Relaxed);
        self.next_drv_id.store(max_drv.saturating_add(1).max(1), Ordering::Relaxed);
    }

    async fn apply_group(&self, dgn: &str, vols: Vec<VolumeRequest>, drives: Vec<DriveRequest>) {
        let group = self.group(dgn);
        let mut g = group.lock().await;
        g.vol_queue.clear();
        g.drv_queue.clear();
        for drv in drives {
            let dedication = DedicationExpression::compile(&drv.dedicate, &*self.accounts);
            g.drv_queue.push(DriveRecord {
                drv,
                dedication,
                vol: None,
            });
        }
        for vol in vols {
            if vol.drv_req_id != 0 {
                if let Some(rec) = g
                    .drv_queue
                    .iter_mut()
                    .find(|r| r.drv.drv_req_id == vol.drv_req_id)
                {
                    rec.vol = Some(vol);
                    continue;
                }
            }
            g.insert_volume(vol);
        }
    }

    async fn dump_group(&self, dgn: &str) -> (Vec<VolumeRequest>, Vec<DriveRequest>) {
        let group = self.group(dgn);
        let g = group.lock().await;
        let mut vols: Vec<VolumeRequest> = g.vol_queue.clone();
        let mut drvs = Vec::new();
        for rec in &g.drv_queue {
            drvs.push(rec.drv.clone());
            if let Some(ref vol) = rec.vol {
                vols.push(vol.clone());
            }
        }
        (vols, drvs)
    }

    async fn persist(&self) -> VdqmResult<()> {
        let dir = match self.data_dir {
            Some(ref dir) => dir.clone(),
            None => return Ok(()),
        };
        let (vols, drvs) = self.snapshot_all().await;
        config::save_queues(&dir, &vols, &drvs).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockJobStarter;
    use super::*;
    use vdqm_core::dedication::StaticAccounts;

    fn store_with(jobs: Arc<MockJobStarter>) -> MemQueueStore {
        let accounts = Arc::new(StaticAccounts::new(["stage"]));
        MemQueueStore::new(accounts, jobs, None)
    }

    fn vol(volid: &str, dgn: &str) -> VolumeRequest {
        VolumeRequest {
            volid: volid.into(),
            dgn: dgn.into(),
            client_host: "client01".into(),
            client_name: "stage".into(),
            client_uid: 100,
            client_gid: 200,
            ..Default::default()
        }
    }

    fn drive_up(drive: &str, server: &str, dgn: &str) -> DriveRequest {
        DriveRequest {
            status: DriveStatus::UP | DriveStatus::FREE,
            drive: drive.into(),
            server: server.into(),
            dgn: dgn.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_volume_assigns_id_and_queues() {
        let store = store_with(MockJobStarter::new());
        let stored = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();
        assert!(stored.vol_req_id > 0);
        assert_eq!(store.queue_position(&stored).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_volume_rejects_empty_volid() {
        let store = store_with(MockJobStarter::new());
        let mut req = vol("", "SL8500");
        req.volid.clear();
        assert_eq!(
            store.add_volume_request(req).await.unwrap_err(),
            VdqmError::BadVolId
        );
    }

    #[tokio::test]
    async fn test_priority_order_then_fifo() {
        let store = store_with(MockJobStarter::new());
        let mut low = vol("T00001", "SL8500");
        low.priority = 0;
        let mut high = vol("T00002", "SL8500");
        high.priority = 5;
        let mut low2 = vol("T00003", "SL8500");
        low2.priority = 0;

        let low = store.add_volume_request(low).await.unwrap();
        let high = store.add_volume_request(high).await.unwrap();
        let low2 = store.add_volume_request(low2).await.unwrap();

        assert_eq!(store.queue_position(&high).await.unwrap(), 0);
        assert_eq!(store.queue_position(&low).await.unwrap(), 1);
        assert_eq!(store.queue_position(&low2).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_free_drive_serves_queue() {
        let jobs = MockJobStarter::new();
        let store = store_with(jobs.clone());

        let stored = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();
        // No drive yet: still queued
        assert_eq!(store.queue_position(&stored).await.unwrap(), 0);

        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();

        // Paired: gone from the queue, drive busy with its id
        assert_eq!(
            store.queue_position(&stored).await.unwrap_err(),
            VdqmError::NoVolumeRequest
        );
        let drives = store.drive_queue(Some("SL8500")).await;
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].vol_req_id, stored.vol_req_id);
        assert!(drives[0].status.contains(DriveStatus::BUSY));
        assert!(!drives[0].status.contains(DriveStatus::FREE));
        assert_eq!(
            jobs.started.lock().await.as_slice(),
            &[(stored.vol_req_id, "drv0@tps01".to_string())]
        );
    }

    #[tokio::test]
    async fn test_dedicated_drive_skips_non_matching_request() {
        let jobs = MockJobStarter::new();
        let store = store_with(jobs.clone());

        let mut drv = drive_up("drv0", "tps01", "SL8500");
        drv.dedicate =
            "uid=100,gid=.*,name=.*,host=.*,vid=.*,mode=.*,datestr=.*,timestr=.*,age=.*".into();
        store.update_drive(drv.clone()).await.unwrap();

        let mut other = vol("T00001", "SL8500");
        other.client_uid = 999;
        let other = store.add_volume_request(other).await.unwrap();
        // uid mismatch: stays queued
        assert_eq!(store.queue_position(&other).await.unwrap(), 0);
        assert!(jobs.started.lock().await.is_empty());

        let matching = store.add_volume_request(vol("T00002", "SL8500")).await.unwrap();
        // uid 100 matches and is served despite being behind in the queue
        assert_eq!(
            store.queue_position(&matching).await.unwrap_err(),
            VdqmError::NoVolumeRequest
        );
        assert_eq!(store.queue_position(&other).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clearing_dedication_unblocks_queue() {
        let store = store_with(MockJobStarter::new());

        let mut drv = drive_up("drv0", "tps01", "SL8500");
        drv.dedicate =
            "uid=100,gid=.*,name=.*,host=.*,vid=.*,mode=.*,datestr=.*,timestr=.*,age=.*".into();
        store.update_drive(drv.clone()).await.unwrap();

        let mut req = vol("T00001", "SL8500");
        req.client_uid = 999;
        let req = store.add_volume_request(req).await.unwrap();
        assert_eq!(store.queue_position(&req).await.unwrap(), 0);

        drv.dedicate = String::new();
        let updated = store.set_dedication(&drv).await.unwrap();
        assert!(updated.dedicate.is_empty());
        assert_eq!(
            store.queue_position(&req).await.unwrap_err(),
            VdqmError::NoVolumeRequest
        );
    }

    #[tokio::test]
    async fn test_job_start_failure_flags_unit_unknown() {
        let jobs = MockJobStarter::new();
        jobs.fail.store(true, Ordering::Relaxed);
        let store = store_with(jobs.clone());

        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        let req = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();

        // Request back in queue, drive flagged unknown
        assert_eq!(store.queue_position(&req).await.unwrap(), 0);
        let drives = store.drive_queue(Some("SL8500")).await;
        assert!(drives[0].status.contains(DriveStatus::UNKNOWN));
        assert_eq!(drives[0].vol_req_id, 0);
    }

    #[tokio::test]
    async fn test_drive_down_requeues_assigned_request() {
        let store = store_with(MockJobStarter::new());
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        let req = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();
        assert!(store.queue_position(&req).await.is_err());

        let mut down = drive_up("drv0", "tps01", "SL8500");
        down.status = DriveStatus::DOWN;
        let updated = store.update_drive(down).await.unwrap();
        assert_eq!(updated.status, DriveStatus::DOWN);
        assert_eq!(store.queue_position(&req).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transition_on_down_drive_is_rejected() {
        let store = store_with(MockJobStarter::new());
        let mut down = drive_up("drv0", "tps01", "SL8500");
        down.status = DriveStatus::DOWN;
        store.update_drive(down).await.unwrap();

        let mut busy = drive_up("drv0", "tps01", "SL8500");
        busy.status = DriveStatus::BUSY;
        assert_eq!(
            store.update_drive(busy).await.unwrap_err(),
            VdqmError::UnitNotUp
        );
    }

    #[tokio::test]
    async fn test_busy_and_free_is_inconsistent() {
        let store = store_with(MockJobStarter::new());
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();

        let mut bad = drive_up("drv0", "tps01", "SL8500");
        bad.status = DriveStatus::BUSY | DriveStatus::FREE;
        assert_eq!(
            store.update_drive(bad).await.unwrap_err(),
            VdqmError::BadStatus
        );
    }

    #[tokio::test]
    async fn test_assign_with_wrong_request_id_is_rejected() {
        let store = store_with(MockJobStarter::new());
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        let req = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();

        let mut assign = drive_up("drv0", "tps01", "SL8500");
        assign.status = DriveStatus::ASSIGN;
        assign.vol_req_id = req.vol_req_id + 1000;
        assign.job_id = 4711;
        assert_eq!(
            store.update_drive(assign).await.unwrap_err(),
            VdqmError::BadId
        );
    }

    #[tokio::test]
    async fn test_release_with_no_waiter_orders_unmount() {
        let store = store_with(MockJobStarter::new());
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        let req = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();

        // Tape daemon assigns, mounts, then releases with no other waiter
        let mut assign = drive_up("drv0", "tps01", "SL8500");
        assign.status = DriveStatus::ASSIGN;
        assign.vol_req_id = req.vol_req_id;
        assign.job_id = 4711;
        store.update_drive(assign).await.unwrap();

        let mut mount = drive_up("drv0", "tps01", "SL8500");
        mount.status = DriveStatus::MOUNT;
        mount.volid = "T00001".into();
        mount.job_id = 4711;
        store.update_drive(mount).await.unwrap();

        let mut release = drive_up("drv0", "tps01", "SL8500");
        release.status = DriveStatus::RELEASE;
        release.job_id = 4711;
        let reply = store.update_drive(release).await.unwrap();
        assert_eq!(reply.status, DriveStatus::UNMOUNT);
        assert_eq!(reply.volid, "T00001");
    }

    #[tokio::test]
    async fn test_release_repairs_to_waiting_request_for_same_volume() {
        let jobs = MockJobStarter::new();
        let store = store_with(jobs.clone());
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        let first = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();
        // Second request for the same volume waits (volume in use)
        let second = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();
        assert_eq!(store.queue_position(&second).await.unwrap(), 0);

        let mut assign = drive_up("drv0", "tps01", "SL8500");
        assign.status = DriveStatus::ASSIGN;
        assign.vol_req_id = first.vol_req_id;
        assign.job_id = 1;
        store.update_drive(assign).await.unwrap();

        let mut mount = drive_up("drv0", "tps01", "SL8500");
        mount.status = DriveStatus::MOUNT;
        mount.volid = "T00001".into();
        mount.job_id = 1;
        store.update_drive(mount).await.unwrap();

        let mut release = drive_up("drv0", "tps01", "SL8500");
        release.status = DriveStatus::RELEASE;
        release.job_id = 1;
        let reply = store.update_drive(release).await.unwrap();

        // Re-paired to the second request instead of unmounting
        assert_ne!(reply.status, DriveStatus::UNMOUNT);
        assert_eq!(reply.vol_req_id, second.vol_req_id);
        assert!(store.queue_position(&second).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_busy_drive_is_rejected() {
        let store = store_with(MockJobStarter::new());
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();

        let probe = drive_up("drv0", "tps01", "SL8500");
        assert_eq!(
            store.delete_drive(&probe).await.unwrap_err(),
            VdqmError::BadStatus
        );

        // After configuring down, removal is allowed
        let mut down = probe.clone();
        down.status = DriveStatus::DOWN;
        store.update_drive(down).await.unwrap();
        store.delete_drive(&probe).await.unwrap();
        assert!(store.drive_queue(Some("SL8500")).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_paired_volume_detaches_from_drive() {
        let store = store_with(MockJobStarter::new());
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        let req = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();

        store.delete_volume_request(&req).await.unwrap();
        let drives = store.drive_queue(Some("SL8500")).await;
        assert_eq!(drives[0].vol_req_id, 0);
        // Status untouched: cleanup is the tape daemon's move
        assert!(drives[0].status.contains(DriveStatus::BUSY));
    }

    #[tokio::test]
    async fn test_delete_unknown_volume_request() {
        let store = store_with(MockJobStarter::new());
        let req = vol("T00001", "SL8500");
        assert_eq!(
            store.delete_volume_request(&req).await.unwrap_err(),
            VdqmError::NoVolumeRequest
        );
    }

    #[tokio::test]
    async fn test_rollback_drive_op_restores_queue() {
        let store = store_with(MockJobStarter::new());
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        let req = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();
        assert!(store.queue_position(&req).await.is_err());

        let probe = drive_up("drv0", "tps01", "SL8500");
        store.rollback_drive_op(&probe).await.unwrap();

        assert_eq!(store.queue_position(&req).await.unwrap(), 0);
        let drives = store.drive_queue(Some("SL8500")).await;
        assert_eq!(drives[0].vol_req_id, 0);
        assert!(drives[0].status.contains(DriveStatus::FREE));
    }

    #[tokio::test]
    async fn test_snapshot_includes_paired_requests() {
        let store = store_with(MockJobStarter::new());
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        let paired = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();
        let queued = store.add_volume_request(vol("T00002", "SL9310")).await.unwrap();

        let (vols, drvs) = store.snapshot_all().await;
        assert_eq!(drvs.len(), 1);
        assert_eq!(vols.len(), 2);
        assert!(vols.iter().any(|v| v.vol_req_id == paired.vol_req_id));
        assert!(vols.iter().any(|v| v.vol_req_id == queued.vol_req_id));
    }

    #[tokio::test]
    async fn test_replace_all_round_trip() {
        let store = store_with(MockJobStarter::new());
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        let paired = store.add_volume_request(vol("T00001", "SL8500")).await.unwrap();
        let queued = store.add_volume_request(vol("T00002", "SL9310")).await.unwrap();
        let (vols, drvs) = store.snapshot_all().await;

        let replica = store_with(MockJobStarter::new());
        replica.replace_all(vols, drvs).await;

        let (rv, rd) = replica.snapshot_all().await;
        assert_eq!(rv.len(), 2);
        assert_eq!(rd.len(), 1);
        // Pairing survived the transfer
        let drives = replica.drive_queue(Some("SL8500")).await;
        assert_eq!(drives[0].vol_req_id, paired.vol_req_id);
        assert_eq!(replica.queue_position(&queued).await.unwrap(), 0);

        // New ids on the replica stay ahead of the installed ones
        let fresh = replica.add_volume_request(vol("T00003", "SL9310")).await.unwrap();
        assert!(fresh.vol_req_id > queued.vol_req_id);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = Arc::new(StaticAccounts::new(["stage"]));
        let store = MemQueueStore::new(
            accounts.clone(),
            MockJobStarter::new(),
            Some(dir.path().to_owned()),
        );
        store.update_drive(drive_up("drv0", "tps01", "SL8500")).await.unwrap();
        let queued = store.add_volume_request(vol("T00002", "SL9310")).await.unwrap();
        store.persist().await.unwrap();

        let restored = MemQueueStore::new(
            accounts,
            MockJobStarter::new(),
            Some(dir.path().to_owned()),
        );
        let (vols, drvs) = config::load_queues(dir.path()).await.unwrap().unwrap();
        restored.replace_all(vols, drvs).await;
        assert_eq!(restored.queue_position(&queued).await.unwrap(), 0);
        assert_eq!(restored.drive_queue(Some("SL8500")).await.len(), 1);
    }
}
