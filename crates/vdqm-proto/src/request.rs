/// Request, acknowledgement, and reply types for the VDQM protocol.
///
/// In the C version a request was a `{magic, reqtype, len}` header followed
/// by a field-marshalled body, and the request code was an integer switched
/// on by the server. Here the codes are one serde enum; the header keeps
/// the magic for cheap rejection of stray connections.
///
/// Every mutating exchange follows
/// `request -> {commit|rollback} -> [body] -> peer ack`.

use serde::{Deserialize, Serialize};

use crate::constants::{VDQM_MAGIC, VDQM_PROTO_VER};
use crate::error::VdqmError;
use crate::types::{DriveRequest, VolumeRequest};

/// Common header for all request frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Protocol magic
    pub magic: u32,
    /// Protocol version
    pub version: u8,
}

impl MessageHeader {
    pub fn new() -> Self {
        Self {
            magic: VDQM_MAGIC,
            version: VDQM_PROTO_VER,
        }
    }

    /// Check the magic word.
    pub fn is_valid(&self) -> bool {
        self.magic == VDQM_MAGIC
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Client and replica request codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VdqmRequest {
    // ---- Queue operations ----
    /// Submit a new volume mount request.
    AddVolume(VolumeRequest),
    /// Cancel a queued volume request.
    DeleteVolume(VolumeRequest),
    /// Create or update a drive record (status transitions included).
    AddDrive(DriveRequest),
    /// Remove a drive record.
    DeleteDrive(DriveRequest),
    /// Set or clear a drive's dedication string.
    DedicateDrive(DriveRequest),
    /// Enumerate the volume queue (all device groups when `dgn` is empty).
    GetVolQueue { dgn: String },
    /// Enumerate the drive queue (all device groups when `dgn` is empty).
    GetDrvQueue { dgn: String },

    // ---- Abbreviated-handshake operations ----
    /// Query the queue position of a volume request.
    Ping(VolumeRequest),
    /// Orderly connection termination probe.
    Hangup,

    // ---- Administrative operations ----
    /// Stop admitting new ordinary requests.
    Hold,
    /// Resume admitting requests.
    Release,
    /// Hold and stop accepting new connections.
    Shutdown,

    // ---- Replication ----
    /// A standby server asks to join as a replica and receive the queue
    /// snapshot plus the subsequent update stream.
    ReplicaJoin {
        /// The joining server's name
        server: String,
    },
}

impl VdqmRequest {
    /// Administrative codes, subject to admin-host authorization.
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            VdqmRequest::Hold | VdqmRequest::Release | VdqmRequest::Shutdown
        )
    }

    /// Codes that mutate the queue store and need compensation if the
    /// commit handshake is cut short.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            VdqmRequest::AddVolume(_)
                | VdqmRequest::DeleteVolume(_)
                | VdqmRequest::AddDrive(_)
                | VdqmRequest::DeleteDrive(_)
                | VdqmRequest::DedicateDrive(_)
        )
    }

    /// Short display name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            VdqmRequest::AddVolume(_) => "AddVolume",
            VdqmRequest::DeleteVolume(_) => "DeleteVolume",
            VdqmRequest::AddDrive(_) => "AddDrive",
            VdqmRequest::DeleteDrive(_) => "DeleteDrive",
            VdqmRequest::DedicateDrive(_) => "DedicateDrive",
            VdqmRequest::GetVolQueue { .. } => "GetVolQueue",
            VdqmRequest::GetDrvQueue { .. } => "GetDrvQueue",
            VdqmRequest::Ping(_) => "Ping",
            VdqmRequest::Hangup => "Hangup",
            VdqmRequest::Hold => "Hold",
            VdqmRequest::Release => "Release",
            VdqmRequest::Shutdown => "Shutdown",
            VdqmRequest::ReplicaJoin { .. } => "ReplicaJoin",
        }
    }
}

/// Acknowledgement frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ack {
    /// The operation was performed; the reply body follows.
    Commit,
    /// The operation was not performed (or was undone).
    Rollback(VdqmError),
    /// Ping reply: 0-based queue position.
    QueuePos(i32),
    /// Hangup reply.
    Hangup,
}

/// Reply and enumeration record frames.
///
/// Enumeration streams end with a record whose id is
/// [`crate::constants::SENTINEL_ID`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyBody {
    Volume(VolumeRequest),
    Drive(DriveRequest),
}

impl ReplyBody {
    /// The record id carried by this body.
    pub fn id(&self) -> i32 {
        match self {
            ReplyBody::Volume(v) => v.vol_req_id,
            ReplyBody::Drive(d) => d.drv_req_id,
        }
    }
}

/// Job start message, sent to the requesting client's callback port once a
/// drive has been assigned to its volume request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub vol_req_id: i32,
    pub client_port: u16,
    pub client_uid: u32,
    pub client_gid: u32,
    pub client_host: String,
    pub client_name: String,
    pub dgn: String,
    pub drive: String,
    pub server: String,
}

/// Frames sent by the primary on an established replica stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMessage {
    /// Full point-in-time dump of both queues, sent once after the join
    /// handshake.
    Snapshot {
        volumes: Vec<VolumeRequest>,
        drives: Vec<DriveRequest>,
    },
    /// Replacement contents of one device group after a mutation.
    GroupUpdate {
        dgn: String,
        volumes: Vec<VolumeRequest>,
        drives: Vec<DriveRequest>,
    },
}
