/// Volume request and drive record types.
///
/// In the C version these were fixed-size structs (`vdqmVolReq_t`,
/// `vdqmDrvReq_t`) with char-array fields marshalled field by field. In
/// Rust they are plain serde structs; the field set and order follow the
/// original marshalling.

use serde::{Deserialize, Serialize};
use std::fmt;

bitflags::bitflags! {
    /// Drive unit status bitmask.
    ///
    /// `MOUNT` and `UNMOUNT` are not persistent unit states: on input they
    /// update the mounted volid, on output `UNMOUNT` tells the tape server
    /// to unmount.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DriveStatus: u32 {
        const UP      = 1 << 0;
        const DOWN    = 1 << 1;
        const FREE    = 1 << 2;
        const BUSY    = 1 << 3;
        const ASSIGN  = 1 << 4;
        const RELEASE = 1 << 5;
        const MOUNT   = 1 << 6;
        const UNMOUNT = 1 << 7;
        const UNKNOWN = 1 << 8;
    }
}

impl Default for DriveStatus {
    fn default() -> Self {
        DriveStatus::empty()
    }
}

impl fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (DriveStatus::UP, "UP"),
            (DriveStatus::DOWN, "DOWN"),
            (DriveStatus::FREE, "FREE"),
            (DriveStatus::BUSY, "BUSY"),
            (DriveStatus::ASSIGN, "ASSIGN"),
            (DriveStatus::RELEASE, "RELEASE"),
            (DriveStatus::MOUNT, "MOUNT"),
            (DriveStatus::UNMOUNT, "UNMOUNT"),
            (DriveStatus::UNKNOWN, "UNKNOWN"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// A client's request to have a volume mounted on some compatible drive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// Queue id, assigned by the server (positive; -1 is the enumeration
    /// sentinel)
    pub vol_req_id: i32,
    /// Id of the drive request this volume request is paired with (0 = none)
    pub drv_req_id: i32,
    /// Queue priority, higher is served first
    pub priority: i32,
    /// Client callback port for the job start message
    pub client_port: u16,
    /// Requesting user id
    pub client_uid: u32,
    /// Requesting group id
    pub client_gid: u32,
    /// Access mode (0 = read, 1 = write)
    pub mode: i32,
    /// Submission timestamp (unix seconds), stamped by the server
    pub recv_time: i64,
    /// Requesting client host
    pub client_host: String,
    /// Requested volume id
    pub volid: String,
    /// Requested drive server (empty = any)
    pub server: String,
    /// Requested drive unit (empty = any)
    pub drive: String,
    /// Device group name
    pub dgn: String,
    /// Resolved account name of the requester
    pub client_name: String,
}

/// The server's state for one physical tape drive, also the wire record for
/// drive status updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveRequest {
    /// Unit status bitmask
    pub status: DriveStatus,
    /// Queue id of this drive record, assigned by the server
    pub drv_req_id: i32,
    /// Id of the volume request currently assigned (0 = none)
    pub vol_req_id: i32,
    /// Job identifier of the running tape job (0 = none)
    pub job_id: i32,
    /// Last status update timestamp (unix seconds)
    pub recv_time: i64,
    /// Last status reset timestamp
    pub reset_time: i64,
    /// Number of jobs served since reset
    pub use_count: i32,
    /// Number of errors since reset
    pub err_count: i32,
    /// Megabytes transferred by the current job
    pub mb_transferred: i32,
    /// Access mode of the current job
    pub mode: i32,
    /// Total megabytes transferred since reset
    pub total_mb: i64,
    /// Volume currently mounted (empty = none)
    pub volid: String,
    /// Server the drive is attached to
    pub server: String,
    /// Drive unit name
    pub drive: String,
    /// Device group name
    pub dgn: String,
    /// Raw dedication string (empty = undedicated)
    pub dedicate: String,
    /// Requesting host, filled in server-side from the peer address
    pub req_host: String,
}

impl DriveRequest {
    /// `drive@server`, the conventional display name of a unit.
    pub fn unit_name(&self) -> String {
        format!("{}@{}", self.drive, self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let st = DriveStatus::UP | DriveStatus::FREE;
        assert_eq!(st.to_string(), "UP|FREE");
        assert_eq!(DriveStatus::empty().to_string(), "-");
    }

    #[test]
    fn test_status_default_is_empty() {
        assert_eq!(DriveStatus::default(), DriveStatus::empty());
    }

    #[test]
    fn test_unit_name() {
        let drv = DriveRequest {
            drive: "drv0".into(),
            server: "tps01".into(),
            ..Default::default()
        };
        assert_eq!(drv.unit_name(), "drv0@tps01");
    }
}
