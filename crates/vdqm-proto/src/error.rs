/// VDQM error types.
///
/// Every operation returns an explicit `VdqmResult`; there is no ambient
/// per-thread error state. The numeric codes travel inside rollback
/// acknowledgements and in the negated queue-position of a failed ping.

use serde::{Deserialize, Serialize};

/// Unified error type for all VDQM operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum VdqmError {
    #[error("internal system error")]
    SystemError,
    #[error("network error")]
    NetworkError,
    #[error("connection dropped")]
    ConnectionDropped,
    #[error("protocol error")]
    ProtocolError,
    #[error("request not authorized")]
    NotAuthorized,
    #[error("server is on hold")]
    OnHold,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("inconsistent drive status requested")]
    BadStatus,
    #[error("inconsistent request or job id")]
    BadId,
    #[error("invalid or missing volume id")]
    BadVolId,
    #[error("drive unit is not up")]
    UnitNotUp,
    #[error("drive unit is not assigned")]
    NotAssigned,
    #[error("volume request not found")]
    NoVolumeRequest,
    #[error("drive record not found")]
    NoDriveRecord,
    #[error("drive record already exists")]
    DriveExists,
    #[error("another primary exists, local node must become a replica")]
    ReplicaConflict,
    #[error("replica synchronization failed")]
    ReplicaFailed,
}

impl VdqmError {
    /// Convert from a raw protocol error code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x00 => None, // Success
            0x01 => Some(Self::SystemError),
            0x02 => Some(Self::NetworkError),
            0x03 => Some(Self::ConnectionDropped),
            0x04 => Some(Self::ProtocolError),
            0x05 => Some(Self::NotAuthorized),
            0x06 => Some(Self::OnHold),
            0x07 => Some(Self::ShuttingDown),
            0x08 => Some(Self::BadStatus),
            0x09 => Some(Self::BadId),
            0x0A => Some(Self::BadVolId),
            0x0B => Some(Self::UnitNotUp),
            0x0C => Some(Self::NotAssigned),
            0x0D => Some(Self::NoVolumeRequest),
            0x0E => Some(Self::NoDriveRecord),
            0x0F => Some(Self::DriveExists),
            0x10 => Some(Self::ReplicaConflict),
            0x11 => Some(Self::ReplicaFailed),
            _ => Some(Self::SystemError),
        }
    }

    /// Convert to the raw protocol error code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::SystemError => 0x01,
            Self::NetworkError => 0x02,
            Self::ConnectionDropped => 0x03,
            Self::ProtocolError => 0x04,
            Self::NotAuthorized => 0x05,
            Self::OnHold => 0x06,
            Self::ShuttingDown => 0x07,
            Self::BadStatus => 0x08,
            Self::BadId => 0x09,
            Self::BadVolId => 0x0A,
            Self::UnitNotUp => 0x0B,
            Self::NotAssigned => 0x0C,
            Self::NoVolumeRequest => 0x0D,
            Self::NoDriveRecord => 0x0E,
            Self::DriveExists => 0x0F,
            Self::ReplicaConflict => 0x10,
            Self::ReplicaFailed => 0x11,
        }
    }
}

/// Result type alias for VDQM operations.
pub type VdqmResult<T> = Result<T, VdqmError>;

impl From<std::io::Error> for VdqmError {
    fn from(_: std::io::Error) -> Self {
        VdqmError::NetworkError
    }
}
