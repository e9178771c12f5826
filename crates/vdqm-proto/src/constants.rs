/// VDQM protocol and system constants.

/// Protocol magic number, first word of every message header ("VDQ0")
pub const VDQM_MAGIC: u32 = 0x5644_5130;

/// Protocol version
pub const VDQM_PROTO_VER: u8 = 0x01;

/// Default listen port for client and replica connections
pub const VDQM_LISTEN_PORT: u16 = 5012;

/// Record id terminating an enumeration reply stream
pub const SENTINEL_ID: i32 = -1;

/// Maximum frame size accepted on the wire (1 MB) — a queue record is tiny,
/// anything larger indicates a corrupt length prefix
pub const VDQM_MAX_FRAME: usize = 1024 * 1024;

/// Maximum volume id (VID) length
pub const VDQM_MAX_VID_LEN: usize = 6;
/// Maximum device group name length
pub const VDQM_MAX_DGN_LEN: usize = 6;
/// Maximum drive unit name length
pub const VDQM_MAX_DRIVE_LEN: usize = 8;
/// Maximum host/server name length
pub const VDQM_MAX_HOST_LEN: usize = 63;

/// Number of fields in a dedication expression
pub const VDQM_DEDICATE_FIELDS: usize = 9;

/// Dedication field names in their fixed order
pub const VDQM_DEDICATE_FIELD_NAMES: [&str; VDQM_DEDICATE_FIELDS] = [
    "uid", "gid", "name", "host", "vid", "mode", "datestr", "timestr", "age",
];

/// Access mode: read
pub const VDQM_MODE_READ: i32 = 0;
/// Access mode: write
pub const VDQM_MODE_WRITE: i32 = 1;
