//! Volume mount request subcommands.

use clap::{Args, Subcommand};
use tabled::{Table, Tabled};

use vdqm_proto::{ReplyBody, VdqmRequest, VolumeRequest};

use crate::common;

#[derive(Args)]
pub struct VolumeArgs {
    #[command(subcommand)]
    command: VolumeCommand,
}

#[derive(Subcommand)]
enum VolumeCommand {
    /// Submit a mount request
    Submit {
        /// Volume id to mount
        #[arg(long)]
        vid: String,
        /// Device group name
        #[arg(long)]
        dgn: String,
        /// Open for writing
        #[arg(short = 'w', long)]
        write: bool,
        /// Queue priority
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Restrict to a specific drive server
        #[arg(long, default_value = "")]
        server: String,
        /// Restrict to a specific drive unit
        #[arg(long, default_value = "")]
        drive: String,
        /// Callback host for the job start message
        #[arg(long, default_value = "localhost")]
        client_host: String,
        /// Callback port for the job start message
        #[arg(long, default_value_t = 0)]
        client_port: u16,
        /// Requesting user id
        #[arg(long, default_value_t = 0)]
        uid: u32,
        /// Requesting group id
        #[arg(long, default_value_t = 0)]
        gid: u32,
        /// Requesting account name (defaults to $USER)
        #[arg(long)]
        name: Option<String>,
    },
    /// Cancel a queued mount request
    Delete {
        /// Request id to cancel
        #[arg(long)]
        id: i32,
        /// Volume id of the request
        #[arg(long)]
        vid: String,
        /// Device group name
        #[arg(long)]
        dgn: String,
    },
    /// Show the volume queue
    Queue {
        /// Restrict to one device group
        #[arg(long, default_value = "")]
        dgn: String,
    },
    /// Query the queue position of a request
    Ping {
        /// Request id
        #[arg(long)]
        id: i32,
        /// Device group name
        #[arg(long)]
        dgn: String,
    },
}

#[derive(Tabled)]
struct VolumeRow {
    #[tabled(rename = "ID")]
    id: i32,
    #[tabled(rename = "VOLID")]
    volid: String,
    #[tabled(rename = "DGN")]
    dgn: String,
    #[tabled(rename = "PRI")]
    priority: i32,
    #[tabled(rename = "MODE")]
    mode: &'static str,
    #[tabled(rename = "USER")]
    user: String,
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "DRIVE")]
    drive: String,
}

fn row(vol: &VolumeRequest) -> VolumeRow {
    VolumeRow {
        id: vol.vol_req_id,
        volid: vol.volid.clone(),
        dgn: vol.dgn.clone(),
        priority: vol.priority,
        mode: if vol.mode == vdqm_proto::constants::VDQM_MODE_WRITE {
            "write"
        } else {
            "read"
        },
        user: vol.client_name.clone(),
        host: vol.client_host.clone(),
        drive: if vol.drive.is_empty() {
            "*".into()
        } else {
            format!("{}@{}", vol.drive, vol.server)
        },
    }
}

pub async fn run(addr: &str, port: u16, args: VolumeArgs) {
    match args.command {
        VolumeCommand::Submit {
            vid,
            dgn,
            write,
            priority,
            server,
            drive,
            client_host,
            client_port,
            uid,
            gid,
            name,
        } => {
            let req = VolumeRequest {
                volid: vid,
                dgn,
                mode: if write {
                    vdqm_proto::constants::VDQM_MODE_WRITE
                } else {
                    vdqm_proto::constants::VDQM_MODE_READ
                },
                priority,
                server,
                drive,
                client_host,
                client_port,
                client_uid: uid,
                client_gid: gid,
                client_name: name.unwrap_or_else(common::current_user),
                ..Default::default()
            };

            let mut conn = match common::connect(addr, port).await {
                Ok(conn) => conn,
                Err(e) => common::fail("connect", e),
            };
            match conn.exchange(&VdqmRequest::AddVolume(req)).await {
                Ok(ReplyBody::Volume(stored)) => {
                    println!("Queued request {} for {}", stored.vol_req_id, stored.volid);
                }
                Ok(other) => eprintln!("Unexpected reply: {:?}", other),
                Err(e) => common::fail("submit", e),
            }
        }

        VolumeCommand::Delete { id, vid, dgn } => {
            let req = VolumeRequest {
                vol_req_id: id,
                volid: vid,
                dgn,
                ..Default::default()
            };
            let mut conn = match common::connect(addr, port).await {
                Ok(conn) => conn,
                Err(e) => common::fail("connect", e),
            };
            match conn.exchange(&VdqmRequest::DeleteVolume(req)).await {
                Ok(_) => println!("Request {} deleted", id),
                Err(e) => common::fail("delete", e),
            }
        }

        VolumeCommand::Queue { dgn } => {
            let mut conn = match common::connect(addr, port).await {
                Ok(conn) => conn,
                Err(e) => common::fail("connect", e),
            };
            match conn.fetch_queue(&VdqmRequest::GetVolQueue { dgn }).await {
                Ok(records) => {
                    let rows: Vec<VolumeRow> = records
                        .iter()
                        .filter_map(|r| match r {
                            ReplyBody::Volume(v) => Some(row(v)),
                            _ => None,
                        })
                        .collect();
                    if rows.is_empty() {
                        println!("Queue is empty");
                    } else {
                        println!("{}", Table::new(rows));
                    }
                }
                Err(e) => common::fail("queue", e),
            }
        }

        VolumeCommand::Ping { id, dgn } => {
            let req = VolumeRequest {
                vol_req_id: id,
                dgn,
                ..Default::default()
            };
            let mut conn = match common::connect(addr, port).await {
                Ok(conn) => conn,
                Err(e) => common::fail("connect", e),
            };
            match conn.ping(&VdqmRequest::Ping(req)).await {
                Ok(pos) => println!("Request {} is at queue position {}", id, pos),
                Err(e) => common::fail("ping", e),
            }
        }
    }
}
