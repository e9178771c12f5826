//! Drive configuration and dedication subcommands.

use clap::{Args, Subcommand};
use tabled::{Table, Tabled};

use vdqm_proto::{DriveRequest, DriveStatus, ReplyBody, VdqmRequest};

use crate::common;

#[derive(Args)]
pub struct DriveArgs {
    #[command(subcommand)]
    command: DriveCommand,
}

#[derive(Subcommand)]
enum DriveCommand {
    /// Configure a drive up
    Up {
        #[arg(long)]
        drive: String,
        #[arg(long)]
        server: String,
        #[arg(long)]
        dgn: String,
    },
    /// Configure a drive down
    Down {
        #[arg(long)]
        drive: String,
        #[arg(long)]
        server: String,
        #[arg(long)]
        dgn: String,
    },
    /// Remove a drive record
    Delete {
        #[arg(long)]
        drive: String,
        #[arg(long)]
        server: String,
        #[arg(long)]
        dgn: String,
    },
    /// Set or clear a drive's dedication
    Dedicate {
        #[arg(long)]
        drive: String,
        #[arg(long)]
        server: String,
        #[arg(long)]
        dgn: String,
        /// Dedication expression; an empty string clears it
        #[arg(long, default_value = "")]
        expr: String,
    },
    /// Show the drive queue
    Queue {
        /// Restrict to one device group
        #[arg(long, default_value = "")]
        dgn: String,
    },
}

#[derive(Tabled)]
struct DriveRow {
    #[tabled(rename = "UNIT")]
    unit: String,
    #[tabled(rename = "DGN")]
    dgn: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "VOLID")]
    volid: String,
    #[tabled(rename = "REQ")]
    vol_req_id: i32,
    #[tabled(rename = "JOB")]
    job_id: i32,
    #[tabled(rename = "DEDICATION")]
    dedicate: String,
}

fn row(drv: &DriveRequest) -> DriveRow {
    DriveRow {
        unit: drv.unit_name(),
        dgn: drv.dgn.clone(),
        status: drv.status.to_string(),
        volid: if drv.volid.is_empty() {
            "-".into()
        } else {
            drv.volid.clone()
        },
        vol_req_id: drv.vol_req_id,
        job_id: drv.job_id,
        dedicate: if drv.dedicate.is_empty() {
            "-".into()
        } else {
            drv.dedicate.clone()
        },
    }
}

fn drive_request(drive: String, server: String, dgn: String, status: DriveStatus) -> DriveRequest {
    DriveRequest {
        status,
        drive,
        server,
        dgn,
        ..Default::default()
    }
}

async fn send_drive(addr: &str, port: u16, what: &str, req: VdqmRequest) {
    let mut conn = match common::connect(addr, port).await {
        Ok(conn) => conn,
        Err(e) => common::fail("connect", e),
    };
    match conn.exchange(&req).await {
        Ok(ReplyBody::Drive(updated)) => {
            println!("{}: {} is now {}", what, updated.unit_name(), updated.status);
        }
        Ok(other) => eprintln!("Unexpected reply: {:?}", other),
        Err(e) => common::fail(what, e),
    }
}

pub async fn run(addr: &str, port: u16, args: DriveArgs) {
    match args.command {
        DriveCommand::Up { drive, server, dgn } => {
            let req = drive_request(drive, server, dgn, DriveStatus::UP | DriveStatus::FREE);
            send_drive(addr, port, "up", VdqmRequest::AddDrive(req)).await;
        }

        DriveCommand::Down { drive, server, dgn } => {
            let req = drive_request(drive, server, dgn, DriveStatus::DOWN);
            send_drive(addr, port, "down", VdqmRequest::AddDrive(req)).await;
        }

        DriveCommand::Delete { drive, server, dgn } => {
            let req = drive_request(drive, server, dgn, DriveStatus::empty());
            let mut conn = match common::connect(addr, port).await {
                Ok(conn) => conn,
                Err(e) => common::fail("connect", e),
            };
            match conn.exchange(&VdqmRequest::DeleteDrive(req)).await {
                Ok(_) => println!("Drive deleted"),
                Err(e) => common::fail("delete", e),
            }
        }

        DriveCommand::Dedicate {
            drive,
            server,
            dgn,
            expr,
        } => {
            let mut req = drive_request(drive, server, dgn, DriveStatus::empty());
            req.dedicate = expr;
            send_drive(addr, port, "dedicate", VdqmRequest::DedicateDrive(req)).await;
        }

        DriveCommand::Queue { dgn } => {
            let mut conn = match common::connect(addr, port).await {
                Ok(conn) => conn,
                Err(e) => common::fail("connect", e),
            };
            match conn.fetch_queue(&VdqmRequest::GetDrvQueue { dgn }).await {
                Ok(records) => {
                    let rows: Vec<DriveRow> = records
                        .iter()
                        .filter_map(|r| match r {
                            ReplyBody::Drive(d) => Some(row(d)),
                            _ => None,
                        })
                        .collect();
                    if rows.is_empty() {
                        println!("No drives configured");
                    } else {
                        println!("{}", Table::new(rows));
                    }
                }
                Err(e) => common::fail("queue", e),
            }
        }
    }
}
