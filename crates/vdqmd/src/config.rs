//! Queue persistence.
//!
//! Saves/loads the full queue contents to disk so that a restarting
//! primary recovers its volume and drive queues.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error};

use vdqm_proto::{DriveRequest, VdqmError, VdqmResult, VolumeRequest};

const QUEUE_FILE: &str = "queues";

#[derive(Serialize, Deserialize)]
struct QueueDump {
    volumes: Vec<VolumeRequest>,
    drives: Vec<DriveRequest>,
}

/// Save the queue dump to `<dir>/queues`.
pub async fn save_queues(
    dir: &Path,
    volumes: &[VolumeRequest],
    drives: &[DriveRequest],
) -> VdqmResult<()> {
    let path = dir.join(QUEUE_FILE);
    let dump = QueueDump {
        volumes: volumes.to_vec(),
        drives: drives.to_vec(),
    };
    let data = bincode::serialize(&dump).map_err(|_| VdqmError::SystemError)?;
    fs::write(&path, &data).await.map_err(|e| {
        error!("failed to write queues to {}: {}", path.display(), e);
        VdqmError::SystemError
    })?;
    debug!(
        "saved queues: {} volume requests, {} drives",
        dump.volumes.len(),
        dump.drives.len()
    );
    Ok(())
}

/// Load the queue dump from `<dir>/queues`. `Ok(None)` when no dump exists.
pub async fn load_queues(
    dir: &Path,
) -> VdqmResult<Option<(Vec<VolumeRequest>, Vec<DriveRequest>)>> {
    let path = dir.join(QUEUE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(&path).await.map_err(|e| {
        error!("failed to read queues from {}: {}", path.display(), e);
        VdqmError::SystemError
    })?;
    let dump: QueueDump = bincode::deserialize(&data).map_err(|_| {
        error!("corrupt queue file: {}", path.display());
        VdqmError::SystemError
    })?;
    Ok(Some((dump.volumes, dump.drives)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vols = vec![VolumeRequest {
            vol_req_id: 1,
            volid: "T00001".into(),
            dgn: "SL8500".into(),
            ..Default::default()
        }];
        let drvs = vec![DriveRequest {
            drv_req_id: 2,
            drive: "drv0".into(),
            server: "tps01".into(),
            dgn: "SL8500".into(),
            ..Default::default()
        }];

        save_queues(dir.path(), &vols, &drvs).await.unwrap();
        let (lv, ld) = load_queues(dir.path()).await.unwrap().unwrap();
        assert_eq!(lv, vols);
        assert_eq!(ld, drvs);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_queues(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(QUEUE_FILE), b"not a queue dump")
            .await
            .unwrap();
        assert_eq!(
            load_queues(dir.path()).await.unwrap_err(),
            VdqmError::SystemError
        );
    }
}
