//! Saved configuration of every pump, kept in one JSON file keyed by pump name:
//!
//! ```json
//! {"Linac 1 files": {"type": "File Upload", "state": {"Pump": [{"interval (s)": 300}]}}}
//! ```
use std::collections::BTreeMap;
use std::path::Path;

use pump_common::config::ConfigState;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::WorkerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPump {
    #[serde(rename = "type")]
    pub pump_type: String,
    #[serde(default)]
    pub state: ConfigState,
}

pub type SavedPumps = BTreeMap<String, SavedPump>;

/// Load saved pumps from `path`. A missing file means no pumps are configured yet.
pub async fn load(path: &Path) -> Result<SavedPumps, WorkerError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("no pump state at {}, starting without pumps", path.display());
            return Ok(SavedPumps::new());
        }
        Err(error) => {
            return Err(WorkerError::StateRead {
                path: path.to_owned(),
                error,
            })
        }
    };

    serde_json::from_str(&contents).map_err(|error| WorkerError::StateFormat {
        path: path.to_owned(),
        error,
    })
}

pub async fn save(path: &Path, pumps: &SavedPumps) -> Result<(), WorkerError> {
    let contents = serde_json::to_string_pretty(pumps).map_err(|error| WorkerError::StateFormat {
        path: path.to_owned(),
        error,
    })?;

    tokio::fs::write(path, contents)
        .await
        .map_err(|error| WorkerError::StateWrite {
            path: path.to_owned(),
            error,
        })
}
