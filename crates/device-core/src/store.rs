//! Durable device-state storage
//!
//! JSON snapshot for restart recovery plus a JSON-lines history log for
//! state changes.

use crate::device::Device;
use crate::error::DeviceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Load the device snapshot from disk
///
/// A missing or unparsable file yields an empty set; recovery is best
/// effort and never fatal.
pub async fn load_devices(path: &Path) -> Vec<Device> {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<Vec<Device>>(&contents) {
            Ok(devices) => {
                tracing::info!("loaded {} devices from {:?}", devices.len(), path);
                devices
            }
            Err(e) => {
                tracing::warn!("failed to parse device snapshot {:?}: {}", path, e);
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no device snapshot at {:?}, starting fresh", path);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("failed to read device snapshot {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// Save the device snapshot atomically (write temp file, then rename)
pub async fn save_devices(path: &Path, devices: &[Device]) -> Result<(), DeviceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(devices)?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json).await?;
    fs::rename(&tmp_path, path).await?;

    tracing::debug!("saved {} devices to {:?}", devices.len(), path);
    Ok(())
}

/// One historical state record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub device_id: String,
    pub attribute: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// Append-only JSON-lines history of device state changes
pub struct StateLog {
    path: PathBuf,
}

impl StateLog {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one record; failures are logged, not propagated
    pub async fn append(&self, device_id: &str, attribute: &str, value: Value) {
        let record = StateRecord {
            device_id: device_id.to_string(),
            attribute: attribute.to_string(),
            value,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.append_record(&record).await {
            tracing::warn!("failed to append state record to {:?}: {}", self.path, e);
        }
    }

    async fn append_record(&self, record: &StateRecord) -> Result<(), DeviceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}
