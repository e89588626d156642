//! In-process adapter for the `virtual` transport
//!
//! Backs configured devices with an in-memory attribute map so the daemon
//! runs end-to-end without hardware. Sends apply their parameters and ack
//! with the resulting state, making the transport confirm-on-ack.

use async_trait::async_trait;
use dashmap::DashMap;
use device_core::{Ack, AdapterError, Device, DeviceAdapter};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub struct VirtualAdapter {
    state: DashMap<String, HashMap<String, Value>>,
}

impl VirtualAdapter {
    /// Seed backing state from the configured devices
    #[must_use]
    pub fn from_devices(devices: &[Device]) -> Self {
        let state = DashMap::new();
        for device in devices.iter().filter(|d| d.transport == "virtual") {
            state.insert(device.id.clone(), device.state.clone());
        }
        Self { state }
    }
}

#[async_trait]
impl DeviceAdapter for VirtualAdapter {
    fn transport(&self) -> &str {
        "virtual"
    }

    async fn probe(&self, device_id: &str) -> Result<HashMap<String, Value>, AdapterError> {
        self.state
            .get(device_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AdapterError::Permanent(format!("unknown device: {device_id}")))
    }

    async fn send(
        &self,
        device_id: &str,
        command: &str,
        params: &Map<String, Value>,
    ) -> Result<Ack, AdapterError> {
        let mut entry = self
            .state
            .get_mut(device_id)
            .ok_or_else(|| AdapterError::Permanent(format!("unknown device: {device_id}")))?;

        for (key, value) in params {
            entry.insert(key.clone(), value.clone());
        }
        tracing::debug!(device = %device_id, %command, "virtual device acknowledged");

        let readback: HashMap<String, Value> = params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Ack::confirmed_with(readback))
    }
}
