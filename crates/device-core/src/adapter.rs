//! Protocol adapter contract
//!
//! Each transport (virtual, message-bus, vendor API) implements
//! [`DeviceAdapter`]; the rest of the system only sees this contract.

use crate::device::Device;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by protocol adapters
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    /// The device did not answer within the adapter's own deadline
    #[error("adapter timed out")]
    Timeout,

    /// Transient transport failure; the dispatcher may retry
    #[error("transient transport error: {0}")]
    Transient(String),

    /// Permanent failure; retrying will not help
    #[error("permanent transport error: {0}")]
    Permanent(String),

    /// No adapter registered for the device's transport
    #[error("unknown transport: {0}")]
    UnknownTransport(String),
}

impl AdapterError {
    /// Whether the dispatcher should retry after this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient(_))
    }
}

/// Command acknowledgement
#[derive(Debug, Clone, Default)]
pub struct Ack {
    /// True when the transport confirmed delivery end-to-end
    pub confirmed: bool,
    /// Readback state reported with the ack (confirm-on-ack transports)
    pub state: Option<HashMap<String, Value>>,
}

impl Ack {
    /// Plain acknowledgement with no readback
    #[must_use]
    pub fn accepted() -> Self {
        Self::default()
    }

    /// Confirmed acknowledgement carrying readback state
    #[must_use]
    pub fn confirmed_with(state: HashMap<String, Value>) -> Self {
        Self {
            confirmed: true,
            state: Some(state),
        }
    }
}

/// Uniform per-transport device contract
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Transport name this adapter serves (matches `Device::transport`)
    fn transport(&self) -> &str;

    /// Lightweight reachability/state probe
    async fn probe(&self, device_id: &str) -> Result<HashMap<String, Value>, AdapterError>;

    /// Send one command to one device
    async fn send(
        &self,
        device_id: &str,
        command: &str,
        params: &Map<String, Value>,
    ) -> Result<Ack, AdapterError>;
}

/// Lookup table from transport name to adapter
#[derive(Default, Clone)]
pub struct AdapterSet {
    adapters: HashMap<String, Arc<dyn DeviceAdapter>>,
}

impl AdapterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its transport name
    pub fn register(&mut self, adapter: Arc<dyn DeviceAdapter>) {
        self.adapters
            .insert(adapter.transport().to_string(), adapter);
    }

    /// Resolve the adapter for a device
    pub fn adapter_for(&self, device: &Device) -> Result<Arc<dyn DeviceAdapter>, AdapterError> {
        self.adapters
            .get(&device.transport)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownTransport(device.transport.clone()))
    }
}
