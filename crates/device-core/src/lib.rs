//! Device layer for the domovoy controller
//!
//! Owns the authoritative device registry, the protocol-adapter contract,
//! periodic health probing, and durable device-state snapshots.

pub mod adapter;
pub mod device;
pub mod error;
pub mod health;
pub mod registry;
pub mod store;

pub use adapter::{Ack, AdapterError, AdapterSet, DeviceAdapter};
pub use device::{Capability, Device, DeviceKind, Group, Health, ParamKind, ParamSpec, Room};
pub use error::DeviceError;
pub use health::{HealthConfig, HealthMonitor};
pub use registry::{DeviceRegistry, RegistryEvent};
