//! Authoritative in-memory device registry with event fan-out

use crate::device::{Device, Group, Health, Room};
use crate::error::DeviceError;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events published by the registry
///
/// Delivery is at-least-once for live subscribers: a slow subscriber that
/// lags behind the channel capacity sees `RecvError::Lagged`, not silence.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A state attribute was committed
    StateChanged {
        device_id: String,
        attribute: String,
        value: Value,
        revision: u64,
    },
    /// Device reachability transitioned
    HealthChanged { device_id: String, health: Health },
    /// A device was added to the registry
    DeviceAdded { device_id: String },
}

/// In-memory device registry
///
/// Devices are guarded per-entry by the `DashMap` shard locks: concurrent
/// updates to the same device serialize, updates to different devices do
/// not contend. Rooms and groups are immutable after load.
pub struct DeviceRegistry {
    devices: DashMap<String, Device>,
    rooms: Arc<[Room]>,
    groups: Arc<[Group]>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a registry with static room/group configuration
    #[must_use]
    pub fn new(rooms: Vec<Room>, groups: Vec<Group>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            devices: DashMap::new(),
            rooms: rooms.into(),
            groups: groups.into(),
            event_tx,
        }
    }

    /// Subscribe to registry events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Add or replace a device
    pub fn upsert_device(&self, device: Device) {
        let id = device.id.clone();
        let is_new = !self.devices.contains_key(&id);
        self.devices.insert(id.clone(), device);

        if is_new {
            tracing::info!(device = %id, "registered device");
            let _ = self.event_tx.send(RegistryEvent::DeviceAdded { device_id: id });
        }
    }

    /// Get a snapshot of a device
    pub fn get_device(&self, id: &str) -> Result<Device, DeviceError> {
        self.devices
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))
    }

    /// All known devices
    #[must_use]
    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.iter().map(|r| r.value().clone()).collect()
    }

    /// Number of known devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when no devices are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Commit one state attribute and publish exactly one `StateChanged`
    ///
    /// Returns the device revision after the write.
    pub fn update_state(&self, id: &str, attribute: &str, value: Value) -> Result<u64, DeviceError> {
        let mut entry = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;

        entry.revision += 1;
        let revision = entry.revision;
        entry.state.insert(attribute.to_string(), value.clone());
        drop(entry);

        let _ = self.event_tx.send(RegistryEvent::StateChanged {
            device_id: id.to_string(),
            attribute: attribute.to_string(),
            value,
            revision,
        });
        Ok(revision)
    }

    /// Commit several attributes under one entry lock
    ///
    /// Readers never observe a partially-applied set; one `StateChanged`
    /// is published per attribute after the commit.
    pub fn apply_state(
        &self,
        id: &str,
        updates: HashMap<String, Value>,
    ) -> Result<u64, DeviceError> {
        let mut entry = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;

        let mut events = Vec::with_capacity(updates.len());
        for (attribute, value) in updates {
            entry.revision += 1;
            entry.state.insert(attribute.clone(), value.clone());
            events.push(RegistryEvent::StateChanged {
                device_id: id.to_string(),
                attribute,
                value,
                revision: entry.revision,
            });
        }
        let revision = entry.revision;
        drop(entry);

        for event in events {
            let _ = self.event_tx.send(event);
        }
        Ok(revision)
    }

    /// Set device health, publishing `HealthChanged` only on a transition
    pub fn mark_health(&self, id: &str, health: Health) -> Result<(), DeviceError> {
        let mut entry = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;

        if entry.health == health {
            return Ok(());
        }
        entry.health = health;
        drop(entry);

        tracing::info!(device = %id, ?health, "device health changed");
        let _ = self.event_tx.send(RegistryEvent::HealthChanged {
            device_id: id.to_string(),
            health,
        });
        Ok(())
    }

    /// Record a successful probe: stamp `last_seen`, reset the failure
    /// counter, merge the probed state
    ///
    /// Only attributes whose value actually differs are published; a probe
    /// reporting unchanged state is not a state change.
    pub fn record_probe_success(
        &self,
        id: &str,
        probed: Option<HashMap<String, Value>>,
    ) -> Result<(), DeviceError> {
        let mut entry = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;

        entry.last_seen = Some(Utc::now());
        entry.probe_failures = 0;

        let mut events = Vec::new();
        if let Some(probed) = probed {
            for (attribute, value) in probed {
                if entry.state.get(&attribute) == Some(&value) {
                    continue;
                }
                entry.revision += 1;
                entry.state.insert(attribute.clone(), value.clone());
                events.push(RegistryEvent::StateChanged {
                    device_id: id.to_string(),
                    attribute,
                    value,
                    revision: entry.revision,
                });
            }
        }
        drop(entry);

        for event in events {
            let _ = self.event_tx.send(event);
        }
        self.mark_health(id, Health::Healthy)
    }

    /// Record a failed probe; returns the consecutive failure count
    pub fn record_probe_failure(&self, id: &str) -> Result<u32, DeviceError> {
        let mut entry = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        entry.probe_failures += 1;
        Ok(entry.probe_failures)
    }

    /// Stamp `last_seen` without touching state (e.g. a command was acked)
    pub fn touch(&self, id: &str) -> Result<(), DeviceError> {
        let mut entry = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        entry.last_seen = Some(Utc::now());
        Ok(())
    }

    /// Room configuration
    #[must_use]
    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    /// Group configuration
    #[must_use]
    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Devices belonging to a group, in a stable order
    ///
    /// A kind-filtered group is recomputed from the live registry (sorted
    /// by device id for determinism); a static group keeps declaration
    /// order and skips members the registry does not know.
    pub fn list_by_group(&self, group_id: &str) -> Result<Vec<Device>, DeviceError> {
        let group = self
            .group(group_id)
            .ok_or_else(|| DeviceError::GroupNotFound(group_id.to_string()))?;

        if let Some(kind) = group.kind_filter {
            let mut members: Vec<Device> = self
                .devices
                .iter()
                .filter(|r| r.value().kind == kind)
                .map(|r| r.value().clone())
                .collect();
            members.sort_by(|a, b| a.id.cmp(&b.id));
            return Ok(members);
        }

        Ok(group
            .devices
            .iter()
            .filter_map(|id| self.devices.get(id).map(|r| r.value().clone()))
            .collect())
    }

    /// Devices in a room, in the room's declared order
    pub fn list_by_room(&self, room_id: &str) -> Vec<Device> {
        self.rooms
            .iter()
            .find(|r| r.id == room_id)
            .map(|room| {
                room.devices
                    .iter()
                    .filter_map(|id| self.devices.get(id).map(|r| r.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
