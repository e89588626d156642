//! Command dispatcher
//!
//! Sends commands to devices through their protocol adapters with
//! parameter validation, timeout, bounded retry and per-device failure
//! isolation. Group targets fan out concurrently; one member's failure
//! never aborts its siblings.

use crate::model::{Action, Target};
use device_core::{AdapterSet, Device, DeviceRegistry};
use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Deadline for one send attempt
    pub command_timeout: Duration,
    /// Total send attempts per device (at least 1)
    pub retry_attempts: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    /// Concurrent send cap across all dispatches
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(500),
            workers: 8,
        }
    }
}

/// Outcome of executing one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// Every per-device send succeeded
    Success,
    /// Some sends failed; siblings were still attempted
    PartialFailure { failed: Vec<String> },
    /// The action could not be executed at all
    Failure { reason: String },
}

impl DispatchResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Sends commands to devices and commits the resulting state
pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    adapters: AdapterSet,
    config: DispatchConfig,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<DeviceRegistry>,
        adapters: AdapterSet,
        config: DispatchConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            registry,
            adapters,
            config,
            permits,
            shutdown,
        }
    }

    /// Execute an action on behalf of a rule
    ///
    /// Devices in rooms with automation disabled are excluded from the
    /// expansion; manual and voice dispatches use [`execute`](Self::execute)
    /// which ignores that flag.
    pub async fn execute_for_rule(&self, action: &Action) -> DispatchResult {
        self.dispatch(action, true).await
    }

    /// Execute an action unconditionally (manual/voice/external path)
    pub async fn execute(&self, action: &Action) -> DispatchResult {
        self.dispatch(action, false).await
    }

    async fn dispatch(&self, action: &Action, respect_room_flag: bool) -> DispatchResult {
        let Action::DeviceCommand {
            target,
            command,
            params,
        } = action;

        let mut devices = match self.expand(target) {
            Ok(devices) => devices,
            Err(reason) => return DispatchResult::Failure { reason },
        };
        if respect_room_flag {
            devices.retain(|d| self.automation_allowed(d));
        }
        if devices.is_empty() {
            return DispatchResult::Failure {
                reason: format!("target expands to no dispatchable devices: {target:?}"),
            };
        }

        let single = devices.len() == 1;
        let sends = devices
            .iter()
            .map(|device| self.send_one(device, command, params));
        let outcomes = join_all(sends).await;

        let mut failed = Vec::new();
        let mut first_reason = None;
        for (device, outcome) in devices.iter().zip(outcomes) {
            if let Err(reason) = outcome {
                tracing::warn!(device = %device.id, %command, %reason, "send failed");
                if first_reason.is_none() {
                    first_reason = Some(reason);
                }
                failed.push(device.id.clone());
            }
        }

        match (failed.is_empty(), single) {
            (true, _) => DispatchResult::Success,
            (false, true) => DispatchResult::Failure {
                reason: first_reason.unwrap_or_else(|| "send failed".to_string()),
            },
            (false, false) => DispatchResult::PartialFailure { failed },
        }
    }

    /// Resolve a target to its member devices, in a stable order
    fn expand(&self, target: &Target) -> Result<Vec<Device>, String> {
        match target {
            Target::Device { id } => self
                .registry
                .get_device(id)
                .map(|d| vec![d])
                .map_err(|e| e.to_string()),
            Target::Group { id } => self
                .registry
                .list_by_group(id)
                .map_err(|e| e.to_string()),
        }
    }

    fn automation_allowed(&self, device: &Device) -> bool {
        let Some(room_id) = &device.room else {
            return true;
        };
        self.registry
            .rooms()
            .iter()
            .find(|r| &r.id == room_id)
            .map_or(true, |r| r.automation_enabled)
    }

    /// One per-device send: validate, then attempt with timeout and retry
    async fn send_one(
        &self,
        device: &Device,
        command: &str,
        params: &Map<String, Value>,
    ) -> Result<(), String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| "dispatcher shut down".to_string())?;

        // Parameter validation never contacts the device.
        validate_params(device, command, params)?;

        let adapter = self
            .adapters
            .adapter_for(device)
            .map_err(|e| e.to_string())?;

        let mut last_error = String::new();
        for attempt in 1..=self.config.retry_attempts.max(1) {
            if attempt > 1 {
                // A retry is a new attempt; shutdown stops here, the
                // attempt already in flight was allowed to finish.
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        return Err(format!("cancelled before retry: {last_error}"));
                    }
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }

            let send = adapter.send(&device.id, command, params);
            match tokio::time::timeout(self.config.command_timeout, send).await {
                Ok(Ok(ack)) => {
                    self.commit(device, params, ack.state).await;
                    return Ok(());
                }
                Ok(Err(e)) if e.is_retryable() => {
                    tracing::debug!(device = %device.id, %command, attempt, error = %e, "send attempt failed");
                    last_error = e.to_string();
                }
                // Permanent and unknown-transport errors are final.
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => {
                    tracing::debug!(device = %device.id, %command, attempt, "command timed out");
                    last_error = "command timed out".to_string();
                }
            }
        }

        Err(format!(
            "gave up after {} attempts: {last_error}",
            self.config.retry_attempts.max(1)
        ))
    }

    /// Commit state after a successful send
    ///
    /// The readback state from a confirm-on-ack transport wins; otherwise
    /// the commanded parameters are written optimistically.
    async fn commit(
        &self,
        device: &Device,
        params: &Map<String, Value>,
        readback: Option<HashMap<String, Value>>,
    ) {
        let updates: HashMap<String, Value> = match readback {
            Some(state) => state,
            None => params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        let _ = self.registry.touch(&device.id);
        if updates.is_empty() {
            return;
        }
        if let Err(e) = self.registry.apply_state(&device.id, updates) {
            tracing::warn!(device = %device.id, error = %e, "state commit failed");
        }
    }
}

/// Validate parameters against the device's declared capability schema
fn validate_params(
    device: &Device,
    command: &str,
    params: &Map<String, Value>,
) -> Result<(), String> {
    let capability = device.capability(command).ok_or_else(|| {
        format!(
            "invalid parameters: device {} does not accept command {command}",
            device.id
        )
    })?;

    for spec in &capability.params {
        match params.get(&spec.name) {
            Some(value) => {
                if !spec.kind.accepts(value) {
                    return Err(format!(
                        "invalid parameters: {} expects {:?}, got {value}",
                        spec.name, spec.kind
                    ));
                }
            }
            None if spec.required => {
                return Err(format!("invalid parameters: missing {}", spec.name));
            }
            None => {}
        }
    }

    for name in params.keys() {
        if !capability.params.iter().any(|p| &p.name == name) {
            return Err(format!("invalid parameters: unexpected {name}"));
        }
    }
    Ok(())
}
