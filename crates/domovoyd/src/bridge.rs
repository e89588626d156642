//! Message-bus boundary
//!
//! Republishes registry events to an external bus and appends them to the
//! durable state log. Inbound device commands from the bus enter through
//! `RuleEngine::on_external_command`; this module only handles the
//! outbound direction.

use async_trait::async_trait;
use device_core::store::StateLog;
use device_core::{DeviceRegistry, Health, RegistryEvent};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outbound half of the external message bus
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish_state_change(
        &self,
        device_id: &str,
        attribute: &str,
        value: &Value,
        revision: u64,
    );

    async fn publish_health(&self, device_id: &str, health: Health);
}

/// Default bus that only writes structured log lines
pub struct LogBus;

#[async_trait]
impl MessageBus for LogBus {
    async fn publish_state_change(
        &self,
        device_id: &str,
        attribute: &str,
        value: &Value,
        revision: u64,
    ) {
        tracing::info!(device = %device_id, %attribute, %value, revision, "state change");
    }

    async fn publish_health(&self, device_id: &str, health: Health) {
        tracing::info!(device = %device_id, ?health, "health change");
    }
}

/// Forward one registry event to the bus and the state log
pub async fn forward_event(bus: &dyn MessageBus, log: &StateLog, event: &RegistryEvent) {
    match event {
        RegistryEvent::StateChanged {
            device_id,
            attribute,
            value,
            revision,
        } => {
            bus.publish_state_change(device_id, attribute, value, *revision)
                .await;
            log.append(device_id, attribute, value.clone()).await;
        }
        RegistryEvent::HealthChanged { device_id, health } => {
            bus.publish_health(device_id, *health).await;
        }
        RegistryEvent::DeviceAdded { device_id } => {
            tracing::debug!(device = %device_id, "device added");
        }
    }
}

/// Pump registry events to the bus until shutdown
pub fn spawn_event_pump(
    registry: Arc<DeviceRegistry>,
    bus: Arc<dyn MessageBus>,
    log: Arc<StateLog>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = registry.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("event pump stopping");
                    return;
                }
                received = rx.recv() => match received {
                    Ok(event) => forward_event(bus.as_ref(), &log, &event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("event pump lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    })
}
