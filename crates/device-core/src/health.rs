//! Periodic device health probing

use crate::adapter::AdapterSet;
use crate::device::Health;
use crate::registry::DeviceRegistry;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Health monitor tuning
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between probe cycles
    pub interval: Duration,
    /// Deadline for a single device probe
    pub probe_timeout: Duration,
    /// How long a device may go without a successful probe before it is
    /// flagged unreachable
    pub offline_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            offline_after: Duration::from_secs(180),
        }
    }
}

/// Periodically probes every registered device and updates the registry
///
/// Probe failures are contained here: one dead device never blocks the
/// others, and the loop itself never exits on error.
pub struct HealthMonitor {
    registry: Arc<DeviceRegistry>,
    adapters: AdapterSet,
    config: HealthConfig,
    started_at: DateTime<Utc>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>, adapters: AdapterSet, config: HealthConfig) -> Self {
        Self {
            registry,
            adapters,
            config,
            started_at: Utc::now(),
        }
    }

    /// Spawn the probe loop as a background task
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run probe cycles until the token is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        // The immediate first tick gives a baseline probe at startup.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("health monitor stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            // The whole cycle is bounded so a pathological cycle cannot
            // overlap the next tick.
            let cycle = tokio::time::timeout(self.config.interval, self.run_cycle(&shutdown));
            if cycle.await.is_err() {
                tracing::warn!("probe cycle exceeded its deadline");
            }
        }
    }

    /// Probe every device once, concurrently
    pub async fn run_cycle(&self, shutdown: &CancellationToken) {
        let devices = self.registry.list_devices();
        if devices.is_empty() {
            return;
        }

        let probes = devices.into_iter().map(|device| {
            let registry = Arc::clone(&self.registry);
            let adapters = self.adapters.clone();
            let probe_timeout = self.config.probe_timeout;
            let offline_after = self.config.offline_after;
            let started_at = self.started_at;
            let shutdown = shutdown.clone();
            async move {
                if shutdown.is_cancelled() {
                    return;
                }
                let adapter = match adapters.adapter_for(&device) {
                    Ok(adapter) => adapter,
                    Err(e) => {
                        tracing::warn!(device = %device.id, error = %e, "no adapter for device");
                        return;
                    }
                };

                let result = tokio::time::timeout(probe_timeout, adapter.probe(&device.id)).await;
                match result {
                    Ok(Ok(state)) => {
                        if let Err(e) = registry.record_probe_success(&device.id, Some(state)) {
                            tracing::warn!(device = %device.id, error = %e, "probe bookkeeping failed");
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(device = %device.id, error = %e, "probe failed");
                        Self::note_failure(&registry, &device.id, started_at, offline_after);
                    }
                    Err(_) => {
                        tracing::debug!(device = %device.id, "probe timed out");
                        Self::note_failure(&registry, &device.id, started_at, offline_after);
                    }
                }
            }
        });

        join_all(probes).await;
    }

    fn note_failure(
        registry: &DeviceRegistry,
        device_id: &str,
        started_at: DateTime<Utc>,
        offline_after: Duration,
    ) {
        let failures = match registry.record_probe_failure(device_id) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(device = %device_id, error = %e, "probe bookkeeping failed");
                return;
            }
        };

        let Ok(device) = registry.get_device(device_id) else {
            return;
        };
        // A device that has never answered counts from monitor start.
        let reference = device.last_seen.unwrap_or(started_at);
        let elapsed = (Utc::now() - reference)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed >= offline_after {
            tracing::warn!(device = %device.display_name(), failures, "device unreachable");
            let _ = registry.mark_health(device_id, Health::Unreachable);
        }
    }
}
