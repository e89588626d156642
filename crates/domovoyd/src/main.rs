//! domovoyd - home automation controller daemon

use device_core::store::{self, StateLog};
use device_core::{AdapterSet, Device, DeviceRegistry, HealthMonitor};
use rule_engine::{
    Clock, CommandDispatcher, ConditionEvaluator, RuleEngine, RuleSet, SystemClock,
    TriggerScheduler, VoiceRouter,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod bridge;
mod config;
mod virtual_adapter;

use bridge::{LogBus, MessageBus};
use config::AppConfig;
use virtual_adapter::VirtualAdapter;

/// Configured devices overlaid with the persisted snapshot
///
/// Configuration is the authority on topology: persisted devices that are
/// no longer configured are dropped. For devices that survive, the last
/// observed state, revision and last-seen time win over config defaults.
fn merge_devices(configured: &[Device], persisted: Vec<Device>) -> Vec<Device> {
    let mut saved: HashMap<String, Device> =
        persisted.into_iter().map(|d| (d.id.clone(), d)).collect();

    configured
        .iter()
        .map(|device| {
            let mut device = device.clone();
            if let Some(old) = saved.remove(&device.id) {
                device.state.extend(old.state);
                device.revision = old.revision;
                device.last_seen = old.last_seen;
                device.health = old.health;
            }
            device
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "domovoyd=debug,device_core=debug,rule_engine=debug,info".into()),
        )
        .init();

    tracing::info!("starting domovoy controller v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "domovoy.toml".to_string());
    let config = match AppConfig::load(Path::new(&config_path)).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration {} is invalid: {}", config_path, e);
            std::process::exit(2);
        }
    };
    let timezone = config.timezone()?;
    tracing::info!(
        "loaded {} devices, {} rules, {} voice patterns (timezone {})",
        config.devices.len(),
        config.rules.len(),
        config.voice.len(),
        timezone,
    );

    // Registry: configured topology overlaid with the persisted snapshot.
    let snapshot_path = config.data_dir.join("devices.json");
    let persisted = store::load_devices(&snapshot_path).await;
    let devices = merge_devices(&config.devices, persisted);
    let registry = Arc::new(DeviceRegistry::new(
        config.rooms.clone(),
        config.groups.clone(),
    ));

    // The virtual transport backs the merged devices, not the config
    // defaults, so the first probe cycle does not undo restored state.
    let mut adapters = AdapterSet::new();
    adapters.register(Arc::new(VirtualAdapter::from_devices(&devices)));
    for device in devices {
        registry.upsert_device(device);
    }

    let shutdown = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::clone(&registry),
        adapters.clone(),
        config.dispatch_config(),
        shutdown.clone(),
    ));
    let evaluator = ConditionEvaluator::new(Arc::clone(&registry), clock.clone(), timezone);
    let engine = Arc::new(RuleEngine::new(
        RuleSet::from_rules(config.rules.clone()),
        evaluator,
        dispatcher,
    ));

    let scheduler = Arc::new(TriggerScheduler::new(
        Arc::clone(&engine),
        Arc::clone(&registry),
        clock.clone(),
        timezone,
        shutdown.clone(),
    ));
    scheduler.start()?;
    tracing::info!("{} cron timers armed", scheduler.active_timers());

    let monitor = HealthMonitor::new(Arc::clone(&registry), adapters, config.health_config());
    let health_task = monitor.spawn(shutdown.clone());

    let bus: Arc<dyn MessageBus> = Arc::new(LogBus);
    let state_log = Arc::new(StateLog::new(config.data_dir.join("history.jsonl")));
    let pump_task = bridge::spawn_event_pump(
        Arc::clone(&registry),
        bus,
        state_log,
        shutdown.clone(),
    );

    // Console voice input: one utterance per line on stdin.
    let voice = VoiceRouter::new(config.voice.clone(), Arc::clone(&engine), clock, timezone);
    let voice_shutdown = shutdown.clone();
    let voice_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = voice_shutdown.cancelled() => return,
                line = lines.next_line() => match line {
                    Ok(Some(text)) => match voice.handle(&text).await {
                        Some(reply) => tracing::info!(intent = %reply.intent, "{}", reply.reply),
                        None => tracing::info!("no matching voice pattern"),
                    },
                    Ok(None) | Err(_) => return,
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown.cancel();
    let _ = health_task.await;
    let _ = pump_task.await;
    voice_task.abort();

    store::save_devices(&snapshot_path, &registry.list_devices()).await?;
    tracing::info!("device snapshot saved, bye");
    Ok(())
}
