//! Trigger scheduler
//!
//! One timer task per schedule-triggered rule plus a single listener for
//! registry state-change events. Firing hands the rule to the engine; the
//! engine's per-rule lock guarantees the same rule never overlaps itself
//! while different rules run concurrently.

use crate::clock::Clock;
use crate::engine::RuleEngine;
use crate::error::EngineError;
use crate::model::{normalize_cron, Rule, Trigger};
use chrono::DateTime;
use chrono_tz::Tz;
use cron::Schedule;
use dashmap::DashMap;
use device_core::{DeviceRegistry, RegistryEvent};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-rule trigger state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringState {
    /// No trigger pending
    Idle,
    /// Waiting for the next scheduled occurrence
    Armed,
    /// Evaluation in progress
    Firing,
}

/// Time- and event-driven rule trigger loop
pub struct TriggerScheduler {
    engine: Arc<RuleEngine>,
    registry: Arc<DeviceRegistry>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    /// Active cron timer tasks, keyed by rule id
    timers: DashMap<String, JoinHandle<()>>,
    states: Arc<DashMap<String, FiringState>>,
    shutdown: CancellationToken,
}

impl TriggerScheduler {
    #[must_use]
    pub fn new(
        engine: Arc<RuleEngine>,
        registry: Arc<DeviceRegistry>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            registry,
            clock,
            timezone,
            timers: DashMap::new(),
            states: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Observable trigger state for a rule
    #[must_use]
    pub fn state_of(&self, rule_id: &str) -> FiringState {
        self.states
            .get(rule_id)
            .map_or(FiringState::Idle, |s| *s.value())
    }

    /// Number of active cron timers
    #[must_use]
    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    /// Register every enabled rule and start the state-change listener
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        for rule in self.engine.rules().iter() {
            self.register(&rule)?;
        }
        self.start_event_listener();
        Ok(())
    }

    /// Register (or re-register) a rule's schedule trigger
    ///
    /// State-change rules need no timer; they are matched by the event
    /// listener against the engine's current rule generation. The timer
    /// runs even while the rule is disabled — the engine refuses disabled
    /// firings, so re-enabling takes effect at the next occurrence without
    /// touching the scheduler.
    pub fn register(&self, rule: &Rule) -> Result<(), EngineError> {
        let Trigger::Schedule { cron } = &rule.trigger else {
            return Ok(());
        };

        // Replace any existing timer.
        self.remove(&rule.id);

        let schedule = Schedule::from_str(&normalize_cron(cron))
            .map_err(|e| EngineError::InvalidCron(format!("{cron}: {e}")))?;

        let id = rule.id.clone();
        let engine = Arc::clone(&self.engine);
        let states = Arc::clone(&self.states);
        let clock = Arc::clone(&self.clock);
        let timezone = self.timezone;
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let now = clock.now_in(timezone);
                let Some(wait) = time_until_next(&schedule, &now) else {
                    tracing::warn!(rule = %id, "no upcoming occurrences, timer stopping");
                    states.insert(id.clone(), FiringState::Idle);
                    return;
                };

                states.insert(id.clone(), FiringState::Armed);
                tracing::debug!(rule = %id, ?wait, "armed");
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        states.insert(id.clone(), FiringState::Idle);
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                states.insert(id.clone(), FiringState::Firing);
                match engine.fire(&id, "schedule").await {
                    Ok(_) => {}
                    Err(EngineError::RuleDisabled(_)) => {
                        tracing::debug!(rule = %id, "rule disabled, occurrence skipped");
                    }
                    Err(e) => {
                        tracing::warn!(rule = %id, error = %e, "scheduled firing failed");
                    }
                }
                states.insert(id.clone(), FiringState::Idle);

                // Settle past the fire instant so the same occurrence is
                // not picked again on recompute.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        self.timers.insert(rule.id.clone(), handle);
        tracing::info!(rule = %rule.id, %cron, "scheduled cron trigger");
        Ok(())
    }

    /// Drop a rule's timer
    pub fn remove(&self, rule_id: &str) {
        if let Some((_, handle)) = self.timers.remove(rule_id) {
            handle.abort();
            self.states.insert(rule_id.to_string(), FiringState::Idle);
            tracing::debug!(rule = %rule_id, "removed cron timer");
        }
    }

    /// Start listening for registry state-change events
    fn start_event_listener(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut rx = self.registry.subscribe();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("scheduler event listener stopping");
                        return;
                    }
                    received = rx.recv() => match received {
                        Ok(event) => {
                            let _ = scheduler.handle_event(&event);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("scheduler lagged by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("registry event channel closed");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Match one registry event against the current rule generation and
    /// fire every matching enabled rule
    ///
    /// Each firing runs in its own task (different rules are concurrent);
    /// repeated identical events refire deliberately — there is no
    /// debounce, repeating an idempotent action is cheap.
    pub fn handle_event(&self, event: &RegistryEvent) -> Vec<JoinHandle<()>> {
        let mut firings = Vec::new();
        for rule in self.engine.rules().iter() {
            if !rule.enabled || !trigger_matches(&rule.trigger, event) {
                continue;
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            let id = rule.id.clone();
            let engine = Arc::clone(&self.engine);
            let states = Arc::clone(&self.states);
            firings.push(tokio::spawn(async move {
                states.insert(id.clone(), FiringState::Firing);
                if let Err(e) = engine.fire(&id, "state_change").await {
                    tracing::warn!(rule = %id, error = %e, "state-change firing failed");
                }
                states.insert(id, FiringState::Idle);
            }));
        }
        firings
    }
}

impl Drop for TriggerScheduler {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}

/// Sleep duration until the next cron occurrence after `now`
fn time_until_next(schedule: &Schedule, now: &DateTime<Tz>) -> Option<Duration> {
    let next = schedule.after(now).next()?;
    Some((next - *now).to_std().unwrap_or(Duration::from_secs(1)))
}

/// Does a registry event match a rule's state-change trigger?
///
/// Health transitions are matched as a pseudo-attribute named `health`
/// so rules can react to devices going unreachable.
fn trigger_matches(trigger: &Trigger, event: &RegistryEvent) -> bool {
    let Trigger::StateChange {
        device_id,
        attribute,
        equals,
    } = trigger
    else {
        return false; // Schedule triggers are handled by timers
    };

    match event {
        RegistryEvent::StateChanged {
            device_id: event_device,
            attribute: event_attribute,
            value,
            ..
        } => event_device == device_id && event_attribute == attribute && value == equals,
        RegistryEvent::HealthChanged {
            device_id: event_device,
            health,
        } => {
            event_device == device_id
                && attribute == "health"
                && serde_json::to_value(health).is_ok_and(|v| &v == equals)
        }
        RegistryEvent::DeviceAdded { .. } => false,
    }
}
