//! Core rule engine

use crate::dispatcher::{CommandDispatcher, DispatchResult};
use crate::error::EngineError;
use crate::evaluator::ConditionEvaluator;
use crate::model::{Action, Rule, RuleSet, Target};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, Mutex};

/// Why a triggered rule did not run its actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A condition evaluated to false
    ConditionsNotMet,
    /// A condition could not be evaluated; treated as false
    EvaluationFailed(String),
}

/// Result of evaluating a triggered rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Skipped(SkipReason),
    Executed(Vec<DispatchResult>),
}

/// Events emitted by the engine, consumable by the bus bridge
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A rule was triggered and is being evaluated
    Triggered { rule_id: String, reason: String },
    /// A triggered rule was skipped
    Skipped { rule_id: String, reason: String },
    /// A triggered rule ran its actions
    Executed { rule_id: String, all_succeeded: bool },
}

/// Evaluates rules against registry state and dispatches their actions
pub struct RuleEngine {
    /// Current rule generation; swapped atomically, never mutated in place
    rules: RwLock<Arc<RuleSet>>,
    evaluator: ConditionEvaluator,
    dispatcher: Arc<CommandDispatcher>,
    /// Per-rule firing locks: the same rule never overlaps itself
    firing: DashMap<String, Arc<Mutex<()>>>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl RuleEngine {
    #[must_use]
    pub fn new(
        rules: RuleSet,
        evaluator: ConditionEvaluator,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            rules: RwLock::new(Arc::new(rules)),
            evaluator,
            dispatcher,
            firing: DashMap::new(),
            event_tx,
        }
    }

    /// Subscribe to engine events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Current rule generation
    #[must_use]
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.read().expect("rule set lock poisoned").clone()
    }

    /// Look up a rule in the current generation
    #[must_use]
    pub fn rule(&self, id: &str) -> Option<Arc<Rule>> {
        self.rules().get(id)
    }

    /// Enable or disable a rule by swapping in a new rule-set generation
    ///
    /// In-flight evaluations keep the generation they started with.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<Arc<Rule>, EngineError> {
        let mut guard = self.rules.write().expect("rule set lock poisoned");
        let next = guard.with_enabled(id, enabled)?;
        *guard = Arc::new(next);
        let rule = guard.get(id).ok_or_else(|| EngineError::RuleNotFound(id.to_string()))?;
        drop(guard);

        tracing::info!(rule = %id, enabled, "rule toggled");
        Ok(rule)
    }

    /// Fire a rule by id (scheduler and manual-trigger entry point)
    ///
    /// Firings of the same rule serialize; different rules run
    /// concurrently. A disabled rule is refused, never evaluated.
    pub async fn fire(&self, rule_id: &str, reason: &str) -> Result<Evaluation, EngineError> {
        let rule = self
            .rule(rule_id)
            .ok_or_else(|| EngineError::RuleNotFound(rule_id.to_string()))?;
        if !rule.enabled {
            return Err(EngineError::RuleDisabled(rule_id.to_string()));
        }

        let lock = self
            .firing
            .entry(rule_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        tracing::debug!(rule = %rule_id, reason, "rule triggered");
        let _ = self.event_tx.send(EngineEvent::Triggered {
            rule_id: rule_id.to_string(),
            reason: reason.to_string(),
        });

        let evaluation = self.evaluate(&rule).await;
        match &evaluation {
            Evaluation::Skipped(skip) => {
                tracing::debug!(rule = %rule_id, ?skip, "rule skipped");
                let _ = self.event_tx.send(EngineEvent::Skipped {
                    rule_id: rule_id.to_string(),
                    reason: format!("{skip:?}"),
                });
            }
            Evaluation::Executed(results) => {
                let all_succeeded = results.iter().all(DispatchResult::is_success);
                if !all_succeeded {
                    tracing::warn!(rule = %rule_id, ?results, "rule executed with failures");
                }
                let _ = self.event_tx.send(EngineEvent::Executed {
                    rule_id: rule_id.to_string(),
                    all_succeeded,
                });
            }
        }
        Ok(evaluation)
    }

    /// Evaluate conditions and, if they hold, run the actions in order
    ///
    /// Actions are independent: a failing action is recorded but never
    /// stops the ones after it.
    pub async fn evaluate(&self, rule: &Rule) -> Evaluation {
        let snapshot = self.evaluator.snapshot(&rule.conditions);
        match self.evaluator.evaluate_all(&rule.conditions, &snapshot) {
            Ok(true) => {}
            Ok(false) => return Evaluation::Skipped(SkipReason::ConditionsNotMet),
            Err(e) => {
                return Evaluation::Skipped(SkipReason::EvaluationFailed(e.to_string()));
            }
        }

        let mut results = Vec::with_capacity(rule.actions.len());
        for action in &rule.actions {
            results.push(self.dispatcher.execute_for_rule(action).await);
        }
        Evaluation::Executed(results)
    }

    /// Run actions directly, bypassing triggers and conditions
    /// (voice router and manual-action path)
    pub async fn run_actions(&self, actions: &[Action]) -> Vec<DispatchResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            results.push(self.dispatcher.execute(action).await);
        }
        results
    }

    /// Entry point for commands arriving over the message bus; equivalent
    /// to one internally-triggered device command
    pub async fn on_external_command(
        &self,
        device_id: &str,
        command: &str,
        params: Map<String, Value>,
    ) -> DispatchResult {
        self.dispatcher
            .execute(&Action::DeviceCommand {
                target: Target::Device {
                    id: device_id.to_string(),
                },
                command: command.to_string(),
                params,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::dispatcher::DispatchConfig;
    use crate::model::{Comparator, Condition, Trigger};
    use async_trait::async_trait;
    use chrono_tz::Europe::Moscow;
    use device_core::{
        Ack, AdapterError, AdapterSet, Capability, Device, DeviceAdapter, DeviceRegistry,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Records the order of commands it receives; `broken` devices fail.
    #[derive(Default)]
    struct RecordingAdapter {
        log: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DeviceAdapter for RecordingAdapter {
        fn transport(&self) -> &str {
            "virtual"
        }

        async fn probe(
            &self,
            _device_id: &str,
        ) -> Result<HashMap<String, Value>, AdapterError> {
            Ok(HashMap::new())
        }

        async fn send(
            &self,
            device_id: &str,
            command: &str,
            _params: &Map<String, Value>,
        ) -> Result<Ack, AdapterError> {
            self.log
                .lock()
                .unwrap()
                .push((device_id.to_string(), command.to_string()));
            if device_id.starts_with("broken") {
                return Err(AdapterError::Permanent("dead".into()));
            }
            Ok(Ack::accepted())
        }
    }

    fn lamp(id: &str) -> Device {
        let mut d = Device::new(id, id, "virtual");
        d.capabilities = vec![
            Capability {
                command: "turn_on".into(),
                params: vec![],
            },
            Capability {
                command: "turn_off".into(),
                params: vec![],
            },
        ];
        d
    }

    fn action(device: &str, command: &str) -> Action {
        Action::DeviceCommand {
            target: Target::Device { id: device.into() },
            command: command.into(),
            params: Map::new(),
        }
    }

    fn engine_with(
        rules: Vec<Rule>,
        devices: Vec<Device>,
        clock: FixedClock,
    ) -> (RuleEngine, Arc<RecordingAdapter>) {
        let registry = Arc::new(DeviceRegistry::new(vec![], vec![]));
        for d in devices {
            registry.upsert_device(d);
        }
        let adapter = Arc::new(RecordingAdapter::default());
        let mut adapters = AdapterSet::new();
        adapters.register(Arc::clone(&adapter) as Arc<dyn DeviceAdapter>);
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            adapters,
            DispatchConfig {
                retry_attempts: 1,
                ..DispatchConfig::default()
            },
            CancellationToken::new(),
        ));
        let evaluator = ConditionEvaluator::new(registry, Arc::new(clock), Moscow);
        (
            RuleEngine::new(RuleSet::from_rules(rules), evaluator, dispatcher),
            adapter,
        )
    }

    fn monday_noon() -> FixedClock {
        FixedClock::at(Moscow, 2025, 6, 2, 12, 0)
    }

    /// Tracks how many sends are in flight at once; each send parks for a
    /// moment so overlapping dispatches are observable.
    #[derive(Default)]
    struct GateAdapter {
        entered: AtomicU32,
        max_entered: AtomicU32,
    }

    #[async_trait]
    impl DeviceAdapter for GateAdapter {
        fn transport(&self) -> &str {
            "virtual"
        }

        async fn probe(
            &self,
            _device_id: &str,
        ) -> Result<HashMap<String, Value>, AdapterError> {
            Ok(HashMap::new())
        }

        async fn send(
            &self,
            _device_id: &str,
            _command: &str,
            _params: &Map<String, Value>,
        ) -> Result<Ack, AdapterError> {
            let in_flight = self.entered.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_entered.fetch_max(in_flight, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.entered.fetch_sub(1, Ordering::SeqCst);
            Ok(Ack::accepted())
        }
    }

    fn schedule_rule(id: &str, device: &str) -> Rule {
        Rule {
            id: id.into(),
            name: String::new(),
            enabled: true,
            trigger: Trigger::Schedule {
                cron: "0 7 * * *".into(),
            },
            conditions: vec![],
            actions: vec![action(device, "turn_on")],
        }
    }

    fn gated_engine(rules: Vec<Rule>) -> (Arc<RuleEngine>, Arc<GateAdapter>) {
        let registry = Arc::new(DeviceRegistry::new(vec![], vec![]));
        registry.upsert_device(lamp("lamp"));
        registry.upsert_device(lamp("lamp2"));
        let adapter = Arc::new(GateAdapter::default());
        let mut adapters = AdapterSet::new();
        adapters.register(Arc::clone(&adapter) as Arc<dyn DeviceAdapter>);
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            adapters,
            DispatchConfig {
                retry_attempts: 1,
                ..DispatchConfig::default()
            },
            CancellationToken::new(),
        ));
        let evaluator = ConditionEvaluator::new(registry, Arc::new(monday_noon()), Moscow);
        let engine = Arc::new(RuleEngine::new(
            RuleSet::from_rules(rules),
            evaluator,
            dispatcher,
        ));
        (engine, adapter)
    }

    #[tokio::test]
    async fn empty_conditions_always_execute() {
        let rule = Rule {
            id: "r1".into(),
            name: "unconditional".into(),
            enabled: true,
            trigger: Trigger::Schedule {
                cron: "0 7 * * *".into(),
            },
            conditions: vec![],
            actions: vec![action("lamp", "turn_on")],
        };
        let (engine, adapter) = engine_with(vec![rule], vec![lamp("lamp")], monday_noon());

        let eval = engine.fire("r1", "test").await.unwrap();
        assert_eq!(eval, Evaluation::Executed(vec![DispatchResult::Success]));
        assert_eq!(adapter.log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_rule_is_never_evaluated() {
        let rule = Rule {
            id: "r1".into(),
            name: String::new(),
            enabled: false,
            trigger: Trigger::Schedule {
                cron: "0 7 * * *".into(),
            },
            conditions: vec![],
            actions: vec![action("lamp", "turn_on")],
        };
        let (engine, adapter) = engine_with(vec![rule], vec![lamp("lamp")], monday_noon());

        assert!(matches!(
            engine.fire("r1", "test").await,
            Err(EngineError::RuleDisabled(_))
        ));
        assert!(adapter.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn evaluation_error_skips_without_dispatch() {
        let rule = Rule {
            id: "r1".into(),
            name: String::new(),
            enabled: true,
            trigger: Trigger::Schedule {
                cron: "0 7 * * *".into(),
            },
            conditions: vec![Condition::DeviceState {
                device_id: "ghost".into(),
                attribute: "power".into(),
                op: Comparator::Eq,
                value: json!(true),
            }],
            actions: vec![action("lamp", "turn_on")],
        };
        let (engine, adapter) = engine_with(vec![rule], vec![lamp("lamp")], monday_noon());

        let eval = engine.fire("r1", "test").await.unwrap();
        assert!(matches!(
            eval,
            Evaluation::Skipped(SkipReason::EvaluationFailed(_))
        ));
        assert!(adapter.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_action_does_not_stop_later_actions() {
        let rule = Rule {
            id: "r1".into(),
            name: String::new(),
            enabled: true,
            trigger: Trigger::Schedule {
                cron: "0 7 * * *".into(),
            },
            conditions: vec![],
            actions: vec![
                action("broken", "turn_on"),
                action("lamp", "turn_on"),
            ],
        };
        let (engine, adapter) =
            engine_with(vec![rule], vec![lamp("broken"), lamp("lamp")], monday_noon());

        let eval = engine.fire("r1", "test").await.unwrap();
        match eval {
            Evaluation::Executed(results) => {
                assert_eq!(results.len(), 2);
                assert!(matches!(results[0], DispatchResult::Failure { .. }));
                assert!(results[1].is_success());
            }
            other => panic!("unexpected: {other:?}"),
        }
        let log = adapter.log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, "broken");
        assert_eq!(log[1].0, "lamp");
    }

    #[tokio::test(start_paused = true)]
    async fn same_rule_firings_never_overlap() {
        let (engine, adapter) = gated_engine(vec![schedule_rule("r1", "lamp")]);

        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.fire("r1", "test").await.unwrap() })
        };
        let second = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.fire("r1", "test").await.unwrap() })
        };
        assert!(matches!(first.await.unwrap(), Evaluation::Executed(_)));
        assert!(matches!(second.await.unwrap(), Evaluation::Executed(_)));

        // Both firings ran to completion, one after the other.
        assert_eq!(adapter.max_entered.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.entered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn different_rules_fire_concurrently() {
        let (engine, adapter) = gated_engine(vec![
            schedule_rule("r1", "lamp"),
            schedule_rule("r2", "lamp2"),
        ]);

        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.fire("r1", "test").await.unwrap() })
        };
        let second = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.fire("r2", "test").await.unwrap() })
        };
        first.await.unwrap();
        second.await.unwrap();

        // Their sends were in flight at the same time.
        assert_eq!(adapter.max_entered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn set_enabled_swaps_generation() {
        let rule = Rule {
            id: "r1".into(),
            name: String::new(),
            enabled: true,
            trigger: Trigger::Schedule {
                cron: "0 7 * * *".into(),
            },
            conditions: vec![],
            actions: vec![action("lamp", "turn_on")],
        };
        let (engine, _) = engine_with(vec![rule], vec![lamp("lamp")], monday_noon());

        let old = engine.rules();
        engine.set_enabled("r1", false).unwrap();
        assert!(old.get("r1").unwrap().enabled);
        assert!(!engine.rule("r1").unwrap().enabled);
    }

    #[tokio::test]
    async fn external_command_dispatches_directly() {
        let (engine, adapter) = engine_with(vec![], vec![lamp("lamp")], monday_noon());

        let result = engine
            .on_external_command("lamp", "turn_off", Map::new())
            .await;
        assert!(result.is_success());
        assert_eq!(
            adapter.log.lock().unwrap()[0],
            ("lamp".to_string(), "turn_off".to_string())
        );
    }
}
