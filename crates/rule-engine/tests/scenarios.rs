//! End-to-end scenarios wiring registry, engine, scheduler and voice
//! router together the way the daemon does.

use async_trait::async_trait;
use chrono_tz::Europe::Moscow;
use device_core::{
    Ack, AdapterError, AdapterSet, Capability, Device, DeviceAdapter, DeviceRegistry,
    RegistryEvent,
};
use rule_engine::{
    Action, CommandDispatcher, Condition, ConditionEvaluator, DispatchConfig,
    DispatchResult, Evaluation, FixedClock, Invocation, Rule, RuleEngine, RuleSet, Target,
    Trigger, TriggerScheduler, VoicePattern, VoiceRouter,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingAdapter {
    log: Mutex<Vec<(String, String)>>,
}

impl RecordingAdapter {
    fn commands(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceAdapter for RecordingAdapter {
    fn transport(&self) -> &str {
        "virtual"
    }

    async fn probe(&self, _device_id: &str) -> Result<HashMap<String, Value>, AdapterError> {
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
        Ok(Ack::accepted())
    }
}

struct Home {
    registry: Arc<DeviceRegistry>,
    engine: Arc<RuleEngine>,
    scheduler: Arc<TriggerScheduler>,
    adapter: Arc<RecordingAdapter>,
    clock: Arc<FixedClock>,
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

/// A morning routine: weekdays at 07:00, turn on the bedroom lamp and the
/// kitchen lamp.
fn good_morning() -> Rule {
    Rule {
        id: "good_morning".into(),
        name: "Good morning".into(),
        enabled: true,
        trigger: Trigger::Schedule {
            cron: "0 7 * * *".into(),
        },
        conditions: vec![Condition::Weekday {
            days: vec![1, 2, 3, 4, 5],
        }],
        actions: vec![
            Action::DeviceCommand {
                target: Target::Device {
                    id: "bedroom_lamp".into(),
                },
                command: "turn_on".into(),
                params: Map::new(),
            },
            Action::DeviceCommand {
                target: Target::Device {
                    id: "kitchen_lamp".into(),
                },
                command: "turn_on".into(),
                params: Map::new(),
            },
        ],
    }
}

fn home_at(clock: FixedClock, rules: Vec<Rule>) -> Home {
    let registry = Arc::new(DeviceRegistry::new(vec![], vec![]));
    registry.upsert_device(lamp("bedroom_lamp"));
    registry.upsert_device(lamp("kitchen_lamp"));
    registry.upsert_device(Device::new("motion", "Hall motion", "virtual"));

    let adapter = Arc::new(RecordingAdapter::default());
    let mut adapters = AdapterSet::new();
    adapters.register(Arc::clone(&adapter) as Arc<dyn DeviceAdapter>);
    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::clone(&registry),
        adapters,
        DispatchConfig::default(),
        CancellationToken::new(),
    ));

    let clock = Arc::new(clock);
    let evaluator = ConditionEvaluator::new(Arc::clone(&registry), clock.clone(), Moscow);
    let engine = Arc::new(RuleEngine::new(
        RuleSet::from_rules(rules),
        evaluator,
        dispatcher,
    ));
    let scheduler = Arc::new(TriggerScheduler::new(
        Arc::clone(&engine),
        Arc::clone(&registry),
        clock.clone(),
        Moscow,
        CancellationToken::new(),
    ));

    Home {
        registry,
        engine,
        scheduler,
        adapter,
        clock,
    }
}

#[tokio::test]
async fn morning_routine_runs_on_a_weekday() {
    // Tuesday 2025-06-03, 07:00 Moscow.
    let home = home_at(FixedClock::at(Moscow, 2025, 6, 3, 7, 0), vec![good_morning()]);

    let eval = home.engine.fire("good_morning", "schedule").await.unwrap();
    assert_eq!(
        eval,
        Evaluation::Executed(vec![DispatchResult::Success, DispatchResult::Success])
    );
    // Actions ran in declaration order.
    assert_eq!(
        home.adapter.commands(),
        vec![
            ("bedroom_lamp".to_string(), "turn_on".to_string()),
            ("kitchen_lamp".to_string(), "turn_on".to_string()),
        ]
    );
}

#[tokio::test]
async fn morning_routine_skips_the_weekend() {
    // Saturday 2025-06-07, 07:00 Moscow.
    let home = home_at(FixedClock::at(Moscow, 2025, 6, 7, 7, 0), vec![good_morning()]);

    let eval = home.engine.fire("good_morning", "schedule").await.unwrap();
    assert!(matches!(eval, Evaluation::Skipped(_)));
    assert!(home.adapter.commands().is_empty());
}

#[tokio::test]
async fn motion_event_flows_from_registry_to_dispatch() {
    let rule = Rule {
        id: "hall_light".into(),
        name: String::new(),
        enabled: true,
        trigger: Trigger::StateChange {
            device_id: "motion".into(),
            attribute: "occupied".into(),
            equals: json!(true),
        },
        conditions: vec![],
        actions: vec![Action::DeviceCommand {
            target: Target::Device {
                id: "bedroom_lamp".into(),
            },
            command: "turn_on".into(),
            params: Map::new(),
        }],
    };
    let home = home_at(FixedClock::at(Moscow, 2025, 6, 3, 21, 0), vec![rule]);

    // Update the sensor and feed the resulting registry event through the
    // scheduler's matcher, as the listener task would.
    let mut rx = home.registry.subscribe();
    home.registry
        .update_state("motion", "occupied", json!(true))
        .unwrap();
    let event = rx.try_recv().unwrap();
    assert!(matches!(event, RegistryEvent::StateChanged { .. }));

    for firing in home.scheduler.handle_event(&event) {
        firing.await.unwrap();
    }
    assert_eq!(
        home.adapter.commands(),
        vec![("bedroom_lamp".to_string(), "turn_on".to_string())]
    );
}

#[tokio::test]
async fn voice_command_reaches_the_same_dispatch_path() {
    let home = home_at(FixedClock::at(Moscow, 2025, 6, 3, 22, 30), vec![good_morning()]);
    let patterns = vec![
        VoicePattern {
            intent: "lights.off".into(),
            phrases: vec!["выключи свет".into()],
            response: "Выключаю свет".into(),
            invokes: Invocation::Action {
                action: Action::DeviceCommand {
                    target: Target::Device {
                        id: "bedroom_lamp".into(),
                    },
                    command: "turn_off".into(),
                    params: Map::new(),
                },
            },
        },
        VoicePattern {
            intent: "scene.morning".into(),
            phrases: vec!["доброе утро".into()],
            response: "Доброе утро! Сейчас {time}".into(),
            invokes: Invocation::Rule {
                rule_id: "good_morning".into(),
            },
        },
    ];
    let router = VoiceRouter::new(
        patterns,
        Arc::clone(&home.engine),
        home.clock.clone(),
        Moscow,
    );

    let reply = router.handle("Выключи свет, пожалуйста").await.unwrap();
    assert_eq!(reply.intent, "lights.off");
    assert!(reply.results.iter().all(DispatchResult::is_success));

    // Rule-backed pattern runs the rule's actions even though it is
    // evening and the weekday condition would not matter either way.
    let reply = router.handle("доброе утро").await.unwrap();
    assert_eq!(reply.reply, "Доброе утро! Сейчас 22:30");
    assert_eq!(reply.results.len(), 2);

    assert_eq!(
        home.adapter.commands(),
        vec![
            ("bedroom_lamp".to_string(), "turn_off".to_string()),
            ("bedroom_lamp".to_string(), "turn_on".to_string()),
            ("kitchen_lamp".to_string(), "turn_on".to_string()),
        ]
    );
}

#[tokio::test]
async fn toggling_a_rule_is_visible_to_later_firings() {
    let home = home_at(FixedClock::at(Moscow, 2025, 6, 3, 7, 0), vec![good_morning()]);

    home.engine.set_enabled("good_morning", false).unwrap();
    assert!(home.engine.fire("good_morning", "schedule").await.is_err());
    assert!(home.adapter.commands().is_empty());

    home.engine.set_enabled("good_morning", true).unwrap();
    let eval = home.engine.fire("good_morning", "schedule").await.unwrap();
    assert!(matches!(eval, Evaluation::Executed(_)));
}
