//! Rule and voice-pattern data models

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A complete automation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier; the daemon generates one when the config
    /// leaves it empty
    #[serde(default)]
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Whether the rule is active; a disabled rule is never evaluated
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// What initiates the rule
    pub trigger: Trigger,
    /// Conditions that must all hold (empty list is vacuously true)
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Actions executed sequentially when the rule fires
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}

/// Trigger types that can initiate a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Time-based trigger; cron expressions are always rearmed after firing
    Schedule {
        /// Cron expression ("0 7 * * *" or the seconds-bearing six-field form)
        cron: String,
    },
    /// Fires when a device attribute changes to the expected value
    StateChange {
        device_id: String,
        attribute: String,
        equals: Value,
    },
}

/// Comparison operators for device-state conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Conditions checked before a triggered rule's actions run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Day-of-week filter (0 = Sunday .. 6 = Saturday; empty means every day)
    Weekday { days: Vec<u8> },
    /// Compare a device attribute against a value
    DeviceState {
        device_id: String,
        attribute: String,
        op: Comparator,
        value: Value,
    },
}

/// Command target: one device or a whole group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    Device { id: String },
    Group { id: String },
}

/// A single effect of a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Send a command to a device or group; a group expands to one send
    /// per member at execution time
    DeviceCommand {
        target: Target,
        command: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
}

/// What a matched voice pattern invokes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Invocation {
    /// Run one action directly
    Action { action: Action },
    /// Run the actions of an existing rule (conditions bypassed)
    Rule { rule_id: String },
}

/// A configured voice phrase pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicePattern {
    /// Intent identifier (e.g. "lights.on")
    pub intent: String,
    /// Phrase variants; any variant contained in the input matches
    pub phrases: Vec<String>,
    /// Response template; `{time}` / `{date}` placeholders are substituted
    pub response: String,
    /// Bound action or rule reference
    pub invokes: Invocation,
}

/// Immutable generation of the configured rules
///
/// Reloading or toggling a rule produces a new generation that is swapped
/// in atomically; in-flight evaluations keep the snapshot they started
/// with.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: HashMap<String, Arc<Rule>>,
    order: Vec<String>,
}

impl RuleSet {
    #[must_use]
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        let order = rules.iter().map(|r| r.id.clone()).collect();
        let rules = rules
            .into_iter()
            .map(|r| (r.id.clone(), Arc::new(r)))
            .collect();
        Self { rules, order }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Rule>> {
        self.rules.get(id).cloned()
    }

    /// Rules in declaration order
    pub fn iter(&self) -> impl Iterator<Item = Arc<Rule>> + '_ {
        self.order.iter().filter_map(|id| self.rules.get(id).cloned())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Next generation with one rule's enabled flag changed
    pub fn with_enabled(&self, id: &str, enabled: bool) -> Result<Self, EngineError> {
        let current = self
            .rules
            .get(id)
            .ok_or_else(|| EngineError::RuleNotFound(id.to_string()))?;

        let mut rule = Rule::clone(current);
        rule.enabled = enabled;

        let mut rules = self.rules.clone();
        rules.insert(id.to_string(), Arc::new(rule));
        Ok(Self {
            rules,
            order: self.order.clone(),
        })
    }
}

/// Normalize a cron expression for the `cron` crate, which expects a
/// seconds field: a classic five-field crontab line gets `0` prepended.
#[must_use]
pub fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}
