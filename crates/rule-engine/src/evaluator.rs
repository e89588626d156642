//! Condition evaluator
//!
//! Conditions are checked left-to-right with short-circuit on the first
//! failure, against a device snapshot taken once at evaluation start so a
//! multi-condition rule never sees a torn view of the registry.

use crate::clock::Clock;
use crate::error::EngineError;
use crate::model::{Comparator, Condition};
use chrono::Datelike;
use chrono_tz::Tz;
use device_core::{Device, DeviceRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Devices referenced by a rule, cloned at evaluation start
pub type StateSnapshot = HashMap<String, Device>;

/// Evaluator for rule conditions
pub struct ConditionEvaluator {
    registry: Arc<DeviceRegistry>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
}

impl ConditionEvaluator {
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>, clock: Arc<dyn Clock>, timezone: Tz) -> Self {
        Self {
            registry,
            clock,
            timezone,
        }
    }

    /// Clone every device the conditions reference, once
    ///
    /// Missing devices are simply absent from the snapshot; evaluation
    /// reports them as an error when (and only when) a condition actually
    /// reaches them.
    #[must_use]
    pub fn snapshot(&self, conditions: &[Condition]) -> StateSnapshot {
        let mut snapshot = StateSnapshot::new();
        for condition in conditions {
            if let Condition::DeviceState { device_id, .. } = condition {
                if snapshot.contains_key(device_id) {
                    continue;
                }
                if let Ok(device) = self.registry.get_device(device_id) {
                    snapshot.insert(device_id.clone(), device);
                }
            }
        }
        snapshot
    }

    /// Evaluate all conditions (AND semantics, short-circuit)
    ///
    /// An empty list is vacuously true. Remaining conditions after the
    /// first false one are not evaluated.
    pub fn evaluate_all(
        &self,
        conditions: &[Condition],
        snapshot: &StateSnapshot,
    ) -> Result<bool, EngineError> {
        for condition in conditions {
            if !self.evaluate(condition, snapshot)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate a single condition
    pub fn evaluate(
        &self,
        condition: &Condition,
        snapshot: &StateSnapshot,
    ) -> Result<bool, EngineError> {
        match condition {
            Condition::Weekday { days } => Ok(self.evaluate_weekday(days)),
            Condition::DeviceState {
                device_id,
                attribute,
                op,
                value,
            } => self.evaluate_device_state(device_id, attribute, *op, value, snapshot),
        }
    }

    fn evaluate_weekday(&self, days: &[u8]) -> bool {
        if days.is_empty() {
            return true; // Empty means every day
        }
        let today = self
            .clock
            .now_in(self.timezone)
            .weekday()
            .num_days_from_sunday() as u8;
        days.contains(&today)
    }

    fn evaluate_device_state(
        &self,
        device_id: &str,
        attribute: &str,
        op: Comparator,
        expected: &Value,
        snapshot: &StateSnapshot,
    ) -> Result<bool, EngineError> {
        let device = snapshot.get(device_id).ok_or_else(|| {
            EngineError::ConditionEvaluation(format!("device not found: {device_id}"))
        })?;
        let actual = device.attribute(attribute).ok_or_else(|| {
            EngineError::ConditionEvaluation(format!(
                "device {device_id} has no attribute: {attribute}"
            ))
        })?;
        compare(op, actual, expected)
    }
}

/// Apply a comparator to two JSON values
///
/// Equality works on any values; ordering requires two numbers or two
/// strings and is an evaluation error otherwise (never silently false).
pub fn compare(op: Comparator, actual: &Value, expected: &Value) -> Result<bool, EngineError> {
    match op {
        Comparator::Eq => return Ok(actual == expected),
        Comparator::Ne => return Ok(actual != expected),
        _ => {}
    }

    let ordering = if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        a.partial_cmp(&b)
    } else if let (Some(a), Some(b)) = (actual.as_str(), expected.as_str()) {
        Some(a.cmp(b))
    } else {
        None
    };

    let Some(ordering) = ordering else {
        return Err(EngineError::ConditionEvaluation(format!(
            "cannot order {actual} against {expected}"
        )));
    };

    Ok(match op {
        Comparator::Gt => ordering.is_gt(),
        Comparator::Gte => ordering.is_ge(),
        Comparator::Lt => ordering.is_lt(),
        Comparator::Lte => ordering.is_le(),
        Comparator::Eq | Comparator::Ne => unreachable!("handled above"),
    })
}
