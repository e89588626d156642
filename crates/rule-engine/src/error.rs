//! Error types for the rule engine

use thiserror::Error;

/// Errors that can occur while managing or firing rules
#[derive(Error, Debug)]
pub enum EngineError {
    /// Rule not found
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    /// Rule is disabled and may not be fired
    #[error("Rule is disabled: {0}")]
    RuleDisabled(String),

    /// Invalid cron expression
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    /// A condition could not be evaluated (missing device/attribute or
    /// type-incompatible comparison); the rule is skipped, never aborted
    #[error("Condition evaluation failed: {0}")]
    ConditionEvaluation(String),
}
