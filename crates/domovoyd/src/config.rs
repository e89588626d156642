//! Daemon configuration
//!
//! One TOML file describes the whole installation: devices, rooms,
//! groups, rules, voice patterns and every tunable. The file is loaded
//! once at startup; any validation failure is fatal before a single task
//! is spawned.

use chrono_tz::Tz;
use cron::Schedule;
use device_core::{Device, Group, HealthConfig, Room};
use rule_engine::{
    normalize_cron, Action, Condition, DispatchConfig, Invocation, Rule, Target, Trigger,
    VoicePattern,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid timezone: {0}")]
    Timezone(String),
    #[error("invalid cron expression in rule {rule}: {detail}")]
    Cron { rule: String, detail: String },
    #[error("duplicate id: {0}")]
    DuplicateId(String),
    #[error("{context} references unknown {target}")]
    UnknownTarget { context: String, target: String },
    #[error("invalid weekday {day} in rule {rule} (expected 0-6, 0 = Sunday)")]
    Weekday { rule: String, day: u8 },
    #[error("voice pattern {0} has no usable phrases")]
    NoPhrases(String),
    #[error("dispatch.retry_attempts must be at least 1")]
    ZeroRetries,
}

/// Health monitor tunables, in config-friendly units
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub offline_after_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: 60,
            probe_timeout_secs: 5,
            offline_after_secs: 180,
        }
    }
}

/// Command dispatcher tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub command_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub workers: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: 5,
            retry_attempts: 3,
            retry_delay_ms: 500,
            workers: 8,
        }
    }
}

/// The complete, immutable daemon configuration
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub voice: Vec<VoicePattern>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl AppConfig {
    /// Load and validate a configuration file
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration text
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw)?;
        for rule in &mut config.rules {
            if rule.id.is_empty() {
                rule.id = Uuid::new_v4().to_string();
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::Timezone(self.timezone.clone()))
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.health.probe_interval_secs),
            probe_timeout: Duration::from_secs(self.health.probe_timeout_secs),
            offline_after: Duration::from_secs(self.health.offline_after_secs),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            command_timeout: Duration::from_secs(self.dispatch.command_timeout_secs),
            retry_attempts: self.dispatch.retry_attempts,
            retry_delay: Duration::from_millis(self.dispatch.retry_delay_ms),
            workers: self.dispatch.workers,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.timezone()?;
        if self.dispatch.retry_attempts == 0 {
            return Err(ConfigError::ZeroRetries);
        }

        let devices = unique_ids(self.devices.iter().map(|d| d.id.as_str()))?;
        let groups = unique_ids(self.groups.iter().map(|g| g.id.as_str()))?;
        unique_ids(self.rooms.iter().map(|r| r.id.as_str()))?;
        unique_ids(self.rules.iter().map(|r| r.id.as_str()))?;
        unique_ids(self.voice.iter().map(|v| v.intent.as_str()))?;

        for room in &self.rooms {
            for member in &room.devices {
                require_device(&devices, member, format!("room {}", room.id))?;
            }
        }
        for group in &self.groups {
            for member in &group.devices {
                require_device(&devices, member, format!("group {}", group.id))?;
            }
        }

        for rule in &self.rules {
            let context = format!("rule {}", rule.id);
            match &rule.trigger {
                Trigger::Schedule { cron } => {
                    Schedule::from_str(&normalize_cron(cron)).map_err(|e| {
                        ConfigError::Cron {
                            rule: rule.id.clone(),
                            detail: e.to_string(),
                        }
                    })?;
                }
                Trigger::StateChange { device_id, .. } => {
                    require_device(&devices, device_id, context.clone())?;
                }
            }
            for condition in &rule.conditions {
                match condition {
                    Condition::Weekday { days } => {
                        if let Some(&day) = days.iter().find(|&&d| d > 6) {
                            return Err(ConfigError::Weekday {
                                rule: rule.id.clone(),
                                day,
                            });
                        }
                    }
                    Condition::DeviceState { device_id, .. } => {
                        require_device(&devices, device_id, context.clone())?;
                    }
                }
            }
            for action in &rule.actions {
                self.validate_action(action, &devices, &groups, &context)?;
            }
        }

        let rule_ids: HashSet<&str> = self.rules.iter().map(|r| r.id.as_str()).collect();
        for pattern in &self.voice {
            // A blank phrase is contained in every utterance; neither it
            // nor a phraseless pattern can ever match meaningfully.
            if pattern.phrases.is_empty()
                || pattern.phrases.iter().any(|p| p.trim().is_empty())
            {
                return Err(ConfigError::NoPhrases(pattern.intent.clone()));
            }
            let context = format!("voice pattern {}", pattern.intent);
            match &pattern.invokes {
                Invocation::Action { action } => {
                    self.validate_action(action, &devices, &groups, &context)?;
                }
                Invocation::Rule { rule_id } => {
                    if !rule_ids.contains(rule_id.as_str()) {
                        return Err(ConfigError::UnknownTarget {
                            context,
                            target: format!("rule {rule_id}"),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_action(
        &self,
        action: &Action,
        devices: &HashSet<&str>,
        groups: &HashSet<&str>,
        context: &str,
    ) -> Result<(), ConfigError> {
        let Action::DeviceCommand { target, .. } = action;
        match target {
            Target::Device { id } => require_device(devices, id, context.to_string()),
            Target::Group { id } => {
                if groups.contains(id.as_str()) {
                    Ok(())
                } else {
                    Err(ConfigError::UnknownTarget {
                        context: context.to_string(),
                        target: format!("group {id}"),
                    })
                }
            }
        }
    }
}

fn unique_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Result<HashSet<&'a str>, ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ConfigError::DuplicateId(id.to_string()));
        }
    }
    Ok(seen)
}

fn require_device(
    devices: &HashSet<&str>,
    id: &str,
    context: String,
) -> Result<(), ConfigError> {
    if devices.contains(id) {
        Ok(())
    } else {
        Err(ConfigError::UnknownTarget {
            context,
            target: format!("device {id}"),
        })
    }
}
