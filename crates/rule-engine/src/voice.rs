//! Voice command router
//!
//! Routes free-form utterances to configured phrase patterns. Matching is
//! case-insensitive substring containment; the first pattern in
//! declaration order wins, so more specific phrases belong earlier in the
//! configuration.

use crate::clock::Clock;
use crate::dispatcher::DispatchResult;
use crate::engine::RuleEngine;
use crate::model::{Invocation, VoicePattern};
use chrono_tz::Tz;
use std::sync::Arc;

/// Outcome of a routed utterance
#[derive(Debug, Clone)]
pub struct VoiceReply {
    /// Intent of the matched pattern
    pub intent: String,
    /// Rendered response text
    pub reply: String,
    /// Results of the dispatched actions, in order
    pub results: Vec<DispatchResult>,
}

/// Matches utterances against configured patterns and runs what they bind
pub struct VoiceRouter {
    patterns: Vec<VoicePattern>,
    engine: Arc<RuleEngine>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
}

impl VoiceRouter {
    #[must_use]
    pub fn new(
        patterns: Vec<VoicePattern>,
        engine: Arc<RuleEngine>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
    ) -> Self {
        Self {
            patterns,
            engine,
            clock,
            timezone,
        }
    }

    /// Find the first pattern whose phrase is contained in the utterance
    #[must_use]
    pub fn match_text(&self, text: &str) -> Option<&VoicePattern> {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }
        self.patterns.iter().find(|pattern| {
            pattern
                .phrases
                .iter()
                .any(|phrase| normalized.contains(&phrase.to_lowercase()))
        })
    }

    /// Route an utterance: match, run the bound invocation, render the
    /// response. `None` means no pattern matched.
    pub async fn handle(&self, text: &str) -> Option<VoiceReply> {
        let pattern = self.match_text(text)?;
        tracing::info!(intent = %pattern.intent, "voice command matched");

        let results = match &pattern.invokes {
            Invocation::Action { action } => {
                self.engine.run_actions(std::slice::from_ref(action)).await
            }
            // A referenced rule contributes its actions only; its trigger
            // and conditions do not apply to a spoken request.
            Invocation::Rule { rule_id } => match self.engine.rule(rule_id) {
                Some(rule) => self.engine.run_actions(&rule.actions).await,
                None => {
                    tracing::warn!(rule = %rule_id, "voice pattern references unknown rule");
                    vec![DispatchResult::Failure {
                        reason: format!("rule not found: {rule_id}"),
                    }]
                }
            },
        };

        Some(VoiceReply {
            intent: pattern.intent.clone(),
            reply: self.render(&pattern.response),
            results,
        })
    }

    /// Substitute `{time}` and `{date}` placeholders
    fn render(&self, template: &str) -> String {
        if !template.contains('{') {
            return template.to_string();
        }
        let now = self.clock.now_in(self.timezone);
        template
            .replace("{time}", &now.format("%H:%M").to_string())
            .replace("{date}", &now.format("%d.%m.%Y").to_string())
    }
}
