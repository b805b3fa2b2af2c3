//! Transition actions.
//!
//! A requested action is first resolved against the registry into a
//! `Transition`, which only describes the change. The runner applies it to
//! its working copy of the thread once generation has succeeded.

use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::{RequestedAction, TerminalKind, ThreadOutcome};

use crate::registry::{ActionKind, StepId, StepRegistry};
use crate::thread::ThreadState;

/// A validated, not yet applied, state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Record {
        action: String,
        fact: String,
        value: serde_json::Value,
        to: StepId,
    },
    Revert {
        action: String,
        to: StepId,
        reason: String,
    },
    Terminal {
        action: String,
        kind: TerminalKind,
        payload: String,
    },
}

impl Transition {
    /// Check a requested action against the current step and build the
    /// transition it describes.
    pub fn resolve(
        registry: &StepRegistry,
        current: StepId,
        requested: &RequestedAction,
    ) -> Result<Self> {
        let definition = registry.action(&requested.name).ok_or_else(|| {
            StepwiseError::InvalidTransition(format!("unknown action '{}'", requested.name))
        })?;
        if let ActionKind::Revert { target } = definition.kind {
            if !registry.is_earlier(target, current) {
                return Err(StepwiseError::InvalidTransition(format!(
                    "'{}' cannot move from '{}' to '{}': target is not an earlier step",
                    requested.name,
                    registry.step_name(current),
                    registry.step_name(target)
                )));
            }
        }
        if definition.owner != current {
            return Err(StepwiseError::InvalidTransition(format!(
                "action '{}' is not available in step '{}'",
                requested.name,
                registry.step_name(current)
            )));
        }

        let argument = extract_argument(&requested.input, &definition.param).ok_or_else(|| {
            StepwiseError::InvalidTransition(format!(
                "action '{}' needs a non-empty string '{}'",
                requested.name, definition.param
            ))
        })?;

        match &definition.kind {
            ActionKind::Record { fact, values } => {
                if !values.is_empty() && !values.iter().any(|v| v == &argument) {
                    return Err(StepwiseError::InvalidTransition(format!(
                        "'{}' is not a valid {} (expected one of: {})",
                        argument,
                        definition.param,
                        values.join(", ")
                    )));
                }
                let to = registry.step(current).next.ok_or_else(|| {
                    StepwiseError::InvalidTransition(format!(
                        "step '{}' has no next step",
                        registry.step_name(current)
                    ))
                })?;
                Ok(Self::Record {
                    action: definition.name.clone(),
                    fact: fact.clone(),
                    value: serde_json::Value::String(argument),
                    to,
                })
            }
            ActionKind::Revert { target } => Ok(Self::Revert {
                action: definition.name.clone(),
                to: *target,
                reason: argument,
            }),
            ActionKind::Terminal { outcome } => Ok(Self::Terminal {
                action: definition.name.clone(),
                kind: *outcome,
                payload: argument,
            }),
        }
    }

    /// Apply to `state`. On error `state` is left untouched.
    pub fn apply(&self, registry: &StepRegistry, state: &mut ThreadState) -> Result<()> {
        match self {
            Self::Record {
                action,
                fact,
                value,
                to,
            } => {
                if registry.step(state.step).next != Some(*to) {
                    return Err(StepwiseError::InvalidTransition(format!(
                        "'{}' cannot advance from '{}'",
                        action,
                        registry.step_name(state.step)
                    )));
                }
                let previous = state.facts.record(fact.clone(), value.clone());
                debug!(fact = %fact, value = %value, previous = ?previous, "Fact recorded");
                state.step = *to;
            }
            Self::Revert { action, to, .. } => {
                let target = registry.get(*to).ok_or_else(|| {
                    StepwiseError::InvalidTransition(format!(
                        "'{}' targets a step outside the registry",
                        action
                    ))
                })?;
                if !registry.is_earlier(*to, state.step) {
                    return Err(StepwiseError::InvalidTransition(format!(
                        "'{}' cannot move from '{}' to '{}': target is not an earlier step",
                        action,
                        registry.step_name(state.step),
                        target.name
                    )));
                }
                state.step = *to;
            }
            Self::Terminal { kind, payload, .. } => {
                state.outcome = ThreadOutcome::from_terminal(*kind, payload.clone());
            }
        }
        Ok(())
    }

    pub fn action_name(&self) -> &str {
        match self {
            Self::Record { action, .. } | Self::Revert { action, .. } | Self::Terminal { action, .. } => {
                action
            }
        }
    }

    /// Short confirmation stored in the thread history.
    pub fn note(&self, registry: &StepRegistry) -> String {
        match self {
            Self::Record { fact, value, .. } => match value {
                serde_json::Value::String(s) => format!("{} recorded as: {}", fact, s),
                other => format!("{} recorded as: {}", fact, other),
            },
            Self::Revert { to, reason, .. } => format!(
                "Returning to {}: {}",
                registry.step_name(*to),
                reason
            ),
            Self::Terminal { kind, payload, .. } => match kind {
                TerminalKind::Escalate => format!("Escalated to a human: {}", payload),
                TerminalKind::Resolved => format!("Resolved: {}", payload),
            },
        }
    }
}

/// Pull the single string argument out of a tool call's input. A bare
/// string is accepted as the argument itself.
fn extract_argument(input: &serde_json::Value, param: &str) -> Option<String> {
    let value = match input {
        serde_json::Value::String(s) => s.as_str(),
        serde_json::Value::Object(map) => map.get(param)?.as_str()?,
        _ => return None,
    };
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support;
    use serde_json::json;
    use stepwise_core::types::ThreadId;

    fn setup() -> (StepRegistry, ThreadState) {
        let registry = support::registry().unwrap();
        let state = ThreadState::new(ThreadId::from_str("t"), &registry);
        (registry, state)
    }

    fn at_resolution(registry: &StepRegistry, state: &mut ThreadState) {
        state.facts.record("warranty_status", json!("in_warranty"));
        state.facts.record("issue_type", json!("hardware"));
        state.step = registry.step_id("resolution_specialist").unwrap();
    }

    #[test]
    fn record_writes_fact_and_advances() {
        let (registry, mut state) = setup();
        let requested = RequestedAction::new("record_warranty_status", json!({"status": "in_warranty"}));
        let transition = Transition::resolve(&registry, state.step, &requested).unwrap();
        transition.apply(&registry, &mut state).unwrap();

        assert_eq!(state.step_name(&registry), "issue_classifier");
        assert_eq!(state.facts.get_str("warranty_status"), Some("in_warranty"));
        assert_eq!(
            transition.note(&registry),
            "warranty_status recorded as: in_warranty"
        );
    }

    #[test]
    fn bare_string_input_is_accepted() {
        let (registry, state) = setup();
        let requested = RequestedAction::new("record_warranty_status", json!("out_of_warranty"));
        let transition = Transition::resolve(&registry, state.step, &requested).unwrap();
        assert!(matches!(
            transition,
            Transition::Record { ref value, .. } if value == "out_of_warranty"
        ));
    }

    #[test]
    fn rejects_value_outside_enum() {
        let (registry, state) = setup();
        let requested = RequestedAction::new("record_warranty_status", json!({"status": "maybe"}));
        let err = Transition::resolve(&registry, state.step, &requested).unwrap_err();
        assert!(matches!(err, StepwiseError::InvalidTransition(ref m) if m.contains("maybe")));
    }

    #[test]
    fn rejects_missing_or_blank_argument() {
        let (registry, state) = setup();
        for input in [json!({}), json!({"status": "  "}), json!({"status": 3}), json!(null)] {
            let requested = RequestedAction::new("record_warranty_status", input);
            assert!(matches!(
                Transition::resolve(&registry, state.step, &requested),
                Err(StepwiseError::InvalidTransition(_))
            ));
        }
    }

    #[test]
    fn rejects_action_from_another_step() {
        let (registry, state) = setup();
        let requested = RequestedAction::new("record_issue_type", json!({"issue_type": "hardware"}));
        let err = Transition::resolve(&registry, state.step, &requested).unwrap_err();
        assert!(matches!(err, StepwiseError::InvalidTransition(ref m) if m.contains("not available")));
    }

    #[test]
    fn rejects_unknown_action() {
        let (registry, state) = setup();
        let requested = RequestedAction::new("refund_everything", json!({}));
        assert!(matches!(
            Transition::resolve(&registry, state.step, &requested),
            Err(StepwiseError::InvalidTransition(_))
        ));
    }

    #[test]
    fn revert_keeps_facts() {
        let (registry, mut state) = setup();
        at_resolution(&registry, &mut state);
        let requested = RequestedAction::new(
            "go_back_to_warranty",
            json!({"reason": "customer corrected warranty status"}),
        );
        let transition = Transition::resolve(&registry, state.step, &requested).unwrap();
        transition.apply(&registry, &mut state).unwrap();

        assert_eq!(state.step_name(&registry), "warranty_collector");
        assert_eq!(state.facts.get_str("warranty_status"), Some("in_warranty"));
        assert_eq!(state.facts.get_str("issue_type"), Some("hardware"));
    }

    #[test]
    fn forward_revert_is_invalid_and_leaves_state_alone() {
        let (registry, mut state) = setup();
        let before = state.clone();
        let transition = Transition::Revert {
            action: "jump".into(),
            to: registry.step_id("resolution_specialist").unwrap(),
            reason: "skip ahead".into(),
        };
        let err = transition.apply(&registry, &mut state).unwrap_err();
        assert!(matches!(err, StepwiseError::InvalidTransition(_)));
        assert_eq!(state, before);
    }

    #[test]
    fn revert_to_current_step_is_invalid() {
        let (registry, mut state) = setup();
        let transition = Transition::Revert {
            action: "stay".into(),
            to: state.step,
            reason: "again".into(),
        };
        assert!(transition.apply(&registry, &mut state).is_err());
    }

    #[test]
    fn stale_record_is_rejected_on_apply() {
        let (registry, mut state) = setup();
        let requested = RequestedAction::new("record_warranty_status", json!({"status": "in_warranty"}));
        let transition = Transition::resolve(&registry, state.step, &requested).unwrap();
        at_resolution(&registry, &mut state);
        let before = state.clone();
        assert!(transition.apply(&registry, &mut state).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn terminal_sets_outcome_without_moving() {
        let (registry, mut state) = setup();
        at_resolution(&registry, &mut state);
        let step = state.step;
        let requested = RequestedAction::new(
            "escalate_to_human",
            json!({"reason": "out of warranty hardware repair"}),
        );
        let transition = Transition::resolve(&registry, step, &requested).unwrap();
        transition.apply(&registry, &mut state).unwrap();

        assert_eq!(state.step, step);
        assert_eq!(
            state.outcome,
            ThreadOutcome::Escalated {
                reason: "out of warranty hardware repair".into()
            }
        );
        assert_eq!(transition.action_name(), "escalate_to_human");
    }
}
