use chrono::{DateTime, Utc};

use stepwise_core::error::Result;
use stepwise_core::types::{ChatMessage, ThreadId, ThreadOutcome, ThreadSnapshot};

use crate::facts::FactStore;
use crate::registry::{StepId, StepRegistry};

/// Live state of one conversation thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadState {
    pub thread_id: ThreadId,
    pub step: StepId,
    pub facts: FactStore,
    pub history: Vec<ChatMessage>,
    pub outcome: ThreadOutcome,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadState {
    /// Fresh thread at the registry's initial step with no facts.
    pub fn new(thread_id: ThreadId, registry: &StepRegistry) -> Self {
        let now = Utc::now();
        Self {
            thread_id,
            step: registry.initial(),
            facts: FactStore::new(),
            history: Vec::new(),
            outcome: ThreadOutcome::Open,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rehydrate a stored thread, resolving its step name against `registry`.
    pub fn from_snapshot(snapshot: ThreadSnapshot, registry: &StepRegistry) -> Result<Self> {
        let step = registry.step_id(&snapshot.step)?;
        Ok(Self {
            thread_id: snapshot.thread_id,
            step,
            facts: FactStore::from_map(snapshot.facts),
            history: snapshot.history,
            outcome: snapshot.outcome,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        })
    }

    pub fn to_snapshot(&self, registry: &StepRegistry) -> ThreadSnapshot {
        ThreadSnapshot {
            thread_id: self.thread_id.clone(),
            step: registry.step_name(self.step).to_string(),
            facts: self.facts.as_map().clone(),
            history: self.history.clone(),
            outcome: self.outcome.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn step_name<'a>(&self, registry: &'a StepRegistry) -> &'a str {
        registry.step_name(self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support;
    use stepwise_core::error::StepwiseError;

    #[test]
    fn snapshot_keeps_step_by_name() {
        let registry = support::registry().unwrap();
        let mut state = ThreadState::new(ThreadId::from_str("t-1"), &registry);
        state.step = registry.step_id("issue_classifier").unwrap();
        state.facts.record("warranty_status", serde_json::json!("in_warranty"));

        let snap = state.to_snapshot(&registry);
        assert_eq!(snap.step, "issue_classifier");
        assert_eq!(snap.facts["warranty_status"], "in_warranty");

        let back = ThreadState::from_snapshot(snap, &registry).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn unknown_step_in_snapshot_is_rejected() {
        let registry = support::registry().unwrap();
        let mut snap = ThreadState::new(ThreadId::new(), &registry).to_snapshot(&registry);
        snap.step = "billing".into();
        assert!(matches!(
            ThreadState::from_snapshot(snap, &registry),
            Err(StepwiseError::UnknownStep(name)) if name == "billing"
        ));
    }
}
