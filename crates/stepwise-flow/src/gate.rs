use std::sync::Arc;

use tracing::{debug, error};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::ActionSpec;

use crate::facts::FactStore;
use crate::registry::{StepId, StepRegistry};

/// What the generation call is allowed to do this turn.
#[derive(Debug, Clone, PartialEq)]
pub struct GatedPrompt {
    pub step: StepId,
    pub system_prompt: String,
    pub actions: Vec<ActionSpec>,
}

/// Sits between the runner and the generation call.
///
/// Pure and synchronous: reads the registry and a fact snapshot, never
/// writes either.
pub struct StepGate {
    registry: Arc<StepRegistry>,
}

impl StepGate {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    /// Check the step's preconditions, bind its prompt, and restrict the
    /// action set.
    pub fn prepare(&self, step: StepId, facts: &FactStore) -> Result<GatedPrompt> {
        let definition = self.registry.get(step).ok_or_else(|| {
            StepwiseError::UnknownStep(format!("step #{}", step.position()))
        })?;

        let missing = facts.missing(&definition.requires);
        if !missing.is_empty() {
            error!(
                step = %definition.name,
                missing = ?missing,
                "Step entered without its required facts"
            );
            return Err(StepwiseError::PreconditionViolation {
                step: definition.name.clone(),
                missing,
            });
        }

        let system_prompt = definition.prompt.render(&definition.name, facts)?;
        let actions = self.registry.action_specs(step);

        debug!(
            step = %definition.name,
            actions = actions.len(),
            prompt_len = system_prompt.len(),
            "Step gate passed"
        );

        Ok(GatedPrompt {
            step,
            system_prompt,
            actions,
        })
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }
}
