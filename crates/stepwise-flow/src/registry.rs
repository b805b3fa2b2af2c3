//! The static table of steps, prompts, and actions.
//!
//! Steps are resolved from names exactly once, when the registry is built.
//! The table is ordered along the forward chain (`initial`, its `next`, and
//! so on), so a `StepId` doubles as the step's position in the nominal
//! forward ordering.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::{debug, warn};

use stepwise_core::config::{ActionConfig, ActionKindConfig, FlowConfig, StepConfig};
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::{ActionSpec, TerminalKind};

use crate::template::PromptTemplate;

/// Index of a step in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(usize);

impl StepId {
    /// Position in the forward chain (0 = initial step).
    pub fn position(self) -> usize {
        self.0
    }
}

/// What an action does when the runner applies it.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    /// Write `fact` and advance to the owning step's successor.
    Record { fact: String, values: Vec<String> },
    /// Go back to an earlier step without touching facts.
    Revert { target: StepId },
    /// Signal an outcome; the step does not change.
    Terminal { outcome: TerminalKind },
}

#[derive(Debug, Clone)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    /// Name of the single string argument the generator supplies.
    pub param: String,
    pub kind: ActionKind,
    /// The one step this action is listed under.
    pub owner: StepId,
}

impl ActionDefinition {
    /// Tool description handed to the generation call.
    pub fn spec(&self) -> ActionSpec {
        let mut property = serde_json::json!({ "type": "string" });
        if let ActionKind::Record { values, .. } = &self.kind {
            if !values.is_empty() {
                property["enum"] = serde_json::json!(values);
            }
        }
        let mut properties = serde_json::Map::new();
        properties.insert(self.param.clone(), property);

        ActionSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": [self.param],
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub id: StepId,
    pub name: String,
    pub prompt: PromptTemplate,
    /// Facts that must be recorded before this step's prompt can render.
    pub requires: Vec<String>,
    /// Successor reached by this step's record actions.
    pub next: Option<StepId>,
    actions: Vec<usize>,
}

/// Immutable step table shared by the gate and the runner.
#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: Vec<StepDefinition>,
    actions: Vec<ActionDefinition>,
    step_index: HashMap<String, StepId>,
    action_index: HashMap<String, usize>,
}

struct NameRules {
    identifier: Regex,
    action: Regex,
}

impl NameRules {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| StepwiseError::Registry(e.to_string()))
        };
        Ok(Self {
            identifier: compile(r"^[A-Za-z_][A-Za-z0-9_]*$")?,
            // OpenAI-compatible function names
            action: compile(r"^[A-Za-z0-9_-]{1,64}$")?,
        })
    }
}

impl StepRegistry {
    /// Build and validate a registry from its TOML description.
    pub fn from_config(flow: &FlowConfig) -> Result<Self> {
        let rules = NameRules::new()?;

        let mut by_name: HashMap<&str, &StepConfig> = HashMap::new();
        for step in &flow.steps {
            if !rules.identifier.is_match(&step.name) {
                return Err(StepwiseError::Registry(format!(
                    "invalid step name '{}'",
                    step.name
                )));
            }
            if by_name.insert(step.name.as_str(), step).is_some() {
                return Err(StepwiseError::Registry(format!(
                    "duplicate step '{}'",
                    step.name
                )));
            }
        }

        // Walk the forward chain from the initial step.
        let mut chain: Vec<&StepConfig> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut cursor = Some(flow.initial.as_str());
        while let Some(name) = cursor {
            let step: &StepConfig = by_name.get(name).copied().ok_or_else(|| {
                StepwiseError::Registry(match chain.last() {
                    Some(prev) => format!("step '{}' has unknown next step '{}'", prev.name, name),
                    None => format!("unknown initial step '{}'", name),
                })
            })?;
            if !seen.insert(name) {
                return Err(StepwiseError::Registry(format!(
                    "forward chain loops back to step '{}'",
                    name
                )));
            }
            chain.push(step);
            cursor = step.next.as_deref();
        }

        if chain.len() != flow.steps.len() {
            let unreachable: Vec<&str> = flow
                .steps
                .iter()
                .map(|s| s.name.as_str())
                .filter(|n| !seen.contains(n))
                .collect();
            return Err(StepwiseError::Registry(format!(
                "step(s) not reachable from '{}': {}",
                flow.initial,
                unreachable.join(", ")
            )));
        }

        let step_index: HashMap<String, StepId> = chain
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), StepId(i)))
            .collect();

        let mut steps = Vec::with_capacity(chain.len());
        let mut actions = Vec::new();
        let mut action_index = HashMap::new();
        // Facts each earlier step can record, by position. One pass through a
        // step writes exactly one of them.
        let mut recorders: Vec<Vec<String>> = Vec::with_capacity(chain.len());

        for (position, config) in chain.iter().enumerate() {
            let id = StepId(position);
            let next = config.next.as_ref().map(|n| step_index[n.as_str()]);

            for fact in &config.requires {
                if !recorders.iter().any(|facts| facts.contains(fact)) {
                    return Err(StepwiseError::Registry(format!(
                        "step '{}' requires '{}', which no earlier step records",
                        config.name, fact
                    )));
                }
            }
            if !forward_path_records(&config.requires, &recorders) {
                return Err(StepwiseError::Registry(format!(
                    "step '{}' requires {}, but no forward path records them all \
                     (each step records one fact before advancing)",
                    config.name,
                    config.requires.join(", ")
                )));
            }

            let prompt = PromptTemplate::parse(&config.prompt).map_err(|e| match e {
                StepwiseError::Registry(msg) => {
                    StepwiseError::Registry(format!("step '{}': {}", config.name, msg))
                }
                other => other,
            })?;
            for placeholder in prompt.placeholders() {
                if !config.requires.iter().any(|r| r == placeholder) {
                    warn!(
                        step = %config.name,
                        fact = placeholder,
                        "Prompt references a fact the step does not require; rendering will fail until it is recorded"
                    );
                }
            }

            let mut step_actions = Vec::with_capacity(config.actions.len());
            let mut records_here = Vec::new();
            for action in &config.actions {
                if !rules.action.is_match(&action.name) {
                    return Err(StepwiseError::Registry(format!(
                        "invalid action name '{}'",
                        action.name
                    )));
                }
                if action_index.contains_key(&action.name) {
                    return Err(StepwiseError::Registry(format!(
                        "action '{}' is listed under more than one step",
                        action.name
                    )));
                }
                let definition = build_action(action, config, id, next, &step_index, &rules)?;
                if let ActionKind::Record { fact, .. } = &definition.kind {
                    records_here.push(fact.clone());
                }
                action_index.insert(definition.name.clone(), actions.len());
                step_actions.push(actions.len());
                actions.push(definition);
            }
            recorders.push(records_here);

            steps.push(StepDefinition {
                id,
                name: config.name.clone(),
                prompt,
                requires: config.requires.clone(),
                next,
                actions: step_actions,
            });
        }

        debug!(
            steps = steps.len(),
            actions = actions.len(),
            initial = %flow.initial,
            "Step registry built"
        );

        Ok(Self {
            steps,
            actions,
            step_index,
            action_index,
        })
    }

    /// The step every new thread starts in.
    pub fn initial(&self) -> StepId {
        StepId(0)
    }

    pub fn step(&self, id: StepId) -> &StepDefinition {
        &self.steps[id.0]
    }

    /// Look up a step id, or `None` if it does not belong to this registry.
    pub fn get(&self, id: StepId) -> Option<&StepDefinition> {
        self.steps.get(id.0)
    }

    pub fn step_id(&self, name: &str) -> Result<StepId> {
        self.step_index
            .get(name)
            .copied()
            .ok_or_else(|| StepwiseError::UnknownStep(name.to_string()))
    }

    pub fn step_name(&self, id: StepId) -> &str {
        &self.steps[id.0].name
    }

    pub fn action(&self, name: &str) -> Option<&ActionDefinition> {
        self.action_index.get(name).map(|&i| &self.actions[i])
    }

    /// Actions permitted while in `id`, in declaration order.
    pub fn actions_for(&self, id: StepId) -> impl Iterator<Item = &ActionDefinition> {
        self.steps[id.0].actions.iter().map(|&i| &self.actions[i])
    }

    pub fn action_specs(&self, id: StepId) -> Vec<ActionSpec> {
        self.actions_for(id).map(|a| a.spec()).collect()
    }

    pub fn is_allowed(&self, id: StepId, action: &str) -> bool {
        self.action(action).is_some_and(|a| a.owner == id)
    }

    /// Whether `a` comes before `b` in the forward ordering.
    pub fn is_earlier(&self, a: StepId, b: StepId) -> bool {
        a.0 < b.0
    }

    /// Steps in forward order.
    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Whether one fact per earlier step can cover every required fact.
///
/// A bipartite matching of required facts onto the steps able to record them,
/// found with augmenting paths.
fn forward_path_records(required: &[String], recorders: &[Vec<String>]) -> bool {
    fn assign(
        fact: &str,
        recorders: &[Vec<String>],
        owner: &mut [Option<usize>],
        visited: &mut [bool],
        required: &[String],
    ) -> bool {
        for (step, facts) in recorders.iter().enumerate() {
            if visited[step] || !facts.iter().any(|f| f == fact) {
                continue;
            }
            visited[step] = true;
            let free = match owner[step] {
                None => true,
                Some(other) => assign(&required[other], recorders, owner, visited, required),
            };
            if free {
                if let Some(index) = required.iter().position(|r| r == fact) {
                    owner[step] = Some(index);
                }
                return true;
            }
        }
        false
    }

    let mut owner: Vec<Option<usize>> = vec![None; recorders.len()];
    let mut wanted: Vec<&String> = Vec::new();
    for fact in required {
        if !wanted.contains(&fact) {
            wanted.push(fact);
        }
    }
    wanted.into_iter().all(|fact| {
        let mut visited = vec![false; recorders.len()];
        assign(fact, recorders, &mut owner, &mut visited, required)
    })
}

fn build_action(
    action: &ActionConfig,
    step: &StepConfig,
    owner: StepId,
    next: Option<StepId>,
    step_index: &HashMap<String, StepId>,
    rules: &NameRules,
) -> Result<ActionDefinition> {
    let invalid = |msg: String| {
        StepwiseError::Registry(format!("action '{}' in step '{}': {}", action.name, step.name, msg))
    };

    let (kind, default_param, default_description) = match action.kind {
        ActionKindConfig::Record => {
            let fact = action
                .fact
                .clone()
                .ok_or_else(|| invalid("record actions need a `fact`".into()))?;
            if !rules.identifier.is_match(&fact) {
                return Err(invalid(format!("invalid fact name '{}'", fact)));
            }
            if next.is_none() {
                return Err(invalid(
                    "record actions need the step to declare a `next` step".into(),
                ));
            }
            let description = format!("Record {} and move to the next step.", fact);
            (
                ActionKind::Record {
                    fact: fact.clone(),
                    values: action.values.clone(),
                },
                fact,
                description,
            )
        }
        ActionKindConfig::Revert => {
            let target_name = action
                .target
                .as_deref()
                .ok_or_else(|| invalid("revert actions need a `target`".into()))?;
            let target = *step_index
                .get(target_name)
                .ok_or_else(|| invalid(format!("unknown target step '{}'", target_name)))?;
            if target >= owner {
                return Err(invalid(format!(
                    "target '{}' is not earlier than '{}'",
                    target_name, step.name
                )));
            }
            (
                ActionKind::Revert { target },
                "reason".to_string(),
                format!("Go back to the {} step.", target_name),
            )
        }
        ActionKindConfig::Terminal => {
            let outcome = action
                .outcome
                .ok_or_else(|| invalid("terminal actions need an `outcome`".into()))?;
            let description = match outcome {
                TerminalKind::Escalate => "Escalate the conversation to a human.".to_string(),
                TerminalKind::Resolved => "Mark the conversation as resolved.".to_string(),
            };
            (ActionKind::Terminal { outcome }, "reason".to_string(), description)
        }
    };

    let param = action.param.clone().unwrap_or(default_param);
    if !rules.identifier.is_match(&param) {
        return Err(invalid(format!("invalid parameter name '{}'", param)));
    }

    Ok(ActionDefinition {
        name: action.name.clone(),
        description: if action.description.is_empty() {
            default_description
        } else {
            action.description.clone()
        },
        param,
        kind,
        owner,
    })
}
