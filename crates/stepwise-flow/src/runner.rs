use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use stepwise_core::config::{ExtraActionPolicy, RunnerConfig};
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::EventBus;
use stepwise_core::traits::{Generator, ThreadStore};
use stepwise_core::types::*;

use crate::action::Transition;
use crate::facts::FactStore;
use crate::gate::StepGate;
use crate::lane::ThreadLanes;
use crate::registry::{StepId, StepRegistry};
use crate::thread::ThreadState;

/// What a completed turn hands back to the host.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub thread_id: ThreadId,
    pub reply: String,
    /// Step the thread is in after the turn.
    pub step: String,
    pub facts: FactStore,
    pub outcome: ThreadOutcome,
    /// The one transition applied this turn, if any.
    pub transition: Option<Transition>,
    /// Actions the generator asked for beyond the first.
    pub ignored_actions: Vec<String>,
}

/// The conversation runner: owns per-thread state and sequences turns.
///
/// Each turn works on a private copy of the stored thread and writes it back
/// only after generation succeeded and the transition applied cleanly. A
/// failed, timed-out, or dropped turn therefore leaves the store as it was.
pub struct ConversationRunner {
    registry: Arc<StepRegistry>,
    gate: StepGate,
    generator: Arc<dyn Generator>,
    store: Arc<dyn ThreadStore>,
    event_bus: Arc<EventBus>,
    lanes: ThreadLanes,
    config: RunnerConfig,
}

impl ConversationRunner {
    pub fn new(
        registry: Arc<StepRegistry>,
        generator: Arc<dyn Generator>,
        store: Arc<dyn ThreadStore>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            gate: StepGate::new(registry.clone()),
            registry,
            generator,
            store,
            event_bus: Arc::new(EventBus::default()),
            lanes: ThreadLanes::new(),
            config,
        }
    }

    /// Share an existing event bus instead of the runner's own.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Return the thread, creating and persisting a fresh one at the initial
    /// step if it does not exist yet. Never resets an existing thread.
    pub async fn get_or_create_thread(&self, thread_id: &ThreadId) -> Result<ThreadState> {
        let _lane = self.lanes.acquire(thread_id, self.config.busy_policy).await?;
        if let Some(state) = self.load(thread_id).await? {
            return Ok(state);
        }
        let state = ThreadState::new(thread_id.clone(), &self.registry);
        self.store.save(&state.to_snapshot(&self.registry)).await?;
        info!(thread = %thread_id, step = %state.step_name(&self.registry), "Thread created");
        Ok(state)
    }

    /// Handle one inbound message on a thread.
    pub async fn handle_turn(&self, thread_id: &ThreadId, message: &str) -> Result<TurnOutcome> {
        let _lane = self.lanes.acquire(thread_id, self.config.busy_policy).await?;

        let result = self.run_turn(thread_id, message).await;
        if let Err(e) = &result {
            match e {
                StepwiseError::PreconditionViolation { .. } | StepwiseError::TemplateBinding { .. } => {
                    error!(thread = %thread_id, error = %e, "Turn failed on a flow configuration error");
                }
                _ => warn!(thread = %thread_id, error = %e, "Turn failed; thread unchanged"),
            }
            self.event_bus.publish(FlowEvent::TurnFailed {
                thread_id: thread_id.clone(),
                error: e.to_string(),
            });
        }
        result
    }

    async fn run_turn(&self, thread_id: &ThreadId, message: &str) -> Result<TurnOutcome> {
        let mut state = match self.load(thread_id).await? {
            Some(state) => state,
            None => ThreadState::new(thread_id.clone(), &self.registry),
        };
        let from = state.step;

        let gated = self.gate.prepare(state.step, &state.facts)?;
        self.event_bus.publish(FlowEvent::TurnStarted {
            thread_id: thread_id.clone(),
            step: state.step_name(&self.registry).to_string(),
        });

        let inbound = ChatMessage::user(message);
        let mut history = self.windowed_history(&state.history);
        history.push(inbound.clone());
        let request = GenerationRequest {
            system_prompt: gated.system_prompt,
            actions: gated.actions,
            history,
        };

        let timeout_secs = self.config.generation_timeout_secs;
        debug!(thread = %thread_id, step = %state.step_name(&self.registry), "Calling generator");
        let generation = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.generator.generate(request),
        )
        .await
        .map_err(|_| StepwiseError::GenerationTimeout(timeout_secs))??;

        let (transition, ignored_actions) = self.select_transition(&state, &generation)?;

        state.history.push(inbound);
        let mut reply = generation.reply;
        if let Some(transition) = &transition {
            transition.apply(&self.registry, &mut state)?;
            let note = transition.note(&self.registry);
            if reply.trim().is_empty() {
                reply = note.clone();
            }
            state
                .history
                .push(ChatMessage::tool(transition.action_name(), note));
        }
        state.history.push(ChatMessage::assistant(reply.clone()));

        // Holds after every turn, reverts included.
        let missing = state.facts.missing(&self.registry.step(state.step).requires);
        if !missing.is_empty() {
            return Err(StepwiseError::PreconditionViolation {
                step: state.step_name(&self.registry).to_string(),
                missing,
            });
        }

        state.updated_at = Utc::now();
        self.store.save(&state.to_snapshot(&self.registry)).await?;

        self.publish_applied(&state, from, transition.as_ref(), &ignored_actions);
        info!(
            thread = %thread_id,
            step = %state.step_name(&self.registry),
            transition = transition.as_ref().map(|t| t.action_name()).unwrap_or("none"),
            "Turn complete"
        );

        Ok(TurnOutcome {
            thread_id: thread_id.clone(),
            reply,
            step: state.step_name(&self.registry).to_string(),
            facts: state.facts,
            outcome: state.outcome,
            transition,
            ignored_actions,
        })
    }

    /// Pick the single transition for this turn. Only the first requested
    /// action is considered; the rest are dropped or fail the turn.
    fn select_transition(
        &self,
        state: &ThreadState,
        generation: &Generation,
    ) -> Result<(Option<Transition>, Vec<String>)> {
        let Some((first, rest)) = generation.actions.split_first() else {
            return Ok((None, Vec::new()));
        };

        let ignored: Vec<String> = rest.iter().map(|a| a.name.clone()).collect();
        if !ignored.is_empty() && self.config.extra_actions == ExtraActionPolicy::Reject {
            return Err(StepwiseError::InvalidTransition(format!(
                "generator requested {} actions in one turn; only one is allowed",
                generation.actions.len()
            )));
        }

        let transition = Transition::resolve(&self.registry, state.step, first)?;
        Ok((Some(transition), ignored))
    }

    fn publish_applied(
        &self,
        state: &ThreadState,
        from: StepId,
        transition: Option<&Transition>,
        ignored: &[String],
    ) {
        let thread_id = &state.thread_id;
        for action in ignored {
            warn!(thread = %thread_id, action = %action, "Extra action ignored; one transition per turn");
            self.event_bus.publish(FlowEvent::ActionIgnored {
                thread_id: thread_id.clone(),
                action: action.clone(),
            });
        }

        match transition {
            Some(Transition::Record { fact, value, .. }) => {
                self.event_bus.publish(FlowEvent::FactRecorded {
                    thread_id: thread_id.clone(),
                    fact: fact.clone(),
                    value: value.clone(),
                });
            }
            Some(Transition::Terminal { .. }) => {
                info!(thread = %thread_id, outcome = %state.outcome, "Thread outcome set");
                self.event_bus.publish(FlowEvent::Terminal {
                    thread_id: thread_id.clone(),
                    outcome: state.outcome.clone(),
                });
            }
            _ => {}
        }

        if state.step != from {
            let reason = match transition {
                Some(Transition::Revert { reason, .. }) => Some(reason.clone()),
                _ => None,
            };
            info!(
                thread = %thread_id,
                from = %self.registry.step_name(from),
                to = %state.step_name(&self.registry),
                "Step changed"
            );
            self.event_bus.publish(FlowEvent::StepChanged {
                thread_id: thread_id.clone(),
                from: self.registry.step_name(from).to_string(),
                to: state.step_name(&self.registry).to_string(),
                reason,
            });
        }

        self.event_bus.publish(FlowEvent::TurnCompleted {
            thread_id: thread_id.clone(),
            step: state.step_name(&self.registry).to_string(),
        });
    }

    /// Discard a thread entirely. The next access starts fresh.
    pub async fn reset_thread(&self, thread_id: &ThreadId) -> Result<()> {
        let _lane = self.lanes.acquire(thread_id, self.config.busy_policy).await?;
        self.store.delete(thread_id).await?;
        info!(thread = %thread_id, "Thread reset");
        self.event_bus.publish(FlowEvent::ThreadReset {
            thread_id: thread_id.clone(),
        });
        Ok(())
    }

    /// Stored state of a thread, for diagnostics. Does not create it.
    pub async fn snapshot(&self, thread_id: &ThreadId) -> Result<Option<ThreadSnapshot>> {
        self.store.load(thread_id).await
    }

    pub async fn threads(&self) -> Result<Vec<ThreadId>> {
        self.store.list().await
    }

    async fn load(&self, thread_id: &ThreadId) -> Result<Option<ThreadState>> {
        match self.store.load(thread_id).await? {
            Some(snapshot) => Ok(Some(ThreadState::from_snapshot(snapshot, &self.registry)?)),
            None => Ok(None),
        }
    }

    fn windowed_history(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        match self.config.history_limit {
            Some(limit) if history.len() > limit => history[history.len() - limit..].to_vec(),
            _ => history.to_vec(),
        }
    }
}
