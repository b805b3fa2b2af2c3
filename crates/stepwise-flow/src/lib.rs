pub mod action;
pub mod facts;
pub mod gate;
pub mod lane;
pub mod registry;
pub mod runner;
pub mod store;
pub mod support;
pub mod template;
pub mod thread;

pub use action::Transition;
pub use facts::FactStore;
pub use gate::{GatedPrompt, StepGate};
pub use lane::{LaneGuard, ThreadLanes};
pub use registry::{ActionDefinition, ActionKind, StepDefinition, StepId, StepRegistry};
pub use runner::{ConversationRunner, TurnOutcome};
pub use store::InMemoryThreadStore;
pub use template::PromptTemplate;
pub use thread::ThreadState;
