use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique conversation thread identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Confirmation of an applied transition action.
    Tool,
}

/// A single entry in a thread's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    /// Name of the action that produced this entry (tool messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            action: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            action: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn tool(action: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            text: text.into(),
            action: Some(action.into()),
            timestamp: Some(Utc::now()),
        }
    }
}

/// An action the generation call may request this turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// An action invocation returned by the generation call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestedAction {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl RequestedAction {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

/// Everything the generation call gets to see for one turn.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub actions: Vec<ActionSpec>,
    /// Prior history followed by the inbound message.
    pub history: Vec<ChatMessage>,
}

/// The generation call's answer: reply text plus any requested actions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub reply: String,
    pub actions: Vec<RequestedAction>,
}

impl Generation {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: text.into(),
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, name: impl Into<String>, input: serde_json::Value) -> Self {
        self.actions.push(RequestedAction::new(name, input));
        self
    }
}

/// Kind of terminal action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    Escalate,
    Resolved,
}

impl std::fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Escalate => write!(f, "escalate"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// Outcome signalled by terminal actions. Does not close the thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ThreadOutcome {
    #[default]
    Open,
    Escalated { reason: String },
    Resolved { summary: String },
}

impl ThreadOutcome {
    pub fn from_terminal(kind: TerminalKind, payload: impl Into<String>) -> Self {
        match kind {
            TerminalKind::Escalate => Self::Escalated {
                reason: payload.into(),
            },
            TerminalKind::Resolved => Self::Resolved {
                summary: payload.into(),
            },
        }
    }
}

impl std::fmt::Display for ThreadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Escalated { reason } => write!(f, "escalated ({})", reason),
            Self::Resolved { summary } => write!(f, "resolved ({})", summary),
        }
    }
}

/// Persistable, registry-independent form of a thread. The step is kept by
/// name so snapshots survive registry rebuilds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadSnapshot {
    pub thread_id: ThreadId,
    pub step: String,
    #[serde(default)]
    pub facts: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub outcome: ThreadOutcome,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Flow event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A turn passed the step gate and is waiting on generation.
    TurnStarted { thread_id: ThreadId, step: String },
    /// The thread moved to another step.
    StepChanged {
        thread_id: ThreadId,
        from: String,
        to: String,
        reason: Option<String>,
    },
    /// A fact was written.
    FactRecorded {
        thread_id: ThreadId,
        fact: String,
        value: serde_json::Value,
    },
    /// A terminal action set the thread outcome.
    Terminal {
        thread_id: ThreadId,
        outcome: ThreadOutcome,
    },
    /// An extra action in the same turn was dropped.
    ActionIgnored { thread_id: ThreadId, action: String },
    /// Turn finished and state was persisted.
    TurnCompleted { thread_id: ThreadId, step: String },
    /// Turn failed; thread state is unchanged.
    TurnFailed { thread_id: ThreadId, error: String },
    /// Thread state was discarded.
    ThreadReset { thread_id: ThreadId },
}
