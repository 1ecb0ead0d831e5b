use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{NodeFailure, SmartFieldsError};
use crate::field::{Content, FieldKind, FieldSpec, NoteId, field_key};

/// Why a node ended without being generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Already has content and the policy only fills empty fields.
    AlreadyFilled,
    /// Manual field that wasn't requested.
    Manual,
    /// Every referenced field was empty (or some were, with empty fields disallowed).
    EmptyInput,
    /// A dependency failed or was skipped without producing content.
    UpstreamFailed,
    /// The batch was cancelled before the node ran or finished.
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyFilled => write!(f, "already filled"),
            SkipReason::Manual => write!(f, "manual"),
            SkipReason::EmptyInput => write!(f, "empty input"),
            SkipReason::UpstreamFailed => write!(f, "upstream failed"),
            SkipReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of a field node.
///
/// `Pending → Ready → Running → Done | Failed`, with `Skipped` reachable from
/// any non-terminal state. `Done`, `Failed` and `Skipped` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Done,
    Failed(NodeFailure),
    Skipped(SkipReason),
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Done | NodeState::Failed(_) | NodeState::Skipped(_)
        )
    }

    /// Whether dependents may run after this node settled.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(
            self,
            NodeState::Done | NodeState::Skipped(SkipReason::AlreadyFilled)
        )
    }

    /// Legal transitions. Capacity denial is the only failure allowed before
    /// a node is running.
    pub fn can_transition_to(&self, next: &NodeState) -> bool {
        match (self, next) {
            (NodeState::Pending, NodeState::Ready | NodeState::Skipped(_)) => true,
            (NodeState::Ready, NodeState::Running) => true,
            (NodeState::Ready, NodeState::Failed(NodeFailure::CapacityExceeded(_))) => true,
            (NodeState::Ready, NodeState::Skipped(SkipReason::Cancelled)) => true,
            (NodeState::Running, NodeState::Done | NodeState::Failed(_)) => true,
            (NodeState::Running, NodeState::Skipped(SkipReason::Cancelled)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Pending => write!(f, "PENDING"),
            NodeState::Ready => write!(f, "READY"),
            NodeState::Running => write!(f, "RUNNING"),
            NodeState::Done => write!(f, "DONE"),
            NodeState::Failed(failure) => write!(f, "FAILED ({failure})"),
            NodeState::Skipped(reason) => write!(f, "SKIPPED ({reason})"),
        }
    }
}

/// Identity of a node: one field on one note.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub note_id: NoteId,
    pub field: String,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.note_id, self.field)
    }
}

/// One field to generate on one note.
#[derive(Debug, Clone)]
pub struct FieldNode {
    pub id: NodeId,
    /// Field name as spelled on the note.
    pub name: String,
    pub kind: FieldKind,
    pub template: String,
    pub model: Option<String>,
    pub automatic: bool,
    /// Keys of the smart fields this node's prompt reads.
    pub dependencies: BTreeSet<String>,
    /// Keys of the smart fields whose prompts read this node.
    pub dependents: BTreeSet<String>,
    /// Explicitly requested; generated even when filled.
    pub is_target: bool,
    /// Ancestor of a target; generated even when manual.
    pub generate_despite_manual: bool,
    /// Prompt with placeholders substituted, set when the node starts.
    pub resolved_prompt: Option<String>,
    pub result: Option<Content>,
    state: NodeState,
}

impl FieldNode {
    pub fn new(note_id: NoteId, name: impl Into<String>, spec: &FieldSpec) -> Self {
        let name = name.into();
        Self {
            id: NodeId {
                note_id,
                field: field_key(&name),
            },
            name,
            kind: spec.kind,
            template: spec.prompt.clone(),
            model: spec.model.clone(),
            automatic: spec.automatic,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            is_target: false,
            generate_despite_manual: false,
            resolved_prompt: None,
            result: None,
            state: NodeState::Pending,
        }
    }

    pub fn key(&self) -> &str {
        &self.id.field
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// A manual field runs only when targeted or feeding a target.
    pub fn is_manual_skip(&self) -> bool {
        !self.automatic && !(self.is_target || self.generate_despite_manual)
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: NodeState) -> Result<NodeState, SmartFieldsError> {
        if !self.state.can_transition_to(&next) {
            return Err(SmartFieldsError::InvalidTransition {
                field: self.id.to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        Ok(std::mem::replace(&mut self.state, next))
    }
}
