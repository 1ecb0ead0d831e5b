//! Generate flashcard note fields with AI, where a field's prompt may read
//! other generated fields.
//!
//! Each note's smart fields form a [`DependencyGraph`]. The [`Orchestrator`]
//! runs it layer by layer behind a shared [`CapacityGate`], and the
//! [`BatchCoordinator`] does that across many notes with cancellation and
//! undo.

pub mod anthropic;
pub mod batch;
pub mod capacity;
pub mod config;
pub mod error;
pub mod events;
pub mod field;
pub mod graph;
pub mod input;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod ui;
pub mod undo;

#[cfg(test)]
mod test_support;

pub use batch::{BatchCoordinator, BatchCounts, BatchJob, BatchResult, NoteResult};
pub use capacity::{CapacityGate, PlanInfo, StaticSubscription, SubscriptionSource};
pub use config::SmartFieldsConfig;
pub use error::{NodeFailure, ProviderError, SmartFieldsError, ValidationError};
pub use events::{EventReceiver, EventSender, GenerationEvent, create_event_channel};
pub use field::{Content, FieldKind, FieldSpec, FieldWriter, NoopWriter, Note, NoteId, PromptMap};
pub use graph::{DependencyGraph, FieldNode, NodeId, NodeState, SkipReason};
pub use orchestrator::{
    FieldOutcome, GenerationContext, NoteOutcome, Orchestrator, RegenerationPolicy, RetryConfig,
};
pub use provider::{AnthropicProvider, EchoProvider, GenerationRequest, Provider};
pub use undo::UndoEntry;
