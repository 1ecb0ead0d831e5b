//! Typed progress events. The orchestrator and batch coordinator send them;
//! UI code subscribes to the receiving end and renders on its own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::batch::BatchCounts;
use crate::error::NodeFailure;
use crate::field::NoteId;
use crate::graph::SkipReason;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    NodeStarted {
        note_id: NoteId,
        field: String,
        layer: usize,
        timestamp: DateTime<Utc>,
    },

    NodeSucceeded {
        note_id: NoteId,
        field: String,
        timestamp: DateTime<Utc>,
    },

    NodeFailed {
        note_id: NoteId,
        field: String,
        error: NodeFailure,
        timestamp: DateTime<Utc>,
    },

    NodeSkipped {
        note_id: NoteId,
        field: String,
        reason: SkipReason,
        timestamp: DateTime<Utc>,
    },

    /// The note's graph failed validation; none of its fields ran.
    NoteRejected {
        note_id: NoteId,
        error: String,
        timestamp: DateTime<Utc>,
    },

    BatchCompleted {
        batch_id: String,
        counts: BatchCounts,
        cancelled: bool,
        timestamp: DateTime<Utc>,
    },
}

impl GenerationEvent {
    pub fn note_id(&self) -> Option<NoteId> {
        match self {
            GenerationEvent::NodeStarted { note_id, .. }
            | GenerationEvent::NodeSucceeded { note_id, .. }
            | GenerationEvent::NodeFailed { note_id, .. }
            | GenerationEvent::NodeSkipped { note_id, .. }
            | GenerationEvent::NoteRejected { note_id, .. } => Some(*note_id),
            GenerationEvent::BatchCompleted { .. } => None,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<GenerationEvent>;

pub type EventReceiver = mpsc::UnboundedReceiver<GenerationEvent>;

pub fn create_event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Send if anyone is listening. A dropped receiver is not an error.
pub(crate) fn emit(sender: Option<&EventSender>, event: GenerationEvent) {
    if let Some(tx) = sender {
        let _ = tx.send(event);
    }
}
