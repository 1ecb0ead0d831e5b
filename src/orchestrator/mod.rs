//! Drives one note's dependency graph to completion.
//!
//! Layers run strictly in order. Within a layer every admitted node gets its
//! own task; tasks report over a completion channel and the orchestrator
//! applies every state transition itself, so no node is ever written by two
//! tasks.

mod context;
mod retry;

pub use context::GenerationContext;
pub use retry::{MAX_RATE_LIMIT_WAIT_MS, RetryConfig};

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchCounts;
use crate::error::{FailureKind, NodeFailure, SmartFieldsError};
use crate::events::{GenerationEvent, emit};
use crate::field::{FieldWriter, Note, NoteId, field_key};
use crate::graph::{DependencyGraph, FieldNode, NodeState, SkipReason};
use crate::prompt::interpolate;
use crate::provider::{GenerationRequest, Provider};
use retry::{Attempt, generate_with_retry};

/// Whether fields that already hold content are regenerated. Chosen by the
/// caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RegenerationPolicy {
    #[default]
    FillEmptyOnly,
    ForceAll,
}

/// Final state of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldOutcome {
    pub field: String,
    pub layer: usize,
    pub state: NodeState,
}

/// Per-field status list for one note.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NoteOutcome {
    pub note_id: NoteId,
    pub fields: Vec<FieldOutcome>,
    /// Fields the write-back collaborator accepted.
    pub written: Vec<String>,
}

impl NoteOutcome {
    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for outcome in &self.fields {
            counts.record(&outcome.state);
        }
        counts
    }

    pub fn state_of(&self, field: &str) -> Option<&NodeState> {
        let key = field_key(field);
        self.fields
            .iter()
            .find(|o| field_key(&o.field) == key)
            .map(|o| &o.state)
    }
}

enum Admission {
    Skip(SkipReason),
    Run(String),
}

pub struct Orchestrator {
    ctx: GenerationContext,
    provider: Arc<dyn Provider>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        ctx: GenerationContext,
        provider: Arc<dyn Provider>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            provider,
            cancel,
        }
    }

    /// Run every node of `graph` against `note`. Generated values are stored
    /// on `note` and handed to `writer` once their node is `Done`.
    ///
    /// Per-node failures never surface here; they end up in the outcome, and
    /// that includes a provider that panics. An error means the run itself
    /// broke (a lost task or an illegal transition).
    pub async fn run(
        &self,
        graph: &mut DependencyGraph,
        note: &mut Note,
        policy: RegenerationPolicy,
        writer: &dyn FieldWriter,
    ) -> Result<NoteOutcome, SmartFieldsError> {
        let layers = graph.layers().to_vec();
        let mut written = Vec::new();
        info!(note_id = note.id, nodes = graph.len(), layers = layers.len(), "running note");

        for (index, layer) in layers.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(note_id = note.id, layer = index, "cancelled, skipping remaining layers");
                for key in layers[index..].iter().flatten() {
                    let node = node_mut(graph, key)?;
                    if !node.state().is_terminal() {
                        self.settle(node, NodeState::Skipped(SkipReason::Cancelled))?;
                    }
                }
                break;
            }

            let (tx, mut rx) = mpsc::channel::<(String, Attempt)>(layer.len().max(1));
            let mut dispatched = 0usize;

            for key in layer {
                let admission = self.admit(graph, note, key, policy)?;
                let node = node_mut(graph, key)?;
                let prompt = match admission {
                    Admission::Skip(reason) => {
                        self.settle(node, NodeState::Skipped(reason))?;
                        continue;
                    }
                    Admission::Run(prompt) => prompt,
                };

                node.transition(NodeState::Ready)?;
                if let Err(denied) = self.ctx.gate.try_acquire(node.kind, 1) {
                    self.settle(node, NodeState::Failed(NodeFailure::CapacityExceeded(denied)))?;
                    continue;
                }
                node.transition(NodeState::Running)?;
                node.resolved_prompt = Some(prompt.clone());
                emit(
                    self.ctx.events.as_ref(),
                    GenerationEvent::NodeStarted {
                        note_id: node.id.note_id,
                        field: node.name.clone(),
                        layer: index,
                        timestamp: Utc::now(),
                    },
                );

                let request = GenerationRequest {
                    note_id: node.id.note_id,
                    field: node.name.clone(),
                    prompt,
                    kind: node.kind,
                    model: node.model.clone(),
                };
                self.spawn_node(key.clone(), request, tx.clone());
                dispatched += 1;
            }
            drop(tx);

            for _ in 0..dispatched {
                let (key, attempt) = rx.recv().await.ok_or_else(|| {
                    SmartFieldsError::TaskLost(format!("note {} layer {index}", note.id))
                })?;
                let node = node_mut(graph, &key)?;
                if let Some(field) = self.complete(node, note, attempt, writer)? {
                    written.push(field);
                }
            }
        }

        let fields = layers
            .iter()
            .enumerate()
            .flat_map(|(layer, keys)| keys.iter().map(move |k| (layer, k)))
            .filter_map(|(layer, key)| {
                graph.node(key).map(|node| FieldOutcome {
                    field: node.name.clone(),
                    layer,
                    state: node.state().clone(),
                })
            })
            .collect();

        Ok(NoteOutcome {
            note_id: note.id,
            fields,
            written,
        })
    }

    /// Skip checks, in order: upstream outcome, manual, fill policy, empty
    /// input. All of them happen before the gate is consulted.
    fn admit(
        &self,
        graph: &DependencyGraph,
        note: &Note,
        key: &str,
        policy: RegenerationPolicy,
    ) -> Result<Admission, SmartFieldsError> {
        let node = graph
            .node(key)
            .ok_or_else(|| SmartFieldsError::UnknownNode(key.to_string()))?;

        let upstream_ok = node.dependencies.iter().all(|dep| {
            graph
                .node(dep)
                .is_some_and(|d| d.state().satisfies_dependents())
        });
        if !upstream_ok {
            return Ok(Admission::Skip(SkipReason::UpstreamFailed));
        }

        let filled = note.is_filled(&node.name);
        if node.is_manual_skip() {
            let reason = if filled {
                SkipReason::AlreadyFilled
            } else {
                SkipReason::Manual
            };
            return Ok(Admission::Skip(reason));
        }
        if filled && policy == RegenerationPolicy::FillEmptyOnly && !node.is_target {
            return Ok(Admission::Skip(SkipReason::AlreadyFilled));
        }

        match interpolate(&node.template, note, self.ctx.allow_empty_fields) {
            Some(prompt) => Ok(Admission::Run(prompt)),
            None => Ok(Admission::Skip(SkipReason::EmptyInput)),
        }
    }

    fn spawn_node(
        &self,
        key: String,
        request: GenerationRequest,
        tx: mpsc::Sender<(String, Attempt)>,
    ) {
        let provider = Arc::clone(&self.provider);
        let permits = Arc::clone(&self.ctx.concurrency);
        let retry = self.ctx.retry.clone();
        let per_call = self.ctx.request_timeout;
        let cancel = self.cancel.clone();

        // The generation runs in its own task so a panic inside the provider
        // still reports back as a failure of this node.
        tokio::spawn(async move {
            let node = format!("{}:{}", request.note_id, request.field);
            let generation = tokio::spawn(async move {
                match permits.acquire_owned().await {
                    Ok(_permit) => {
                        generate_with_retry(provider.as_ref(), &request, &retry, per_call, &cancel)
                            .await
                    }
                    Err(_) => Attempt::NotAttempted,
                }
            });
            let attempt = match generation.await {
                Ok(attempt) => attempt,
                Err(err) => {
                    error!(node = %node, error = %err, "generation task died");
                    Attempt::Failed(NodeFailure::Provider {
                        kind: FailureKind::Permanent,
                        attempts: 1,
                        message: format!("generation task died: {err}"),
                    })
                }
            };
            let _ = tx.send((key, attempt)).await;
        });
    }

    /// Apply a task's result. Returns the field name when it was written back.
    fn complete(
        &self,
        node: &mut FieldNode,
        note: &mut Note,
        attempt: Attempt,
        writer: &dyn FieldWriter,
    ) -> Result<Option<String>, SmartFieldsError> {
        let content = match attempt {
            Attempt::NotAttempted => {
                self.ctx.gate.release(node.kind, 1);
                self.settle(node, NodeState::Skipped(SkipReason::Cancelled))?;
                return Ok(None);
            }
            _ if self.cancel.is_cancelled() => {
                debug!(node = %node.id, "cancelled while in flight, discarding result");
                self.settle(node, NodeState::Skipped(SkipReason::Cancelled))?;
                return Ok(None);
            }
            Attempt::Failed(failure) => {
                warn!(node = %node.id, error = %failure, "generation failed");
                self.settle(node, NodeState::Failed(failure))?;
                return Ok(None);
            }
            Attempt::Generated { content, attempts } => {
                debug!(node = %node.id, attempts, "generation succeeded");
                content
            }
        };

        self.settle(node, NodeState::Done)?;
        let rendered = content.render(note, &node.name);
        note.set(&node.name, rendered);
        let accepted = match writer.set_field_value(note.id, &node.name, &content) {
            Ok(()) => Some(node.name.clone()),
            Err(err) => {
                error!(node = %node.id, error = %err, "write-back failed");
                None
            }
        };
        node.result = Some(content);
        Ok(accepted)
    }

    /// Move `node` to a terminal state and announce it.
    fn settle(&self, node: &mut FieldNode, next: NodeState) -> Result<(), SmartFieldsError> {
        node.transition(next.clone())?;
        let note_id = node.id.note_id;
        let field = node.name.clone();
        let timestamp = Utc::now();
        let event = match next {
            NodeState::Done => GenerationEvent::NodeSucceeded {
                note_id,
                field,
                timestamp,
            },
            NodeState::Failed(error) => GenerationEvent::NodeFailed {
                note_id,
                field,
                error,
                timestamp,
            },
            NodeState::Skipped(reason) => {
                debug!(node = %node.id, %reason, "skipped");
                GenerationEvent::NodeSkipped {
                    note_id,
                    field,
                    reason,
                    timestamp,
                }
            }
            NodeState::Pending | NodeState::Ready | NodeState::Running => return Ok(()),
        };
        emit(self.ctx.events.as_ref(), event);
        Ok(())
    }
}

fn node_mut<'g>(
    graph: &'g mut DependencyGraph,
    key: &str,
) -> Result<&'g mut FieldNode, SmartFieldsError> {
    graph
        .node_mut(key)
        .ok_or_else(|| SmartFieldsError::UnknownNode(key.to_string()))
}
