//! Many notes, one request.
//!
//! Each note gets its own graph, so a note whose prompts don't validate is
//! reported and the rest of the batch carries on. Notes run one after the
//! other; the concurrency limit in the [`GenerationContext`] is shared by all
//! of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SmartFieldsError, ValidationError};
use crate::events::{GenerationEvent, emit};
use crate::field::{FieldWriter, Note, NoteId, PromptMap};
use crate::graph::{DependencyGraph, NodeState};
use crate::orchestrator::{GenerationContext, NoteOutcome, Orchestrator, RegenerationPolicy};
use crate::provider::Provider;
use crate::undo::UndoEntry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchCounts {
    pub fn record(&mut self, state: &NodeState) {
        match state {
            NodeState::Done => self.succeeded += 1,
            NodeState::Failed(_) => self.failed += 1,
            NodeState::Skipped(_) => self.skipped += 1,
            NodeState::Pending | NodeState::Ready | NodeState::Running => {}
        }
    }

    pub fn merge(&mut self, other: BatchCounts) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Handle on a running batch: its cancellation flag and live counters.
#[derive(Debug, Clone, Default)]
pub struct BatchJob {
    cancel: CancellationToken,
    counts: Arc<Mutex<BatchCounts>>,
}

impl BatchJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop at the next layer or note boundary. Calls in flight finish, but
    /// their results are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn counts(&self) -> BatchCounts {
        *self.counts.lock()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub counts: BatchCounts,
    pub notes: Vec<NoteOutcome>,
    /// Notes whose graph failed validation. None of their fields ran.
    pub rejected: Vec<(NoteId, ValidationError)>,
    /// Notes whose run broke partway. The rest of the batch still ran.
    pub aborted: Vec<(NoteId, String)>,
    /// Notes never reached because the batch was cancelled.
    pub unprocessed: Vec<NoteId>,
    pub cancelled: bool,
    pub undo: UndoEntry,
}

/// Outcome of a single-note request.
#[derive(Debug, Clone, Serialize)]
pub struct NoteResult {
    pub outcome: NoteOutcome,
    pub undo: UndoEntry,
}

pub struct BatchCoordinator {
    ctx: GenerationContext,
    provider: Arc<dyn Provider>,
    in_progress: AtomicBool,
}

/// Clears the in-progress flag when the request ends, however it ends.
struct RequestGuard<'a>(&'a AtomicBool);

impl<'a> RequestGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, SmartFieldsError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SmartFieldsError::RequestInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BatchCoordinator {
    pub fn new(ctx: GenerationContext, provider: Arc<dyn Provider>) -> Self {
        Self {
            ctx,
            provider,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Generate the smart fields of every note in `notes`.
    ///
    /// Validation failures, per-field failures and broken note runs are
    /// reported in the result; only a second concurrent request is an error.
    pub async fn run_batch(
        &self,
        job: &BatchJob,
        notes: &mut [Note],
        prompts: &PromptMap,
        policy: RegenerationPolicy,
        writer: &dyn FieldWriter,
    ) -> Result<BatchResult, SmartFieldsError> {
        let _guard = RequestGuard::acquire(&self.in_progress)?;
        let batch_id = Uuid::new_v4().to_string();
        info!(%batch_id, notes = notes.len(), ?policy, "starting batch");

        let mut undo = UndoEntry::new();
        for note in notes.iter() {
            if let Some(specs) = prompts.specs_for(&note.note_type) {
                undo.capture(note, specs);
            }
        }

        let orchestrator =
            Orchestrator::new(self.ctx.clone(), Arc::clone(&self.provider), job.token());
        let mut outcomes = Vec::new();
        let mut rejected = Vec::new();
        let mut aborted = Vec::new();
        let mut unprocessed = Vec::new();

        for (index, note) in notes.iter_mut().enumerate() {
            if job.is_cancelled() {
                unprocessed.push(note.id);
                continue;
            }
            let Some(specs) = prompts.specs_for(&note.note_type) else {
                debug!(note_id = note.id, note_type = %note.note_type, "no smart fields");
                continue;
            };

            let mut graph = match DependencyGraph::build(note, specs) {
                Ok(graph) => graph,
                Err(err) => {
                    warn!(note_id = note.id, error = %err, "rejecting note");
                    emit(
                        self.ctx.events.as_ref(),
                        GenerationEvent::NoteRejected {
                            note_id: note.id,
                            error: err.to_string(),
                            timestamp: Utc::now(),
                        },
                    );
                    rejected.push((note.id, err));
                    continue;
                }
            };

            debug!(note_id = note.id, index, "processing note");
            let outcome = match orchestrator.run(&mut graph, note, policy, writer).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(note_id = note.id, error = %err, "note run aborted");
                    aborted.push((note.id, err.to_string()));
                    continue;
                }
            };
            job.counts.lock().merge(outcome.counts());
            undo.record_written(note.id, &outcome.written);
            outcomes.push(outcome);
        }

        let counts = job.counts();
        let cancelled = job.is_cancelled();
        info!(
            %batch_id,
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            rejected = rejected.len(),
            aborted = aborted.len(),
            cancelled,
            "batch finished"
        );
        emit(
            self.ctx.events.as_ref(),
            GenerationEvent::BatchCompleted {
                batch_id: batch_id.clone(),
                counts,
                cancelled,
                timestamp: Utc::now(),
            },
        );

        Ok(BatchResult {
            batch_id,
            counts,
            notes: outcomes,
            rejected,
            aborted,
            unprocessed,
            cancelled,
            undo,
        })
    }

    /// Generate one note's smart fields, or just `target` and what it reads.
    pub async fn run_note(
        &self,
        note: &mut Note,
        prompts: &PromptMap,
        policy: RegenerationPolicy,
        target: Option<&str>,
        writer: &dyn FieldWriter,
    ) -> Result<NoteResult, SmartFieldsError> {
        let _guard = RequestGuard::acquire(&self.in_progress)?;
        let specs = prompts.specs_for(&note.note_type).unwrap_or_default();

        let mut graph = DependencyGraph::build(note, specs)?;
        if let Some(target) = target {
            graph = graph.trim_to_target(target)?;
        }

        let mut undo = UndoEntry::new();
        undo.capture(note, specs);

        let orchestrator = Orchestrator::new(
            self.ctx.clone(),
            Arc::clone(&self.provider),
            CancellationToken::new(),
        );
        let outcome = orchestrator.run(&mut graph, note, policy, writer).await?;
        undo.record_written(note.id, &outcome.written);
        Ok(NoteResult { outcome, undo })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capacity::CapacityGate;
    use crate::events::create_event_channel;
    use crate::field::{FieldSpec, NoopWriter};
    use crate::graph::SkipReason;
    use crate::orchestrator::RetryConfig;
    use crate::test_support::{RecordingWriter, ScriptedProvider, vocab_note, vocab_prompts};

    fn coordinator(provider: &Arc<ScriptedProvider>) -> BatchCoordinator {
        let ctx = GenerationContext::new(CapacityGate::unlimited(), 4).with_retry(RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
        });
        let provider: Arc<dyn Provider> = provider.clone();
        BatchCoordinator::new(ctx, provider)
    }

    fn two_field_prompts() -> PromptMap {
        PromptMap::new().with(
            "Basic",
            vec![
                FieldSpec::text("Example", "Example for {{Word}}"),
                FieldSpec::text("Definition", "Define {{Word}}"),
            ],
        )
    }

    fn basic_note(id: NoteId) -> Note {
        Note::new(id, "Basic")
            .with_field("Word", format!("word{id}"))
            .with_field("Example", "")
            .with_field("Definition", "")
    }

    #[tokio::test]
    async fn panicking_note_does_not_stop_the_batch() {
        let provider = Arc::new(ScriptedProvider::new().panicking_on(2));
        let mut notes: Vec<Note> = (1..=3).map(basic_note).collect();
        let job = BatchJob::new();
        let writer = RecordingWriter::new();

        let result = coordinator(&provider)
            .run_batch(
                &job,
                &mut notes,
                &two_field_prompts(),
                RegenerationPolicy::FillEmptyOnly,
                &writer,
            )
            .await
            .unwrap();

        assert_eq!(result.notes.len(), 3);
        assert!(result.aborted.is_empty());
        assert_eq!(
            result.counts,
            BatchCounts {
                succeeded: 4,
                failed: 2,
                skipped: 0,
            }
        );
        for outcome in &result.notes {
            let expected_done = outcome.note_id != 2;
            assert!(outcome.fields.iter().all(|f| {
                matches!(f.state, NodeState::Done) == expected_done
            }));
        }
        assert_eq!(result.undo.written().len(), 4);
        assert_eq!(writer.writes().len(), 4);
        assert_eq!(notes[1].get("example"), Some(""));
    }

    #[tokio::test]
    async fn three_notes_two_fields_each() {
        let provider = Arc::new(ScriptedProvider::new());
        let mut notes: Vec<Note> = (1..=3).map(basic_note).collect();
        let job = BatchJob::new();

        let result = coordinator(&provider)
            .run_batch(
                &job,
                &mut notes,
                &two_field_prompts(),
                RegenerationPolicy::FillEmptyOnly,
                &NoopWriter,
            )
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 6);
        assert_eq!(
            result.counts,
            BatchCounts {
                succeeded: 6,
                failed: 0,
                skipped: 0,
            }
        );
        assert_eq!(job.counts(), result.counts);
        assert_eq!(result.notes.len(), 3);
        assert_eq!(result.undo.written().len(), 6);
        assert!(!result.cancelled);
        assert!(result.unprocessed.is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_note_leaves_later_notes_untouched() {
        let provider = Arc::new(ScriptedProvider::new());
        let job = BatchJob::new();
        let writer = RecordingWriter::new().cancel_on(2, "Sentence", job.token());
        let mut notes: Vec<Note> = (1..=3).map(|id| vocab_note(id, "perro")).collect();

        let result = coordinator(&provider)
            .run_batch(
                &job,
                &mut notes,
                &vocab_prompts(),
                RegenerationPolicy::FillEmptyOnly,
                &writer,
            )
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.notes.len(), 2);

        let first = &result.notes[0];
        assert_eq!(first.state_of("sentence"), Some(&NodeState::Done));
        assert_eq!(first.state_of("mnemonic"), Some(&NodeState::Done));

        let second = &result.notes[1];
        assert_eq!(second.state_of("sentence"), Some(&NodeState::Done));
        assert_eq!(
            second.state_of("mnemonic"),
            Some(&NodeState::Skipped(SkipReason::Cancelled))
        );

        assert_eq!(result.unprocessed, vec![3]);
        assert_eq!(notes[2], vocab_note(3, "perro"));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn invalid_note_does_not_stop_the_batch() {
        let provider = Arc::new(ScriptedProvider::new());
        let prompts = two_field_prompts().with(
            "Looped",
            vec![
                FieldSpec::text("A", "{{B}}"),
                FieldSpec::text("B", "{{A}}"),
            ],
        );
        let looped = Note::new(2, "Looped").with_field("A", "").with_field("B", "");
        let mut notes = vec![basic_note(1), looped, basic_note(3)];
        let (tx, mut rx) = create_event_channel();
        let ctx = GenerationContext::new(CapacityGate::unlimited(), 4).with_events(tx);
        let provider_dyn: Arc<dyn Provider> = provider.clone();

        let result = BatchCoordinator::new(ctx, provider_dyn)
            .run_batch(
                &BatchJob::new(),
                &mut notes,
                &prompts,
                RegenerationPolicy::FillEmptyOnly,
                &NoopWriter,
            )
            .await
            .unwrap();

        assert_eq!(result.counts.succeeded, 4);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].0, 2);
        assert!(matches!(result.rejected[0].1, ValidationError::Cycle { .. }));
        assert_eq!(provider.call_count(), 4);

        let mut saw_rejection = false;
        let mut saw_summary = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                GenerationEvent::NoteRejected { note_id, .. } => saw_rejection = note_id == 2,
                GenerationEvent::BatchCompleted { counts, .. } => {
                    saw_summary = counts.succeeded == 4;
                }
                _ => {}
            }
        }
        assert!(saw_rejection);
        assert!(saw_summary);
    }

    #[tokio::test]
    async fn undo_restores_a_batch() {
        let provider = Arc::new(ScriptedProvider::new());
        let original: Vec<Note> = (1..=2).map(basic_note).collect();
        let mut notes = original.clone();

        let result = coordinator(&provider)
            .run_batch(
                &BatchJob::new(),
                &mut notes,
                &two_field_prompts(),
                RegenerationPolicy::FillEmptyOnly,
                &NoopWriter,
            )
            .await
            .unwrap();
        assert_ne!(notes, original);

        let restored = result.undo.restore(&mut notes, &NoopWriter).unwrap();
        assert_eq!(restored, 4);
        assert_eq!(notes, original);
    }

    #[tokio::test]
    async fn single_note_with_target() {
        let provider = Arc::new(ScriptedProvider::new());
        let mut note = vocab_note(5, "perro").with_field("Sentence", "old");

        let result = coordinator(&provider)
            .run_note(
                &mut note,
                &vocab_prompts(),
                RegenerationPolicy::FillEmptyOnly,
                Some("Sentence"),
                &NoopWriter,
            )
            .await
            .unwrap();

        assert_eq!(result.outcome.fields.len(), 2);
        assert_eq!(result.outcome.state_of("sentence"), Some(&NodeState::Done));
        assert_eq!(result.undo.prior_value(5, "sentence"), Some("old"));
        assert_eq!(provider.calls_for("Mnemonic"), 0);
    }

    #[tokio::test]
    async fn single_note_validation_error_surfaces() {
        let provider = Arc::new(ScriptedProvider::new());
        let coordinator = coordinator(&provider);
        let mut note = vocab_note(5, "perro");

        let err = coordinator
            .run_note(
                &mut note,
                &vocab_prompts(),
                RegenerationPolicy::FillEmptyOnly,
                Some("Nope"),
                &NoopWriter,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SmartFieldsError::Validation(ValidationError::UnknownTarget(_))
        ));
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn second_request_while_busy_is_refused() {
        let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(50)));
        let coordinator = coordinator(&provider);
        let mut notes: Vec<Note> = (1..=2).map(basic_note).collect();
        let mut other = basic_note(9);
        let prompts = two_field_prompts();
        let job = BatchJob::new();

        let (batch, single) = tokio::join!(
            coordinator.run_batch(
                &job,
                &mut notes,
                &prompts,
                RegenerationPolicy::FillEmptyOnly,
                &NoopWriter,
            ),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                coordinator
                    .run_note(
                        &mut other,
                        &prompts,
                        RegenerationPolicy::FillEmptyOnly,
                        None,
                        &NoopWriter,
                    )
                    .await
            }
        );

        assert!(batch.is_ok());
        assert!(matches!(single, Err(SmartFieldsError::RequestInProgress)));
        assert!(!coordinator.is_busy());
    }
}
