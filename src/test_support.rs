//! Provider and writer doubles shared by the orchestrator and batch tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::field::{Content, FieldKind, FieldSpec, FieldWriter, Note, NoteId, PromptMap};
use crate::provider::{GenerationRequest, Provider};

/// Answers `"<field>: <prompt>"` unless told otherwise for a field.
#[derive(Default)]
pub struct ScriptedProvider {
    delay: Duration,
    failing: HashMap<String, ProviderError>,
    flaky: Mutex<HashMap<String, u32>>,
    panic_on: Option<NoteId>,
    calls: Mutex<Vec<GenerationRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every call for `field` fails with `error`.
    pub fn failing(mut self, field: &str, error: ProviderError) -> Self {
        self.failing.insert(field.to_string(), error);
        self
    }

    /// The first `times` calls for `field` fail with a network error.
    pub fn flaky(self, field: &str, times: u32) -> Self {
        self.flaky
            .lock()
            .unwrap()
            .insert(field.to_string(), times);
        self
    }

    /// Every call for `note_id` panics.
    pub fn panicking_on(mut self, note_id: NoteId) -> Self {
        self.panic_on = Some(note_id);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, field: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.field == field)
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Content, ProviderError> {
        self.calls.lock().unwrap().push(request.clone());
        if self.panic_on == Some(request.note_id) {
            panic!("provider blew up on note {}", request.note_id);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.failing.get(&request.field) {
            return Err(err.clone());
        }
        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(left) = flaky.get_mut(&request.field)
                && *left > 0
            {
                *left -= 1;
                return Err(ProviderError::Network("connection reset".into()));
            }
        }

        Ok(match request.kind {
            FieldKind::Text => Content::Text(format!("{}: {}", request.field, request.prompt)),
            FieldKind::Speech => Content::Audio(vec![1, 2, 3]),
            FieldKind::Image => Content::Image(vec![4, 5, 6]),
        })
    }
}

/// Records writes; can cancel a token when a given field is written.
#[derive(Default)]
pub struct RecordingWriter {
    writes: Mutex<Vec<(NoteId, String, Content)>>,
    cancel_on: Option<(NoteId, String, CancellationToken)>,
    reject: Option<String>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_on(mut self, note_id: NoteId, field: &str, token: CancellationToken) -> Self {
        self.cancel_on = Some((note_id, field.to_string(), token));
        self
    }

    /// Writes to `field` fail.
    pub fn rejecting(mut self, field: &str) -> Self {
        self.reject = Some(field.to_string());
        self
    }

    pub fn writes(&self) -> Vec<(NoteId, String, Content)> {
        self.writes.lock().unwrap().clone()
    }
}

impl FieldWriter for RecordingWriter {
    fn set_field_value(&self, note_id: NoteId, field: &str, content: &Content) -> anyhow::Result<()> {
        if self.reject.as_deref() == Some(field) {
            anyhow::bail!("read-only field {field}");
        }
        self.writes
            .lock()
            .unwrap()
            .push((note_id, field.to_string(), content.clone()));
        if let Some((id, name, token)) = &self.cancel_on
            && *id == note_id
            && name == field
        {
            token.cancel();
        }
        Ok(())
    }
}

/// The vocab card: `Vocab` is manual input, `Sentence` uses it and
/// `Mnemonic` builds on the sentence.
pub fn vocab_specs() -> Vec<FieldSpec> {
    vec![
        FieldSpec::text("Vocab", "Translate {{Meaning}}").manual(),
        FieldSpec::text("Sentence", "Write a sentence using {{Vocab}}"),
        FieldSpec::text("Mnemonic", "Write a mnemonic for {{Sentence}}"),
    ]
}

pub fn vocab_note(id: NoteId, vocab: &str) -> Note {
    Note::new(id, "Vocab")
        .with_field("Meaning", "dog")
        .with_field("Vocab", vocab)
        .with_field("Sentence", "")
        .with_field("Mnemonic", "")
}

pub fn vocab_prompts() -> PromptMap {
    PromptMap::new().with("Vocab", vocab_specs())
}
