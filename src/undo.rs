use std::collections::BTreeMap;

use anyhow::Context;
use serde::Serialize;

use crate::field::{Content, FieldSpec, FieldWriter, Note, NoteId, field_key};

/// Prior values of a run's target fields, and which of them got written.
///
/// Restoring puts back only what the run actually changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UndoEntry {
    snapshot: BTreeMap<NoteId, BTreeMap<String, String>>,
    written: Vec<(NoteId, String)>,
}

impl UndoEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the current value of every field `specs` targets on `note`.
    pub fn capture(&mut self, note: &Note, specs: &[FieldSpec]) {
        let prior = self.snapshot.entry(note.id).or_default();
        for spec in specs {
            if let Some(name) = note.canonical_name(&spec.name) {
                let value = note.get(name).unwrap_or_default().to_string();
                prior.entry(name.to_string()).or_insert(value);
            }
        }
    }

    pub fn record_written(&mut self, note_id: NoteId, fields: &[String]) {
        self.written
            .extend(fields.iter().map(|f| (note_id, f.clone())));
    }

    pub fn prior_value(&self, note_id: NoteId, field: &str) -> Option<&str> {
        let fields = self.snapshot.get(&note_id)?;
        let key = field_key(field);
        fields
            .iter()
            .find(|(name, _)| field_key(name) == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn written(&self) -> &[(NoteId, String)] {
        &self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }

    /// Write the prior value of every written field back, both through
    /// `writer` and into `notes`. Returns how many fields were restored.
    pub fn restore(&self, notes: &mut [Note], writer: &dyn FieldWriter) -> anyhow::Result<usize> {
        let mut restored = 0;
        for (note_id, field) in &self.written {
            let Some(prior) = self.prior_value(*note_id, field) else {
                continue;
            };
            writer
                .set_field_value(*note_id, field, &Content::Text(prior.to_string()))
                .with_context(|| format!("restoring {note_id}:{field}"))?;
            if let Some(note) = notes.iter_mut().find(|n| n.id == *note_id) {
                note.set(field, prior);
            }
            restored += 1;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingWriter, vocab_note, vocab_specs};

    #[test]
    fn capture_keeps_first_value() {
        let mut undo = UndoEntry::new();
        let mut note = vocab_note(1, "perro");
        undo.capture(&note, &vocab_specs());
        note.set("vocab", "gato");
        undo.capture(&note, &vocab_specs());

        assert_eq!(undo.prior_value(1, "VOCAB"), Some("perro"));
        assert_eq!(undo.prior_value(1, "sentence"), Some(""));
        assert_eq!(undo.prior_value(2, "vocab"), None);
        assert!(undo.is_empty());
    }

    #[test]
    fn restore_only_touches_written_fields() {
        let mut notes = vec![vocab_note(1, "perro"), vocab_note(2, "gato")];
        let mut undo = UndoEntry::new();
        for note in &notes {
            undo.capture(note, &vocab_specs());
        }

        notes[0].set("Sentence", "El perro ladra.");
        notes[1].set("Sentence", "El gato duerme.");
        notes[1].set("Mnemonic", "gato = cat");
        undo.record_written(1, &["Sentence".into()]);
        undo.record_written(2, &["Sentence".into(), "Mnemonic".into()]);

        let writer = RecordingWriter::new();
        let restored = undo.restore(&mut notes, &writer).unwrap();

        assert_eq!(restored, 3);
        assert_eq!(notes[0].get("sentence"), Some(""));
        assert_eq!(notes[1].get("mnemonic"), Some(""));
        assert_eq!(notes[1].get("vocab"), Some("gato"));
        assert_eq!(writer.writes().len(), 3);
    }

    #[test]
    fn restore_reports_writer_errors() {
        let mut notes = vec![vocab_note(1, "perro")];
        let mut undo = UndoEntry::new();
        undo.capture(&notes[0], &vocab_specs());
        undo.record_written(1, &["Sentence".into()]);

        let writer = RecordingWriter::new().rejecting("Sentence");
        let err = undo.restore(&mut notes, &writer).unwrap_err();
        assert!(err.to_string().contains("restoring 1:Sentence"));
    }
}
