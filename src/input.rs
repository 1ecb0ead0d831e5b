//! Batch files for the CLI: note types with their smart fields, and notes.
//!
//! ```toml
//! [note_types]
//! Vocab = [
//!     { name = "Sentence", prompt = "Use {{Vocab}} in a sentence" },
//!     { name = "Audio", kind = "speech", prompt = "{{Sentence}}" },
//! ]
//!
//! [[notes]]
//! id = 1
//! note_type = "Vocab"
//! fields = { Vocab = "perro", Sentence = "", Audio = "" }
//! ```
//!
//! JSON with the same shape is accepted when the file ends in `.json`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::field::{FieldSpec, Note, PromptMap};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchFile {
    #[serde(default)]
    pub note_types: PromptMap,
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl BatchFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let file = if is_json {
            serde_json::from_str(&contents)
                .with_context(|| format!("parsing {} as JSON", path.display()))?
        } else {
            toml::from_str(&contents)
                .with_context(|| format!("parsing {} as TOML", path.display()))?
        };
        Ok(file)
    }

    pub fn specs_for(&self, note: &Note) -> Option<&[FieldSpec]> {
        self.note_types.specs_for(&note.note_type)
    }
}

/// The vocabulary card used by `smartfields demo`.
pub fn demo_batch() -> BatchFile {
    let specs = vec![
        FieldSpec::text("Vocab", "Translate {{Meaning}} into Spanish").manual(),
        FieldSpec::text("Sentence", "Write a short Spanish sentence using {{Vocab}}"),
        FieldSpec::text("Mnemonic", "Write a mnemonic to remember: {{Sentence}}"),
    ];
    let notes = [("perro", "dog"), ("gato", "cat"), ("", "bird")]
        .into_iter()
        .zip(1..)
        .map(|((vocab, meaning), id)| {
            Note::new(id, "Vocab")
                .with_field("Meaning", meaning)
                .with_field("Vocab", vocab)
                .with_field("Sentence", "")
                .with_field("Mnemonic", "")
        })
        .collect();

    BatchFile {
        note_types: PromptMap::new().with("Vocab", specs),
        notes,
    }
}
