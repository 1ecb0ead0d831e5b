//! Notes, smart field specifications and generated content.
//!
//! Field names are matched case-insensitively everywhere: a prompt may say
//! `{{Front}}` for a note field called `front`. Lookups go through [`Note::get`]
//! and [`Note::canonical_name`] so the note keeps its own capitalization.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type NoteId = u64;

/// Normalized form of a field name: trimmed and Unicode-lowercased. Every
/// case-insensitive comparison of field names goes through this.
pub fn field_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// What a smart field generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Speech,
    Image,
}

impl FieldKind {
    /// File extension for media written by this kind, `None` for text.
    pub fn media_extension(&self) -> Option<&'static str> {
        match self {
            FieldKind::Text => None,
            FieldKind::Speech => Some("mp3"),
            FieldKind::Image => Some("webp"),
        }
    }

    /// Whether the field's value can be interpolated into another prompt.
    pub fn is_textual(&self) -> bool {
        matches!(self, FieldKind::Text)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Text => write!(f, "text"),
            FieldKind::Speech => write!(f, "speech"),
            FieldKind::Image => write!(f, "image"),
        }
    }
}

fn default_automatic() -> bool {
    true
}

/// Configuration of one smart field: which field, what kind, and the prompt
/// template that produces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    pub prompt: String,
    /// Generate whenever the note is processed. Manual fields only run when
    /// explicitly targeted.
    #[serde(default = "default_automatic")]
    pub automatic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            prompt: prompt.into(),
            automatic: true,
            model: None,
        }
    }

    pub fn text(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text, prompt)
    }

    pub fn manual(mut self) -> Self {
        self.automatic = false;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Lowercased field name used as the graph key.
    pub fn key(&self) -> String {
        field_key(&self.name)
    }
}

/// Smart field specifications per note type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptMap(BTreeMap<String, Vec<FieldSpec>>);

impl PromptMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, note_type: impl Into<String>, specs: Vec<FieldSpec>) {
        self.0.insert(note_type.into(), specs);
    }

    pub fn with(mut self, note_type: impl Into<String>, specs: Vec<FieldSpec>) -> Self {
        self.insert(note_type, specs);
        self
    }

    /// Specs for a note type, or `None` when it has no smart fields.
    pub fn specs_for(&self, note_type: &str) -> Option<&[FieldSpec]> {
        self.0
            .get(note_type)
            .map(Vec::as_slice)
            .filter(|specs| !specs.is_empty())
    }

    pub fn note_types(&self) -> impl Iterator<Item = (&String, &Vec<FieldSpec>)> {
        self.0.iter()
    }
}

/// A flashcard note: an id, its type and its field values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub note_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Note {
    pub fn new(id: NoteId, note_type: impl Into<String>) -> Self {
        Self {
            id,
            note_type: note_type.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// The note's own spelling of a field name.
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        let key = field_key(name);
        self.fields
            .keys()
            .find(|k| field_key(k) == key)
            .map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let key = self.canonical_name(name)?;
        self.fields.get(key).map(String::as_str)
    }

    /// True when the field exists and holds something other than whitespace.
    pub fn is_filled(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| !v.trim().is_empty())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let key = self
            .canonical_name(name)
            .map(str::to_string)
            .unwrap_or_else(|| name.to_string());
        self.fields.insert(key, value.into());
    }

    /// Lowercased names of every field on the note.
    pub fn field_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.fields.keys().map(|k| field_key(k))
    }
}

/// Generated value for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Audio(Vec<u8>),
    Image(Vec<u8>),
}

impl Content {
    pub fn kind(&self) -> FieldKind {
        match self {
            Content::Text(_) => FieldKind::Text,
            Content::Audio(_) => FieldKind::Speech,
            Content::Image(_) => FieldKind::Image,
        }
    }

    /// The string stored in the note field. Media is referenced by file name;
    /// writing the bytes is up to the [`FieldWriter`].
    pub fn render(&self, note: &Note, field: &str) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Audio(_) => format!(
                "[sound:{}]",
                media_file_name(note, field, FieldKind::Speech)
            ),
            Content::Image(_) => format!(
                "<img src=\"{}\"/>",
                media_file_name(note, field, FieldKind::Image)
            ),
        }
    }
}

/// `<note type>-<field>-<note id>.<ext>`
pub fn media_file_name(note: &Note, field: &str, kind: FieldKind) -> String {
    let ext = kind.media_extension().unwrap_or("txt");
    format!(
        "{}-{}-{}.{ext}",
        note.note_type,
        field_key(field),
        note.id
    )
}

/// Write-back collaborator. Called once per field, after its node is `Done`.
pub trait FieldWriter: Send + Sync {
    fn set_field_value(&self, note_id: NoteId, field: &str, content: &Content) -> anyhow::Result<()>;
}

/// Writer for callers that only need the in-memory notes updated.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWriter;

impl FieldWriter for NoopWriter {
    fn set_field_value(&self, _note_id: NoteId, _field: &str, _content: &Content) -> anyhow::Result<()> {
        Ok(())
    }
}
