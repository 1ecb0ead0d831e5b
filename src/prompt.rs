//! Prompt template analysis and interpolation.
//!
//! Templates reference other fields with `{{field name}}`. [`PromptAnalyzer`]
//! turns a template into the set of fields it depends on and rejects bad
//! references up front; [`interpolate`] substitutes the current values at run
//! time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationError;
use crate::field::{FieldKind, FieldSpec, Note, field_key};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.+?)\}\}").expect("placeholder pattern is valid"));

/// Lowercased field names referenced by a template, in order of first use.
pub fn referenced_fields(prompt: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    PLACEHOLDER
        .captures_iter(prompt)
        .map(|c| field_key(&c[1]))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Validates templates against the fields of one note.
pub struct PromptAnalyzer {
    fields: BTreeSet<String>,
    smart_kinds: BTreeMap<String, FieldKind>,
}

impl PromptAnalyzer {
    pub fn new(field_names: impl IntoIterator<Item = String>, specs: &[FieldSpec]) -> Self {
        Self {
            fields: field_names.into_iter().map(|f| field_key(&f)).collect(),
            smart_kinds: specs.iter().map(|s| (s.key(), s.kind)).collect(),
        }
    }

    pub fn for_note(note: &Note, specs: &[FieldSpec]) -> Self {
        Self::new(note.field_keys(), specs)
    }

    /// Fields `target`'s template depends on.
    ///
    /// Fails on a reference to the target itself, to a field the note doesn't
    /// have, or to a speech/image field.
    pub fn dependencies(
        &self,
        target: &str,
        prompt: &str,
    ) -> Result<BTreeSet<String>, ValidationError> {
        let target = field_key(target);
        let refs = referenced_fields(prompt);

        if refs.contains(&target) {
            return Err(ValidationError::SelfReference { field: target });
        }

        let mut deps = BTreeSet::new();
        for reference in refs {
            if !self.fields.contains(&reference) {
                return Err(ValidationError::UnknownField {
                    field: target,
                    reference,
                });
            }
            if let Some(kind) = self.smart_kinds.get(&reference)
                && !kind.is_textual()
            {
                return Err(ValidationError::NonTextReference {
                    field: target,
                    reference,
                    kind: *kind,
                });
            }
            deps.insert(reference);
        }
        Ok(deps)
    }

    /// Whether a referenced field is itself generated.
    pub fn is_smart(&self, field: &str) -> bool {
        self.smart_kinds.contains_key(&field_key(field))
    }
}

/// Substitute every placeholder with the note's current value.
///
/// Returns `None` when all referenced fields are empty, or when some are empty
/// and `allow_empty` is off. A template with no placeholders is returned as-is.
pub fn interpolate(prompt: &str, note: &Note, allow_empty: bool) -> Option<String> {
    let refs = referenced_fields(prompt);
    if refs.is_empty() {
        return Some(prompt.to_string());
    }

    let values: Vec<&str> = refs
        .iter()
        .map(|f| note.get(f).map(str::trim).unwrap_or(""))
        .collect();
    let any_filled = values.iter().any(|v| !v.is_empty());
    let all_filled = values.iter().all(|v| !v.is_empty());
    if !any_filled || !(allow_empty || all_filled) {
        return None;
    }

    let rendered = PLACEHOLDER.replace_all(prompt, |caps: &regex::Captures<'_>| {
        note.get(caps[1].trim()).unwrap_or("").to_string()
    });
    Some(rendered.into_owned())
}
