//! Row-to-line translators and their registry.
//!
//! Each configured output file names a translator by identifier. The
//! registry is resolved once at startup from a tagged map, so an
//! unknown identifier fails fast instead of surfacing mid-run.
//!
//! Translators are pure: one row in, one output line out. The batch
//! form exists for translators that can amortise per-page work and
//! defaults to per-row application.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::Value;

use nightjar_core::FileId;

use crate::error::{Error, Result};
use crate::row::Row;

/// Identifier of the built-in delimited translator.
pub const DELIMITED_TRANSLATOR_ID: &str = "delimited";

/// Identifier of the built-in JSON-lines translator.
pub const JSON_LINE_TRANSLATOR_ID: &str = "json-line";

/// A pure row-to-line translator.
pub trait Translator: Send + Sync + std::fmt::Debug {
    /// Renders one row as one output line (no line terminator).
    ///
    /// # Errors
    ///
    /// Returns a translation error if the row cannot be rendered.
    fn translate(&self, file_id: &FileId, row: &Row) -> Result<String>;

    /// Renders a page of rows; defaults to per-row application.
    ///
    /// # Errors
    ///
    /// Returns the first translation error encountered.
    fn translate_page(&self, file_id: &FileId, rows: &[Row]) -> Result<Vec<String>> {
        rows.iter().map(|row| self.translate(file_id, row)).collect()
    }
}

/// Lookup from translator identifier to translator.
#[derive(Clone, Default)]
pub struct TranslatorRegistry {
    translators: HashMap<String, Arc<dyn Translator>>,
}

impl TranslatorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in translators registered:
    /// `delimited` (comma-separated) and `json-line`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DELIMITED_TRANSLATOR_ID, Arc::new(DelimitedTranslator::default()));
        registry.register(JSON_LINE_TRANSLATOR_ID, Arc::new(JsonLineTranslator));
        registry
    }

    /// Registers a translator under an identifier, replacing any
    /// previous registration.
    pub fn register(&mut self, id: impl Into<String>, translator: Arc<dyn Translator>) {
        self.translators.insert(id.into(), translator);
    }

    /// Resolves a translator identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TranslatorNotRegistered`] for unknown ids.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Translator>> {
        self.translators
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TranslatorNotRegistered {
                translator_id: id.to_string(),
            })
    }

    /// Returns the registered identifiers, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.translators.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for TranslatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatorRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

/// Delimiter-joined translator; values in column order.
///
/// SQL NULL renders as the configured null token (empty by default).
/// Non-scalar values (arrays, objects) render as compact JSON.
#[derive(Debug, Clone)]
pub struct DelimitedTranslator {
    delimiter: String,
    null_token: String,
}

impl DelimitedTranslator {
    /// Creates a translator with the given delimiter and NULL token.
    #[must_use]
    pub fn new(delimiter: impl Into<String>, null_token: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
            null_token: null_token.into(),
        }
    }

    fn render_value(&self, value: &Value) -> String {
        match value {
            Value::Null => self.null_token.clone(),
            Value::String(text) => text.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        }
    }
}

impl Default for DelimitedTranslator {
    fn default() -> Self {
        Self::new(",", "")
    }
}

impl Translator for DelimitedTranslator {
    fn translate(&self, _file_id: &FileId, row: &Row) -> Result<String> {
        let values: Vec<String> = row
            .columns
            .iter()
            .map(|column| self.render_value(&column.value))
            .collect();
        Ok(values.join(&self.delimiter))
    }
}

/// One JSON object per row, keys in column order.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineTranslator;

impl Translator for JsonLineTranslator {
    fn translate(&self, file_id: &FileId, row: &Row) -> Result<String> {
        let mut line = String::with_capacity(row.columns.len() * 16 + 2);
        line.push('{');

        for (index, column) in row.columns.iter().enumerate() {
            if index > 0 {
                line.push(',');
            }
            let key = serde_json::to_string(&column.name).map_err(|e| Error::Translation {
                file_id: file_id.clone(),
                message: format!("column name '{}': {e}", column.name),
            })?;
            let value = serde_json::to_string(&column.value).map_err(|e| Error::Translation {
                file_id: file_id.clone(),
                message: format!("column '{}': {e}", column.name),
            })?;
            let _ = write!(line, "{key}:{value}");
        }

        line.push('}');
        Ok(line)
    }
}
