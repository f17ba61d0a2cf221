//! Core domain model for FSX: per-page row tables, consolidated indexes, taxonomy
//! resolutions and the edit audit overlay.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fsx-core";

/// Year columns assumed when an extraction payload declares none (or garbage).
pub const DEFAULT_YEARS: [&str; 2] = ["2024", "2023"];

/// Snapshot keys used by the audit overlay for the non-year row fields.
pub const NOTE_FIELD: &str = "nota";
pub const CONFIDENCE_FIELD: &str = "confidence_score";

/// Clamp a confidence into `[0, 1]`; NaN collapses to `0.0`.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// True for a four digit year key such as `"2024"`.
pub fn is_year_key(key: &str) -> bool {
    key.len() == 4 && key.chars().all(|c| c.is_ascii_digit())
}

pub fn default_years() -> Vec<String> {
    DEFAULT_YEARS.iter().map(|y| y.to_string()).collect()
}

/// One line item of a statement page.
///
/// Serialized in the page JSON shape shared with the extraction service: year values are
/// flattened next to the named keys, so a record reads
/// `{"Experian Value": "Revenue", "2024": "1.000", "nota": "", "confidence_score": 0.9}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RowRecord {
    #[serde(rename = "Experian Value", default)]
    pub translated_label: String,
    #[serde(rename = "nota", default)]
    pub note_reference: String,
    #[serde(rename = "confidence_score", default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxonomy_hint: Option<String>,
    #[serde(rename = "_original", default, skip_serializing_if = "IndexMap::is_empty")]
    pub original_snapshot: IndexMap<String, String>,
    #[serde(flatten)]
    pub values: IndexMap<String, String>,
}

impl RowRecord {
    pub fn new(translated_label: impl Into<String>, confidence: f64) -> Self {
        Self {
            translated_label: translated_label.into(),
            confidence: clamp_confidence(confidence),
            ..Self::default()
        }
    }

    pub fn with_value(mut self, year: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(year.into(), value.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note_reference = note.into();
        self
    }

    pub fn value(&self, year: &str) -> Option<&str> {
        self.values.get(year).map(String::as_str)
    }

    /// Apply a human correction. Each touched field keeps its first pre-edit value as the
    /// baseline in `original_snapshot`; later edits only move the live value.
    pub fn apply_edit(&mut self, edit: &RowEdit) {
        for (year, value) in &edit.years {
            if !is_year_key(year) {
                continue;
            }
            let current = self.values.get(year).cloned().unwrap_or_default();
            self.original_snapshot.entry(year.clone()).or_insert(current);
            self.values.insert(year.clone(), value.clone());
        }

        if let Some(note) = &edit.note_reference {
            let current = self.note_reference.clone();
            self.original_snapshot
                .entry(NOTE_FIELD.to_string())
                .or_insert(current);
            self.note_reference = note.clone();
        }

        if let Some(confidence) = edit.confidence {
            let current = self.confidence.to_string();
            self.original_snapshot
                .entry(CONFIDENCE_FIELD.to_string())
                .or_insert(current);
            self.confidence = clamp_confidence(confidence);
        }
    }

    /// Pre-edit value of a field, if the field was ever edited.
    pub fn baseline(&self, field: &str) -> Option<&str> {
        self.original_snapshot.get(field).map(String::as_str)
    }
}

/// Correction to one tabular row: values keyed by year plus note and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RowEdit {
    #[serde(default)]
    pub years: IndexMap<String, String>,
    #[serde(rename = "nota", default)]
    pub note_reference: Option<String>,
    #[serde(rename = "confidence_score", default)]
    pub confidence: Option<f64>,
}

impl RowEdit {
    /// First year key that is not a four digit year.
    pub fn invalid_year_key(&self) -> Option<&str> {
        self.years
            .keys()
            .map(String::as_str)
            .find(|key| !is_year_key(key))
    }
}

/// One page's labeled line items with per-year values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RowTable {
    #[serde(default)]
    pub page_title: String,
    #[serde(default)]
    pub years: Vec<String>,
    #[serde(default)]
    pub rows: IndexMap<String, RowRecord>,
}

impl RowTable {
    /// Table with no rows and the default year columns.
    pub fn empty() -> Self {
        Self {
            page_title: String::new(),
            years: default_years(),
            rows: IndexMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, label: &str) -> Option<&RowRecord> {
        self.rows.get(label)
    }

    /// Append a year column unless already present.
    pub fn push_year(&mut self, year: &str) {
        if !self.years.iter().any(|y| y == year) {
            self.years.push(year.to_string());
        }
    }

    /// Edit (or create) the row for `item`. Edited years the table does not list yet are
    /// appended to its columns so every row value stays visible.
    pub fn apply_edit(&mut self, item: &str, edit: &RowEdit) -> &RowRecord {
        for year in edit.years.keys().filter(|key| is_year_key(key)) {
            self.push_year(year);
        }
        let record = self.rows.entry(item.to_string()).or_default();
        record.apply_edit(edit);
        record
    }
}

/// Free-standing extracted value (key/value pages), with its own single-value baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DefaultField {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub item_type: String,
    #[serde(default)]
    pub confidence_score: String,
    #[serde(rename = "_original", default, skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FieldEdit {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub item_type: String,
    #[serde(default)]
    pub confidence_score: String,
}

impl DefaultField {
    pub fn apply_edit(&mut self, edit: &FieldEdit) {
        if self.original.is_none() {
            self.original = Some(self.value.clone());
        }
        self.value = edit.value.clone();
        self.item_type = edit.item_type.clone();
        self.confidence_score = edit.confidence_score.clone();
    }
}

/// Job-wide `label -> year -> value` index folded from every page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConsolidatedIndex {
    /// Year columns in first-seen order.
    pub years: Vec<String>,
    pub labels: IndexMap<String, IndexMap<String, String>>,
}

impl ConsolidatedIndex {
    pub fn value(&self, label: &str, year: &str) -> Option<&str> {
        self.labels
            .get(label)
            .and_then(|years| years.get(year))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Years sorted newest first, for exporters that present descending columns.
    pub fn years_descending(&self) -> Vec<String> {
        let mut years = self.years.clone();
        years.sort_by(|a, b| b.cmp(a));
        years
    }
}

/// Ordered, immutable list of canonical export field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonomySchema {
    fields: Vec<String>,
    lookup: HashSet<String>,
}

impl TaxonomySchema {
    /// Build a schema, dropping blank and repeated names while keeping order.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered = Vec::new();
        let mut lookup = HashSet::new();
        for field in fields {
            let field = field.into().trim().to_string();
            if field.is_empty() || !lookup.insert(field.clone()) {
                continue;
            }
            ordered.push(field);
        }
        Self {
            fields: ordered,
            lookup,
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn contains(&self, field: &str) -> bool {
        self.lookup.contains(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// How a taxonomy resolution was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Cache,
    Direct,
    Arbitrated,
    Heuristic,
    NoMatch,
}

/// Outcome of resolving one free-text label onto the taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResolution {
    pub field: Option<String>,
    pub confidence: f64,
    pub reason: String,
    pub method: MatchMethod,
}

impl MatchResolution {
    pub fn no_match(reason: impl Into<String>) -> Self {
        Self {
            field: None,
            confidence: 0.0,
            reason: reason.into(),
            method: MatchMethod::NoMatch,
        }
    }

    pub fn is_match(&self) -> bool {
        self.field.is_some()
    }
}

/// Append-only memo row of a label resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCacheEntry {
    pub id: i64,
    /// Verbatim label as seen in the extraction.
    pub source_label: String,
    /// Normalized form, kept for diagnostics only.
    pub normalized_label: String,
    pub matched_field: Option<String>,
    pub confidence: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    InProgress,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "Work in progress",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Work in progress" => Some(Self::InProgress),
            "Complete" => Some(Self::Complete),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Whether a page carries the statement table or free-form notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Statement,
    Notes,
}

impl PageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Statement => "statement",
            Self::Notes => "notes",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "notes" {
            Self::Notes
        } else {
            Self::Statement
        }
    }
}

/// One cell of a notes table: a normalized number, or text kept as printed (`""` when
/// the page had nothing there).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoteValue {
    Number(f64),
    Text(String),
}

impl Default for NoteValue {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl NoteValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NotesRow {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub values: IndexMap<String, NoteValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NotesTable {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<NotesRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NotesSection {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub paragraphs: Vec<String>,
    #[serde(default)]
    pub tables: Vec<NotesTable>,
}

impl NotesSection {
    pub fn is_empty(&self) -> bool {
        self.title.trim().is_empty() && self.paragraphs.is_empty() && self.tables.is_empty()
    }
}

/// Notes page kept as it reads: headed sections of prose and small tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NotesPage {
    #[serde(default)]
    pub page_title: String,
    #[serde(default)]
    pub sections: Vec<NotesSection>,
}

impl NotesPage {
    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(NotesSection::is_empty)
    }

    pub fn tables(&self) -> impl Iterator<Item = &NotesTable> {
        self.sections.iter().flat_map(|s| s.tables.iter())
    }
}

/// Document-level header fields carried into the export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobMeta {
    pub company_name: Option<String>,
    pub publication_year: Option<String>,
    pub publication_date: Option<String>,
    pub pdf_idnumber: Option<String>,
}
