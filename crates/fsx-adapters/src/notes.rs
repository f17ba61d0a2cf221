//! Notes pages: free-form prose and small tables, read either by a vision model or from
//! OCR lines when no model is configured.

use anyhow::Context;
use fsx_core::{NoteValue, NotesPage, NotesRow, NotesSection, NotesTable};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::chat::{ChatClient, ChatMessage};
use crate::ocr::{all_years, find_years, parse_value_line, OcrPage};
use crate::payload::{outermost_object, render};
use crate::{AdapterError, PageInput};

pub const NOTES_PROMPT: &str = r#"You are extracting one NOTES page of a financial statement from an image.
Capture everything on the page as it reads, so it can be rendered again later.

Return only JSON of this shape:
{
  "page_title": "<best effort heading of the page>",
  "sections": [
    {
      "title": "<sub-heading, or empty>",
      "paragraphs": ["<paragraph text>"],
      "tables": [
        {
          "title": "<table title, or empty>",
          "columns": ["2024", "2023"],
          "rows": [{"name": "<row label as printed>", "values": {"2024": <number or "">, "2023": <number or "">}}]
        }
      ]
    }
  ]
}

Rules:
- Do not wrap the output under a top-level "Notur" key.
- Keep headings, row labels and column names exactly as printed (e.g. "2024", "31-12-24").
- Amounts use "." for thousands and "," for decimals. Output them as JSON numbers:
  "120.000.000" -> 120000000, "120.980,89" -> 120980.89, "(1.234,50)" -> -1234.5.
- Keep minus signs. A value that cannot be read as a number is ""."#;

/// Parse a printed amount in the dot-thousands, comma-decimals convention. Parentheses and
/// a leading minus make it negative. Text that is not an amount yields `None`.
pub fn normalize_amount(raw: &str) -> Option<f64> {
    let mut text = raw.trim();
    let mut negative = false;
    if let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        negative = true;
        text = inner.trim();
    }
    if let Some(rest) = text.strip_prefix('-').or_else(|| text.strip_prefix('\u{2212}')) {
        negative = !negative;
        text = rest.trim_start();
    }
    if text.is_empty()
        || !text.chars().any(|c| c.is_ascii_digit())
        || !text.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',')
    {
        return None;
    }

    let canonical = match text.rfind(',') {
        Some(decimal) => {
            let (whole, fraction) = text.split_at(decimal);
            format!("{}.{}", whole.replace(|c: char| c == '.' || c == ',', ""), &fraction[1..])
        }
        None => text.replace('.', ""),
    };
    let value: f64 = canonical.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn note_value(value: &Value) -> NoteValue {
    match value {
        Value::Number(n) => n.as_f64().map(NoteValue::Number).unwrap_or_default(),
        Value::String(s) => match normalize_amount(s) {
            Some(n) => NoteValue::Number(n),
            None => NoteValue::Text(s.trim().to_string()),
        },
        Value::Null => NoteValue::default(),
        other => NoteValue::Text(render(other)),
    }
}

/// Parse a notes payload. Tolerates text around the JSON, a `Notur` wrapper key, single
/// objects where lists are expected and rows given as a `name -> values` map.
pub fn parse_notes_page(raw: &str) -> Result<NotesPage, AdapterError> {
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(err) => {
            let inner = outermost_object(raw)
                .ok_or_else(|| AdapterError::MalformedPayload(err.to_string()))?;
            serde_json::from_str(inner)
                .map_err(|err| AdapterError::MalformedPayload(err.to_string()))?
        }
    };
    let mut object = value
        .as_object()
        .ok_or_else(|| AdapterError::MalformedPayload("notes payload is not a JSON object".into()))?;
    if object.len() == 1 {
        if let Some(Value::Object(inner)) = object.get("Notur").or_else(|| object.get("notur")) {
            object = inner;
        }
    }

    let mut page = NotesPage {
        page_title: text_of(object, &["page_title", "title"]),
        sections: as_list(object.get("sections"))
            .filter_map(Value::as_object)
            .map(parse_section)
            .filter(|section| !section.is_empty())
            .collect(),
    };
    if page.sections.is_empty() {
        let loose = parse_section(object);
        if !loose.paragraphs.is_empty() || !loose.tables.is_empty() {
            page.sections.push(NotesSection {
                title: String::new(),
                ..loose
            });
        }
    }
    Ok(page)
}

fn parse_section(object: &Map<String, Value>) -> NotesSection {
    NotesSection {
        title: text_of(object, &["title", "heading"]),
        paragraphs: as_list(object.get("paragraphs"))
            .map(render)
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        tables: as_list(object.get("tables"))
            .filter_map(Value::as_object)
            .map(parse_table)
            .collect(),
    }
}

fn parse_table(object: &Map<String, Value>) -> NotesTable {
    let mut rows = Vec::new();
    match object.get("rows") {
        Some(Value::Array(items)) => {
            for item in items.iter().filter_map(Value::as_object) {
                rows.push(NotesRow {
                    name: text_of(item, &["name", "label"]),
                    values: cells(item.get("values")),
                });
            }
        }
        Some(Value::Object(named)) => {
            for (name, values) in named {
                rows.push(NotesRow {
                    name: name.trim().to_string(),
                    values: cells(Some(values)),
                });
            }
        }
        _ => {}
    }

    let mut columns: Vec<String> = as_list(object.get("columns"))
        .map(render)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if columns.is_empty() {
        for row in &rows {
            for key in row.values.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }

    NotesTable {
        title: text_of(object, &["title"]),
        columns,
        rows,
    }
}

fn cells(value: Option<&Value>) -> IndexMap<String, NoteValue> {
    match value {
        Some(Value::Object(values)) => values
            .iter()
            .map(|(column, cell)| (column.trim().to_string(), note_value(cell)))
            .collect(),
        _ => IndexMap::new(),
    }
}

fn text_of(object: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| object.get(*key))
        .map(render)
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

fn as_list(value: Option<&Value>) -> Box<dyn Iterator<Item = &Value> + '_> {
    match value {
        Some(Value::Array(items)) => Box::new(items.iter()),
        Some(Value::Null) | None => Box::new(std::iter::empty()),
        Some(single) => Box::new(std::iter::once(single)),
    }
}

/// Best effort notes page from OCR text: the first line is the title, value lines form
/// one table under the last column header seen, everything else is prose.
pub fn notes_from_ocr(ocr: &OcrPage) -> NotesPage {
    let lines = ocr.text_lines();
    let Some((title, body)) = lines.split_first() else {
        return NotesPage::default();
    };

    let mut section = NotesSection::default();
    let mut table = NotesTable::default();
    for line in body {
        match parse_value_line(line) {
            // A lone year before any row is a column header ("Nota 2024").
            Some(parsed) if !(table.rows.is_empty() && all_years(&parsed.values)) => {
                let values = parsed
                    .values
                    .iter()
                    .enumerate()
                    .map(|(i, raw)| {
                        let column = table
                            .columns
                            .get(i)
                            .cloned()
                            .unwrap_or_else(|| (i + 1).to_string());
                        let cell = normalize_amount(raw)
                            .map(NoteValue::Number)
                            .unwrap_or_else(|| NoteValue::Text(raw.to_string()));
                        (column, cell)
                    })
                    .collect();
                table.rows.push(NotesRow {
                    name: parsed.label.to_string(),
                    values,
                });
            }
            _ => {
                let years = find_years(line, 4);
                if !years.is_empty() && table.rows.is_empty() {
                    table.columns = years;
                } else if line.chars().any(char::is_alphabetic) {
                    section.paragraphs.push(line.clone());
                }
            }
        }
    }
    if !table.rows.is_empty() {
        section.tables.push(table);
    }

    NotesPage {
        page_title: title.clone(),
        sections: if section.is_empty() {
            Vec::new()
        } else {
            vec![section]
        },
    }
}

/// Outcome of reading one notes page. `raw` is the model reply, kept for audit.
#[derive(Debug, Clone)]
pub struct NotesExtraction {
    pub source_id: String,
    pub notes: NotesPage,
    pub raw: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotesExtractor {
    source_id: String,
    client: Option<ChatClient>,
}

impl NotesExtractor {
    pub fn new(client: Option<ChatClient>) -> Self {
        Self {
            source_id: "notes".to_string(),
            client,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    /// Read a notes page. Model failures and unreadable replies fall back to OCR; this
    /// never fails.
    pub async fn extract(&self, page: &PageInput) -> NotesExtraction {
        let mut raw = None;
        if let Some(client) = &self.client {
            match self.ask(client, page).await {
                Ok(reply) => match parse_notes_page(&reply) {
                    Ok(notes) => {
                        debug!(page_number = page.page_number, sections = notes.sections.len(), "notes read by model");
                        return NotesExtraction {
                            source_id: self.source_id.clone(),
                            notes,
                            raw: Some(reply),
                        };
                    }
                    Err(err) => {
                        warn!(page_number = page.page_number, error = %err, "unparseable notes reply; using OCR");
                        raw = Some(reply);
                    }
                },
                Err(err) => {
                    warn!(page_number = page.page_number, error = %err, "notes extraction failed; using OCR")
                }
            }
        }
        NotesExtraction {
            source_id: self.source_id.clone(),
            notes: page.ocr.as_ref().map(notes_from_ocr).unwrap_or_default(),
            raw,
        }
    }

    async fn ask(&self, client: &ChatClient, page: &PageInput) -> Result<String, AdapterError> {
        let png = tokio::fs::read(&page.png_path)
            .await
            .with_context(|| format!("reading page image {}", page.png_path.display()))?;
        client
            .complete_json(vec![ChatMessage::user_with_image(NOTES_PROMPT, &png)])
            .await
    }
}
