//! Lenient parser from an extraction payload onto [`RowTable`].
//!
//! Producers are language models and heuristics; anything may be missing or of the wrong
//! type. All of that is absorbed here so the rest of the pipeline only sees a well formed
//! table: every row carries a value for every declared year, `nota` is never `0`, and
//! confidences are inside `[0, 1]`.

use fsx_core::{clamp_confidence, default_years, is_year_key, RowRecord, RowTable};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::AdapterError;

const LABEL_KEYS: [&str; 2] = ["Experian Value", "translated_label"];
const NOTE_KEYS: [&str; 2] = ["nota", "note_reference"];
const CONFIDENCE_KEYS: [&str; 2] = ["confidence_score", "confidence"];

/// Parse raw payload text. Text wrapped around the JSON object (markdown fences, chatter)
/// is tolerated by falling back to the outermost `{...}`.
pub fn parse_row_table(raw: &str) -> Result<RowTable, AdapterError> {
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(err) => {
            let inner = outermost_object(raw)
                .ok_or_else(|| AdapterError::MalformedPayload(err.to_string()))?;
            serde_json::from_str(inner)
                .map_err(|err| AdapterError::MalformedPayload(err.to_string()))?
        }
    };
    row_table_from_value(&value)
}

pub fn row_table_from_value(value: &Value) -> Result<RowTable, AdapterError> {
    let object = value
        .as_object()
        .ok_or_else(|| AdapterError::MalformedPayload("payload is not a JSON object".into()))?;

    let mut table = RowTable {
        page_title: object.get("page_title").map(render).unwrap_or_default(),
        years: declared_years(object.get("years")),
        rows: IndexMap::new(),
    };

    match object.get("rows") {
        Some(Value::Object(rows)) => {
            for (label, record) in rows {
                let record = parse_record(record, &mut table.years);
                table.rows.entry(label.trim().to_string()).or_insert(record);
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let Some(label) = item
                    .get("label")
                    .or_else(|| item.get("row_label"))
                    .map(render)
                    .filter(|l| !l.trim().is_empty())
                else {
                    continue;
                };
                let record = parse_record(item, &mut table.years);
                table.rows.entry(label.trim().to_string()).or_insert(record);
            }
        }
        _ => {}
    }

    fill_declared_years(&mut table);
    Ok(table)
}

/// Bring a table produced elsewhere into the same shape the parser guarantees.
pub fn normalize_table(table: &mut RowTable) {
    let mut years = Vec::new();
    for year in table.years.drain(..) {
        let year = year.trim().to_string();
        if is_year_key(&year) && !years.contains(&year) {
            years.push(year);
        }
    }
    table.years = if years.is_empty() { default_years() } else { years };

    for record in table.rows.values_mut() {
        record.confidence = clamp_confidence(record.confidence);
        if record.note_reference.trim() == "0" {
            record.note_reference.clear();
        }
    }
    let extra: Vec<String> = table
        .rows
        .values()
        .flat_map(|r| r.values.keys())
        .filter(|k| is_year_key(k))
        .cloned()
        .collect();
    for year in extra {
        table.push_year(&year);
    }
    fill_declared_years(table);
}

fn fill_declared_years(table: &mut RowTable) {
    for record in table.rows.values_mut() {
        record.values.retain(|key, _| is_year_key(key));
        for year in &table.years {
            record.values.entry(year.clone()).or_default();
        }
    }
}

fn declared_years(value: Option<&Value>) -> Vec<String> {
    let mut years: Vec<String> = Vec::new();
    if let Some(Value::Array(items)) = value {
        for item in items {
            let year = render(item).trim().to_string();
            if is_year_key(&year) && !years.contains(&year) {
                years.push(year);
            }
        }
    }
    if years.is_empty() {
        default_years()
    } else {
        years
    }
}

fn parse_record(value: &Value, years: &mut Vec<String>) -> RowRecord {
    let Some(object) = value.as_object() else {
        return RowRecord::default();
    };

    let mut record = RowRecord {
        translated_label: first_of(object, &LABEL_KEYS).map(render).unwrap_or_default(),
        note_reference: first_of(object, &NOTE_KEYS).map(render_note).unwrap_or_default(),
        confidence: first_of(object, &CONFIDENCE_KEYS)
            .map(coerce_confidence)
            .unwrap_or(0.0),
        taxonomy_hint: object
            .get("taxonomy_hint")
            .map(render)
            .filter(|h| !h.trim().is_empty()),
        ..RowRecord::default()
    };

    if let Some(Value::Object(original)) = object.get("_original") {
        for (field, value) in original {
            record.original_snapshot.insert(field.clone(), render(value));
        }
    }

    for (key, value) in object {
        let key = key.trim();
        if !is_year_key(key) {
            continue;
        }
        if !years.iter().any(|y| y == key) {
            years.push(key.to_string());
        }
        record.values.insert(key.to_string(), render(value));
    }
    record
}

fn first_of<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

/// Render a scalar as the format-preserving string the table stores.
pub(crate) fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn render_note(value: &Value) -> String {
    let note = render(value);
    if note.trim() == "0" || note.trim() == "0.0" {
        String::new()
    } else {
        note.trim().to_string()
    }
}

fn coerce_confidence(value: &Value) -> f64 {
    let raw = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    clamp_confidence(raw)
}

pub(crate) fn outermost_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}
