//! Fixed-schema export of a job: consolidated labels resolved onto the taxonomy.

use std::io::Write;

use anyhow::{Context, Result};
use fsx_core::{ConsolidatedIndex, JobMeta, MatchResolution, TaxonomySchema};
use fsx_storage::{Store, StoreError};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::info;

use crate::consolidate::consolidate;
use crate::matcher::TaxonomyMatcher;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const FIELD_COLUMN: &str = "Experian Taxonomy";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldRow {
    pub field: String,
    /// Consolidated label that supplied the first value, if any did.
    pub source_label: Option<String>,
    pub values: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelRow {
    pub label: String,
    pub resolution: MatchResolution,
    pub values: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportTable {
    pub job_id: i64,
    pub meta: JobMeta,
    pub years: Vec<String>,
    pub fields: Vec<FieldRow>,
    pub labels: Vec<LabelRow>,
}

impl ExportTable {
    /// Fill the schema row from consolidated labels. For each field and year the first
    /// label, in first-seen order, that resolved to the field and has a value wins.
    pub fn assemble(
        job_id: i64,
        meta: JobMeta,
        schema: &TaxonomySchema,
        index: &ConsolidatedIndex,
        resolutions: &IndexMap<String, MatchResolution>,
        years: &[String],
    ) -> Self {
        let mut fields: IndexMap<&str, FieldRow> = schema
            .fields()
            .iter()
            .map(|field| {
                (
                    field.as_str(),
                    FieldRow {
                        field: field.clone(),
                        source_label: None,
                        values: years.iter().map(|y| (y.clone(), String::new())).collect(),
                    },
                )
            })
            .collect();

        let mut labels = Vec::with_capacity(index.labels.len());
        for (label, by_year) in &index.labels {
            let resolution = resolutions
                .get(label)
                .cloned()
                .unwrap_or_else(|| MatchResolution::no_match("not resolved"));
            let values: IndexMap<String, String> = years
                .iter()
                .map(|y| (y.clone(), by_year.get(y).cloned().unwrap_or_default()))
                .collect();

            if let Some(row) = resolution
                .field
                .as_deref()
                .and_then(|field| fields.get_mut(field))
            {
                for (year, value) in &values {
                    let slot = row.values.entry(year.clone()).or_default();
                    if slot.is_empty() && !value.trim().is_empty() {
                        *slot = value.clone();
                        row.source_label.get_or_insert_with(|| label.clone());
                    }
                }
            }

            labels.push(LabelRow {
                label: label.clone(),
                resolution,
                values,
            });
        }

        Self {
            job_id,
            meta,
            years: years.to_vec(),
            fields: fields.into_values().collect(),
            labels,
        }
    }

    pub fn filled_fields(&self) -> usize {
        self.fields
            .iter()
            .filter(|row| row.values.values().any(|v| !v.is_empty()))
            .count()
    }

    fn header(&self) -> Vec<String> {
        std::iter::once(FIELD_COLUMN.to_string())
            .chain(self.years.iter().map(|y| format!("Value {y}")))
            .collect()
    }

    /// One line per taxonomy field in schema order, BOM-prefixed.
    pub fn write_taxonomy_csv<W: Write>(&self, writer: W) -> Result<()> {
        let rows = self.fields.iter().map(|row| (row.field.as_str(), &row.values));
        self.write_csv(writer, rows)
    }

    /// One line per consolidated label, BOM-prefixed.
    pub fn write_labels_csv<W: Write>(&self, writer: W) -> Result<()> {
        let rows = self.labels.iter().map(|row| (row.label.as_str(), &row.values));
        self.write_csv(writer, rows)
    }

    fn write_csv<'a, W: Write>(
        &self,
        mut writer: W,
        rows: impl Iterator<Item = (&'a str, &'a IndexMap<String, String>)>,
    ) -> Result<()> {
        writer.write_all(UTF8_BOM).context("writing byte order mark")?;
        let mut csv = csv::WriterBuilder::new().from_writer(writer);
        csv.write_record(self.header()).context("writing csv header")?;
        for (key, values) in rows {
            let mut record = Vec::with_capacity(self.years.len() + 1);
            record.push(key);
            for year in &self.years {
                record.push(values.get(year).map(String::as_str).unwrap_or_default());
            }
            csv.write_record(&record)
                .with_context(|| format!("writing csv row {key}"))?;
        }
        csv.flush().context("flushing csv")?;
        Ok(())
    }
}

/// Consolidate a job's persisted pages and resolve every label onto the schema.
pub async fn build_export(
    store: &Store,
    matcher: &TaxonomyMatcher,
    job_id: i64,
    years: &[String],
) -> Result<ExportTable, StoreError> {
    let pages = store.pages(job_id).await?;
    let index = consolidate(pages.iter().map(|page| &page.table));
    let years = if years.is_empty() {
        index.years_descending()
    } else {
        years.to_vec()
    };
    let resolutions = matcher
        .resolve_all(index.labels.keys().map(String::as_str))
        .await;
    let meta = store.meta(job_id).await?.unwrap_or_default();

    let export = ExportTable::assemble(job_id, meta, matcher.schema(), &index, &resolutions, &years);
    info!(
        job_id,
        labels = export.labels.len(),
        filled = export.filled_fields(),
        "export built"
    );
    Ok(export)
}
