//! Two-source reconciliation of per-page row tables.
//!
//! Both strategies take the base source as table A and the secondary source as table B and
//! always return a table whose confidences are inside `[0, 1]`.

use fsx_core::{clamp_confidence, round2, RowRecord, RowTable};
use indexmap::IndexMap;

use crate::config::ReconcileStrategyKind;

/// Confidence taken off a base row whose label the secondary source did not see.
pub const COVERAGE_PENALTY: f64 = 0.2;

pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;
    fn reconcile(&self, base: &RowTable, secondary: &RowTable) -> RowTable;
}

pub fn reconciler_for(kind: ReconcileStrategyKind) -> Box<dyn Reconciler> {
    match kind {
        ReconcileStrategyKind::FieldConfidence => Box::new(FieldConfidenceMerge),
        ReconcileStrategyKind::CoveragePenalty => Box::new(CoveragePenalty::default()),
    }
}

/// Base table structure is kept whole; B only corroborates row labels. Rows that B lacks
/// lose [`COVERAGE_PENALTY`] confidence, rows only B has are dropped.
#[derive(Debug, Clone, Copy)]
pub struct CoveragePenalty {
    pub penalty: f64,
}

impl Default for CoveragePenalty {
    fn default() -> Self {
        Self {
            penalty: COVERAGE_PENALTY,
        }
    }
}

impl Reconciler for CoveragePenalty {
    fn name(&self) -> &'static str {
        ReconcileStrategyKind::CoveragePenalty.as_str()
    }

    fn reconcile(&self, base: &RowTable, secondary: &RowTable) -> RowTable {
        let mut out = base.clone();
        for (label, record) in out.rows.iter_mut() {
            let confidence = clamp_confidence(record.confidence);
            record.confidence = if secondary.rows.contains_key(label) {
                confidence
            } else {
                clamp_confidence(round2((confidence - self.penalty).max(0.0)))
            };
        }
        out
    }
}

/// Field-by-field union of both tables. Where both sides carry a field, the side with the
/// LOWER row confidence wins (A on ties) and the merged row takes the minimum confidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldConfidenceMerge;

impl Reconciler for FieldConfidenceMerge {
    fn name(&self) -> &'static str {
        ReconcileStrategyKind::FieldConfidence.as_str()
    }

    fn reconcile(&self, a: &RowTable, b: &RowTable) -> RowTable {
        let mut years = a.years.clone();
        for year in &b.years {
            if !years.contains(year) {
                years.push(year.clone());
            }
        }

        let mut rows = IndexMap::with_capacity(a.rows.len() + b.rows.len());
        for (label, record_a) in &a.rows {
            let merged = match b.rows.get(label) {
                Some(record_b) => merge_records(record_a, record_b),
                None => record_a.clone(),
            };
            rows.insert(label.clone(), merged);
        }
        for (label, record_b) in &b.rows {
            if !rows.contains_key(label) {
                rows.insert(label.clone(), record_b.clone());
            }
        }

        // Records keep their own year keys; the column list only grows to cover them.
        for record in rows.values_mut() {
            record.confidence = clamp_confidence(record.confidence);
            for year in record.values.keys() {
                if !years.contains(year) {
                    years.push(year.clone());
                }
            }
        }

        RowTable {
            page_title: if a.page_title.trim().is_empty() {
                b.page_title.clone()
            } else {
                a.page_title.clone()
            },
            years,
            rows,
        }
    }
}

fn pick<'a>(from_a: &'a str, from_b: &'a str, a_wins: bool) -> &'a str {
    match (from_a.is_empty(), from_b.is_empty()) {
        (false, true) => from_a,
        (true, false) => from_b,
        _ if a_wins => from_a,
        _ => from_b,
    }
}

fn merge_records(a: &RowRecord, b: &RowRecord) -> RowRecord {
    let conf_a = clamp_confidence(a.confidence);
    let conf_b = clamp_confidence(b.confidence);
    let a_wins = conf_a <= conf_b;

    let mut values = IndexMap::new();
    for year in a.values.keys().chain(b.values.keys()) {
        if values.contains_key(year) {
            continue;
        }
        let va = a.values.get(year).map(String::as_str).unwrap_or_default();
        let vb = b.values.get(year).map(String::as_str).unwrap_or_default();
        values.insert(year.clone(), pick(va, vb, a_wins).to_string());
    }

    let taxonomy_hint = match (&a.taxonomy_hint, &b.taxonomy_hint) {
        (Some(ha), Some(hb)) => Some(if a_wins { ha.clone() } else { hb.clone() }),
        (hint, None) | (None, hint) => hint.clone(),
    };

    let mut original_snapshot = a.original_snapshot.clone();
    for (field, value) in &b.original_snapshot {
        original_snapshot
            .entry(field.clone())
            .or_insert_with(|| value.clone());
    }

    RowRecord {
        translated_label: pick(&a.translated_label, &b.translated_label, a_wins).to_string(),
        note_reference: pick(&a.note_reference, &b.note_reference, a_wins).to_string(),
        confidence: round2(conf_a.min(conf_b)),
        taxonomy_hint,
        original_snapshot,
        values,
    }
}
