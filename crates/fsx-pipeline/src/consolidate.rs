//! Page consolidation: folds every reconciled page of a job into one label index.

use fsx_core::{is_year_key, ConsolidatedIndex, RowTable};

/// Export label of a row: its translation when present, otherwise the printed label.
pub fn export_label<'a>(row_label: &'a str, translated_label: &'a str) -> &'a str {
    let translated = translated_label.trim();
    if translated.is_empty() {
        row_label.trim()
    } else {
        translated
    }
}

/// Fold a job's page tables, given in page order, into one `label -> year -> value` index.
///
/// The first value seen for a `(label, year)` pair is kept, except that an empty incumbent
/// is replaced by a later non-empty value. Years are collected in first-seen order, the
/// table's declared years ahead of the row keys.
pub fn consolidate<'a>(pages: impl IntoIterator<Item = &'a RowTable>) -> ConsolidatedIndex {
    let mut index = ConsolidatedIndex::default();

    for table in pages {
        for year in &table.years {
            if is_year_key(year) && !index.years.contains(year) {
                index.years.push(year.clone());
            }
        }

        for (row_label, record) in &table.rows {
            let label = export_label(row_label, &record.translated_label);
            if label.is_empty() {
                continue;
            }
            let slot = index.labels.entry(label.to_string()).or_default();
            for (year, value) in &record.values {
                if !is_year_key(year) {
                    continue;
                }
                if !index.years.contains(year) {
                    index.years.push(year.clone());
                }
                match slot.get_mut(year) {
                    Some(existing) if existing.trim().is_empty() && !value.trim().is_empty() => {
                        *existing = value.clone();
                    }
                    Some(_) => {}
                    None => {
                        slot.insert(year.clone(), value.clone());
                    }
                }
            }
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsx_core::RowRecord;

    fn page(rows: Vec<(&str, RowRecord)>) -> RowTable {
        let mut table = RowTable::empty();
        for (label, record) in rows {
            table.rows.insert(label.to_string(), record);
        }
        table
    }

    #[test]
    fn first_non_empty_value_wins_across_pages() {
        let p1 = page(vec![("Turnover", RowRecord::new("", 0.9).with_value("2024", "1.000"))]);
        let p2 = page(vec![("Turnover", RowRecord::new("", 0.9).with_value("2024", ""))]);
        let index = consolidate([&p1, &p2]);
        assert_eq!(index.value("Turnover", "2024"), Some("1.000"));
    }

    #[test]
    fn empty_incumbent_is_overwritten() {
        let p1 = page(vec![("Turnover", RowRecord::new("", 0.9).with_value("2024", ""))]);
        let p2 = page(vec![("Turnover", RowRecord::new("", 0.9).with_value("2024", "2.000"))]);
        let p3 = page(vec![("Turnover", RowRecord::new("", 0.9).with_value("2024", "3.000"))]);
        let index = consolidate([&p1, &p2, &p3]);
        assert_eq!(index.value("Turnover", "2024"), Some("2.000"));
    }

    #[test]
    fn translated_label_is_the_export_label() {
        let p1 = page(vec![
            ("Nettosøla", RowRecord::new("Revenue", 0.9).with_value("2024", "10")),
            ("Ogn", RowRecord::new("  ", 0.9).with_value("2024", "20")),
        ]);
        let p2 = page(vec![("Sølu", RowRecord::new("Revenue", 0.9).with_value("2023", "8"))]);
        let index = consolidate([&p1, &p2]);
        assert_eq!(index.labels.keys().collect::<Vec<_>>(), vec!["Revenue", "Ogn"]);
        assert_eq!(index.value("Revenue", "2023"), Some("8"));
        assert_eq!(index.value("Ogn", "2024"), Some("20"));
    }

    #[test]
    fn years_are_tracked_in_first_seen_order() {
        let mut p1 = page(vec![]);
        p1.years = vec!["2023".into()];
        let p2 = page(vec![("A", RowRecord::new("", 0.5).with_value("2021", "1"))]);
        let index = consolidate([&p1, &p2]);
        assert_eq!(index.years, vec!["2023", "2024", "2021"]);
        assert_eq!(index.years_descending(), vec!["2024", "2023", "2021"]);
    }
}
