//! OCR page model and the text/coordinate extraction path.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use fsx_core::{clamp_confidence, default_years, RowRecord, RowTable};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{AdapterError, ExtractionSource, PageInput, SourceKind};

static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19\d{2}|20\d{2}|2100)\b").expect("static regex"));

const AMOUNT: &str = r"\(?-?\d[\d.,]*\)?";

static TWO_VALUE_ROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^(?P<label>.+?)\s+(?:(?P<nota>\d{{1,2}})\s+)?(?P<v1>{AMOUNT})\s+(?P<v2>{AMOUNT})\s*$"
    ))
    .expect("static regex")
});

static ONE_VALUE_ROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^(?P<label>.+?)\s+(?P<v1>{AMOUNT})\s*$")).expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImageSize {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrWord {
    pub text: String,
    #[serde(default = "unknown_conf")]
    pub conf: f64,
    #[serde(default)]
    pub bbox: [i64; 4],
    #[serde(default)]
    pub block: i64,
    #[serde(default)]
    pub par: i64,
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub word: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    #[serde(default)]
    pub bbox: [i64; 4],
    /// Mean of the non-negative word confidences (0-100), or -1 when none were reported.
    #[serde(default = "unknown_conf")]
    pub avg_conf: f64,
    #[serde(default)]
    pub block: i64,
    #[serde(default)]
    pub par: i64,
    #[serde(default)]
    pub line: i64,
}

fn unknown_conf() -> f64 {
    -1.0
}

/// Word and line boxes of one rendered page as produced by the external OCR engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OcrPage {
    #[serde(default)]
    pub page_number: u32,
    #[serde(default)]
    pub image: ImageSize,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub lines: Vec<OcrLine>,
    #[serde(default)]
    pub words: Vec<OcrWord>,
}

impl OcrPage {
    /// Group words into lines by `(block, par, line)`, in first-seen order.
    pub fn aggregate_lines(words: &[OcrWord]) -> Vec<OcrLine> {
        let mut groups: IndexMap<(i64, i64, i64), Vec<&OcrWord>> = IndexMap::new();
        for word in words.iter().filter(|w| !w.text.trim().is_empty()) {
            groups
                .entry((word.block, word.par, word.line))
                .or_default()
                .push(word);
        }

        let mut lines = Vec::with_capacity(groups.len());
        for ((block, par, line), mut group) in groups {
            group.sort_by_key(|w| (w.bbox[0], w.bbox[1]));
            let text = group
                .iter()
                .map(|w| w.text.trim())
                .collect::<Vec<_>>()
                .join(" ");
            let bbox = [
                group.iter().map(|w| w.bbox[0]).min().unwrap_or_default(),
                group.iter().map(|w| w.bbox[1]).min().unwrap_or_default(),
                group.iter().map(|w| w.bbox[2]).max().unwrap_or_default(),
                group.iter().map(|w| w.bbox[3]).max().unwrap_or_default(),
            ];
            let confs: Vec<f64> = group.iter().map(|w| w.conf).filter(|c| *c >= 0.0).collect();
            let avg_conf = if confs.is_empty() {
                -1.0
            } else {
                confs.iter().sum::<f64>() / confs.len() as f64
            };
            lines.push(OcrLine {
                text,
                bbox,
                avg_conf,
                block,
                par,
                line,
            });
        }
        lines
    }

    /// Fill `lines` from `words` and `text` from `lines` when the producer left them out.
    pub fn complete(&mut self) {
        if self.lines.is_empty() && !self.words.is_empty() {
            self.lines = Self::aggregate_lines(&self.words);
        }
        if self.text.trim().is_empty() {
            self.text = self
                .reading_order()
                .iter()
                .map(|l| l.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
        }
    }

    /// Lines sorted top to bottom, then left to right.
    pub fn reading_order(&self) -> Vec<&OcrLine> {
        let mut lines: Vec<&OcrLine> = self
            .lines
            .iter()
            .filter(|l| !l.text.trim().is_empty())
            .collect();
        lines.sort_by_key(|l| (l.bbox[1], l.bbox[0]));
        lines
    }

    /// Non-empty trimmed text lines in reading order. Falls back to `text` when the page
    /// carries no line boxes.
    pub fn text_lines(&self) -> Vec<String> {
        if self.lines.is_empty() {
            return self
                .text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
        }
        self.reading_order()
            .into_iter()
            .map(|l| l.text.trim().to_string())
            .collect()
    }

    /// The first `count` text lines, where page headings live.
    pub fn header_lines(&self, count: usize) -> Vec<String> {
        self.text_lines().into_iter().take(count).collect()
    }
}

pub fn parse_ocr_page(raw: &str) -> Result<OcrPage, AdapterError> {
    let mut page: OcrPage =
        serde_json::from_str(raw).map_err(|err| AdapterError::MalformedPayload(err.to_string()))?;
    page.complete();
    Ok(page)
}

pub async fn load_ocr_page(path: impl AsRef<Path>) -> Result<OcrPage, AdapterError> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading OCR page {}", path.display()))?;
    parse_ocr_page(&raw)
}

/// First `limit` distinct publication-range years found in `text`, in order.
pub fn find_years(text: &str, limit: usize) -> Vec<String> {
    let mut years = Vec::new();
    for m in YEAR_RE.find_iter(text) {
        let year = m.as_str().to_string();
        if !years.contains(&year) {
            years.push(year);
            if years.len() == limit {
                break;
            }
        }
    }
    years
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedLine<'a> {
    pub(crate) label: &'a str,
    pub(crate) note: &'a str,
    pub(crate) values: Vec<&'a str>,
}

pub(crate) fn all_years(values: &[&str]) -> bool {
    values.iter().all(|v| v.len() == 4 && YEAR_RE.is_match(v))
}

pub(crate) fn parse_value_line(line: &str) -> Option<ParsedLine<'_>> {
    let (captures, two) = match TWO_VALUE_ROW_RE.captures(line) {
        Some(c) => (c, true),
        None => (ONE_VALUE_ROW_RE.captures(line)?, false),
    };
    let label = captures.name("label")?.as_str().trim();
    if !label.chars().any(char::is_alphabetic) {
        return None;
    }
    let mut values = vec![captures.name("v1")?.as_str()];
    if two {
        values.push(captures.name("v2")?.as_str());
    }
    // Column header such as "Nota 2024 2023". A lone year-like amount can be a value.
    if values.len() > 1 && all_years(&values) {
        return None;
    }
    Some(ParsedLine {
        label,
        note: captures.name("nota").map(|m| m.as_str()).unwrap_or_default(),
        values,
    })
}

/// Deterministic extractor over OCR lines. Sees only text and geometry, so labels are
/// not translated and the row confidence is the OCR line confidence.
#[derive(Debug, Clone)]
pub struct OcrLayoutExtractor {
    source_id: String,
}

impl OcrLayoutExtractor {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }

    pub fn extract_table(page: &OcrPage) -> RowTable {
        let lines: Vec<(String, f64)> = if page.lines.is_empty() {
            page.text_lines().into_iter().map(|l| (l, -1.0)).collect()
        } else {
            page.reading_order()
                .into_iter()
                .map(|l| (l.text.trim().to_string(), l.avg_conf))
                .collect()
        };

        let mut table = RowTable {
            page_title: lines.first().map(|(t, _)| t.clone()).unwrap_or_default(),
            years: Vec::new(),
            rows: IndexMap::new(),
        };

        // Above the first body row a single year is still a column header ("Nota 2024").
        let first_row = lines.iter().position(|(text, _)| {
            parse_value_line(text).is_some_and(|parsed| !all_years(&parsed.values))
        });
        let header_end = first_row.unwrap_or(lines.len());
        let header_text = lines[..header_end]
            .iter()
            .map(|(t, _)| t.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        table.years = find_years(&header_text, 2);
        if table.years.is_empty() {
            table.years = default_years();
        }
        // Table body starts after the column header line, or at the first value row.
        let body_start = lines[..header_end]
            .iter()
            .rposition(|(t, _)| !find_years(t, 1).is_empty())
            .map(|i| i + 1)
            .unwrap_or(header_end)
            .min(header_end);

        for (text, avg_conf) in &lines[body_start..] {
            let confidence = clamp_confidence(avg_conf / 100.0);
            let record = match parse_value_line(text) {
                Some(parsed) => {
                    let mut record = RowRecord::new(parsed.label, confidence).with_note(parsed.note);
                    for (i, year) in table.years.iter().enumerate() {
                        let value = parsed.values.get(i).copied().unwrap_or_default();
                        record.values.insert(year.clone(), value.to_string());
                    }
                    (parsed.label.to_string(), record)
                }
                None => {
                    if !text.chars().any(char::is_alphabetic) {
                        continue;
                    }
                    let mut record = RowRecord::new(text.as_str(), confidence);
                    for year in &table.years {
                        record.values.insert(year.clone(), String::new());
                    }
                    (text.clone(), record)
                }
            };
            table.rows.entry(record.0).or_insert(record.1);
        }
        table
    }
}

#[async_trait]
impl ExtractionSource for OcrLayoutExtractor {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::OcrLayout
    }

    async fn produce(&self, page: &PageInput) -> Result<String, AdapterError> {
        let ocr = page
            .ocr
            .as_ref()
            .ok_or(AdapterError::MissingInput("OCR words for page"))?;
        let table = Self::extract_table(ocr);
        serde_json::to_string(&table).map_err(|err| AdapterError::MalformedPayload(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, x: i64, line: i64, conf: f64) -> OcrWord {
        OcrWord {
            text: text.to_string(),
            conf,
            bbox: [x, line * 20, x + 30, line * 20 + 10],
            block: 1,
            par: 1,
            line,
            word: 0,
        }
    }

    fn line(text: &str, y: i64, conf: f64) -> OcrLine {
        OcrLine {
            text: text.to_string(),
            bbox: [10, y, 400, y + 12],
            avg_conf: conf,
            block: 1,
            par: 1,
            line: y,
        }
    }

    #[test]
    fn words_aggregate_into_sorted_lines() {
        let words = vec![
            word("1.000", 200, 1, 90.0),
            word("Nettosøla", 10, 1, 80.0),
            word("Ogn", 10, 2, -1.0),
        ];
        let lines = OcrPage::aggregate_lines(&words);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "Nettosøla 1.000");
        assert_eq!(lines[0].bbox, [10, 20, 230, 30]);
        assert_eq!(lines[0].avg_conf, 85.0);
        assert_eq!(lines[1].avg_conf, -1.0);
    }

    #[test]
    fn value_lines_split_label_note_and_amounts() {
        let parsed = parse_value_line("Nettosøla 3 1.389.189 (122.158)").unwrap();
        assert_eq!(parsed.label, "Nettosøla");
        assert_eq!(parsed.note, "3");
        assert_eq!(parsed.values, vec!["1.389.189", "(122.158)"]);

        let parsed = parse_value_line("Starvsfólk 12 15").unwrap();
        assert_eq!(parsed.note, "");
        assert_eq!(parsed.values, vec!["12", "15"]);

        let parsed = parse_value_line("Úrslit -126.378").unwrap();
        assert_eq!(parsed.values, vec!["-126.378"]);

        assert!(parse_value_line("2024 2023").is_none());
        assert!(parse_value_line("Nota 2024 2023").is_none());
        assert!(parse_value_line("Rakstrarroknskapur").is_none());
    }

    #[test]
    fn layout_extractor_builds_rows_with_header_years() {
        let page = OcrPage {
            page_number: 5,
            lines: vec![
                line("Rakstrarroknskapur", 10, 95.0),
                line("Nota 2024 2023", 30, 90.0),
                line("Nettosøla 3 1.389.189 1.200.000", 50, 88.0),
                line("Útreiðslur", 70, 70.0),
                line("Vørukeyp (122.158) (100.000)", 90, 150.0),
            ],
            ..OcrPage::default()
        };
        let table = OcrLayoutExtractor::extract_table(&page);
        assert_eq!(table.page_title, "Rakstrarroknskapur");
        assert_eq!(table.years, vec!["2024".to_string(), "2023".to_string()]);
        assert_eq!(table.len(), 3);

        let revenue = table.row("Nettosøla").unwrap();
        assert_eq!(revenue.translated_label, "Nettosøla");
        assert_eq!(revenue.note_reference, "3");
        assert_eq!(revenue.value("2023"), Some("1.200.000"));
        assert_eq!(revenue.confidence, 0.88);

        let heading = table.row("Útreiðslur").unwrap();
        assert_eq!(heading.value("2024"), Some(""));
        assert_eq!(table.row("Vørukeyp (122.158) (100.000)"), None);
        assert_eq!(table.row("Vørukeyp").unwrap().confidence, 1.0);
    }

    #[test]
    fn year_like_amount_in_the_body_is_a_value() {
        let page = OcrPage {
            lines: vec![
                line("Eginogn", 10, 90.0),
                line("Nota 2024", 30, 90.0),
                line("Partapeningur 5.000", 50, 90.0),
                line("Share capital 2000", 70, 80.0),
                line("2024 2023", 90, 80.0),
            ],
            ..OcrPage::default()
        };
        let table = OcrLayoutExtractor::extract_table(&page);
        assert_eq!(table.years, vec!["2024".to_string()]);
        assert_eq!(table.row("Nota"), None);
        assert_eq!(table.row("Share capital").unwrap().value("2024"), Some("2000"));
        assert_eq!(table.row("Partapeningur").unwrap().value("2024"), Some("5.000"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn layout_extractor_defaults_years_without_header() {
        let page = OcrPage {
            text: "Fíggjarstøða\nOgn 10 20\n".into(),
            ..OcrPage::default()
        };
        let table = OcrLayoutExtractor::extract_table(&page);
        assert_eq!(table.years, default_years());
        assert_eq!(table.row("Ogn").unwrap().value("2023"), Some("20"));
        assert_eq!(table.row("Ogn").unwrap().confidence, 0.0);
    }

    #[test]
    fn find_years_is_ordered_and_distinct() {
        assert_eq!(
            find_years("Ársfrásøgn 2024 samanborið við 2023 og 2024", 5),
            vec!["2024".to_string(), "2023".to_string()]
        );
        assert!(find_years("1899 or 21000", 2).is_empty());
    }
}
