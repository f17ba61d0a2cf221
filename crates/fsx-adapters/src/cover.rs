//! Cover page header fields: company, publication year and publication date.

use std::path::Path;

use anyhow::Context;
use fsx_core::JobMeta;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::chat::{ChatClient, ChatMessage};
use crate::payload::{outermost_object, render};
use crate::AdapterError;

pub const COVER_PROMPT: &str = r#"You are given the FIRST PAGE of an annual report as an image.

Extract:
1) company_name: the primary company or organization name on the page.
2) publication_year: the 4 digit report year (e.g. "Ársfrásøgn 2024" gives "2024").
3) publication_date: the date printed on the page, if any, as YYYYMMDD (digits only).

Return only JSON with exactly these keys:
{ "company_name": string|null, "publication_year": string|null, "publication_date": string|null }

Use the text as printed. If several years appear, choose the report year. Use null when unsure."#;

static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19\d{2}|20\d{2}|2100)\b").expect("static regex"));
static ISO_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").expect("static regex"));
static NAMED_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})\.?\s+(\p{L}{3,})\.?\s+(\d{4})\b").expect("static regex")
});
static NUMERIC_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})[./](\d{1,2})[./](\d{4})\b").expect("static regex"));

/// Month number from a Faroese, Danish or English month name (or its abbreviation).
fn month_number(name: &str) -> Option<u32> {
    let name = name.to_lowercase();
    let prefix: String = name.chars().take(3).collect();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "mai" | "maj" | "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "okt" | "oct" => 10,
        "nov" => 11,
        "des" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn compact_date(year: &str, month: u32, day: u32) -> Option<String> {
    let year: u32 = year.parse().ok()?;
    let valid = (1900..=2100).contains(&year) && (1..=12).contains(&month) && (1..=31).contains(&day);
    valid.then(|| format!("{year:04}{month:02}{day:02}"))
}

/// First printed date in `text` as `YYYYMMDD`. Understands ISO dates, `31.12.2024` and
/// written months such as `31. desember 2024`.
pub fn parse_publication_date(text: &str) -> Option<String> {
    let iso = ISO_DATE_RE.captures_iter(text).find_map(|c| {
        let start = c.get(0)?.start();
        compact_date(&c[1], c[2].parse().ok()?, c[3].parse().ok()?).map(|d| (start, d))
    });
    let named = NAMED_DATE_RE.captures_iter(text).find_map(|c| {
        let start = c.get(0)?.start();
        compact_date(&c[3], month_number(&c[2])?, c[1].parse().ok()?).map(|d| (start, d))
    });
    let numeric = NUMERIC_DATE_RE.captures_iter(text).find_map(|c| {
        let start = c.get(0)?.start();
        compact_date(&c[3], c[2].parse().ok()?, c[1].parse().ok()?).map(|d| (start, d))
    });
    [iso, named, numeric]
        .into_iter()
        .flatten()
        .min_by_key(|(start, _)| *start)
        .map(|(_, date)| date)
}

/// Header fields read from the cover by a model. Any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverFields {
    pub company_name: Option<String>,
    pub publication_year: Option<String>,
    pub publication_date: Option<String>,
}

impl CoverFields {
    /// Overlay these fields on `meta`; fields the model left empty keep their value.
    pub fn apply_to(self, meta: &mut JobMeta) {
        if let Some(company) = self.company_name {
            meta.company_name = Some(company);
        }
        if let Some(year) = self.publication_year {
            meta.publication_year = Some(year);
        }
        if let Some(date) = self.publication_date {
            meta.publication_date = Some(date);
        }
    }
}

fn present(value: Option<&Value>) -> Option<String> {
    let text = render(value?).trim().to_string();
    let blank = text.is_empty() || text.eq_ignore_ascii_case("null") || text.eq_ignore_ascii_case("none");
    (!blank).then_some(text)
}

pub fn parse_cover_reply(raw: &str) -> Result<CoverFields, AdapterError> {
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(err) => {
            let inner = outermost_object(raw)
                .ok_or_else(|| AdapterError::MalformedPayload(err.to_string()))?;
            serde_json::from_str(inner)
                .map_err(|err| AdapterError::MalformedPayload(err.to_string()))?
        }
    };
    let object = value
        .as_object()
        .ok_or_else(|| AdapterError::MalformedPayload("cover reply is not a JSON object".into()))?;

    let publication_date = present(object.get("publication_date")).and_then(|date| {
        let digits: String = date.chars().filter(char::is_ascii_digit).collect();
        if digits.len() == 8 && date.chars().all(|c| c.is_ascii_digit()) {
            compact_date(&digits[..4], digits[4..6].parse().ok()?, digits[6..].parse().ok()?)
        } else {
            parse_publication_date(&date)
        }
    });

    Ok(CoverFields {
        company_name: present(object.get("company_name")),
        publication_year: present(object.get("publication_year"))
            .and_then(|year| YEAR_RE.find(&year).map(|m| m.as_str().to_string())),
        publication_date,
    })
}

/// Asks a vision model for the cover page header fields.
#[derive(Debug, Clone)]
pub struct CoverReader {
    client: Option<ChatClient>,
}

impl CoverReader {
    pub fn new(client: Option<ChatClient>) -> Self {
        Self { client }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    pub async fn read(&self, png_path: &Path) -> Result<CoverFields, AdapterError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AdapterError::Disabled("cover".to_string()))?;
        let png = tokio::fs::read(png_path)
            .await
            .with_context(|| format!("reading cover image {}", png_path.display()))?;
        let reply = client
            .complete_json(vec![ChatMessage::user_with_image(COVER_PROMPT, &png)])
            .await?;
        parse_cover_reply(&reply)
    }
}
