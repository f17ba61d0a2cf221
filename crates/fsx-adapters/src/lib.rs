//! Extraction source contracts, the two statement extractors (OCR layout and vision) and
//! the readers for notes pages and the cover page.
//!
//! Every producer hands back raw payload text; [`extract_page`] is the single boundary
//! where that text becomes a [`RowTable`] and where producer failures are absorbed.

pub mod chat;
pub mod cover;
pub mod notes;
pub mod ocr;
pub mod pages;
pub mod payload;
pub mod vision;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fsx_core::RowTable;
use fsx_storage::FetchError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use chat::{ChatClient, ChatMessage, ChatSettings};
pub use cover::{parse_cover_reply, parse_publication_date, CoverFields, CoverReader};
pub use notes::{normalize_amount, notes_from_ocr, parse_notes_page, NotesExtraction, NotesExtractor};
pub use ocr::{load_ocr_page, parse_ocr_page, OcrLayoutExtractor, OcrLine, OcrPage, OcrWord};
pub use pages::{DirectoryPageSource, PageFiles};
pub use payload::{normalize_table, parse_row_table, row_table_from_value};
pub use vision::VisionExtractor;

pub const CRATE_NAME: &str = "fsx-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Text and coordinate evidence from OCR.
    OcrLayout,
    /// Full-page visual inspection by a vision model.
    Vision,
}

/// Which side of the reconciliation a source feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Base,
    Secondary,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source {0} is not configured")]
    Disabled(String),
    #[error("missing input: {0}")]
    MissingInput(&'static str),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("producer returned no content")]
    EmptyResponse,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One rendered page as seen by the extractors.
#[derive(Debug, Clone)]
pub struct PageInput {
    pub page_number: u32,
    pub png_path: PathBuf,
    pub ocr: Option<OcrPage>,
}

#[async_trait]
pub trait ExtractionSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    /// False when the producer cannot run at all (e.g. no credentials).
    fn is_available(&self) -> bool {
        true
    }

    /// Raw payload for the page, in the page JSON shape (possibly wrapped in noise).
    async fn produce(&self, page: &PageInput) -> Result<String, AdapterError>;
}

/// Result of running one source over one page. `raw` keeps the payload for audit even
/// when it could not be parsed.
#[derive(Debug, Clone)]
pub struct PageExtraction {
    pub source_id: String,
    pub table: RowTable,
    pub raw: Option<String>,
}

impl PageExtraction {
    pub fn succeeded(&self) -> bool {
        self.raw.is_some() && !self.table.is_empty()
    }
}

/// Run a source over a page. Producer errors and unparseable payloads become an empty
/// table; this never fails.
pub async fn extract_page(source: &dyn ExtractionSource, page: &PageInput) -> PageExtraction {
    let source_id = source.source_id().to_string();
    let raw = match source.produce(page).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(
                source_id = %source_id,
                page_number = page.page_number,
                error = %err,
                "extraction failed; using empty table"
            );
            return PageExtraction {
                source_id,
                table: RowTable::empty(),
                raw: None,
            };
        }
    };

    let table = match parse_row_table(&raw) {
        Ok(table) => table,
        Err(err) => {
            warn!(
                source_id = %source_id,
                page_number = page.page_number,
                error = %err,
                "unparseable extraction payload; using empty table"
            );
            RowTable::empty()
        }
    };
    debug!(source_id = %source_id, page_number = page.page_number, rows = table.len(), "page extracted");
    PageExtraction {
        source_id,
        table,
        raw: Some(raw),
    }
}

pub fn source_for_kind(
    source_id: &str,
    kind: SourceKind,
    chat: Option<ChatClient>,
) -> Box<dyn ExtractionSource> {
    match kind {
        SourceKind::OcrLayout => Box::new(OcrLayoutExtractor::new(source_id)),
        SourceKind::Vision => Box::new(VisionExtractor::new(source_id, chat)),
    }
}

/// Read and deserialize a JSON file (fixtures, recorded payloads).
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<&'static str, &'static str>);

    #[async_trait]
    impl ExtractionSource for Fixed {
        fn source_id(&self) -> &str {
            "fixed"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Vision
        }

        async fn produce(&self, _page: &PageInput) -> Result<String, AdapterError> {
            self.0
                .map(str::to_string)
                .map_err(|msg| AdapterError::MalformedPayload(msg.to_string()))
        }
    }

    fn page() -> PageInput {
        PageInput {
            page_number: 3,
            png_path: PathBuf::from("page_003.png"),
            ocr: None,
        }
    }

    #[tokio::test]
    async fn producer_errors_become_empty_tables() {
        let out = extract_page(&Fixed(Err("boom")), &page()).await;
        assert!(out.table.is_empty());
        assert_eq!(out.table.years, fsx_core::default_years());
        assert!(out.raw.is_none());
        assert!(!out.succeeded());
    }

    #[tokio::test]
    async fn unparseable_payloads_are_kept_for_audit() {
        let out = extract_page(&Fixed(Ok("sorry, I cannot read this page")), &page()).await;
        assert!(out.table.is_empty());
        assert_eq!(out.raw.as_deref(), Some("sorry, I cannot read this page"));
    }

    #[tokio::test]
    async fn payloads_are_parsed() {
        let raw = r#"{"years": ["2024"], "rows": {"Ogn": {"2024": "5", "confidence_score": 0.5}}}"#;
        let out = extract_page(&Fixed(Ok(raw)), &page()).await;
        assert!(out.succeeded());
        assert_eq!(out.table.row("Ogn").unwrap().confidence, 0.5);
    }

    #[tokio::test]
    async fn ocr_source_without_ocr_input_yields_empty_table() {
        let source = source_for_kind("ocr", SourceKind::OcrLayout, None);
        assert_eq!(source.kind(), SourceKind::OcrLayout);
        let out = extract_page(source.as_ref(), &page()).await;
        assert!(out.table.is_empty());
    }

    #[test]
    fn source_kinds_use_snake_case() {
        let kind: SourceKind = serde_json::from_str("\"ocr_layout\"").unwrap();
        assert_eq!(kind, SourceKind::OcrLayout);
        let role: SourceRole = serde_json::from_str("\"secondary\"").unwrap();
        assert_eq!(role, SourceRole::Secondary);
    }
}
