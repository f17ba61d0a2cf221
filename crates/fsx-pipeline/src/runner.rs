//! Job runner: one tokio task per job, pages processed strictly in order.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fsx_adapters::{
    extract_page, parse_publication_date, ChatClient, CoverReader, DirectoryPageSource,
    ExtractionSource, NotesExtractor, PageInput,
};
use fsx_core::{JobMeta, JobStatus, PageKind};
use fsx_storage::{ArtifactStore, Store, StoreError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use crate::reconcile::Reconciler;

/// Lines at the top of a page that count as its heading.
pub const HEADER_LINES: usize = 12;
const NOTES_MARKER: &str = "notur";

static FOUR_DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{4}\b").expect("static regex"));
static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19\d{2}|20\d{2}|2100)\b").expect("static regex"));
static ID_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)[_-]").expect("static regex"));

/// Terminal job failures. Anything else is absorbed at page level.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("source document unavailable: {0}")]
    SourceUnavailable(String),
    #[error("anchor heading {token:?} not found on any page")]
    AnchorNotFound { token: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub job_id: i64,
    pub start_page: u32,
    pub end_page: u32,
    pub pages_reconciled: usize,
    pub notes_pages: usize,
    pub pages_skipped: usize,
}

/// First page whose heading has a line equal to, or starting with, the anchor token.
pub fn find_start_page(pages: &[PageInput], token: &str) -> Option<u32> {
    let token = token.trim().to_lowercase();
    if token.is_empty() {
        return None;
    }
    pages
        .iter()
        .find(|page| {
            header_lines(page)
                .iter()
                .any(|line| line.to_lowercase().starts_with(&token))
        })
        .map(|page| page.page_number)
}

pub fn is_notes_page(page: &PageInput) -> bool {
    header_lines(page)
        .iter()
        .any(|line| line.to_lowercase().contains(NOTES_MARKER))
}

fn header_lines(page: &PageInput) -> Vec<String> {
    page.ocr
        .as_ref()
        .map(|ocr| ocr.header_lines(HEADER_LINES))
        .unwrap_or_default()
}

/// Header fields from the cover page text and the document file name. Used as is without
/// a model, and as the fallback under whatever the model reads from the cover image.
pub fn extract_meta(cover_text: &str, document_name: &str) -> JobMeta {
    let company_name = cover_text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find(|line| line.chars().count() >= 3 && !FOUR_DIGITS_RE.is_match(line))
        .map(str::to_string);
    let publication_year = YEAR_RE.find(cover_text).map(|m| m.as_str().to_string());
    let file_name = Path::new(document_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(document_name);
    let pdf_idnumber = ID_PREFIX_RE
        .captures(file_name)
        .map(|c| c[1].to_string());
    JobMeta {
        company_name,
        publication_year,
        publication_date: parse_publication_date(cover_text),
        pdf_idnumber,
    }
}

/// Without a usable base source the first available source stands in, unreconciled.
pub fn select_sources(
    base: Arc<dyn ExtractionSource>,
    secondary: Option<Arc<dyn ExtractionSource>>,
) -> (Arc<dyn ExtractionSource>, Option<Arc<dyn ExtractionSource>>) {
    match secondary {
        Some(secondary) if !base.is_available() && secondary.is_available() => {
            warn!(
                base = base.source_id(),
                fallback = secondary.source_id(),
                "base source unavailable; running single-source"
            );
            (secondary, None)
        }
        Some(secondary) if !secondary.is_available() => (base, None),
        secondary => (base, secondary),
    }
}

#[derive(Clone)]
pub struct JobRunner {
    store: Store,
    artifacts: ArtifactStore,
    base: Arc<dyn ExtractionSource>,
    secondary: Option<Arc<dyn ExtractionSource>>,
    reconciler: Arc<dyn Reconciler>,
    notes: NotesExtractor,
    cover: CoverReader,
    anchor_token: String,
}

impl JobRunner {
    pub fn new(
        store: Store,
        artifacts: ArtifactStore,
        base: Arc<dyn ExtractionSource>,
        secondary: Option<Arc<dyn ExtractionSource>>,
        reconciler: Arc<dyn Reconciler>,
        anchor_token: impl Into<String>,
    ) -> Self {
        let (base, secondary) = select_sources(base, secondary);
        Self {
            store,
            artifacts,
            base,
            secondary,
            reconciler,
            notes: NotesExtractor::new(None),
            cover: CoverReader::new(None),
            anchor_token: anchor_token.into(),
        }
    }

    /// Read notes pages and the cover image with a vision model.
    pub fn with_chat(mut self, chat: Option<ChatClient>) -> Self {
        self.notes = NotesExtractor::new(chat.clone());
        self.cover = CoverReader::new(chat);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Register a job for a directory of rendered pages.
    pub async fn submit(&self, document_name: &str, pages_dir: &Path) -> Result<i64, StoreError> {
        self.store
            .create_job(document_name, &pages_dir.display().to_string())
            .await
    }

    /// Run a job on its own task. Jobs share nothing but the store.
    pub fn spawn(self: &Arc<Self>, job_id: i64) -> JoinHandle<Result<JobSummary, JobError>> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.run_job(job_id).await })
    }

    /// Run a job to completion and record its terminal status.
    pub async fn run_job(&self, job_id: i64) -> Result<JobSummary, JobError> {
        let span = info_span!("job", job_id);
        async {
            let outcome = self.process(job_id).await;
            let recorded = match &outcome {
                Ok(summary) => {
                    info!(
                        reconciled = summary.pages_reconciled,
                        notes = summary.notes_pages,
                        skipped = summary.pages_skipped,
                        "job complete"
                    );
                    self.store.finish_job(job_id, JobStatus::Complete, None).await
                }
                Err(err) => {
                    warn!(error = %err, "job failed");
                    self.store
                        .finish_job(job_id, JobStatus::Failed, Some(&err.to_string()))
                        .await
                }
            };
            if let Err(err) = recorded {
                warn!(error = %err, "could not record job status");
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn process(&self, job_id: i64) -> Result<JobSummary, JobError> {
        let job = self.store.job(job_id).await?;
        let source = DirectoryPageSource::new(&job.pages_dir);
        let files = source
            .scan()
            .await
            .map_err(|err| JobError::SourceUnavailable(format!("{}: {err}", job.pages_dir)))?;
        if files.is_empty() {
            return Err(JobError::SourceUnavailable(format!(
                "{}: no rendered pages",
                job.pages_dir
            )));
        }

        let mut pages = Vec::with_capacity(files.len());
        for file in &files {
            let ocr_path = file
                .ocr_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            self.store
                .upsert_page(job_id, file.page_number, &file.png_path.display().to_string(), &ocr_path)
                .await?;
            pages.push(source.load(file).await);
        }

        if let Some(cover) = pages.first() {
            let meta = self.read_meta(cover, &job.document_name).await;
            if let Err(err) = self.store.save_meta(job_id, &meta).await {
                warn!(error = %err, "could not save job meta");
            }
        }

        let start_page = find_start_page(&pages, &self.anchor_token).ok_or_else(|| {
            JobError::AnchorNotFound {
                token: self.anchor_token.clone(),
            }
        })?;
        let end_page = pages.last().map(|p| p.page_number).unwrap_or(start_page);
        self.store.set_job_range(job_id, start_page, end_page).await?;
        info!(start_page, end_page, "statement pages located");

        let mut summary = JobSummary {
            job_id,
            start_page,
            end_page,
            ..JobSummary::default()
        };
        for page in pages.iter().filter(|p| p.page_number >= start_page) {
            let span = info_span!("page", page_number = page.page_number);
            let result = async {
                if is_notes_page(page) {
                    self.process_notes(job_id, page).await?;
                    return Ok::<_, anyhow::Error>(PageKind::Notes);
                }
                self.process_page(job_id, page).await?;
                Ok(PageKind::Statement)
            }
            .instrument(span)
            .await;

            match result {
                Ok(PageKind::Notes) => summary.notes_pages += 1,
                Ok(PageKind::Statement) => summary.pages_reconciled += 1,
                Err(err) => {
                    warn!(page_number = page.page_number, error = %format_args!("{err:#}"), "page skipped");
                    summary.pages_skipped += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn read_meta(&self, cover: &PageInput, document_name: &str) -> JobMeta {
        let text = cover
            .ocr
            .as_ref()
            .map(|ocr| ocr.text_lines().join("\n"))
            .unwrap_or_default();
        let mut meta = extract_meta(&text, document_name);
        if self.cover.is_configured() {
            match self.cover.read(&cover.png_path).await {
                Ok(fields) => fields.apply_to(&mut meta),
                Err(err) => warn!(error = %err, "cover read failed; keeping text fields"),
            }
        }
        meta
    }

    async fn process_notes(&self, job_id: i64, page: &PageInput) -> anyhow::Result<()> {
        let extraction = self.notes.extract(page).await;
        self.archive(job_id, page.page_number, &extraction.source_id, extraction.raw.as_deref())
            .await;
        self.store
            .save_notes(job_id, page.page_number, &extraction.notes)
            .await
            .with_context(|| format!("saving notes page {}", page.page_number))?;
        info!(sections = extraction.notes.sections.len(), "notes page read");
        Ok(())
    }

    async fn process_page(&self, job_id: i64, page: &PageInput) -> anyhow::Result<()> {
        let base = extract_page(self.base.as_ref(), page).await;
        self.archive(job_id, page.page_number, &base.source_id, base.raw.as_deref())
            .await;

        let table = match &self.secondary {
            Some(secondary) => {
                let secondary = extract_page(secondary.as_ref(), page).await;
                self.archive(job_id, page.page_number, &secondary.source_id, secondary.raw.as_deref())
                    .await;
                self.reconciler.reconcile(&base.table, &secondary.table)
            }
            None => base.table,
        };

        self.store
            .save_page_table(job_id, page.page_number, PageKind::Statement, &table)
            .await
            .with_context(|| format!("saving page {}", page.page_number))?;
        info!(rows = table.len(), strategy = self.reconciler.name(), "page reconciled");
        Ok(())
    }

    async fn archive(&self, job_id: i64, page_number: u32, source_id: &str, raw: Option<&str>) {
        let Some(raw) = raw else {
            return;
        };
        if let Err(err) = self
            .artifacts
            .store_bytes(job_id, page_number, source_id, "json", raw.as_bytes())
            .await
        {
            warn!(source_id, error = %format_args!("{err:#}"), "could not archive payload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fsx_adapters::{AdapterError, OcrLayoutExtractor, SourceKind};
    use fsx_core::PageKind;
    use std::path::PathBuf;
    use tempfile::TempDir;

    use crate::reconcile::CoveragePenalty;

    struct Scripted {
        id: &'static str,
        available: bool,
        payload: &'static str,
    }

    #[async_trait]
    impl ExtractionSource for Scripted {
        fn source_id(&self) -> &str {
            self.id
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Vision
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn produce(&self, _page: &PageInput) -> Result<String, AdapterError> {
            if self.available {
                Ok(self.payload.to_string())
            } else {
                Err(AdapterError::Disabled(self.id.to_string()))
            }
        }
    }

    const BASE: &str = r#"{"page_title": "Rakstrarroknskapur", "years": ["2024", "2023"], "rows": {
        "X": {"Experian Value": "Revenue", "2024": "1.000", "2023": "900", "nota": "", "confidence_score": 0.9},
        "Y": {"Experian Value": "Other income", "2024": "50", "2023": "", "nota": "", "confidence_score": 0.4}}}"#;
    const SECONDARY: &str = r#"{"years": ["2024", "2023"], "rows": {
        "X": {"2024": "1.000", "confidence_score": 0.7},
        "Z": {"2024": "77", "confidence_score": 0.99}}}"#;

    fn write_page(dir: &Path, number: u32, text: &str) {
        std::fs::write(dir.join(format!("page_{number:03}.png")), b"png").unwrap();
        let ocr = serde_json::json!({ "page_number": number, "text": text });
        std::fs::write(dir.join(format!("page_{number:03}.words.json")), ocr.to_string()).unwrap();
    }

    fn document() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), 1, "ACME P/F\nÁrsfrásøgn 2024\n");
        write_page(dir.path(), 2, "Rakstrarroknskapur\nNota 2024 2023\nX 1.000 900\nY 50 0\n");
        write_page(dir.path(), 3, "Notur til roknskapin\n1. Nýttur roknskaparháttur\n");
        dir
    }

    async fn runner(
        base: Arc<dyn ExtractionSource>,
        secondary: Option<Arc<dyn ExtractionSource>>,
        artifacts: &Path,
    ) -> Arc<JobRunner> {
        let store = Store::in_memory().await.unwrap();
        Arc::new(JobRunner::new(
            store,
            ArtifactStore::new(artifacts),
            base,
            secondary,
            Arc::new(CoveragePenalty::default()),
            "Rakstrarroknskapur",
        ))
    }

    fn scripted(id: &'static str, payload: &'static str) -> Arc<dyn ExtractionSource> {
        Arc::new(Scripted {
            id,
            available: true,
            payload,
        })
    }

    #[tokio::test]
    async fn job_reconciles_statement_pages_from_the_anchor() {
        let doc = document();
        let artifacts = tempfile::tempdir().unwrap();
        let runner = runner(
            scripted("vision", BASE),
            Some(scripted("ocr_layout", SECONDARY)),
            artifacts.path(),
        )
        .await;
        let job_id = runner.submit("1234_acme.pdf", doc.path()).await.unwrap();

        let summary = runner.spawn(job_id).await.unwrap().unwrap();
        assert_eq!(summary.start_page, 2);
        assert_eq!(summary.end_page, 3);
        assert_eq!(summary.pages_reconciled, 1);
        assert_eq!(summary.notes_pages, 1);

        let store = runner.store();
        let job = store.job(job_id).await.unwrap();
        assert_eq!(job.status(), Some(JobStatus::Complete));
        assert_eq!(job.start_page, Some(2));

        let pages = store.pages(job_id).await.unwrap();
        assert_eq!(pages.len(), 3);
        assert!(pages[0].table.is_empty());

        let statement = &pages[1].table;
        assert_eq!(statement.rows.keys().collect::<Vec<_>>(), vec!["X", "Y"]);
        assert_eq!(statement.row("X").unwrap().confidence, 0.9);
        assert_eq!(statement.row("Y").unwrap().confidence, 0.2);
        assert!(statement.row("Z").is_none());

        assert_eq!(pages[2].kind, PageKind::Notes);
        assert!(pages[2].table.is_empty());
        let notes = pages[2].notes.as_ref().unwrap();
        assert_eq!(notes.page_title, "Notur til roknskapin");
        assert_eq!(notes.sections[0].paragraphs, vec!["1. Nýttur roknskaparháttur"]);

        let meta = store.meta(job_id).await.unwrap().unwrap();
        assert_eq!(meta.company_name.as_deref(), Some("ACME P/F"));
        assert_eq!(meta.publication_year.as_deref(), Some("2024"));
        assert_eq!(meta.pdf_idnumber.as_deref(), Some("1234"));

        assert!(artifacts.path().join("job_1/page_002/vision").is_dir());
        assert!(artifacts.path().join("job_1/page_002/ocr_layout").is_dir());
    }

    #[tokio::test]
    async fn missing_anchor_fails_the_job() {
        let doc = tempfile::tempdir().unwrap();
        write_page(doc.path(), 1, "ACME P/F\nÁrsfrásøgn 2024\n");
        let artifacts = tempfile::tempdir().unwrap();
        let runner = runner(scripted("vision", BASE), None, artifacts.path()).await;
        let job_id = runner.submit("acme.pdf", doc.path()).await.unwrap();

        let err = runner.run_job(job_id).await.unwrap_err();
        assert!(matches!(err, JobError::AnchorNotFound { .. }));
        let job = runner.store().job(job_id).await.unwrap();
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert!(job.error.unwrap().contains("Rakstrarroknskapur"));
    }

    #[tokio::test]
    async fn missing_directory_fails_only_that_job() {
        let doc = document();
        let artifacts = tempfile::tempdir().unwrap();
        let runner = runner(scripted("vision", BASE), None, artifacts.path()).await;
        let bad = runner
            .submit("gone.pdf", &PathBuf::from("/definitely/not/here"))
            .await
            .unwrap();
        let good = runner.submit("acme.pdf", doc.path()).await.unwrap();

        let bad_handle = runner.spawn(bad);
        let good_handle = runner.spawn(good);
        assert!(matches!(
            bad_handle.await.unwrap(),
            Err(JobError::SourceUnavailable(_))
        ));
        assert!(good_handle.await.unwrap().is_ok());
        assert_eq!(
            runner.store().job(good).await.unwrap().status(),
            Some(JobStatus::Complete)
        );
    }

    #[tokio::test]
    async fn unavailable_base_falls_back_to_ocr_layout() {
        let doc = document();
        let artifacts = tempfile::tempdir().unwrap();
        let disabled: Arc<dyn ExtractionSource> = Arc::new(Scripted {
            id: "vision",
            available: false,
            payload: "",
        });
        let runner = runner(
            disabled,
            Some(Arc::new(OcrLayoutExtractor::new("ocr_layout"))),
            artifacts.path(),
        )
        .await;
        let job_id = runner.submit("acme.pdf", doc.path()).await.unwrap();
        runner.run_job(job_id).await.unwrap();

        let page = runner.store().page(job_id, 2).await.unwrap();
        let row = page.table.row("X").unwrap();
        assert_eq!(row.value("2024"), Some("1.000"));
        assert_eq!(row.value("2023"), Some("900"));
    }

    #[tokio::test]
    async fn cover_fields_read_by_the_model_override_text_meta() {
        use fsx_adapters::ChatSettings;
        use fsx_storage::{BackoffPolicy, HttpClientConfig, JsonHttpClient};
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let cover_call = server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(serde_json::json!({"choices": [{"message": {
                    "content": "{\"company_name\": \"ACME Holding P/F\", \"publication_year\": null, \"publication_date\": \"20250314\"}"
                }}]}));
            })
            .await;
        let http = JsonHttpClient::new(HttpClientConfig {
            backoff: BackoffPolicy {
                retries: 0,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })
        .unwrap();
        let chat = ChatClient::new(
            Arc::new(http),
            ChatSettings {
                base_url: server.base_url(),
                api_key: "test-key".into(),
                model: "vision-test".into(),
            },
        );

        let doc = tempfile::tempdir().unwrap();
        write_page(doc.path(), 1, "ACME P/F\nÁrsfrásøgn 2024\n");
        write_page(doc.path(), 2, "Rakstrarroknskapur\nNota 2024 2023\nX 1.000 900\n");
        let artifacts = tempfile::tempdir().unwrap();
        let store = Store::in_memory().await.unwrap();
        let runner = Arc::new(
            JobRunner::new(
                store,
                ArtifactStore::new(artifacts.path()),
                scripted("vision", BASE),
                None,
                Arc::new(CoveragePenalty::default()),
                "Rakstrarroknskapur",
            )
            .with_chat(Some(chat)),
        );
        let job_id = runner.submit("55_acme.pdf", doc.path()).await.unwrap();
        runner.run_job(job_id).await.unwrap();
        cover_call.assert_async().await;

        let meta = runner.store().meta(job_id).await.unwrap().unwrap();
        assert_eq!(meta.company_name.as_deref(), Some("ACME Holding P/F"));
        assert_eq!(meta.publication_year.as_deref(), Some("2024"));
        assert_eq!(meta.publication_date.as_deref(), Some("20250314"));
        assert_eq!(meta.pdf_idnumber.as_deref(), Some("55"));
    }

    #[test]
    fn anchor_matches_line_prefix_case_insensitively() {
        let page = |n: u32, text: &str| PageInput {
            page_number: n,
            png_path: PathBuf::new(),
            ocr: Some(fsx_adapters::OcrPage {
                text: text.to_string(),
                ..Default::default()
            }),
        };
        let pages = vec![
            page(1, "Innihaldsyvirlit\nRakstrarroknskapur síða 4"),
            page(4, "ACME\nRAKSTRARROKNSKAPUR 2024"),
        ];
        assert_eq!(find_start_page(&pages, "Rakstrarroknskapur"), Some(1));
        assert_eq!(find_start_page(&pages[1..], "Rakstrarroknskapur"), Some(4));
        assert_eq!(find_start_page(&pages, "Fíggjarstøða"), None);
    }

    #[test]
    fn meta_comes_from_cover_text_and_file_name() {
        let meta = extract_meta("\n2024\nACME P/F\nÁrsfrásøgn 2023", "uploads/987-acme.pdf");
        assert_eq!(meta.company_name.as_deref(), Some("ACME P/F"));
        assert_eq!(meta.publication_year.as_deref(), Some("2024"));
        assert_eq!(meta.publication_date, None);
        assert_eq!(meta.pdf_idnumber.as_deref(), Some("987"));

        let meta = extract_meta("ACME P/F\nÁrsfrásøgn 2024\nTórshavn, 14. mars 2025", "acme.pdf");
        assert_eq!(meta.publication_year.as_deref(), Some("2024"));
        assert_eq!(meta.publication_date.as_deref(), Some("20250314"));

        let meta = extract_meta("", "acme.pdf");
        assert_eq!(meta, JobMeta::default());
    }
}
