//! Pre-rendered page directories: `page_NNN.png` plus an optional `page_NNN.words.json`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::ocr::load_ocr_page;
use crate::{AdapterError, PageInput};

static PAGE_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^page_(\d+)\.png$").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFiles {
    pub page_number: u32,
    pub png_path: PathBuf,
    pub ocr_path: Option<PathBuf>,
}

pub fn ocr_path_for(png_path: &Path) -> PathBuf {
    png_path.with_extension("words.json")
}

#[derive(Debug, Clone)]
pub struct DirectoryPageSource {
    dir: PathBuf,
}

impl DirectoryPageSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All pages of the directory in page order.
    pub async fn scan(&self) -> Result<Vec<PageFiles>, AdapterError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("listing pages in {}", self.dir.display()))?;

        let mut pages = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing pages in {}", self.dir.display()))?
        {
            let name = entry.file_name();
            let Some(captures) = name.to_str().and_then(|n| PAGE_FILE_RE.captures(n)) else {
                continue;
            };
            let Ok(page_number) = captures[1].parse::<u32>() else {
                continue;
            };
            let png_path = entry.path();
            let ocr_path = ocr_path_for(&png_path);
            let ocr_path = tokio::fs::try_exists(&ocr_path)
                .await
                .unwrap_or(false)
                .then_some(ocr_path);
            pages.push(PageFiles {
                page_number,
                png_path,
                ocr_path,
            });
        }
        pages.sort_by_key(|p| p.page_number);
        Ok(pages)
    }

    /// Load a page for extraction. An unreadable OCR file leaves the page without OCR
    /// evidence rather than failing it.
    pub async fn load(&self, files: &PageFiles) -> PageInput {
        let ocr = match &files.ocr_path {
            Some(path) => match load_ocr_page(path).await {
                Ok(page) => Some(page),
                Err(err) => {
                    tracing::warn!(page_number = files.page_number, error = %err, "unreadable OCR page");
                    None
                }
            },
            None => None,
        };
        PageInput {
            page_number: files.page_number,
            png_path: files.png_path.clone(),
            ocr,
        }
    }
}
