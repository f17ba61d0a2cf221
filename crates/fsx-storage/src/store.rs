//! SQLite-backed job store. Every write is its own short transaction so that no job holds
//! a lock across a call to an external service.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use fsx_core::{
    DefaultField, FieldEdit, JobMeta, JobStatus, MatchCacheEntry, NotesPage, PageKind, RowEdit,
    RowRecord, RowTable,
};
use indexmap::IndexMap;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

use crate::cache::NewMatchEntry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("job {0} not found")]
    JobNotFound(i64),
    #[error("page {page_number} of job {job_id} not found")]
    PageNotFound { job_id: i64, page_number: u32 },
    #[error("page json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("edit key {0:?} is not a four digit year")]
    InvalidYear(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub document_name: String,
    pub pages_dir: String,
    pub start_page: Option<i64>,
    pub end_page: Option<i64>,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }
}

/// A persisted page with its reconciled table (empty when extraction produced nothing).
#[derive(Debug, Clone)]
pub struct StoredPage {
    pub page_number: u32,
    pub png_path: String,
    pub ocr_json_path: String,
    pub kind: PageKind,
    pub table: RowTable,
    pub fields: IndexMap<String, DefaultField>,
    /// Structured content of a notes page.
    pub notes: Option<NotesPage>,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_job(&self, document_name: &str, pages_dir: &str) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs(created_at, status, document_name, pages_dir)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now())
        .bind(JobStatus::InProgress.as_str())
        .bind(document_name)
        .bind(pages_dir)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn job(&self, job_id: i64) -> Result<JobRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        job_from_row(&row)
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn set_job_range(
        &self,
        job_id: i64,
        start_page: u32,
        end_page: u32,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET start_page = ?, end_page = ? WHERE id = ?")
            .bind(i64::from(start_page))
            .bind(i64::from(end_page))
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish_job(
        &self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET status = ?, error = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Register a rendered page; re-registering keeps any table already extracted.
    pub async fn upsert_page(
        &self,
        job_id: i64,
        page_number: u32,
        png_path: &str,
        ocr_json_path: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO job_pages(job_id, page_number, png_path, ocr_json_path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id, page_number) DO UPDATE SET
              png_path = excluded.png_path,
              ocr_json_path = excluded.ocr_json_path,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(job_id)
        .bind(i64::from(page_number))
        .bind(png_path)
        .bind(ocr_json_path)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_page_table(
        &self,
        job_id: i64,
        page_number: u32,
        kind: PageKind,
        table: &RowTable,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(table)?;
        let result = sqlx::query(
            r#"
            UPDATE job_pages
               SET extracted_json = ?, page_kind = ?, updated_at = ?
             WHERE job_id = ? AND page_number = ?
            "#,
        )
        .bind(json)
        .bind(kind.as_str())
        .bind(Utc::now())
        .bind(job_id)
        .bind(i64::from(page_number))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::PageNotFound {
                job_id,
                page_number,
            });
        }
        debug!(job_id, page_number, rows = table.len(), "page table saved");
        Ok(())
    }

    /// Store the extracted content of a notes page and mark the page as notes.
    pub async fn save_notes(
        &self,
        job_id: i64,
        page_number: u32,
        notes: &NotesPage,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(notes)?;
        let result = sqlx::query(
            r#"
            UPDATE job_pages
               SET notes_json = ?, page_kind = ?, updated_at = ?
             WHERE job_id = ? AND page_number = ?
            "#,
        )
        .bind(json)
        .bind(PageKind::Notes.as_str())
        .bind(Utc::now())
        .bind(job_id)
        .bind(i64::from(page_number))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::PageNotFound {
                job_id,
                page_number,
            });
        }
        debug!(job_id, page_number, sections = notes.sections.len(), "notes saved");
        Ok(())
    }

    pub async fn page(&self, job_id: i64, page_number: u32) -> Result<StoredPage, StoreError> {
        let row = sqlx::query("SELECT * FROM job_pages WHERE job_id = ? AND page_number = ?")
            .bind(job_id)
            .bind(i64::from(page_number))
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::PageNotFound {
                job_id,
                page_number,
            })?;
        page_from_row(&row)
    }

    /// All pages of a job in page order.
    pub async fn pages(&self, job_id: i64) -> Result<Vec<StoredPage>, StoreError> {
        let rows = sqlx::query("SELECT * FROM job_pages WHERE job_id = ? ORDER BY page_number ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(page_from_row).collect()
    }

    /// Apply a correction to one tabular row, creating the row if it does not exist yet.
    pub async fn apply_row_edit(
        &self,
        job_id: i64,
        page_number: u32,
        item: &str,
        edit: &RowEdit,
    ) -> Result<RowRecord, StoreError> {
        if let Some(key) = edit.invalid_year_key() {
            return Err(StoreError::InvalidYear(key.to_string()));
        }
        let mut tx = self.pool.begin().await?;
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT extracted_json FROM job_pages WHERE job_id = ? AND page_number = ?",
        )
        .bind(job_id)
        .bind(i64::from(page_number))
        .fetch_optional(&mut *tx)
        .await?;
        let raw = raw.ok_or(StoreError::PageNotFound {
            job_id,
            page_number,
        })?;

        let mut table = parse_table(&raw)?;
        let updated = table.apply_edit(item, edit).clone();

        sqlx::query(
            "UPDATE job_pages SET extracted_json = ?, updated_at = ? WHERE job_id = ? AND page_number = ?",
        )
        .bind(serde_json::to_string(&table)?)
        .bind(Utc::now())
        .bind(job_id)
        .bind(i64::from(page_number))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Apply a correction to a free-standing field of a page.
    pub async fn apply_field_edit(
        &self,
        job_id: i64,
        page_number: u32,
        item: &str,
        edit: &FieldEdit,
    ) -> Result<DefaultField, StoreError> {
        let mut tx = self.pool.begin().await?;
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT fields_json FROM job_pages WHERE job_id = ? AND page_number = ?",
        )
        .bind(job_id)
        .bind(i64::from(page_number))
        .fetch_optional(&mut *tx)
        .await?;
        let raw = raw.ok_or(StoreError::PageNotFound {
            job_id,
            page_number,
        })?;

        let mut fields = parse_fields(&raw)?;
        let field = fields.entry(item.to_string()).or_default();
        field.apply_edit(edit);
        let updated = field.clone();

        sqlx::query(
            "UPDATE job_pages SET fields_json = ?, updated_at = ? WHERE job_id = ? AND page_number = ?",
        )
        .bind(serde_json::to_string(&fields)?)
        .bind(Utc::now())
        .bind(job_id)
        .bind(i64::from(page_number))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn save_meta(&self, job_id: i64, meta: &JobMeta) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO job_meta(job_id, company_name, publication_year, publication_date, pdf_idnumber)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(&meta.company_name)
        .bind(&meta.publication_year)
        .bind(&meta.publication_date)
        .bind(&meta.pdf_idnumber)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn meta(&self, job_id: i64) -> Result<Option<JobMeta>, StoreError> {
        let row = sqlx::query("SELECT * FROM job_meta WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<JobMeta, StoreError> {
            Ok(JobMeta {
                company_name: row.try_get("company_name")?,
                publication_year: row.try_get("publication_year")?,
                publication_date: row.try_get("publication_date")?,
                pdf_idnumber: row.try_get("pdf_idnumber")?,
            })
        })
        .transpose()
    }

    /// Most recent cache row for an exact (verbatim) source label.
    pub async fn latest_match(
        &self,
        source_label: &str,
    ) -> Result<Option<MatchCacheEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM taxonomy_match_cache
             WHERE source_label = ?
             ORDER BY id DESC
             LIMIT 1
            "#,
        )
        .bind(source_label)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(match_from_row).transpose()
    }

    pub async fn match_history(&self, source_label: &str) -> Result<Vec<MatchCacheEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM taxonomy_match_cache WHERE source_label = ? ORDER BY id ASC")
            .bind(source_label)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(match_from_row).collect()
    }

    pub async fn insert_match(&self, entry: &NewMatchEntry) -> Result<MatchCacheEntry, StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO taxonomy_match_cache(source_label, normalized_label, matched_field, confidence, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.source_label)
        .bind(&entry.normalized_label)
        .bind(&entry.matched_field)
        .bind(entry.confidence)
        .bind(&entry.reason)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(entry.clone().into_entry(result.last_insert_rowid(), created_at))
    }
}

/// Stored page json. A row that no longer deserializes is an error, never an empty table
/// that the next write would persist.
fn parse_table(raw: &str) -> Result<RowTable, StoreError> {
    if raw.trim().is_empty() {
        return Ok(RowTable::empty());
    }
    Ok(serde_json::from_str(raw)?)
}

fn parse_fields(raw: &str) -> Result<IndexMap<String, DefaultField>, StoreError> {
    if raw.trim().is_empty() {
        return Ok(IndexMap::new());
    }
    Ok(serde_json::from_str(raw)?)
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord, StoreError> {
    Ok(JobRecord {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        status: row.try_get("status")?,
        document_name: row.try_get("document_name")?,
        pages_dir: row.try_get("pages_dir")?,
        start_page: row.try_get("start_page")?,
        end_page: row.try_get("end_page")?,
        error: row.try_get("error")?,
    })
}

fn page_from_row(row: &SqliteRow) -> Result<StoredPage, StoreError> {
    let page_number: i64 = row.try_get("page_number")?;
    let kind: String = row.try_get("page_kind")?;
    let extracted: String = row.try_get("extracted_json")?;
    let fields: String = row.try_get("fields_json")?;
    let notes: String = row.try_get("notes_json")?;
    Ok(StoredPage {
        page_number: u32::try_from(page_number).unwrap_or_default(),
        png_path: row.try_get("png_path")?,
        ocr_json_path: row.try_get("ocr_json_path")?,
        kind: PageKind::parse(&kind),
        table: if extracted.trim().is_empty() {
            RowTable::default()
        } else {
            parse_table(&extracted)?
        },
        fields: parse_fields(&fields)?,
        notes: if notes.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str(&notes)?)
        },
    })
}

fn match_from_row(row: &SqliteRow) -> Result<MatchCacheEntry, StoreError> {
    let confidence: Option<f64> = row.try_get("confidence")?;
    let reason: Option<String> = row.try_get("reason")?;
    Ok(MatchCacheEntry {
        id: row.try_get("id")?,
        source_label: row.try_get("source_label")?,
        normalized_label: row.try_get("normalized_label")?,
        matched_field: row.try_get("matched_field")?,
        confidence: fsx_core::clamp_confidence(confidence.unwrap_or_default()),
        reason: reason.unwrap_or_default(),
        created_at: row.try_get("created_at")?,
    })
}
