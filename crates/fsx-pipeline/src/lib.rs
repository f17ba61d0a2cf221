//! Statement extraction pipeline: reconciliation, consolidation, taxonomy matching,
//! job orchestration and export.

pub mod config;
pub mod consolidate;
pub mod export;
pub mod matcher;
pub mod reconcile;
pub mod runner;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use fsx_adapters::{source_for_kind, ChatClient, ChatSettings, ExtractionSource};
use fsx_storage::{ArtifactStore, HttpClientConfig, JsonHttpClient, MatchCache, Store};

pub use config::{
    load_taxonomy_template, LlmConfig, PipelineConfig, ReconcileStrategyKind, SourceConfig,
    SourceRegistry,
};
pub use consolidate::{consolidate, export_label};
pub use export::{build_export, ExportTable, FieldRow, LabelRow};
pub use matcher::{
    normalize_label, Arbiter, ArbiterChoice, ArbitrationError, ChatArbiter, TaxonomyMatcher,
};
pub use reconcile::{reconciler_for, CoveragePenalty, FieldConfidenceMerge, Reconciler};
pub use runner::{JobError, JobRunner, JobSummary};

pub const CRATE_NAME: &str = "fsx-pipeline";

/// Fully wired pipeline: store, job runner and taxonomy matcher built from one config.
pub struct Pipeline {
    config: PipelineConfig,
    store: Store,
    runner: Arc<JobRunner>,
    matcher: TaxonomyMatcher,
}

impl Pipeline {
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let store = open_store(&config.database_url).await?;
        let chat = chat_client(&config)?;

        let registry = SourceRegistry::load(&config.sources_path()).await?;
        let base_config = registry
            .base()
            .context("source registry has no enabled base source")?;
        let base: Arc<dyn ExtractionSource> =
            Arc::from(source_for_kind(&base_config.source_id, base_config.kind, chat.clone()));
        let secondary: Option<Arc<dyn ExtractionSource>> = registry
            .secondary()
            .map(|s| Arc::from(source_for_kind(&s.source_id, s.kind, chat.clone())));

        let runner = JobRunner::new(
            store.clone(),
            ArtifactStore::new(config.artifacts_dir.clone()),
            base,
            secondary,
            Arc::from(reconciler_for(config.strategy)),
            config.anchor_token.clone(),
        )
        .with_chat(chat.clone());

        let matcher = build_matcher(&config, &store, chat)?;

        Ok(Self {
            config,
            store,
            runner: Arc::new(runner),
            matcher,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn matcher(&self) -> &TaxonomyMatcher {
        &self.matcher
    }

    /// Register a document and run it on its own task until it finishes.
    pub async fn run_document(&self, document_name: &str, pages_dir: &Path) -> Result<JobSummary> {
        let job_id = self.runner.submit(document_name, pages_dir).await?;
        let summary = self
            .runner
            .spawn(job_id)
            .await
            .context("job task panicked")??;
        Ok(summary)
    }

    pub async fn export(&self, job_id: i64) -> Result<ExportTable> {
        self.store.job(job_id).await?;
        let export = build_export(&self.store, &self.matcher, job_id, &self.config.export_years)
            .await
            .with_context(|| format!("building export for job {job_id}"))?;
        Ok(export)
    }
}

/// Connect and migrate, creating the parent directory of a file-backed database.
pub async fn open_store(database_url: &str) -> Result<Store> {
    if let Some(parent) = sqlite_file_path(database_url).and_then(|p| p.parent().map(Path::to_path_buf)) {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(&parent)
                .await
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
    }
    let store = Store::connect(database_url)
        .await
        .with_context(|| format!("connecting to {database_url}"))?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Matcher over the configured taxonomy, backed by the store's match cache. Without a
/// chat client labels fall through to the local heuristic.
pub fn build_matcher(
    config: &PipelineConfig,
    store: &Store,
    chat: Option<ChatClient>,
) -> Result<TaxonomyMatcher> {
    let schema = load_taxonomy_template(&config.taxonomy_path())?;
    let arbiter = chat.map(|client| Arc::new(ChatArbiter::new(client)) as Arc<dyn Arbiter>);
    let cache: Arc<dyn MatchCache> = Arc::new(store.clone());
    Ok(TaxonomyMatcher::new(Arc::new(schema), cache, arbiter))
}

/// Chat client for extraction and arbitration, or `None` when no API key is configured.
pub fn chat_client(config: &PipelineConfig) -> Result<Option<ChatClient>> {
    let Some(api_key) = config.llm.api_key.clone() else {
        return Ok(None);
    };
    let http = JsonHttpClient::new(HttpClientConfig {
        timeout: config.http_timeout,
        ..Default::default()
    })?;
    Ok(Some(ChatClient::new(
        Arc::new(http),
        ChatSettings {
            base_url: config.llm.base_url.clone(),
            api_key,
            model: config.llm.model.clone(),
        },
    )))
}
