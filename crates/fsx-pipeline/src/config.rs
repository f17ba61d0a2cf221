use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fsx_adapters::{SourceKind, SourceRole};
use fsx_core::{default_years, is_year_key, TaxonomySchema};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    pub role: SourceRole,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn base(&self) -> Option<&SourceConfig> {
        self.enabled().find(|s| s.role == SourceRole::Base)
    }

    pub fn secondary(&self) -> Option<&SourceConfig> {
        self.enabled().find(|s| s.role == SourceRole::Secondary)
    }

    fn validate(&self) -> Result<()> {
        let bases = self.enabled().filter(|s| s.role == SourceRole::Base).count();
        if bases != 1 {
            bail!("expected exactly one enabled base source, found {bases}");
        }
        if self.enabled().filter(|s| s.role == SourceRole::Secondary).count() > 1 {
            bail!("at most one enabled secondary source is supported");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStrategyKind {
    /// Field-level merge where the lower-confidence side wins contested fields.
    FieldConfidence,
    /// Base table kept as-is, rows missing from the secondary are penalized.
    #[default]
    CoveragePenalty,
}

impl ReconcileStrategyKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "field_confidence" => Some(Self::FieldConfidence),
            "coverage_penalty" => Some(Self::CoveragePenalty),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FieldConfidence => "field_confidence",
            Self::CoveragePenalty => "coverage_penalty",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub taxonomy_template: PathBuf,
    pub export_years: Vec<String>,
    pub anchor_token: String,
    pub strategy: ReconcileStrategyKind,
    pub llm: LlmConfig,
    pub http_timeout: Duration,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            database_url: get("FSX_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/fsx.db?mode=rwc".to_string()),
            artifacts_dir: get("FSX_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/artifacts")),
            workspace_root: get("FSX_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            taxonomy_template: get("FSX_TAXONOMY_TEMPLATE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("taxonomy_template.csv")),
            export_years: get("FSX_EXPORT_YEARS")
                .map(|v| parse_years(&v))
                .filter(|years| !years.is_empty())
                .unwrap_or_else(default_years),
            anchor_token: get("FSX_ANCHOR_TOKEN")
                .unwrap_or_else(|| "Rakstrarroknskapur".to_string()),
            strategy: get("FSX_RECONCILE_STRATEGY")
                .and_then(|v| ReconcileStrategyKind::parse(&v))
                .unwrap_or_default(),
            llm: LlmConfig {
                api_key: get("OPENAI_API_KEY"),
                base_url: get("FSX_LLM_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                model: get("FSX_LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            },
            http_timeout: Duration::from_secs(
                get("FSX_HTTP_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn taxonomy_path(&self) -> PathBuf {
        if self.taxonomy_template.is_absolute() {
            self.taxonomy_template.clone()
        } else {
            self.workspace_root.join(&self.taxonomy_template)
        }
    }
}

fn parse_years(value: &str) -> Vec<String> {
    let mut years: Vec<String> = Vec::new();
    for year in value.split(',').map(str::trim) {
        if is_year_key(year) && !years.iter().any(|y| y == year) {
            years.push(year.to_string());
        }
    }
    years
}

/// Read the export schema from a template CSV whose header row lists the canonical fields.
pub fn load_taxonomy_template(path: &Path) -> Result<TaxonomySchema> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening taxonomy template {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?;
    let schema = TaxonomySchema::new(headers.iter().map(|h| h.trim_start_matches('\u{feff}')));
    if schema.is_empty() {
        bail!("taxonomy template {} has no fields", path.display());
    }
    Ok(schema)
}
