//! Resolves free-text line item labels onto the canonical taxonomy.
//!
//! Order of resolution: match cache, normalized exact match, similarity shortlist handed to
//! an arbiter (or the local heuristic when no arbiter is configured or it fails). Every
//! fresh resolution, including "no match", is appended to the cache under the verbatim
//! label, but only a cached field that is still in the taxonomy is served back.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fsx_adapters::{AdapterError, ChatClient, ChatMessage};
use fsx_core::{clamp_confidence, MatchMethod, MatchResolution, TaxonomySchema};
use fsx_storage::{MatchCache, NewMatchEntry};
use indexmap::IndexMap;
use serde_json::Value;
use strsim::{jaro_winkler, sorensen_dice};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const SHORTLIST_SIZE: usize = 20;
pub const CONTAINMENT_SCORE: f64 = 0.85;
pub const HEURISTIC_THRESHOLD: f64 = 0.35;

/// Lower-case, `&` to `and`, runs of non-alphanumerics collapsed to one space.
pub fn normalize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_space = false;
    for ch in label.replace('&', " and ").chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// Similarity of two normalized labels in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    0.6 * sorensen_dice(a, b) + 0.4 * jaro_winkler(a, b)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub field: String,
    pub score: f64,
}

/// Best `limit` fields by similarity to the normalized label; ties keep schema order.
pub fn shortlist(normalized: &str, schema: &TaxonomySchema, limit: usize) -> Vec<Candidate> {
    let mut scored: Vec<Candidate> = schema
        .fields()
        .iter()
        .map(|field| Candidate {
            field: field.clone(),
            score: similarity(normalized, &normalize_label(field)),
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(limit);
    scored
}

fn char_overlap(a: &str, b: &str) -> f64 {
    let a: HashSet<char> = a.chars().filter(|c| !c.is_whitespace()).collect();
    let b: HashSet<char> = b.chars().filter(|c| !c.is_whitespace()).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Local fallback when arbitration is unavailable: containment scores
/// [`CONTAINMENT_SCORE`], anything else the character-set overlap. The best candidate is
/// accepted from [`HEURISTIC_THRESHOLD`] up.
pub fn local_heuristic(normalized: &str, candidates: &[Candidate]) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;
    for candidate in candidates {
        let field = normalize_label(&candidate.field);
        let score = if !field.is_empty()
            && !normalized.is_empty()
            && (field.contains(normalized) || normalized.contains(&field))
        {
            CONTAINMENT_SCORE
        } else {
            char_overlap(normalized, &field)
        };
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(Candidate {
                field: candidate.field.clone(),
                score,
            });
        }
    }
    best.filter(|b| b.score >= HEURISTIC_THRESHOLD)
}

#[derive(Debug, Error)]
pub enum ArbitrationError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("malformed arbitration reply: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterChoice {
    pub field: Option<String>,
    pub confidence: f64,
    pub reason: String,
}

/// External service that picks at most one field from a shortlist.
#[async_trait]
pub trait Arbiter: Send + Sync {
    async fn choose(&self, label: &str, candidates: &[String]) -> Result<ArbiterChoice, ArbitrationError>;
}

const ARBITER_PROMPT: &str = "You map line items from financial statements onto a fixed \
taxonomy. Choose exactly one field from the candidate list that means the same thing as the \
label, or null when none fits. Reply with JSON only: \
{\"field\": <candidate or null>, \"confidence\": <0..1>, \"reason\": \"<short reason>\"}";

#[derive(Debug, Clone)]
pub struct ChatArbiter {
    client: ChatClient,
}

impl ChatArbiter {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Arbiter for ChatArbiter {
    async fn choose(&self, label: &str, candidates: &[String]) -> Result<ArbiterChoice, ArbitrationError> {
        let question = serde_json::json!({ "label": label, "candidates": candidates });
        let content = self
            .client
            .complete_json(vec![
                ChatMessage::system(ARBITER_PROMPT),
                ChatMessage::user(question.to_string()),
            ])
            .await?;
        parse_arbiter_reply(&content)
    }
}

pub fn parse_arbiter_reply(content: &str) -> Result<ArbiterChoice, ArbitrationError> {
    let value: Value = match serde_json::from_str(content) {
        Ok(value) => value,
        Err(err) => {
            let start = content.find('{');
            let end = content.rfind('}');
            match (start, end) {
                (Some(start), Some(end)) if end > start => serde_json::from_str(&content[start..=end])
                    .map_err(|e| ArbitrationError::Malformed(e.to_string()))?,
                _ => return Err(ArbitrationError::Malformed(err.to_string())),
            }
        }
    };
    let object = value
        .as_object()
        .ok_or_else(|| ArbitrationError::Malformed("reply is not an object".into()))?;

    let field = object
        .get("field")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|f| !f.is_empty() && !f.eq_ignore_ascii_case("null") && !f.eq_ignore_ascii_case("none"))
        .map(str::to_string);
    let confidence = match object.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    let reason = object
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(ArbiterChoice {
        field,
        confidence: clamp_confidence(confidence),
        reason,
    })
}

pub struct TaxonomyMatcher {
    schema: Arc<TaxonomySchema>,
    cache: Arc<dyn MatchCache>,
    arbiter: Option<Arc<dyn Arbiter>>,
}

impl TaxonomyMatcher {
    pub fn new(
        schema: Arc<TaxonomySchema>,
        cache: Arc<dyn MatchCache>,
        arbiter: Option<Arc<dyn Arbiter>>,
    ) -> Self {
        Self {
            schema,
            cache,
            arbiter,
        }
    }

    pub fn schema(&self) -> &TaxonomySchema {
        &self.schema
    }

    pub async fn resolve(&self, label: &str) -> MatchResolution {
        if label.trim().is_empty() || self.schema.is_empty() {
            return MatchResolution::no_match("empty label or candidate list");
        }
        let span = info_span!("resolve_label", label);
        async {
            if let Some(cached) = self.from_cache(label).await {
                return cached;
            }
            let normalized = normalize_label(label);
            let resolution = self.resolve_fresh(label, &normalized).await;
            self.remember(label, &normalized, &resolution).await;
            resolution
        }
        .instrument(span)
        .await
    }

    /// Resolve labels one after another, keeping their order.
    pub async fn resolve_all<'a>(
        &self,
        labels: impl IntoIterator<Item = &'a str>,
    ) -> IndexMap<String, MatchResolution> {
        let mut out = IndexMap::new();
        for label in labels {
            if out.contains_key(label) {
                continue;
            }
            let resolution = self.resolve(label).await;
            out.insert(label.to_string(), resolution);
        }
        out
    }

    async fn from_cache(&self, label: &str) -> Option<MatchResolution> {
        let entry = match self.cache.latest(label).await {
            Ok(entry) => entry?,
            Err(err) => {
                warn!(error = %err, "match cache lookup failed");
                return None;
            }
        };
        match entry.matched_field {
            Some(field) if self.schema.contains(&field) => Some(MatchResolution {
                field: Some(field),
                confidence: clamp_confidence(entry.confidence),
                reason: entry.reason,
                method: MatchMethod::Cache,
            }),
            Some(field) => {
                debug!(field = %field, "cached field is no longer in the taxonomy");
                None
            }
            // A recorded no-match names no candidate; the taxonomy may have grown since.
            None => None,
        }
    }

    async fn resolve_fresh(&self, label: &str, normalized: &str) -> MatchResolution {
        if let Some(field) = self
            .schema
            .fields()
            .iter()
            .find(|field| normalize_label(field) == normalized)
        {
            return MatchResolution {
                field: Some(field.clone()),
                confidence: 1.0,
                reason: "direct".to_string(),
                method: MatchMethod::Direct,
            };
        }

        let candidates = shortlist(normalized, &self.schema, SHORTLIST_SIZE);
        if let Some(arbiter) = &self.arbiter {
            let names: Vec<String> = candidates.iter().map(|c| c.field.clone()).collect();
            match arbiter.choose(label, &names).await {
                Ok(choice) => return arbitrated(choice, &names),
                Err(err) => warn!(error = %err, "arbitration failed; using local heuristic"),
            }
        }

        match local_heuristic(normalized, &candidates) {
            Some(best) => MatchResolution {
                field: Some(best.field),
                confidence: clamp_confidence(best.score),
                reason: format!("local heuristic score {:.2}", best.score),
                method: MatchMethod::Heuristic,
            },
            None => MatchResolution::no_match("no candidate above heuristic threshold"),
        }
    }

    async fn remember(&self, label: &str, normalized: &str, resolution: &MatchResolution) {
        let entry = NewMatchEntry {
            source_label: label.to_string(),
            normalized_label: normalized.to_string(),
            matched_field: resolution.field.clone(),
            confidence: resolution.confidence,
            reason: resolution.reason.clone(),
        };
        if let Err(err) = self.cache.append(entry).await {
            warn!(error = %err, "could not persist match resolution");
        }
    }
}

fn arbitrated(choice: ArbiterChoice, offered: &[String]) -> MatchResolution {
    match choice.field {
        Some(field) if offered.contains(&field) => MatchResolution {
            field: Some(field),
            confidence: clamp_confidence(choice.confidence),
            reason: choice.reason,
            method: MatchMethod::Arbitrated,
        },
        Some(field) => MatchResolution::no_match(format!("arbiter chose unknown field {field}")),
        None => MatchResolution::no_match(if choice.reason.is_empty() {
            "arbiter found no match".to_string()
        } else {
            choice.reason
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fsx_storage::{MemoryMatchCache, Store};

    struct StubArbiter {
        answer: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl StubArbiter {
        fn new(answer: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Arbiter for StubArbiter {
        async fn choose(&self, _label: &str, _candidates: &[String]) -> Result<ArbiterChoice, ArbitrationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ArbiterChoice {
                field: self.answer.map(str::to_string),
                confidence: 0.8,
                reason: "stub".into(),
            })
        }
    }

    struct FailingArbiter;

    #[async_trait]
    impl Arbiter for FailingArbiter {
        async fn choose(&self, _label: &str, _candidates: &[String]) -> Result<ArbiterChoice, ArbitrationError> {
            Err(ArbitrationError::Malformed("offline".into()))
        }
    }

    fn schema() -> Arc<TaxonomySchema> {
        Arc::new(TaxonomySchema::new([
            "Revenue",
            "Cost_Of_Sales",
            "Staff_Costs",
            "Total_Assets",
            "Profit_And_Loss",
        ]))
    }

    #[test]
    fn normalization_collapses_punctuation_and_ampersands() {
        assert_eq!(normalize_label("Total_Assets"), "total assets");
        assert_eq!(normalize_label("  Total   Assets: "), "total assets");
        assert_eq!(normalize_label("Profit & Loss"), "profit and loss");
        assert_eq!(normalize_label("Ogn í alt"), "ogn í alt");
    }

    #[test]
    fn shortlist_is_capped_and_sorted() {
        let fields: Vec<String> = (0..30).map(|i| format!("Field_{i}")).collect();
        let schema = TaxonomySchema::new(fields);
        let list = shortlist("field 7", &schema, SHORTLIST_SIZE);
        assert_eq!(list.len(), SHORTLIST_SIZE);
        assert_eq!(list[0].field, "Field_7");
        assert!(list.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn heuristic_accepts_containment_and_rejects_noise() {
        let candidates = vec![
            Candidate { field: "Revenue".into(), score: 0.5 },
            Candidate { field: "Total_Assets".into(), score: 0.4 },
        ];
        let best = local_heuristic("revenue from sales", &candidates).unwrap();
        assert_eq!(best.field, "Revenue");
        assert_eq!(best.score, CONTAINMENT_SCORE);
        assert!(local_heuristic("xyz", &candidates).is_none());
    }

    #[tokio::test]
    async fn normalized_exact_match_never_reaches_the_arbiter() {
        let arbiter = StubArbiter::new(Some("Revenue"));
        let cache = Arc::new(MemoryMatchCache::new());
        let matcher = TaxonomyMatcher::new(schema(), cache.clone(), Some(arbiter.clone() as Arc<dyn Arbiter>));

        let resolution = matcher.resolve("Total Assets").await;
        assert_eq!(resolution.field.as_deref(), Some("Total_Assets"));
        assert_eq!(resolution.confidence, 1.0);
        assert_eq!(resolution.reason, "direct");
        assert_eq!(arbiter.calls(), 0);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn repeated_resolution_is_served_from_cache() {
        let arbiter = StubArbiter::new(Some("Staff_Costs"));
        let cache = Arc::new(MemoryMatchCache::new());
        let matcher = TaxonomyMatcher::new(schema(), cache.clone(), Some(arbiter.clone() as Arc<dyn Arbiter>));

        let first = matcher.resolve("Wages and salaries").await;
        let second = matcher.resolve("Wages and salaries").await;
        assert_eq!(first.field.as_deref(), Some("Staff_Costs"));
        assert_eq!(first.method, MatchMethod::Arbitrated);
        assert_eq!(second.field, first.field);
        assert_eq!(second.method, MatchMethod::Cache);
        assert_eq!(arbiter.calls(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn no_match_is_recorded_but_not_replayed() {
        let arbiter = StubArbiter::new(None);
        let cache = Arc::new(MemoryMatchCache::new());
        let matcher = TaxonomyMatcher::new(schema(), cache.clone(), Some(arbiter.clone() as Arc<dyn Arbiter>));

        let first = matcher.resolve("Dividends proposed").await;
        assert!(!first.is_match());
        let entries = cache.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source_label, "Dividends proposed");
        assert_eq!(entries[0].matched_field, None);

        let second = matcher.resolve("Dividends proposed").await;
        assert!(!second.is_match());
        assert_ne!(second.method, MatchMethod::Cache);
        assert_eq!(arbiter.calls(), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn label_matches_once_the_taxonomy_gains_its_field() {
        let cache = Arc::new(MemoryMatchCache::new());
        let narrow = TaxonomyMatcher::new(
            Arc::new(TaxonomySchema::new(["Total_Assets"])),
            cache.clone(),
            None,
        );
        assert!(!narrow.resolve("Dividends proposed").await.is_match());

        let wider = TaxonomyMatcher::new(
            Arc::new(TaxonomySchema::new(["Total_Assets", "Dividends_Proposed"])),
            cache.clone(),
            None,
        );
        let resolution = wider.resolve("Dividends proposed").await;
        assert_eq!(resolution.field.as_deref(), Some("Dividends_Proposed"));
        assert_eq!(resolution.method, MatchMethod::Direct);
        assert_eq!(resolution.confidence, 1.0);

        let replay = wider.resolve("Dividends proposed").await;
        assert_eq!(replay.method, MatchMethod::Cache);
        assert_eq!(replay.field.as_deref(), Some("Dividends_Proposed"));
    }

    #[tokio::test]
    async fn arbiter_answer_outside_the_shortlist_is_no_match() {
        let arbiter = StubArbiter::new(Some("Goodwill"));
        let matcher = TaxonomyMatcher::new(schema(), Arc::new(MemoryMatchCache::new()), Some(arbiter as Arc<dyn Arbiter>));
        let resolution = matcher.resolve("Intangibles").await;
        assert!(!resolution.is_match());
        assert_eq!(resolution.confidence, 0.0);
    }

    #[tokio::test]
    async fn failing_arbiter_falls_back_to_heuristic() {
        let matcher = TaxonomyMatcher::new(
            schema(),
            Arc::new(MemoryMatchCache::new()),
            Some(Arc::new(FailingArbiter) as Arc<dyn Arbiter>),
        );
        let resolution = matcher.resolve("Revenue from sales").await;
        assert_eq!(resolution.field.as_deref(), Some("Revenue"));
        assert_eq!(resolution.method, MatchMethod::Heuristic);
    }

    #[tokio::test]
    async fn empty_inputs_are_not_cached() {
        let cache = Arc::new(MemoryMatchCache::new());
        let matcher = TaxonomyMatcher::new(schema(), cache.clone(), None);
        let resolution = matcher.resolve("   ").await;
        assert_eq!(resolution.method, MatchMethod::NoMatch);

        let empty = TaxonomyMatcher::new(
            Arc::new(TaxonomySchema::new(Vec::<String>::new())),
            cache.clone(),
            None,
        );
        assert!(!empty.resolve("Revenue").await.is_match());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn stale_cached_field_is_resolved_again() {
        let cache = Arc::new(MemoryMatchCache::new());
        cache
            .append(NewMatchEntry {
                source_label: "Revenue".into(),
                normalized_label: "revenue".into(),
                matched_field: Some("Turnover_Old".into()),
                confidence: 0.9,
                reason: "legacy".into(),
            })
            .await
            .unwrap();
        let matcher = TaxonomyMatcher::new(schema(), cache.clone(), None);
        let resolution = matcher.resolve("Revenue").await;
        assert_eq!(resolution.method, MatchMethod::Direct);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn sqlite_cache_round_trip_keeps_confidence_in_range() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let matcher = TaxonomyMatcher::new(schema(), store.clone(), Some(StubArbiter::new(Some("Cost_Of_Sales")) as Arc<dyn Arbiter>));
        let first = matcher.resolve("Vørukeyp").await;
        let second = matcher.resolve("Vørukeyp").await;
        assert_eq!(first.field, second.field);
        assert!((0.0..=1.0).contains(&second.confidence));
        assert_eq!(store.match_history("Vørukeyp").await.unwrap().len(), 1);
    }

    #[test]
    fn arbiter_replies_are_parsed_leniently() {
        let choice = parse_arbiter_reply("```json\n{\"field\": \"Revenue\", \"confidence\": \"1.4\", \"reason\": \"same\"}\n```").unwrap();
        assert_eq!(choice.field.as_deref(), Some("Revenue"));
        assert_eq!(choice.confidence, 1.0);

        let choice = parse_arbiter_reply("{\"field\": null, \"confidence\": 0.1}").unwrap();
        assert_eq!(choice.field, None);
        assert!(parse_arbiter_reply("nope").is_err());
    }
}
