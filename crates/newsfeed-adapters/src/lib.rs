//! Upstream adapter for the NewsAPI `everything` endpoint, plus the
//! record normalizer that turns its payload into [`Article`] values.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use newsfeed_core::{Article, ArticleSource, DedupKey};
use newsfeed_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsfeed-adapters";

pub const NEWSAPI_SOURCE_ID: &str = "newsapi";
pub const DEFAULT_NEWSAPI_BASE_URL: &str = "https://newsapi.org";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream payload malformed: {0}")]
    UpstreamMalformed(String),
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::BodyTooLarge { .. } => Self::UpstreamMalformed(err.to_string()),
            FetchError::Request(_) | FetchError::HttpStatus { .. } => {
                Self::UpstreamUnavailable(err.to_string())
            }
        }
    }
}

/// Upstream credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// A feed of raw upstream records, fetched relative to a watermark.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// One outbound request for records published at or after `since`.
    /// Records come back unparsed so a single bad element cannot sink the batch.
    async fn fetch_since(
        &self,
        run_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<JsonValue>, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct EverythingEnvelope {
    status: Option<String>,
    code: Option<String>,
    message: Option<String>,
    articles: Option<JsonValue>,
}

/// Parse an `everything` response body into its raw `articles` elements.
pub fn parse_everything_body(body: &[u8]) -> Result<Vec<JsonValue>, AdapterError> {
    let envelope: EverythingEnvelope = serde_json::from_slice(body)
        .map_err(|err| AdapterError::UpstreamMalformed(format!("invalid json: {err}")))?;

    if envelope.status.as_deref() == Some("error") {
        return Err(AdapterError::UpstreamMalformed(format!(
            "error envelope: {} ({})",
            envelope.message.unwrap_or_default(),
            envelope.code.unwrap_or_else(|| "unknown".to_string())
        )));
    }

    match envelope.articles {
        Some(JsonValue::Array(records)) => Ok(records),
        Some(_) => Err(AdapterError::UpstreamMalformed(
            "`articles` is not an array".to_string(),
        )),
        None => Err(AdapterError::UpstreamMalformed(
            "missing `articles` field".to_string(),
        )),
    }
}

#[derive(Debug, Clone)]
pub struct NewsApiConfig {
    pub base_url: String,
    pub sources: Vec<String>,
    pub api_key: ApiKey,
}

/// Live NewsAPI adapter. Does not retry; the schedule cadence is the retry.
#[derive(Debug)]
pub struct NewsApiSource {
    http: HttpFetcher,
    base_url: Url,
    sources: Vec<String>,
    api_key: ApiKey,
}

impl NewsApiSource {
    pub fn new(http: HttpFetcher, config: NewsApiConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing upstream base url {}", config.base_url))?;
        anyhow::ensure!(
            !config.sources.is_empty(),
            "source allow-list must not be empty"
        );
        Ok(Self {
            http,
            base_url,
            sources: config.sources,
            api_key: config.api_key,
        })
    }

    pub fn everything_url(&self, since: DateTime<Utc>) -> Result<Url, AdapterError> {
        let mut url = self
            .base_url
            .join("v2/everything")
            .map_err(|err| AdapterError::UpstreamUnavailable(format!("building url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("sources", &self.sources.join(","))
            .append_pair("from", &since.to_rfc3339_opts(SecondsFormat::Secs, true))
            .append_pair("apiKey", self.api_key.expose());
        Ok(url)
    }
}

#[async_trait]
impl SourceAdapter for NewsApiSource {
    fn source_id(&self) -> &'static str {
        NEWSAPI_SOURCE_ID
    }

    async fn fetch_since(
        &self,
        run_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let url = self.everything_url(since)?;
        let response = self.http.fetch_bytes(run_id, NEWSAPI_SOURCE_ID, url).await?;
        debug!(
            status = %response.status,
            url = %response.final_url,
            bytes = response.body.len(),
            "everything response"
        );
        parse_everything_body(&response.body)
    }
}

/// Replays a captured `everything` body; used for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    body: Vec<u8>,
}

impl FixtureSource {
    pub fn from_bytes(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into() }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let body = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(Self { body })
    }
}

#[async_trait]
impl SourceAdapter for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_since(
        &self,
        _run_id: Uuid,
        _since: DateTime<Utc>,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        parse_everything_body(&self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotARecord,
    MissingSourceId,
    MissingUrl,
    UnusableUrl,
    MissingPublishedAt,
    BadPublishedAt,
    DuplicateInBatch,
}

#[derive(Debug, Deserialize)]
struct UpstreamSourceRef {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamRecord {
    source: Option<UpstreamSourceRef>,
    author: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    #[serde(rename = "urlToImage")]
    url_to_image: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Absolute http(s) URL without fragment and without a trailing slash on a
/// non-root path. Scheme and host come back lower-cased from the parser.
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Some(url.to_string())
}

pub fn normalize_record(value: &JsonValue) -> Result<Article, SkipReason> {
    let record: UpstreamRecord =
        serde_json::from_value(value.clone()).map_err(|_| SkipReason::NotARecord)?;

    let (source_id, source_name) = match record.source {
        Some(source) => (clean(source.id), clean(source.name)),
        None => (None, None),
    };
    let source_id = source_id.ok_or(SkipReason::MissingSourceId)?;
    let raw_url = clean(record.url).ok_or(SkipReason::MissingUrl)?;
    let url = canonical_url(&raw_url).ok_or(SkipReason::UnusableUrl)?;
    let raw_published = clean(record.published_at).ok_or(SkipReason::MissingPublishedAt)?;
    let published_at = DateTime::parse_from_rfc3339(&raw_published)
        .map_err(|_| SkipReason::BadPublishedAt)?
        .with_timezone(&Utc);

    Ok(Article {
        dedup_key: DedupKey::derive(&source_id, &url),
        source: ArticleSource {
            id: source_id,
            name: source_name,
        },
        author: clean(record.author),
        title: clean(record.title),
        description: clean(record.description),
        url,
        image_url: clean(record.url_to_image),
        published_at,
    })
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub articles: Vec<Article>,
    pub skipped: BTreeMap<SkipReason, usize>,
}

impl NormalizedBatch {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }
}

/// Normalize a whole batch. Unmappable records are counted, not fatal; a key
/// repeated within the batch keeps its first position and its last content.
pub fn normalize_batch(records: &[JsonValue]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut positions: HashMap<DedupKey, usize> = HashMap::new();

    for (idx, value) in records.iter().enumerate() {
        match normalize_record(value) {
            Ok(article) => {
                if let Some(&pos) = positions.get(&article.dedup_key) {
                    batch.articles[pos] = article;
                    *batch.skipped.entry(SkipReason::DuplicateInBatch).or_default() += 1;
                } else {
                    positions.insert(article.dedup_key.clone(), batch.articles.len());
                    batch.articles.push(article);
                }
            }
            Err(reason) => {
                debug!(index = idx, ?reason, "dropping upstream record");
                *batch.skipped.entry(reason).or_default() += 1;
            }
        }
    }

    batch
}
