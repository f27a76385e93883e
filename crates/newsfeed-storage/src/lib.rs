//! Persistence + HTTP fetch utilities for the newsfeed pipeline.
//!
//! Holds the article repository (Postgres and in-memory), the watermark
//! stores (JSON state file, Postgres, in-memory), the query engine used by the
//! read surface, and the bounded-timeout HTTP client used by adapters.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsfeed_core::{Article, ArticleFilter, ArticleSource, DedupKey};
use reqwest::{StatusCode, Url};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsfeed-storage";

/// Query parameters never written to logs.
const REDACTED_QUERY_PARAMS: &[&str] = &["apiKey", "apikey", "api_key"];

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is not valid: {reason}")]
    CorruptState { path: PathBuf, reason: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Runs a store operation under a deadline; elapsing maps to
/// [`PersistenceError::Timeout`].
pub async fn bounded<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T, PersistenceError>
where
    F: Future<Output = Result<T, PersistenceError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(PersistenceError::Timeout { operation, after }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Document collection keyed by [`DedupKey`]. The repository is the only
/// authority on uniqueness.
#[async_trait]
pub trait ArticleRepository: Send + Sync {
    async fn upsert(&self, article: &Article) -> Result<UpsertOutcome, PersistenceError>;

    /// All stored articles in first-seen order.
    async fn find_all(&self) -> Result<Vec<Article>, PersistenceError>;

    async fn find(&self, filter: &ArticleFilter) -> Result<Vec<Article>, PersistenceError>;

    async fn count(&self) -> Result<usize, PersistenceError>;
}

/// Single "last successfully ingested position" scalar.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn read(&self) -> Result<Option<DateTime<Utc>>, PersistenceError>;

    async fn write(&self, at: DateTime<Utc>) -> Result<(), PersistenceError>;
}

#[derive(Default)]
struct MemoryArticles {
    rows: Vec<Article>,
    index: HashMap<DedupKey, usize>,
}

/// In-memory repository; insertion order is preserved and an upsert replaces
/// the row in place.
#[derive(Default)]
pub struct MemoryArticleRepository {
    inner: RwLock<MemoryArticles>,
}

impl MemoryArticleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArticleRepository for MemoryArticleRepository {
    async fn upsert(&self, article: &Article) -> Result<UpsertOutcome, PersistenceError> {
        let mut inner = self.inner.write().await;
        if let Some(&pos) = inner.index.get(&article.dedup_key) {
            inner.rows[pos] = article.clone();
            return Ok(UpsertOutcome::Updated);
        }
        let pos = inner.rows.len();
        inner.rows.push(article.clone());
        inner.index.insert(article.dedup_key.clone(), pos);
        Ok(UpsertOutcome::Inserted)
    }

    async fn find_all(&self) -> Result<Vec<Article>, PersistenceError> {
        Ok(self.inner.read().await.rows.clone())
    }

    async fn find(&self, filter: &ArticleFilter) -> Result<Vec<Article>, PersistenceError> {
        if filter.matches_nothing() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        Ok(inner
            .rows
            .iter()
            .filter(|article| filter.matches(article))
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<usize, PersistenceError> {
        Ok(self.inner.read().await.rows.len())
    }
}

#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    value: RwLock<Option<DateTime<Utc>>>,
}

impl MemoryWatermarkStore {
    pub fn new(initial: Option<DateTime<Utc>>) -> Self {
        Self {
            value: RwLock::new(initial),
        }
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn read(&self) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        Ok(*self.value.read().await)
    }

    async fn write(&self, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        *self.value.write().await = Some(at);
        Ok(())
    }
}

/// Small JSON key-value record holding the upstream credential (`apiKey`) and
/// the watermark (`updatedOn`). Unknown keys survive rewrites.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub const API_KEY_FIELD: &'static str = "apiKey";
    pub const WATERMARK_FIELD: &'static str = "updatedOn";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn api_key(&self) -> Result<Option<String>, PersistenceError> {
        let record = self.load().await?;
        Ok(record
            .get(Self::API_KEY_FIELD)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(ToString::to_string))
    }

    async fn load(&self) -> Result<JsonMap<String, JsonValue>, PersistenceError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(JsonMap::new()),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(JsonMap::new());
        }
        match serde_json::from_str::<JsonValue>(&text) {
            Ok(JsonValue::Object(map)) => Ok(map),
            Ok(_) => Err(self.corrupt("top-level value is not an object")),
            Err(err) => Err(self.corrupt(err.to_string())),
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> PersistenceError {
        PersistenceError::CorruptState {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn io_err(&self, path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError {
        let path = path.to_path_buf();
        move |source| PersistenceError::Io { path, source }
    }

    /// Replace the record via temp-file + rename so readers never see a torn write.
    async fn store(&self, record: &JsonMap<String, JsonValue>) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(record).map_err(|err| self.corrupt(err.to_string()))?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(self.io_err(&parent))?;

        let temp_path = parent.join(format!(".{}.state.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(self.io_err(&temp_path))?;
        file.write_all(&bytes).await.map_err(self.io_err(&temp_path))?;
        file.flush().await.map_err(self.io_err(&temp_path))?;
        file.sync_all().await.map_err(self.io_err(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(PersistenceError::Io {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for StateFile {
    async fn read(&self) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let record = self.load().await?;
        match record.get(Self::WATERMARK_FIELD) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::String(raw)) if raw.trim().is_empty() => Ok(None),
            Some(JsonValue::String(raw)) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(|err| self.corrupt(format!("{}: {err}", Self::WATERMARK_FIELD))),
            Some(_) => Err(self.corrupt(format!("{} is not a string", Self::WATERMARK_FIELD))),
        }
    }

    async fn write(&self, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        let mut record = self.load().await?;
        record.insert(
            Self::WATERMARK_FIELD.to_string(),
            JsonValue::String(at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );
        self.store(&record).await
    }
}

pub async fn connect_pool(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying database migrations")
}

#[derive(Debug, Clone)]
pub struct PgArticleRepository {
    pool: PgPool,
}

impl PgArticleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn article_from_row(row: &PgRow) -> Result<Article, sqlx::Error> {
    let dedup_key: String = row.try_get("dedup_key")?;
    Ok(Article {
        dedup_key: DedupKey::from_stored(dedup_key),
        source: ArticleSource {
            id: row.try_get("source_id")?,
            name: row.try_get("source_name")?,
        },
        author: row.try_get("author")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        url: row.try_get("url")?,
        image_url: row.try_get("image_url")?,
        published_at: row.try_get("published_at")?,
    })
}

#[async_trait]
impl ArticleRepository for PgArticleRepository {
    async fn upsert(&self, article: &Article) -> Result<UpsertOutcome, PersistenceError> {
        let row = sqlx::query(
            r#"
            INSERT INTO articles
                (dedup_key, source_id, source_name, author, title, description,
                 url, image_url, published_at, first_seen_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (dedup_key) DO UPDATE SET
                source_id = excluded.source_id,
                source_name = excluded.source_name,
                author = excluded.author,
                title = excluded.title,
                description = excluded.description,
                url = excluded.url,
                image_url = excluded.image_url,
                published_at = excluded.published_at,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(article.dedup_key.as_str())
        .bind(&article.source.id)
        .bind(&article.source.name)
        .bind(&article.author)
        .bind(&article.title)
        .bind(&article.description)
        .bind(&article.url)
        .bind(&article.image_url)
        .bind(article.published_at)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn find_all(&self) -> Result<Vec<Article>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT dedup_key, source_id, source_name, author, title, description,
                   url, image_url, published_at
              FROM articles
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(article_from_row).collect::<Result<_, _>>()?)
    }

    async fn find(&self, filter: &ArticleFilter) -> Result<Vec<Article>, PersistenceError> {
        if filter.matches_nothing() {
            return Ok(Vec::new());
        }
        let source_ids = filter.source_ids().iter().cloned().collect::<Vec<_>>();
        // strpos, not LIKE: the keyword is matched literally.
        let rows = sqlx::query(
            r#"
            SELECT dedup_key, source_id, source_name, author, title, description,
                   url, image_url, published_at
              FROM articles
             WHERE source_id = ANY($1)
               AND ($2 = '' OR strpos(lower(COALESCE(title, '')), lower($2)) > 0)
             ORDER BY id
            "#,
        )
        .bind(&source_ids)
        .bind(filter.keyword())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(article_from_row).collect::<Result<_, _>>()?)
    }

    async fn count(&self) -> Result<usize, PersistenceError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM articles")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as usize)
    }
}

/// Watermark kept in the single-row `sync_state` table.
#[derive(Debug, Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn read(&self) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let row = sqlx::query("SELECT last_synced_at FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("last_synced_at")?),
            None => Ok(None),
        }
    }

    async fn write(&self, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (id, last_synced_at, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                updated_at = NOW()
            "#,
        )
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Read side used by the HTTP surface.
#[derive(Clone)]
pub struct QueryEngine {
    repo: Arc<dyn ArticleRepository>,
}

impl QueryEngine {
    pub fn new(repo: Arc<dyn ArticleRepository>) -> Self {
        Self { repo }
    }

    pub async fn list_all(&self) -> Result<Vec<Article>, PersistenceError> {
        self.repo.find_all().await
    }

    pub async fn search<I, S>(&self, keyword: &str, sources: I) -> Result<Vec<Article>, PersistenceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filter = ArticleFilter::new(keyword, sources);
        if filter.matches_nothing() {
            return Ok(Vec::new());
        }
        self.repo.find(&filter).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body exceeded {limit} bytes")]
    BodyTooLarge { limit: usize },
}

/// Single-shot HTTP client: one request per call, whole exchange bounded by
/// the configured timeout, no retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes.max(1),
        })
    }

    /// GET `url`, streaming the body into memory.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: Url,
    ) -> Result<FetchedResponse, FetchError> {
        let log_url = redact_url(&url);
        let span = tracing::info_span!("http_fetch", %run_id, source_id, url = %log_url);
        async move {
            let mut resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = redact_url(resp.url());

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let mut body = Vec::new();
            while let Some(chunk) = resp.chunk().await? {
                if body.len() + chunk.len() > self.max_body_bytes {
                    return Err(FetchError::BodyTooLarge {
                        limit: self.max_body_bytes,
                    });
                }
                body.extend_from_slice(&chunk);
            }
            debug!(bytes = body.len(), %status, "fetched");

            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Render a URL for logs with credential query parameters masked.
pub fn redact_url(url: &Url) -> String {
    if url.query().is_none() {
        return url.to_string();
    }
    let mut redacted = url.clone();
    let pairs = url
        .query_pairs()
        .map(|(k, v)| {
            if REDACTED_QUERY_PARAMS.contains(&k.as_ref()) {
                (k.into_owned(), "***".to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect::<Vec<_>>();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}
