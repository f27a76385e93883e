use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use newsfeed_adapters::{AdapterError, FixtureSource, SourceAdapter};
use newsfeed_core::{Article, ArticleFilter};
use newsfeed_storage::{
    ArticleRepository, MemoryArticleRepository, MemoryWatermarkStore, PersistenceError,
    UpsertOutcome, WatermarkStore,
};
use newsfeed_sync::{CycleStatus, FailureKind, IngestPhase, IngestionJob, JobSettings};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

fn ts(h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, h, 0, 0).single().unwrap()
}

fn body(records: &[(&str, &str, u32)]) -> Vec<u8> {
    let articles = records
        .iter()
        .map(|(source, path, hour)| {
            json!({
                "source": { "id": source, "name": source },
                "title": format!("story {path}"),
                "url": format!("https://news.example.com/{path}"),
                "publishedAt": ts(*hour).to_rfc3339(),
            })
        })
        .collect::<Vec<_>>();
    serde_json::to_vec(&json!({ "status": "ok", "articles": articles })).unwrap()
}

/// Rejects any article whose URL contains `poison`.
struct FlakyRepository {
    inner: MemoryArticleRepository,
}

#[async_trait]
impl ArticleRepository for FlakyRepository {
    async fn upsert(&self, article: &Article) -> Result<UpsertOutcome, PersistenceError> {
        if article.url.contains("poison") {
            return Err(PersistenceError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.upsert(article).await
    }

    async fn find_all(&self) -> Result<Vec<Article>, PersistenceError> {
        self.inner.find_all().await
    }

    async fn find(&self, filter: &ArticleFilter) -> Result<Vec<Article>, PersistenceError> {
        self.inner.find(filter).await
    }

    async fn count(&self) -> Result<usize, PersistenceError> {
        self.inner.count().await
    }
}

struct SlowRepository;

#[async_trait]
impl ArticleRepository for SlowRepository {
    async fn upsert(&self, _article: &Article) -> Result<UpsertOutcome, PersistenceError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(UpsertOutcome::Inserted)
    }

    async fn find_all(&self) -> Result<Vec<Article>, PersistenceError> {
        Ok(vec![])
    }

    async fn find(&self, _filter: &ArticleFilter) -> Result<Vec<Article>, PersistenceError> {
        Ok(vec![])
    }

    async fn count(&self) -> Result<usize, PersistenceError> {
        Ok(0)
    }
}

fn state_io_error(kind: std::io::ErrorKind) -> PersistenceError {
    PersistenceError::Io {
        path: "config.json".into(),
        source: std::io::Error::from(kind),
    }
}

struct ReadOnlyWatermark {
    value: Option<DateTime<Utc>>,
    readable: bool,
}

#[async_trait]
impl WatermarkStore for ReadOnlyWatermark {
    async fn read(&self) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        if self.readable {
            Ok(self.value)
        } else {
            Err(state_io_error(std::io::ErrorKind::PermissionDenied))
        }
    }

    async fn write(&self, _at: DateTime<Utc>) -> Result<(), PersistenceError> {
        Err(state_io_error(std::io::ErrorKind::PermissionDenied))
    }
}

struct DownSource;

#[async_trait]
impl SourceAdapter for DownSource {
    fn source_id(&self) -> &'static str {
        "down"
    }

    async fn fetch_since(&self, _run_id: Uuid, _since: DateTime<Utc>) -> Result<Vec<JsonValue>, AdapterError> {
        Err(AdapterError::UpstreamUnavailable("connection refused".into()))
    }
}

struct StalledSource;

#[async_trait]
impl SourceAdapter for StalledSource {
    fn source_id(&self) -> &'static str {
        "stalled"
    }

    async fn fetch_since(&self, _run_id: Uuid, _since: DateTime<Utc>) -> Result<Vec<JsonValue>, AdapterError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(vec![])
    }
}

fn fast_settings() -> JobSettings {
    JobSettings {
        fetch_timeout: Duration::from_millis(50),
        store_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

#[tokio::test]
async fn one_failed_upsert_does_not_sink_the_batch() {
    // The poisoned record carries the newest publishedAt.
    let source = FixtureSource::from_bytes(body(&[
        ("cnn", "a", 1),
        ("cnn", "b", 2),
        ("bbc-news", "poison", 9),
        ("espn", "c", 4),
        ("cnbc", "d", 3),
    ]));
    let repo = Arc::new(FlakyRepository {
        inner: MemoryArticleRepository::new(),
    });
    let marks = Arc::new(MemoryWatermarkStore::default());
    let job = IngestionJob::new(Arc::new(source), repo.clone(), marks.clone(), JobSettings::default());

    let report = job.run_once().await;

    assert_eq!(report.status, CycleStatus::Partial);
    assert_eq!(report.inserted, 4);
    assert_eq!(report.failed_upserts.len(), 1);
    assert_eq!(repo.count().await.unwrap(), 4);
    assert_eq!(report.watermark_after, Some(ts(4)));
    assert_eq!(marks.read().await.unwrap(), Some(ts(4)));
}

#[tokio::test]
async fn every_upsert_failing_leaves_watermark_alone() {
    let source = FixtureSource::from_bytes(body(&[("cnn", "poison-1", 5), ("cnn", "poison-2", 6)]));
    let repo = Arc::new(FlakyRepository {
        inner: MemoryArticleRepository::new(),
    });
    let marks = Arc::new(MemoryWatermarkStore::new(Some(ts(1))));
    let job = IngestionJob::new(Arc::new(source), repo, marks.clone(), JobSettings::default());

    let report = job.run_once().await;

    assert_eq!(report.status, CycleStatus::Partial);
    assert_eq!(report.failed_upserts.len(), 2);
    assert_eq!(marks.read().await.unwrap(), Some(ts(1)));
}

#[tokio::test]
async fn watermark_write_failure_keeps_upserts() {
    let source = FixtureSource::from_bytes(body(&[("cnn", "a", 5)]));
    let repo = Arc::new(MemoryArticleRepository::new());
    let marks = Arc::new(ReadOnlyWatermark {
        value: Some(ts(1)),
        readable: true,
    });
    let job = IngestionJob::new(Arc::new(source), repo.clone(), marks, JobSettings::default());

    let report = job.run_once().await;

    assert_eq!(report.status, CycleStatus::Partial);
    assert!(report.watermark_error.is_some());
    assert_eq!(report.watermark_after, Some(ts(1)));
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn watermark_read_failure_aborts_before_fetch() {
    let source = FixtureSource::from_bytes(body(&[("cnn", "a", 5)]));
    let repo = Arc::new(MemoryArticleRepository::new());
    let marks = Arc::new(ReadOnlyWatermark {
        value: None,
        readable: false,
    });
    let job = IngestionJob::new(Arc::new(source), repo.clone(), marks, JobSettings::default());

    let report = job.run_once().await;

    assert_eq!(report.status, CycleStatus::Failed);
    assert_eq!(report.failure.unwrap().kind, FailureKind::Persistence);
    assert_eq!(repo.count().await.unwrap(), 0);
}

#[tokio::test]
async fn upstream_outage_fails_cycle_without_side_effects() {
    let repo = Arc::new(MemoryArticleRepository::new());
    let marks = Arc::new(MemoryWatermarkStore::new(Some(ts(2))));
    let job = IngestionJob::new(Arc::new(DownSource), repo.clone(), marks.clone(), JobSettings::default());

    let report = job.run_once().await;

    assert_eq!(report.status, CycleStatus::Failed);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::UpstreamUnavailable);
    assert_eq!(failure.phase, IngestPhase::Fetching);
    assert_eq!(repo.count().await.unwrap(), 0);
    assert_eq!(marks.read().await.unwrap(), Some(ts(2)));
}

#[tokio::test]
async fn stalled_upstream_times_out_as_unavailable() {
    let repo = Arc::new(MemoryArticleRepository::new());
    let marks = Arc::new(MemoryWatermarkStore::default());
    let job = IngestionJob::new(Arc::new(StalledSource), repo, marks, fast_settings());

    let report = job.run_once().await;

    assert_eq!(report.failure.unwrap().kind, FailureKind::UpstreamUnavailable);
}

#[tokio::test]
async fn stalled_store_times_out_per_article() {
    let source = FixtureSource::from_bytes(body(&[("cnn", "a", 5), ("cnn", "b", 6)]));
    let marks = Arc::new(MemoryWatermarkStore::default());
    let job = IngestionJob::new(Arc::new(source), Arc::new(SlowRepository), marks.clone(), fast_settings());

    let report = job.run_once().await;

    assert_eq!(report.status, CycleStatus::Partial);
    assert_eq!(report.failed_upserts.len(), 2);
    assert!(report.failed_upserts[0].error.contains("timed out"));
    assert_eq!(marks.read().await.unwrap(), None);
}

#[tokio::test]
async fn report_serializes_for_status_surface() {
    let source = FixtureSource::from_bytes(body(&[("cnn", "a", 5)]));
    let job = IngestionJob::new(
        Arc::new(source),
        Arc::new(MemoryArticleRepository::new()),
        Arc::new(MemoryWatermarkStore::default()),
        JobSettings::default(),
    );
    let value = serde_json::to_value(job.run_once().await).unwrap();
    assert_eq!(value["status"], "succeeded");
    assert_eq!(value["inserted"], 1);
}
