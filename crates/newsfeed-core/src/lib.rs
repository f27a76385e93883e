//! Core domain model for the newsfeed ingestion pipeline.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "newsfeed-core";

/// Source allow-list used when no `sources.yaml` is present.
pub const DEFAULT_SOURCES: &[&str] = &[
    "abc-news",
    "bbc-news",
    "bbc-sport",
    "espn",
    "business-insider",
    "buzzfeed",
    "cnbc",
    "cnn",
];

/// Stable identity of an article: sha256 over source id and canonical URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn derive(source_id: &str, canonical_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_url.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps a key read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provenance of an article as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleSource {
    pub id: String,
    pub name: Option<String>,
}

/// One ingested news item. Serialized with the upstream field names so the
/// read surface returns the same shape the aggregator does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub dedup_key: DedupKey,
    pub source: ArticleSource,
    pub author: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: String,
    #[serde(rename = "urlToImage")]
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// Conjunctive search predicate: literal, case-insensitive title substring and
/// source-id membership.
///
/// An empty `source_ids` set matches nothing. An empty keyword matches every
/// title, including a missing one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArticleFilter {
    keyword: String,
    keyword_folded: String,
    source_ids: BTreeSet<String>,
}

impl ArticleFilter {
    pub fn new<I, S>(keyword: impl Into<String>, source_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keyword = keyword.into();
        Self {
            keyword_folded: keyword.to_lowercase(),
            keyword,
            source_ids: source_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn source_ids(&self) -> &BTreeSet<String> {
        &self.source_ids
    }

    pub fn matches_nothing(&self) -> bool {
        self.source_ids.is_empty()
    }

    pub fn matches(&self, article: &Article) -> bool {
        if !self.source_ids.contains(&article.source.id) {
            return false;
        }
        if self.keyword_folded.is_empty() {
            return true;
        }
        article
            .title
            .as_deref()
            .map(|title| title.to_lowercase().contains(&self.keyword_folded))
            .unwrap_or(false)
    }
}
