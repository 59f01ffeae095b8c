//! Hacker News top-stories feed and item detail reads.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use yahnc_core::{item_url, top_stories_url, ItemId};

use crate::{FetchError, HttpFetcher};

/// Item detail as served by `item/{id}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HnItem {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default)]
    pub descendants: Option<i64>,
    #[serde(default)]
    pub by: Option<String>,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub dead: bool,
    #[serde(default)]
    pub deleted: bool,
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Current top item ids, best first, at most `limit` of them.
    async fn top_stories(&self, limit: usize) -> Result<Vec<ItemId>, FetchError>;
}

/// Drop repeated ids, keeping the first occurrence.
pub fn dedup_preserving_order(ids: impl IntoIterator<Item = ItemId>) -> Vec<ItemId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

#[derive(Debug, Clone)]
pub struct HackerNewsFeed {
    http: Arc<HttpFetcher>,
    api_base: String,
}

impl HackerNewsFeed {
    pub fn new(http: Arc<HttpFetcher>, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
        }
    }

    /// `Ok(None)` when the API answers `null` for an unknown id.
    pub async fn item(&self, id: ItemId) -> Result<Option<HnItem>, FetchError> {
        self.http.fetch_json(&item_url(&self.api_base, id)).await
    }
}

#[async_trait]
impl FeedSource for HackerNewsFeed {
    async fn top_stories(&self, limit: usize) -> Result<Vec<ItemId>, FetchError> {
        let url = top_stories_url(&self.api_base, limit);
        let ids: Vec<i64> = self.http.fetch_json(&url).await?;
        let fetched = ids.len();
        let ids = dedup_preserving_order(ids.into_iter().map(ItemId))
            .into_iter()
            .take(limit)
            .collect::<Vec<_>>();
        debug!(fetched, kept = ids.len(), "fetched top stories");
        Ok(ids)
    }
}
