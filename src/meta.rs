//! External video metadata via the oEmbed endpoint, cached for a day.
//!
//! Lookup failures degrade to empty metadata like every other read in this
//! layer; the content row simply keeps whatever title it already had.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;

const META_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMeta {
    pub title: Option<String>,
    pub channel_name: Option<String>,
}

impl ExternalMeta {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.channel_name.is_none()
    }
}

#[derive(Deserialize)]
struct OEmbedResponse {
    title: Option<String>,
    author_name: Option<String>,
}

pub struct MetaClient {
    http: reqwest::Client,
}

impl MetaClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Cached lookup keyed by video id. `force` bypasses the cached copy and
    /// refetches; only non-empty results are written back.
    pub async fn lookup(&self, cache: &CacheStore, video_id: &str, force: bool) -> ExternalMeta {
        let cache_key = format!("ytmeta:{video_id}");

        if !force {
            if let Some(meta) = cache.get_cached::<ExternalMeta>(&cache_key).await {
                return meta;
            }
        }

        let meta = self.fetch_oembed(video_id).await;
        if !meta.is_empty() {
            cache.set_cached(&cache_key, &meta, META_TTL).await;
        }
        meta
    }

    async fn fetch_oembed(&self, video_id: &str) -> ExternalMeta {
        let watch_url = format!("https://www.youtube.com/watch?v={video_id}");
        let response = self
            .http
            .get("https://www.youtube.com/oembed")
            .query(&[("url", watch_url.as_str()), ("format", "json")])
            .send()
            .await;

        let Ok(response) = response else {
            return ExternalMeta::default();
        };
        if !response.status().is_success() {
            return ExternalMeta::default();
        }

        match response.json::<OEmbedResponse>().await {
            Ok(body) => ExternalMeta {
                title: body.title,
                channel_name: body.author_name,
            },
            Err(_) => ExternalMeta::default(),
        }
    }
}

impl Default for MetaClient {
    fn default() -> Self {
        Self::new()
    }
}
