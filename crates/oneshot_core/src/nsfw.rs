/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use oneshot_protocol::FeedPost;

/// Costly predicates run only after the base chain accepted a post. Any
/// transport failure counts as accept: an infrastructure outage must not
/// silently suppress content. That rule lives here, once, not in each
/// predicate.
pub struct CostlyFilterChain {
    nsfw: Option<NsfwVisionFilter>,
}

impl CostlyFilterChain {
    pub fn new(nsfw: Option<NsfwVisionFilter>) -> Self {
        Self { nsfw }
    }

    pub fn none() -> Self {
        Self { nsfw: None }
    }

    pub async fn should_keep(&self, post: &FeedPost, author_did: &str) -> bool {
        if let Some(filter) = &self.nsfw {
            match filter.check(post, author_did).await {
                Ok(keep) => return keep,
                Err(e) => {
                    warn!("nsfw filter failed, accepting post: {e:#}");
                    return true;
                }
            }
        }
        true
    }
}

#[derive(Debug, Deserialize)]
struct NsfwScore {
    #[serde(default)]
    nsfw: f64,
    #[serde(default)]
    sfw: f64,
    #[serde(default)]
    error: String,
}

/// Sends image CDN URLs to an out-of-process vision classifier. Concurrent
/// requests are capped so a slow classifier cannot absorb the handler pool.
pub struct NsfwVisionFilter {
    upstream: String,
    nsfw_threshold: f64,
    min_diff: f64,
    limit: Arc<Semaphore>,
    http: reqwest::Client,
}

impl NsfwVisionFilter {
    pub fn new(
        http: reqwest::Client,
        upstream: String,
        nsfw_threshold: f64,
        min_diff: f64,
        max_conns: usize,
    ) -> Self {
        Self {
            upstream,
            nsfw_threshold,
            min_diff,
            limit: Arc::new(Semaphore::new(max_conns.max(1))),
            http,
        }
    }

    fn cdn_url(did: &str, blob_link: &str) -> String {
        format!("https://cdn.bsky.app/img/feed_thumbnail/plain/{did}/{blob_link}@jpeg")
    }

    async fn check(&self, post: &FeedPost, author_did: &str) -> Result<bool> {
        let links = post.image_blob_links();
        if links.is_empty() {
            return Ok(true);
        }
        let urls: Vec<String> = links
            .iter()
            .map(|link| Self::cdn_url(author_did, link))
            .collect();

        let Ok(_permit) = self.limit.acquire().await else {
            return Ok(true);
        };

        let response = self
            .http
            .post(&self.upstream)
            .header("Content-Type", "text/plain")
            .body(urls.join("\n"))
            .send()
            .await
            .context("query nsfw classifier")?
            .error_for_status()
            .context("nsfw classifier status")?;
        let results: Vec<NsfwScore> = response
            .json()
            .await
            .context("decode nsfw classifier response")?;

        for (i, result) in results.iter().enumerate() {
            if !result.error.is_empty() {
                warn!(error = %result.error, "nsfw classifier item error");
                continue;
            }
            if result.nsfw > self.nsfw_threshold && result.nsfw - result.sfw > self.min_diff {
                debug!(img = urls.get(i).map(String::as_str).unwrap_or(""), "nsfw filter blocked post");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
