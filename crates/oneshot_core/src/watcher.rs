/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::limiter::RateLimiter;
use crate::notifier::{BlockDecision, BlockNotifier};
use crate::store::Store;
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_APPVIEW_HOST: &str = "https://public.api.bsky.app";
const BATCH_SIZE: usize = 25;
const BATCH_WINDOW: Duration = Duration::from_secs(5);
const QUEUE_CAPACITY: usize = 4096;

/// An actor the label listener saw enough of to warrant a profile lookup.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub uid: i64,
    /// Full DID.
    pub did: String,
    pub count: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub did: String,
    #[serde(default)]
    pub posts_count: Option<i64>,
}

/// Batches candidates, sizes each actor's label count against their posts
/// count from the app-view, and promotes repeat offenders to blocks.
pub struct AccountWatcher {
    store: Store,
    http: reqwest::Client,
    appview_host: String,
    notifier: Arc<BlockNotifier>,
    limiter: RateLimiter,
    ratio: f64,
    requeue: mpsc::Sender<Candidate>,
}

/// `⌊ratio · posts⌋`: the number of offending posts we tolerate before an
/// actor with that many posts is promoted.
pub fn offending_post_limit(posts: i64, ratio: f64) -> i64 {
    (posts as f64 * ratio) as i64
}

impl AccountWatcher {
    pub fn new(
        store: Store,
        http: reqwest::Client,
        notifier: Arc<BlockNotifier>,
        appview_rate_limit: u32,
        ratio: f64,
    ) -> (Arc<Self>, mpsc::Sender<Candidate>, mpsc::Receiver<Candidate>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let rate = appview_rate_limit.max(1) as f64;
        let watcher = Arc::new(Self {
            store,
            http,
            appview_host: DEFAULT_APPVIEW_HOST.to_string(),
            notifier,
            limiter: RateLimiter::new(rate, rate * 2.0),
            ratio,
            requeue: tx.clone(),
        });
        (watcher, tx, rx)
    }

    pub fn run(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<Candidate>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut batch: HashMap<String, Candidate> = HashMap::with_capacity(BATCH_SIZE);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if !batch.is_empty() {
                            self.check_batch(&cancel, std::mem::take(&mut batch)).await;
                        }
                        return;
                    }
                    candidate = queue.recv() => {
                        let Some(candidate) = candidate else { return };
                        let compact = candidate.did.strip_prefix("did:").unwrap_or(&candidate.did);
                        match self.store.is_blocked(compact) {
                            Ok(true) => continue,
                            Ok(false) => {}
                            Err(e) => {
                                warn!("failed to check blocked state: {e:#}");
                                continue;
                            }
                        }
                        // Dedup by DID, last count wins.
                        batch.insert(candidate.did.clone(), candidate);
                        if batch.len() >= BATCH_SIZE {
                            self.check_batch(&cancel, std::mem::take(&mut batch)).await;
                        }
                    }
                    _ = tokio::time::sleep(BATCH_WINDOW), if !batch.is_empty() => {
                        self.check_batch(&cancel, std::mem::take(&mut batch)).await;
                    }
                }
            }
        })
    }

    async fn check_batch(&self, cancel: &CancellationToken, batch: HashMap<String, Candidate>) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = self.limiter.acquire() => {}
        }

        let dids: Vec<&str> = batch.keys().map(String::as_str).collect();
        match self.fetch_profiles(&dids).await {
            Ok(profiles) => self.process_profiles(&batch, &profiles),
            Err(e) => {
                warn!("failed to get profiles: {e:#}");
                // Best-effort requeue; anything that does not fit is lost
                // until the next upstream label for that actor.
                for candidate in batch.into_values() {
                    if self.requeue.try_send(candidate).is_err() {
                        warn!("failed to requeue candidate");
                    }
                }
            }
        }
    }

    async fn fetch_profiles(&self, dids: &[&str]) -> Result<Vec<Profile>> {
        #[derive(Deserialize)]
        struct Output {
            profiles: Vec<Profile>,
        }
        let params: Vec<(&str, &str)> = dids.iter().map(|did| ("actors", *did)).collect();
        let out: Output = self
            .http
            .get(format!(
                "{}/xrpc/app.bsky.actor.getProfiles",
                self.appview_host
            ))
            .query(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(out.profiles)
    }

    /// Applies the promotion rule to one batch of profiles and emits a
    /// block decision for each first-time promotion.
    pub fn process_profiles(&self, batch: &HashMap<String, Candidate>, profiles: &[Profile]) {
        for profile in profiles {
            let Some(candidate) = batch.get(&profile.did) else {
                continue;
            };
            let Some(posts) = profile.posts_count else {
                continue;
            };
            let limit = offending_post_limit(posts, self.ratio);
            let over = candidate.count > limit || {
                match self.store.sum_counts_for_user(candidate.uid) {
                    Ok(total) => total > limit,
                    Err(e) => {
                        warn!("failed to sum counts: {e:#}");
                        false
                    }
                }
            };
            if !over {
                continue;
            }

            let inserted = match self.store.insert_block(candidate.uid) {
                Ok(inserted) => inserted,
                Err(e) => {
                    warn!("failed to insert block: {e:#}");
                    continue;
                }
            };
            if !inserted.created {
                continue;
            }
            let compact = candidate
                .did
                .strip_prefix("did:")
                .unwrap_or(&candidate.did);
            debug!(did = %candidate.did, id = inserted.id, "promoted actor to block");
            self.notifier.notify(BlockDecision {
                id: inserted.id,
                compact_did: compact.to_string(),
                created_at: inserted.created_at,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Flow;

    fn setup() -> (tempfile::TempDir, Store, Arc<AccountWatcher>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        let notifier = BlockNotifier::new(store.clone()).unwrap();
        let (watcher, _tx, _rx) =
            AccountWatcher::new(store.clone(), reqwest::Client::new(), notifier, 10, 0.10);
        (dir, store, watcher)
    }

    fn candidate(store: &Store, did: &str, count: i64) -> Candidate {
        let compact = did.strip_prefix("did:").unwrap_or(did);
        Candidate {
            uid: store.get_or_create_uid(compact).unwrap(),
            did: did.to_string(),
            count,
        }
    }

    #[test]
    fn limit_is_floored() {
        assert_eq!(offending_post_limit(30, 0.10), 3);
        assert_eq!(offending_post_limit(19, 0.10), 1);
        assert_eq!(offending_post_limit(0, 0.10), 0);
        assert_eq!(offending_post_limit(5, 1.0), 5);
    }

    #[test]
    fn under_the_limit_is_not_promoted() {
        let (_dir, store, watcher) = setup();
        let c = candidate(&store, "did:plc:mild", 3);
        let batch = HashMap::from([(c.did.clone(), c)]);
        watcher.process_profiles(
            &batch,
            &[Profile {
                did: "did:plc:mild".to_string(),
                posts_count: Some(30),
            }],
        );
        assert!(!store.is_blocked("plc:mild").unwrap());
    }

    #[test]
    fn over_the_limit_is_promoted_once() {
        let (_dir, store, watcher) = setup();
        let c = candidate(&store, "did:plc:spammer", 4);
        let batch = HashMap::from([(c.did.clone(), c)]);
        let profiles = [Profile {
            did: "did:plc:spammer".to_string(),
            posts_count: Some(30),
        }];
        watcher.process_profiles(&batch, &profiles);
        assert!(store.is_blocked("plc:spammer").unwrap());
        assert_eq!(store.last_block_id().unwrap(), 1);
        // A second pass over the same batch emits nothing new.
        watcher.process_profiles(&batch, &profiles);
        assert_eq!(store.last_block_id().unwrap(), 1);
    }

    #[test]
    fn summed_counters_promote_even_when_last_count_is_low() {
        let (_dir, store, watcher) = setup();
        let c = candidate(&store, "did:plc:slowburn", 1);
        for i in 0..5 {
            store
                .increment_counter(c.uid, 0, &format!("r{i}"))
                .unwrap();
        }
        let batch = HashMap::from([(c.did.clone(), c)]);
        watcher.process_profiles(
            &batch,
            &[Profile {
                did: "did:plc:slowburn".to_string(),
                posts_count: Some(30),
            }],
        );
        assert!(store.is_blocked("plc:slowburn").unwrap());
    }

    #[test]
    fn missing_posts_count_skips_the_actor() {
        let (_dir, store, watcher) = setup();
        let c = candidate(&store, "did:plc:ghost", i64::MAX);
        let batch = HashMap::from([(c.did.clone(), c)]);
        watcher.process_profiles(
            &batch,
            &[Profile {
                did: "did:plc:ghost".to_string(),
                posts_count: None,
            }],
        );
        assert!(!store.is_blocked("plc:ghost").unwrap());
    }

    #[tokio::test]
    async fn promotion_reaches_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        let notifier = BlockNotifier::new(store.clone()).unwrap();
        let (watcher, _tx, _rx) = AccountWatcher::new(
            store.clone(),
            reqwest::Client::new(),
            notifier.clone(),
            10,
            0.10,
        );

        let c = candidate(&store, "did:plc:watched", i64::MAX);
        let batch = HashMap::from([(c.did.clone(), c)]);

        let cancel = CancellationToken::new();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let sub = {
            let notifier = notifier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                notifier
                    .for_all_decisions_since(&cancel, 0, |decision, _| {
                        seen_tx.send(decision.clone()).unwrap();
                        Ok(Flow::Stop)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        watcher.process_profiles(
            &batch,
            &[Profile {
                did: "did:plc:watched".to_string(),
                posts_count: Some(10),
            }],
        );

        let decision = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("no decision observed")
            .unwrap();
        assert_eq!(decision.id, 1);
        assert_eq!(decision.compact_did, "plc:watched");
        sub.await.unwrap().unwrap();
        cancel.cancel();
    }
}
