/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::blocklist::BlockList;
use crate::bloom::BloomFilter;
use crate::filter::FilterChain;
use crate::notifier::{BlockDecision, BlockNotifier, Flow};
use crate::nsfw::CostlyFilterChain;
use crate::store::{now_ms, Store};
use crate::store_larger;
use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use oneshot_protocol::{compact_uri, AtUri, FeedPost, JetstreamEvent};

const POST_COLLECTION: &str = "app.bsky.feed.post";
const FEED_WINDOW: Duration = Duration::from_secs(48 * 3600);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(600);
const PRUNE_PULSE_EVERY: u64 = 32;
const PERSIST_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct FeedStats {
    pub started_at_ms: AtomicI64,
    pub items_received: AtomicI64,
    pub items_persisted: AtomicI64,
    pub items_blocked_by_db: AtomicI64,
    pub items_blocked_by_csv: AtomicI64,
    pub items_blocked_by_filter: AtomicI64,
}

impl FeedStats {
    fn inc(&self, counter: &AtomicI64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "started_at_ms": self.started_at_ms.load(Ordering::Relaxed),
            "items_received": self.items_received.load(Ordering::Relaxed),
            "items_persisted": self.items_persisted.load(Ordering::Relaxed),
            "items_blocked_by_db": self.items_blocked_by_db.load(Ordering::Relaxed),
            "items_blocked_by_csv": self.items_blocked_by_csv.load(Ordering::Relaxed),
            "items_blocked_by_filter": self.items_blocked_by_filter.load(Ordering::Relaxed),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    OutOfBlockList,
    Db,
    Csv,
}

struct BloomState {
    filter: BloomFilter,
    approx: i64,
}

/// Consumes the post firehose, applies the filter chain and the block-set
/// joins, and persists a pruned rolling feed window.
pub struct JetstreamListener {
    store: Store,
    notifier: Arc<BlockNotifier>,
    block_list: Arc<BlockList>,
    filters: FilterChain,
    costly: CostlyFilterChain,
    endpoint: String,

    sync_time: AtomicI64,
    bloom: RwLock<BloomState>,

    persist_tx: mpsc::Sender<String>,
    persist_rx: Mutex<Option<mpsc::Receiver<String>>>,
    list_updated_tx: mpsc::Sender<()>,
    list_updated_rx: Mutex<Option<mpsc::Receiver<()>>>,

    pub stats: FeedStats,
}

impl JetstreamListener {
    pub fn new(
        store: Store,
        notifier: Arc<BlockNotifier>,
        block_list: Arc<BlockList>,
        filters: FilterChain,
        costly: CostlyFilterChain,
        endpoint: String,
    ) -> Result<Arc<Self>> {
        let block_count = store.last_block_id()?;
        let default_cursor = (now_ms() - 60_000) * 1000;
        let sync_time = store.get_config_int("sync-time", default_cursor)?;

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let (persist_tx, persist_rx) = mpsc::channel(workers * 32);
        let (list_updated_tx, list_updated_rx) = mpsc::channel(1);

        let stats = FeedStats::default();
        stats.started_at_ms.store(now_ms(), Ordering::Relaxed);

        Ok(Arc::new(Self {
            store,
            notifier,
            block_list,
            filters,
            costly,
            endpoint,
            sync_time: AtomicI64::new(sync_time),
            bloom: RwLock::new(BloomState {
                filter: BloomFilter::with_estimates(block_count.max(1) as usize, 0.01),
                approx: block_count,
            }),
            persist_tx,
            persist_rx: Mutex::new(Some(persist_rx)),
            list_updated_tx,
            list_updated_rx: Mutex::new(Some(list_updated_rx)),
            stats,
        }))
    }

    pub fn sync_time(&self) -> i64 {
        self.sync_time.load(Ordering::Acquire)
    }

    /// Coalescing pulse: the pruner runs at most once per batch of pulses.
    pub fn notify_list_updated(&self) {
        let _ = self.list_updated_tx.try_send(());
    }

    fn subscribe_url(&self) -> String {
        format!(
            "{}/subscribe?wantedCollections={POST_COLLECTION}&cursor={}",
            self.endpoint.trim_end_matches('/'),
            self.sync_time()
        )
    }

    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        // The persist loop gets its own token so it can drain after the
        // socket consumer stops.
        let persist_cancel = CancellationToken::new();
        let persist_rx = self
            .persist_rx
            .lock()
            .unwrap()
            .take()
            .expect("jetstream listener started twice");
        let persist = tokio::spawn(self.clone().run_persist(persist_rx, persist_cancel.clone()));

        let pulse_rx = self.list_updated_rx.lock().unwrap().take().unwrap();
        tokio::spawn(self.clone().run_prune_pulses(pulse_rx, cancel.clone()));
        self.start_bloom_sync(cancel.clone());

        tokio::spawn(async move {
            let _drop_guard = cancel.clone().drop_guard();
            let workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            let semaphore = Arc::new(Semaphore::new(workers));

            loop {
                debug!("connecting to jetstream in 1 second");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if let Err(e) = self.clone().listen(&cancel, &semaphore).await {
                            error!("jetstream error: {e:#}");
                        }
                        debug!("jetstream disconnected");
                    }
                }
            }

            info!("jetstream stopped, draining persist queue");
            persist_cancel.cancel();
            let _ = persist.await;
            if let Err(e) = self.persist_sync_time() {
                warn!("failed to persist sync-time: {e:#}");
            }
        })
    }

    async fn listen(
        self: Arc<Self>,
        cancel: &CancellationToken,
        semaphore: &Arc<Semaphore>,
    ) -> Result<()> {
        let url = self.subscribe_url();
        debug!(%url, "dialing jetstream");
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("dial jetstream")?;

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = ws.next() => message,
            };
            let Some(message) = message else {
                return Ok(());
            };
            match message? {
                Message::Text(raw) => {
                    let event: JetstreamEvent = match serde_json::from_str(&raw) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("bad jetstream frame: {e}");
                            continue;
                        }
                    };
                    // Fan out; language detection is CPU-bound.
                    let permit = semaphore.clone().acquire_owned().await?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_event(event).await;
                        drop(permit);
                    });
                }
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
    }

    pub async fn handle_event(&self, event: JetstreamEvent) {
        self.stats.inc(&self.stats.items_received);
        if event.kind != "commit" {
            return;
        }
        let Some(commit) = &event.commit else {
            return;
        };
        if commit.operation != "create" || commit.collection != POST_COLLECTION {
            return;
        }
        store_larger(&self.sync_time, event.time_us);

        let Some(record) = &commit.record else {
            return;
        };
        let mut post: FeedPost = match serde_json::from_value(record.clone()) {
            Ok(post) => post,
            Err(e) => {
                warn!(rkey = %commit.rkey, "bad post record: {e}");
                return;
            }
        };
        if post.reply.is_some() {
            return;
        }

        if !self.filters.should_keep(&mut post, &event.did) {
            self.stats.inc(&self.stats.items_blocked_by_filter);
            return;
        }

        let compact = event.did.strip_prefix("did:").unwrap_or(&event.did);
        let source = self.in_block_list(compact);
        if source != BlockSource::OutOfBlockList {
            self.inc_block_stats(source);
            return;
        }
        // Quote-posts count against the quoted author too.
        if let Some(embedded) = post.embedded_record_uri() {
            if let Some(uri) = AtUri::parse(embedded) {
                let embed_compact = uri.authority.strip_prefix("did:").unwrap_or(&uri.authority);
                let source = self.in_block_list(embed_compact);
                if source != BlockSource::OutOfBlockList {
                    self.inc_block_stats(source);
                    return;
                }
            }
        }

        if !self.costly.should_keep(&post, &event.did).await {
            self.stats.inc(&self.stats.items_blocked_by_filter);
            return;
        }

        let uri = compact_uri(&event.did, &commit.rkey);
        debug!(%uri, langs = ?post.langs, "keeping feed item");
        if self.persist_tx.send(uri).await.is_err() {
            warn!("persist queue closed");
        }
    }

    fn inc_block_stats(&self, source: BlockSource) {
        match source {
            BlockSource::Db => self.stats.inc(&self.stats.items_blocked_by_db),
            BlockSource::Csv => self.stats.inc(&self.stats.items_blocked_by_csv),
            BlockSource::OutOfBlockList => {}
        }
    }

    /// CSV first (authoritative), then the bloom filter with a store
    /// confirmation on positives. Bloom false positives cost one read,
    /// never a wrong answer.
    pub fn in_block_list(&self, compact_did: &str) -> BlockSource {
        if self.block_list.contains(compact_did) {
            return BlockSource::Csv;
        }
        if !self.bloom.read().unwrap().filter.contains(compact_did) {
            return BlockSource::OutOfBlockList;
        }
        match self.store.is_blocked(compact_did) {
            Ok(true) => BlockSource::Db,
            Ok(false) => BlockSource::OutOfBlockList,
            Err(e) => {
                error!("failed to check blocked user: {e:#}");
                BlockSource::OutOfBlockList
            }
        }
    }

    async fn run_persist(self: Arc<Self>, mut rx: mpsc::Receiver<String>, cancel: CancellationToken) {
        let mut count: u64 = 0;
        let mut last_housekeeping = tokio::time::Instant::now();
        loop {
            let uri = tokio::select! {
                _ = cancel.cancelled() => break,
                uri = rx.recv() => {
                    let Some(uri) = uri else { break };
                    uri
                }
            };
            self.persist_one(&uri);
            count += 1;
            if count % 100 == 0 && last_housekeeping.elapsed() > HOUSEKEEPING_INTERVAL {
                last_housekeeping = tokio::time::Instant::now();
                let store = self.store.clone();
                let result = tokio::task::spawn_blocking(move || -> Result<()> {
                    store.prune_feed_older_than(now_ms() - FEED_WINDOW.as_millis() as i64)?;
                    store.incremental_vacuum()?;
                    Ok(())
                })
                .await;
                match result {
                    Ok(Ok(())) => debug!("feed housekeeping done"),
                    Ok(Err(e)) => error!("feed housekeeping failed: {e:#}"),
                    Err(e) => error!("feed housekeeping panicked: {e}"),
                }
            }
        }

        // Bounded drain so queued items survive an orderly shutdown.
        let deadline = tokio::time::Instant::now() + PERSIST_DRAIN;
        while tokio::time::Instant::now() < deadline {
            match rx.try_recv() {
                Ok(uri) => self.persist_one(&uri),
                Err(_) => break,
            }
        }
        info!("persist loop done");
    }

    fn persist_one(&self, uri: &str) {
        match self.store.insert_feed_item(uri) {
            Ok(()) => self.stats.inc(&self.stats.items_persisted),
            Err(e) => error!(%uri, "failed to insert feed item: {e:#}"),
        }
    }

    async fn run_prune_pulses(self: Arc<Self>, mut rx: mpsc::Receiver<()>, cancel: CancellationToken) {
        let mut pulses: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                pulse = rx.recv() => {
                    if pulse.is_none() {
                        return;
                    }
                    pulses += 1;
                    if pulses % PRUNE_PULSE_EVERY == 0 {
                        if let Err(e) = self.prune_blocked_entries().await {
                            error!("failed to prune blocked entries: {e:#}");
                        }
                    }
                }
            }
        }
    }

    /// Evicts feed entries whose author has since been blocked.
    pub async fn prune_blocked_entries(self: &Arc<Self>) -> Result<()> {
        debug!("pruning blocked entries");
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.store.prune_feed_by_predicate(|uri| {
                let Some(slash) = uri.find('/') else {
                    return false;
                };
                let compact = uri[..slash].trim_start_matches("did:");
                this.in_block_list(compact) != BlockSource::OutOfBlockList
            })
        })
        .await?
    }

    /// Starts the bloom sync task. Split out of `run` so the join logic
    /// can be exercised without a live firehose socket.
    pub fn start_bloom_sync(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.clone().run_bloom_sync(cancel))
    }

    /// Feeds every block decision into the local bloom filter, rebuilding
    /// it in place when the id range outgrows the sizing estimate.
    async fn run_bloom_sync(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let mut rebuild_to: Option<i64> = None;
            let result = self
                .notifier
                .for_all_decisions_since(&cancel, 0, |decision, historical| {
                    Ok(self.apply_decision_to_bloom(decision, historical, &mut rebuild_to))
                })
                .await;
            match result {
                Ok(()) => match rebuild_to {
                    Some(new_size) => {
                        debug!(new_size, "rebuilding bloom filter");
                        self.rebuild_bloom(new_size);
                        // Restart from zero against the fresh filter.
                        continue;
                    }
                    None => {
                        // Cancelled or notifier closed.
                        if cancel.is_cancelled() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                Err(e) => {
                    error!("bloom filter sync error: {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn apply_decision_to_bloom(
        &self,
        decision: &BlockDecision,
        live: bool,
        rebuild_to: &mut Option<i64>,
    ) -> Flow {
        {
            let state = self.bloom.read().unwrap();
            // Past twice the sizing estimate the false-positive rate is no
            // longer the one we promised; stop and resize.
            if decision.id > state.approx.saturating_mul(2) {
                *rebuild_to = Some(decision.id);
                return Flow::Stop;
            }
        }
        self.bloom
            .write()
            .unwrap()
            .filter
            .insert(&decision.compact_did);
        if live {
            debug!(did = %decision.compact_did, "adding to block filter");
            self.notify_list_updated();
        }
        Flow::Continue
    }

    /// Explicit rebuild-in-place: fresh filter sized for the new id range;
    /// the caller replays all decisions into it.
    fn rebuild_bloom(&self, new_size: i64) {
        let mut state = self.bloom.write().unwrap();
        state.filter = BloomFilter::with_estimates(new_size.max(1) as usize, 0.01);
        state.approx = new_size;
    }

    pub fn persist_sync_time(&self) -> Result<()> {
        self.store
            .set_config_int("sync-time", self.sync_time.load(Ordering::Acquire))
    }
}
