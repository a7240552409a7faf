/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::Store;
use anyhow::Result;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const OUTBOX_CAPACITY: usize = 16;

/// A committed block decision as published to subscribers. Signing and wire
/// formatting happen at the serving edge, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDecision {
    pub id: i64,
    pub compact_did: String,
    pub created_at: i64,
}

/// Whether a `for_all_decisions_since` callback wants more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

struct SubEntry {
    id: u64,
    tx: mpsc::Sender<BlockDecision>,
}

/// In-process broadcast of newly committed block decisions with catch-up
/// from the store for late subscribers.
///
/// Decisions are published in strictly increasing id order. `last` advances
/// monotonically; close publishes `-1` which terminates all subscribers.
pub struct BlockNotifier {
    store: Store,
    subs: RwLock<Vec<SubEntry>>,
    last: AtomicI64,
    sub_seq: AtomicU64,
}

pub struct Subscription {
    /// The last id committed at subscribe time.
    pub since: i64,
    rx: mpsc::Receiver<BlockDecision>,
    id: u64,
    notifier: Arc<BlockNotifier>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.remove_sub(self.id);
    }
}

impl BlockNotifier {
    pub fn new(store: Store) -> Result<Arc<Self>> {
        let last = store.last_block_id()?;
        Ok(Arc::new(Self {
            store,
            subs: RwLock::new(Vec::new()),
            last: AtomicI64::new(last),
            sub_seq: AtomicU64::new(1),
        }))
    }

    pub fn last(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }

    /// Publishes one decision to every live subscriber. A subscriber whose
    /// outbox is full is dropped as slow rather than blocking the producer.
    pub fn notify(&self, decision: BlockDecision) {
        // Same lock the subscribe path takes, so a subscriber either sees
        // this id in its `since` snapshot or receives it on its outbox,
        // never both.
        let subs = self.subs.read().unwrap();
        self.last.store(decision.id, Ordering::Release);

        let mut slow: Vec<u64> = Vec::new();
        for entry in subs.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = entry.tx.try_send(decision.clone()) {
                warn!(sub = entry.id, "dropping slow label subscriber");
                slow.push(entry.id);
            }
        }
        drop(subs);

        if !slow.is_empty() {
            let mut subs = self.subs.write().unwrap();
            subs.retain(|entry| !slow.contains(&entry.id));
        }
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let id = self.sub_seq.fetch_add(1, Ordering::Relaxed);

        let mut subs = self.subs.write().unwrap();
        let since = self.last.load(Ordering::Acquire);
        if since >= 0 {
            subs.push(SubEntry { id, tx });
        }
        // A negative snapshot means the notifier is closed; the dangling
        // receiver reports closure immediately.
        drop(subs);

        Subscription {
            since,
            rx,
            id,
            notifier: self.clone(),
        }
    }

    fn remove_sub(&self, id: u64) {
        let mut subs = self.subs.write().unwrap();
        subs.retain(|entry| entry.id != id);
    }

    /// Terminates all subscribers; future subscriptions end immediately.
    pub fn close(&self) {
        let mut subs = self.subs.write().unwrap();
        self.last.store(-1, Ordering::Release);
        subs.clear();
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subs.read().unwrap().len()
    }

    /// Replays every decision with id > `since` from the store, then hands
    /// off to the live feed, without gaps or duplicates.
    ///
    /// Subscribing snapshots `last`; catch-up reads only `(since, last]`
    /// and the loop re-subscribes until the snapshot stops moving, so a
    /// storm of commits during catch-up cannot open a window.
    pub async fn for_all_decisions_since<F>(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        mut since: i64,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(&BlockDecision, bool) -> Result<Flow>,
    {
        let mut sub = self.subscribe();
        let mut latest = sub.since;
        while latest > since {
            drop(sub);
            let rows = {
                let store = self.store.clone();
                let (from, to) = (since, latest);
                tokio::task::spawn_blocking(move || store.blocks_in_range(from, to)).await??
            };
            for row in rows {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let decision = BlockDecision {
                    id: row.id,
                    compact_did: row.compact_did,
                    created_at: row.created_at,
                };
                if f(&decision, true)? == Flow::Stop {
                    return Ok(());
                }
            }
            since = latest;
            if cancel.is_cancelled() {
                return Ok(());
            }
            sub = self.subscribe();
            latest = sub.since;
        }
        if latest < 0 {
            return Ok(());
        }
        debug!(since, "caught up, streaming live decisions");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                decision = sub.rx.recv() => {
                    let Some(decision) = decision else {
                        // Closed, or this subscriber was dropped as slow.
                        return Ok(());
                    };
                    if f(&decision, false)? == Flow::Stop {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn insert_block(store: &Store, name: &str) -> BlockDecision {
        let uid = store.get_or_create_uid(name).unwrap();
        let inserted = store.insert_block(uid).unwrap();
        BlockDecision {
            id: inserted.id,
            compact_did: name.to_string(),
            created_at: inserted.created_at,
        }
    }

    #[tokio::test]
    async fn catch_up_then_live_is_exactly_once() {
        let (_dir, store) = open_store();
        for i in 1..=10 {
            insert_block(&store, &format!("plc:seed{i}"));
        }
        let notifier = BlockNotifier::new(store.clone()).unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = {
            let notifier = notifier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                notifier
                    .for_all_decisions_since(&cancel, 0, |decision, historical| {
                        seen_tx.send((decision.id, historical)).unwrap();
                        Ok(Flow::Continue)
                    })
                    .await
            })
        };

        // Wait for catch-up of the pre-seeded decisions.
        let mut seen = Vec::new();
        while seen.len() < 10 {
            let item = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
                .await
                .expect("catch-up timed out")
                .unwrap();
            seen.push(item);
        }

        // Emit one more decision live.
        let decision = insert_block(&store, "plc:live11");
        notifier.notify(decision);
        let live = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("live delivery timed out")
            .unwrap();
        seen.push(live);

        let ids: Vec<i64> = seen.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, (1..=11).collect::<Vec<i64>>());
        assert!(seen[..10].iter().all(|(_, historical)| *historical));
        assert!(!seen[10].1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn commit_storm_during_catch_up_has_no_gaps() {
        let (_dir, store) = open_store();
        for i in 1..=5 {
            insert_block(&store, &format!("plc:seed{i}"));
        }
        let notifier = BlockNotifier::new(store.clone()).unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = {
            let notifier = notifier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                notifier
                    .for_all_decisions_since(&cancel, 0, |decision, _| {
                        seen_tx.send(decision.id).unwrap();
                        Ok(Flow::Continue)
                    })
                    .await
            })
        };

        let producer = {
            let store = store.clone();
            let notifier = notifier.clone();
            tokio::spawn(async move {
                for i in 6..=40 {
                    let decision = insert_block(&store, &format!("plc:storm{i}"));
                    notifier.notify(decision);
                    tokio::task::yield_now().await;
                }
            })
        };
        producer.await.unwrap();

        let mut ids = Vec::new();
        while ids.len() < 40 {
            let id = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
                .await
                .expect("delivery timed out")
                .unwrap();
            ids.push(id);
        }
        assert_eq!(ids, (1..=40).collect::<Vec<i64>>());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking() {
        let (_dir, store) = open_store();
        let notifier = BlockNotifier::new(store.clone()).unwrap();
        let _sub = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);

        // Never reading: the outbox fills and the producer sheds the
        // subscriber instead of waiting.
        for i in 1..=(OUTBOX_CAPACITY as i64 + 2) {
            let decision = insert_block(&store, &format!("plc:flood{i}"));
            notifier.notify(decision);
        }
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_terminates_current_and_future_subscribers() {
        let (_dir, store) = open_store();
        let notifier = BlockNotifier::new(store).unwrap();
        let cancel = CancellationToken::new();

        let running = {
            let notifier = notifier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                notifier
                    .for_all_decisions_since(&cancel, 0, |_, _| Ok(Flow::Continue))
                    .await
            })
        };
        tokio::task::yield_now().await;
        notifier.close();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("subscriber did not terminate on close")
            .unwrap()
            .unwrap();

        // After close, a new subscription ends immediately.
        let sub = notifier.subscribe();
        assert_eq!(sub.since, -1);
        notifier
            .for_all_decisions_since(&cancel, 0, |_, _| Ok(Flow::Continue))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn callback_stop_ends_the_stream() {
        let (_dir, store) = open_store();
        for i in 1..=3 {
            insert_block(&store, &format!("plc:seed{i}"));
        }
        let notifier = BlockNotifier::new(store).unwrap();
        let cancel = CancellationToken::new();
        let mut seen = 0;
        notifier
            .for_all_decisions_since(&cancel, 0, |_, _| {
                seen += 1;
                Ok(if seen == 2 { Flow::Stop } else { Flow::Continue })
            })
            .await
            .unwrap();
        assert_eq!(seen, 2);
    }
}
