/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::bloom::BloomFilter;
use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use std::collections::HashSet;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Always-blocked DIDs loaded from an operator-maintained CSV, reloaded on
/// file change. Readers see a consistent snapshot: the bloom filter and the
/// exact set are built off to the side and published together.
pub struct BlockList {
    csv_path: Option<PathBuf>,
    state: RwLock<Arc<BlockSet>>,
    append_lock: Mutex<()>,
    reloaded: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

struct BlockSet {
    filter: BloomFilter,
    set: HashSet<String>,
}

impl BlockList {
    pub fn new(csv_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            csv_path,
            state: RwLock::new(Arc::new(BlockSet {
                filter: BloomFilter::with_estimates(100, 0.01),
                set: HashSet::new(),
            })),
            append_lock: Mutex::new(()),
            reloaded: Mutex::new(None),
        })
    }

    /// Callback invoked after each successful reload.
    pub fn set_reload_notifier(&self, notifier: impl Fn() + Send + Sync + 'static) {
        *self.reloaded.lock().unwrap() = Some(Box::new(notifier));
    }

    /// Bloom test first, exact set to confirm. Never a false negative.
    pub fn contains(&self, compact_did: &str) -> bool {
        let snapshot = self.state.read().unwrap().clone();
        if !snapshot.filter.contains(compact_did) {
            return false;
        }
        snapshot.set.contains(compact_did)
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reparses the whole file and atomically swaps in the fresh set.
    pub fn reload(&self) -> Result<usize> {
        let Some(path) = &self.csv_path else {
            return Ok(0);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read block list: {}", path.display()))?;

        let mut set = HashSet::new();
        for line in raw.lines() {
            let column = match line.find(',') {
                Some(i) => &line[..i],
                None => line,
            };
            let did = column.trim().trim_matches('"');
            let Some(compact) = did.strip_prefix("did:") else {
                // Comments and junk rows are skipped.
                continue;
            };
            set.insert(compact.to_string());
        }

        let mut filter = BloomFilter::with_estimates(set.len(), 0.01);
        for did in &set {
            filter.insert(did);
        }
        let count = set.len();
        *self.state.write().unwrap() = Arc::new(BlockSet { filter, set });
        info!(count, "block list updated");

        if let Some(notifier) = self.reloaded.lock().unwrap().as_ref() {
            notifier();
        }
        Ok(count)
    }

    /// Appends a moderation report row (`did,"type","reason"`) for the
    /// watcher to pick up. Quotes in free-text fields are doubled.
    pub fn append_report(
        &self,
        did: &str,
        reason_type: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        let Some(path) = &self.csv_path else {
            anyhow::bail!("no external block list configured");
        };
        let _guard = self.append_lock.lock().unwrap();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open block list for append: {}", path.display()))?;
        let line = format!(
            "{did},{},{}\n",
            escape_csv(reason_type.unwrap_or("")),
            escape_csv(reason.unwrap_or(""))
        );
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        info!(did, "added to block list csv");
        Ok(())
    }

    /// Long-lived task: initial load, then reload on every file write. A
    /// dead watcher is fatal and cancels the parent token.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let _drop_guard = cancel.clone().drop_guard();
            let Some(path) = self.csv_path.clone() else {
                cancel.cancelled().await;
                return;
            };

            if let Err(e) = self.reload() {
                error!("initial block list load failed: {e:#}");
                return;
            }

            let (tx, mut rx) = mpsc::channel::<notify::Result<notify::Event>>(16);
            let mut watcher = match notify::recommended_watcher(move |res| {
                let _ = tx.blocking_send(res);
            }) {
                Ok(w) => w,
                Err(e) => {
                    error!("create file watcher failed: {e:#}");
                    return;
                }
            };
            if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                error!("watch block list failed: {e:#}");
                return;
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("block list sync stopped");
                        return;
                    }
                    event = rx.recv() => {
                        let Some(event) = event else {
                            error!("file watcher closed");
                            return;
                        };
                        match event {
                            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                                if let Err(e) = self.reload() {
                                    warn!("block list reload failed: {e:#}");
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("file watcher event error: {e:#}"),
                        }
                    }
                }
            }
        })
    }
}

fn escape_csv(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}
