/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::ProfileLabelPolicy;
use crate::identity::LabelerPolicy;
use crate::store::Store;
use crate::store_larger;
use crate::watcher::Candidate;
use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use oneshot_protocol::{AtUri, LabelsMessage, StreamFrame};

pub const LABEL_PORN: &str = "porn";
pub const LABEL_SEXUAL: &str = "sexual";
pub const LABEL_NUDITY: &str = "nudity";
pub const LABEL_GRAPHIC_MEDIA: &str = "graphic-media";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelKind {
    Porn = 0,
    Sexual = 1,
    Nudity = 2,
    GraphicMedia = 3,
    Others = 4,
}

impl LabelKind {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Maps the upstream labeler's values to local kinds. The four built-ins
/// are always present; custom policy identifiers are bucketed by their
/// published attributes.
pub fn kind_mapping(policies: &[LabelerPolicy]) -> HashMap<String, LabelKind> {
    let mut mapping = HashMap::from([
        (LABEL_PORN.to_string(), LabelKind::Porn),
        (LABEL_SEXUAL.to_string(), LabelKind::Sexual),
        (LABEL_NUDITY.to_string(), LabelKind::Nudity),
        (LABEL_GRAPHIC_MEDIA.to_string(), LabelKind::GraphicMedia),
    ]);
    for policy in policies {
        let kind = if policy.adult_only.unwrap_or(false) {
            LabelKind::Sexual
        } else if policy.blurs.as_deref().unwrap_or("none") != "none" {
            LabelKind::GraphicMedia
        } else {
            LabelKind::Others
        };
        mapping.insert(policy.identifier.clone(), kind);
    }
    mapping
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelIntent {
    OnUser,
    OnPost,
    OnProfile,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ExplainedLabel {
    pub did: String,
    pub rkey: String,
    pub intent: LabelIntent,
}

/// Classifies a label subject: an AT-URI on a post or profile record, a
/// bare DID for account-level labels, anything else unknown.
pub fn explain_label(uri: &str) -> ExplainedLabel {
    if let Some(parsed) = AtUri::parse(uri) {
        let intent = match parsed.collection.as_str() {
            "app.bsky.feed.post" => LabelIntent::OnPost,
            "app.bsky.actor.profile" => LabelIntent::OnProfile,
            _ => LabelIntent::Unknown,
        };
        return ExplainedLabel {
            did: parsed.authority,
            rkey: parsed.rkey,
            intent,
        };
    }
    if uri.starts_with("did:") {
        return ExplainedLabel {
            did: uri.to_string(),
            rkey: String::new(),
            intent: LabelIntent::OnUser,
        };
    }
    ExplainedLabel {
        did: String::new(),
        rkey: uri.to_string(),
        intent: LabelIntent::Unknown,
    }
}

/// Consumes the upstream labeler's subscription stream, counts per-actor
/// observations and hands promotion candidates to the account watcher.
///
/// Frames are handled strictly in order on one task; the cursor only ever
/// advances.
pub struct LabelListener {
    store: Store,
    endpoint: String,
    kinds: HashMap<String, LabelKind>,
    profile_policy: ProfileLabelPolicy,
    candidates: mpsc::Sender<Candidate>,

    cursor: AtomicI64,
    counter: AtomicI64,
}

impl LabelListener {
    pub fn new(
        store: Store,
        endpoint: String,
        kinds: HashMap<String, LabelKind>,
        profile_policy: ProfileLabelPolicy,
        candidates: mpsc::Sender<Candidate>,
    ) -> Result<Arc<Self>> {
        let cursor = store.get_config_int("label-cursor", 0)?;
        let counter = store.get_config_int("label-counter", 0)?;
        Ok(Arc::new(Self {
            store,
            endpoint,
            kinds,
            profile_policy,
            candidates,
            cursor: AtomicI64::new(cursor),
            counter: AtomicI64::new(counter),
        }))
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    fn subscribe_url(&self) -> String {
        let host = self
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        format!(
            "wss://{host}/xrpc/com.atproto.label.subscribeLabels?cursor={}",
            self.cursor().saturating_add(1)
        )
    }

    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let listener = self.clone();
        let ticker_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker_cancel.cancelled() => return,
                    _ = tick.tick() => {
                        if let Err(e) = listener.persist_cursor() {
                            warn!("failed to persist label cursor: {e:#}");
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            let _drop_guard = cancel.clone().drop_guard();
            loop {
                info!("connecting to upstream labeler in 1 second");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if let Err(e) = self.listen(&cancel).await {
                            warn!("label stream error: {e:#}");
                        }
                        info!("label websocket disconnected");
                    }
                }
            }
            if let Err(e) = self.persist_cursor() {
                warn!("failed to persist label cursor on shutdown: {e:#}");
            }
            info!("label listening stopped");
        })
    }

    async fn listen(&self, cancel: &CancellationToken) -> Result<()> {
        let url = self.subscribe_url();
        debug!(%url, "dialing label stream");
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("dial label stream")?;

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = ws.next() => message,
            };
            let Some(message) = message else {
                return Ok(());
            };
            match message? {
                Message::Binary(bytes) => match StreamFrame::decode(&bytes) {
                    Ok(StreamFrame::Labels(msg)) => self.handle_message(&msg).await,
                    Ok(StreamFrame::Error(frame)) => {
                        warn!(error = %frame.error, "upstream error frame");
                        return Ok(());
                    }
                    Ok(StreamFrame::Other(t)) => debug!(t, "skipping stream message"),
                    Err(e) => warn!("bad stream frame: {e}"),
                },
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
    }

    /// One `#labels` frame. Per-label failures are logged and skipped; the
    /// stream keeps going.
    pub async fn handle_message(&self, msg: &LabelsMessage) {
        for label in &msg.labels {
            if label.is_negated() {
                continue;
            }
            let Some(kind) = self.kinds.get(&label.val).copied() else {
                continue;
            };

            let info = explain_label(&label.uri);
            if info.intent == LabelIntent::Unknown {
                warn!(uri = %label.uri, "failed to parse label subject");
                continue;
            }
            let compact = info.did.strip_prefix("did:").unwrap_or(&info.did);
            let uid = match self.store.get_or_create_uid(compact) {
                Ok(uid) => uid,
                Err(e) => {
                    warn!(did = %info.did, "failed to intern user: {e:#}");
                    continue;
                }
            };

            let count = match info.intent {
                LabelIntent::OnPost => {
                    match self
                        .store
                        .increment_counter(uid, kind.as_i64(), &info.rkey)
                    {
                        Ok(Some(count)) => count,
                        Ok(None) => continue, // replayed record key
                        Err(e) => {
                            warn!(did = %info.did, "failed to increment counter: {e:#}");
                            continue;
                        }
                    }
                }
                LabelIntent::OnProfile => match self.profile_policy {
                    ProfileLabelPolicy::Ignore => continue,
                    ProfileLabelPolicy::Promote => i64::MAX,
                    ProfileLabelPolicy::Multiply => {
                        match self.store.multiply_counter(uid, kind.as_i64()) {
                            Ok(count) => count,
                            Err(e) => {
                                warn!(did = %info.did, "failed to multiply counter: {e:#}");
                                continue;
                            }
                        }
                    }
                },
                LabelIntent::OnUser => i64::MAX,
                LabelIntent::Unknown => unreachable!(),
            };

            let candidate = Candidate {
                uid,
                did: info.did.clone(),
                count,
            };
            if self.candidates.send(candidate).await.is_err() {
                warn!("account watcher queue closed");
                return;
            }
        }
        store_larger(&self.cursor, msg.seq);
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persist_cursor(&self) -> Result<()> {
        let cursor = self.cursor.load(Ordering::Acquire);
        let counter = self.counter.load(Ordering::Relaxed);
        debug!(cursor, counter, "persisting label cursor");
        self.store.set_config_int("label-cursor", cursor)?;
        self.store.set_config_int("label-counter", counter)?;
        Ok(())
    }

    /// One-shot `--rebuild`: re-derives the block table from the persisted
    /// counters against the configured threshold.
    pub fn rebuild_blocks(&self, threshold: i64) -> Result<usize> {
        let uids = self.store.uids_over_threshold(threshold)?;
        let mut created = 0;
        for uid in uids {
            if self.store.insert_block(uid)?.created {
                created += 1;
            }
        }
        info!(created, threshold, "rebuilt block table");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oneshot_protocol::Label;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn listener(
        store: Store,
        policy: ProfileLabelPolicy,
    ) -> (Arc<LabelListener>, mpsc::Receiver<Candidate>) {
        let (tx, rx) = mpsc::channel(64);
        let listener = LabelListener::new(
            store,
            "https://mod.example.com".to_string(),
            kind_mapping(&[]),
            policy,
            tx,
        )
        .unwrap();
        (listener, rx)
    }

    fn label(val: &str, uri: &str, neg: bool) -> Label {
        Label {
            cid: None,
            cts: "2026-01-02T03:04:05Z".to_string(),
            exp: None,
            neg: neg.then_some(true),
            src: "did:plc:upstream".to_string(),
            uri: uri.to_string(),
            val: val.to_string(),
            ver: Some(1),
            sig: None,
        }
    }

    #[test]
    fn explains_label_subjects() {
        let post = explain_label("at://did:plc:a/app.bsky.feed.post/3k");
        assert_eq!(post.intent, LabelIntent::OnPost);
        assert_eq!(post.did, "did:plc:a");
        assert_eq!(post.rkey, "3k");

        let profile = explain_label("at://did:plc:a/app.bsky.actor.profile/self");
        assert_eq!(profile.intent, LabelIntent::OnProfile);

        let user = explain_label("did:plc:a");
        assert_eq!(user.intent, LabelIntent::OnUser);
        assert_eq!(user.did, "did:plc:a");

        let unknown = explain_label("https://example.com/whatever");
        assert_eq!(unknown.intent, LabelIntent::Unknown);
        let odd_collection = explain_label("at://did:plc:a/app.bsky.feed.like/3k");
        assert_eq!(odd_collection.intent, LabelIntent::Unknown);
    }

    #[test]
    fn kind_mapping_buckets_custom_policies() {
        let mapping = kind_mapping(&[
            LabelerPolicy {
                identifier: "spicy".to_string(),
                adult_only: Some(true),
                blurs: Some("content".to_string()),
            },
            LabelerPolicy {
                identifier: "gore-adjacent".to_string(),
                adult_only: None,
                blurs: Some("media".to_string()),
            },
            LabelerPolicy {
                identifier: "mild".to_string(),
                adult_only: None,
                blurs: Some("none".to_string()),
            },
        ]);
        assert_eq!(mapping["porn"], LabelKind::Porn);
        assert_eq!(mapping["spicy"], LabelKind::Sexual);
        assert_eq!(mapping["gore-adjacent"], LabelKind::GraphicMedia);
        assert_eq!(mapping["mild"], LabelKind::Others);
    }

    #[tokio::test]
    async fn post_labels_count_distinct_rkeys_once() {
        let (_dir, store) = open_store();
        let (listener, mut rx) = listener(store.clone(), ProfileLabelPolicy::Promote);

        for (seq, rkey) in [(1, "r1"), (2, "r2"), (3, "r1")] {
            listener
                .handle_message(&LabelsMessage {
                    seq,
                    labels: vec![label(
                        "porn",
                        &format!("at://did:plc:a/app.bsky.feed.post/{rkey}"),
                        false,
                    )],
                })
                .await;
        }

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!((first.count, second.count), (1, 2));
        // The replayed rkey produced no candidate.
        assert!(rx.try_recv().is_err());
        assert_eq!(store.sum_counts_for_user(first.uid).unwrap(), 2);
        assert_eq!(listener.cursor(), 3);
    }

    #[tokio::test]
    async fn negated_and_unknown_labels_are_skipped() {
        let (_dir, store) = open_store();
        let (listener, mut rx) = listener(store, ProfileLabelPolicy::Promote);
        listener
            .handle_message(&LabelsMessage {
                seq: 5,
                labels: vec![
                    label("porn", "at://did:plc:a/app.bsky.feed.post/r1", true),
                    label("unmapped-value", "at://did:plc:a/app.bsky.feed.post/r2", false),
                    label("porn", "not a subject", false),
                ],
            })
            .await;
        assert!(rx.try_recv().is_err());
        assert_eq!(listener.cursor(), 5);
    }

    #[tokio::test]
    async fn account_labels_promote_immediately() {
        let (_dir, store) = open_store();
        let (listener, mut rx) = listener(store, ProfileLabelPolicy::Promote);
        listener
            .handle_message(&LabelsMessage {
                seq: 9,
                labels: vec![label("sexual", "did:plc:banned", false)],
            })
            .await;
        let candidate = rx.try_recv().unwrap();
        assert_eq!(candidate.count, i64::MAX);
        assert_eq!(candidate.did, "did:plc:banned");
    }

    #[tokio::test]
    async fn profile_label_policy_multiply() {
        let (_dir, store) = open_store();
        let (listener, mut rx) = listener(store, ProfileLabelPolicy::Multiply);
        let uri = "at://did:plc:a/app.bsky.actor.profile/self";
        listener
            .handle_message(&LabelsMessage {
                seq: 1,
                labels: vec![label("porn", uri, false), label("porn", uri, false)],
            })
            .await;
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!((first.count, second.count), (2, 4));
    }

    #[tokio::test]
    async fn cursor_never_regresses() {
        let (_dir, store) = open_store();
        let (listener, _rx) = listener(store.clone(), ProfileLabelPolicy::Promote);
        listener
            .handle_message(&LabelsMessage { seq: 10, labels: vec![] })
            .await;
        listener
            .handle_message(&LabelsMessage { seq: 7, labels: vec![] })
            .await;
        assert_eq!(listener.cursor(), 10);
        listener.persist_cursor().unwrap();
        assert_eq!(store.get_config_int("label-cursor", 0).unwrap(), 10);
    }

    #[tokio::test]
    async fn rebuild_blocks_from_counters() {
        let (_dir, store) = open_store();
        let (listener, _rx) = listener(store.clone(), ProfileLabelPolicy::Promote);
        let heavy = store.get_or_create_uid("plc:heavy").unwrap();
        let light = store.get_or_create_uid("plc:light").unwrap();
        for i in 0..5 {
            store
                .increment_counter(heavy, 0, &format!("r{i}"))
                .unwrap();
        }
        store.increment_counter(light, 0, "r0").unwrap();

        assert_eq!(listener.rebuild_blocks(3).unwrap(), 1);
        assert!(store.is_blocked("plc:heavy").unwrap());
        assert!(!store.is_blocked("plc:light").unwrap());
        // Idempotent.
        assert_eq!(listener.rebuild_blocks(3).unwrap(), 0);
    }
}
