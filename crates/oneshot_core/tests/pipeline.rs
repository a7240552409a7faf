/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! End-to-end pipeline coverage without a live upstream: labels flow
//! through counting and promotion into block decisions, decisions reach
//! the feed ingestor's bloom join, and the pruner evicts the blocked
//! author's earlier entries. The jetstream socket itself never connects
//! (the endpoint does not resolve); events are injected directly.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use oneshot_core::blocklist::BlockList;
use oneshot_core::config::ProfileLabelPolicy;
use oneshot_core::filter::{is_not_comment, FilterChain};
use oneshot_core::jetstream::{BlockSource, JetstreamListener};
use oneshot_core::labels::{kind_mapping, LabelListener};
use oneshot_core::notifier::BlockNotifier;
use oneshot_core::nsfw::CostlyFilterChain;
use oneshot_core::store::Store;
use oneshot_core::watcher::{AccountWatcher, Candidate, Profile};
use oneshot_protocol::{Label, LabelsMessage};

fn porn_label(uri: &str) -> Label {
    Label {
        cid: None,
        cts: "2026-01-02T03:04:05Z".to_string(),
        exp: None,
        neg: None,
        src: "did:plc:upstream".to_string(),
        uri: uri.to_string(),
        val: "porn".to_string(),
        ver: Some(1),
        sig: None,
    }
}

fn post_event(did: &str, rkey: &str) -> oneshot_protocol::JetstreamEvent {
    serde_json::from_value(serde_json::json!({
        "did": did,
        "time_us": 4_102_444_800_000_000i64,
        "kind": "commit",
        "commit": {
            "operation": "create",
            "collection": "app.bsky.feed.post",
            "rkey": rkey,
            "record": {"text": "hello", "langs": ["en"]},
        }
    }))
    .unwrap()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn labels_promote_blocks_and_blocks_gate_the_feed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("pipeline.db")).unwrap();
    let notifier = BlockNotifier::new(store.clone()).unwrap();

    let (watcher, _requeue_tx, _queue_rx) = AccountWatcher::new(
        store.clone(),
        reqwest::Client::new(),
        notifier.clone(),
        10,
        0.10,
    );

    let (candidates_tx, mut candidates_rx) = tokio::sync::mpsc::channel(64);
    let labels = LabelListener::new(
        store.clone(),
        "https://mod.example.com".to_string(),
        kind_mapping(&[]),
        ProfileLabelPolicy::Promote,
        candidates_tx,
    )
    .unwrap();

    let block_list = BlockList::new(None);
    let jetstream = JetstreamListener::new(
        store.clone(),
        notifier.clone(),
        block_list,
        FilterChain::new(vec![is_not_comment()]),
        CostlyFilterChain::none(),
        "wss://jetstream.invalid".to_string(),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let ingest = jetstream.clone().run(cancel.child_token());

    // The offender posts before being blocked; all three entries land.
    jetstream.handle_event(post_event("did:plc:offender", "pre1")).await;
    jetstream.handle_event(post_event("did:plc:offender", "pre2")).await;
    jetstream.handle_event(post_event("did:plc:bystander", "ok1")).await;
    {
        let store = store.clone();
        wait_until("feed entries persisted", move || {
            store.feed_items_before(i64::MAX, 10).unwrap().1.len() == 3
        })
        .await;
    }

    // Five upstream porn labels on distinct posts.
    for i in 0..5 {
        labels
            .handle_message(&LabelsMessage {
                seq: i + 1,
                labels: vec![porn_label(&format!(
                    "at://did:plc:offender/app.bsky.feed.post/r{i}"
                ))],
            })
            .await;
    }

    // Run one profile batch the way the account watcher does: 30 posts at
    // ratio 0.10 tolerates 3 offending posts, so count 5 promotes.
    let mut batch: HashMap<String, Candidate> = HashMap::new();
    while let Ok(candidate) = candidates_rx.try_recv() {
        batch.insert(candidate.did.clone(), candidate);
    }
    assert_eq!(batch.len(), 1);
    assert_eq!(batch["did:plc:offender"].count, 5);
    watcher.process_profiles(
        &batch,
        &[Profile {
            did: "did:plc:offender".to_string(),
            posts_count: Some(30),
        }],
    );
    assert!(store.is_blocked("plc:offender").unwrap());

    // The decision propagates to the bloom join.
    {
        let jetstream = jetstream.clone();
        wait_until("block decision reached the bloom filter", move || {
            jetstream.in_block_list("plc:offender") == BlockSource::Db
        })
        .await;
    }

    // New posts by the blocked author are dropped; others still pass.
    jetstream.handle_event(post_event("did:plc:offender", "post1")).await;
    jetstream.handle_event(post_event("did:plc:bystander", "ok2")).await;
    assert_eq!(jetstream.stats.items_blocked_by_db.load(Ordering::Relaxed), 1);
    {
        let store = store.clone();
        wait_until("second bystander post persisted", move || {
            store
                .feed_items_before(i64::MAX, 10)
                .unwrap()
                .1
                .contains(&"did:plc:bystander/ok2".to_string())
        })
        .await;
    }

    // The pruner evicts the offender's earlier entries.
    jetstream.prune_blocked_entries().await.unwrap();
    let (_, items) = store.feed_items_before(i64::MAX, 10).unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|uri| uri.starts_with("did:plc:bystander/")));

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), ingest).await;
}
