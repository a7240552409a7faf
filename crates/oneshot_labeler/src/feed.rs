/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use oneshot_core::jetstream::BlockSource;
use oneshot_protocol::{post_uri_from_compact, split_compact_uri};

use crate::routes::error_response;
use crate::state::AppState;

pub async fn describe_feed_generator(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "did": state.cfg.user_did,
        "feeds": [{"uri": state.cfg.feed_uri()}],
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SkeletonQuery {
    #[serde(default)]
    pub feed: Option<String>,
    #[serde(default)]
    pub cursor: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn get_feed_skeleton(
    State(state): State<AppState>,
    Query(query): Query<SkeletonQuery>,
) -> Response {
    let cursor = query.cursor.unwrap_or(i64::MAX);
    let limit = query.limit.unwrap_or(50);
    if !(1..=100).contains(&limit) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "InvalidRequest",
            "Limit must be between 1 and 100",
        );
    }
    if cursor <= 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "InvalidRequest",
            "Cursor must be greater than 0",
        );
    }
    let feed_uri = state.cfg.feed_uri();
    if query.feed.as_deref() != Some(feed_uri.as_str()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "InvalidRequest",
            format!("Feed must be {feed_uri}"),
        );
    }

    let (next_cursor, items) = match state.store.feed_items_before(cursor, limit) {
        Ok(page) => page,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalError",
                e.to_string(),
            )
        }
    };

    let mut feed = Vec::with_capacity(items.len());
    for uri in &items {
        // Last-chance filter: the pruner is eventually consistent, so an
        // author blocked after insertion may still be present here.
        if let Some((did, _)) = split_compact_uri(uri) {
            let compact = did.strip_prefix("did:").unwrap_or(did);
            if state.jetstream.in_block_list(compact) != BlockSource::OutOfBlockList {
                continue;
            }
        }
        if let Some(post) = post_uri_from_compact(uri) {
            feed.push(serde_json::json!({"post": post}));
        }
    }

    let cursor_out = if items.is_empty() {
        None
    } else {
        Some(next_cursor.to_string())
    };
    Json(serde_json::json!({
        "cursor": cursor_out,
        "feed": feed,
    }))
    .into_response()
}
