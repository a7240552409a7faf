/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use oneshot_protocol::{XrpcError, ATPROTO_VERSION};

use crate::state::AppState;
use crate::{feed, query, report, subs};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(home))
        .route("/.well-known/atproto-did", get(well_known))
        .route("/xrpc/_health", get(health))
        .route("/xrpc/com.atproto.label.queryLabels", get(query::query_labels))
        .route(
            "/xrpc/com.atproto.label.subscribeLabels",
            get(subs::subscribe_labels),
        )
        .route(
            "/xrpc/app.bsky.feed.describeFeedGenerator",
            get(feed::describe_feed_generator),
        )
        .route(
            "/xrpc/app.bsky.feed.getFeedSkeleton",
            get(feed::get_feed_skeleton),
        )
        .route(
            "/xrpc/com.atproto.moderation.createReport",
            post(report::create_report),
        )
        .route("/xrpc/*method", any(not_implemented))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (status, Json(XrpcError::new(error, message))).into_response()
}

async fn home(State(state): State<AppState>) -> Html<String> {
    let stats = state.jetstream.stats.snapshot();
    let latest = state.store.last_block_id().unwrap_or(0);
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>oneshot labeler</title></head>
<body>
<h1>oneshot labeler</h1>
<p>Derived moderation labels from <code>{upstream}</code>, served by
<code>{user}</code>.</p>
<p>Latest block id: {latest}</p>
<pre>{stats}</pre>
</body>
</html>
"#,
        upstream = state.cfg.upstream_user,
        user = state.cfg.username,
        stats = serde_json::to_string_pretty(&stats).unwrap_or_default(),
    ))
}

async fn well_known(State(state): State<AppState>) -> String {
    state.cfg.user_did.clone()
}

async fn health(State(state): State<AppState>) -> Response {
    let latest = match state.store.last_block_id() {
        Ok(id) => serde_json::json!(id),
        Err(_) => serde_json::json!("unknown"),
    };
    Json(serde_json::json!({
        "version": ATPROTO_VERSION,
        "latest": latest,
    }))
    .into_response()
}

async fn not_implemented() -> Response {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "MethodNotImplemented",
        "Method not implemented",
    )
}
