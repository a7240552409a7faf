/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::extract::{Json as JsonBody, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tracing::warn;

use oneshot_core::jwt::verify_service_jwt;
use oneshot_protocol::AtUri;

use crate::routes::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportInput {
    #[serde(default)]
    pub reason_type: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    pub subject: serde_json::Value,
}

/// Extracts the offending DID from a report subject: a repo strong ref
/// carrying an AT-URI, or a bare DID.
fn offender_did(subject: &serde_json::Value) -> Option<String> {
    let uri = subject
        .get("uri")
        .or_else(|| subject.get("did"))
        .and_then(|v| v.as_str())?;
    if let Some(parsed) = AtUri::parse(uri) {
        if parsed.authority.starts_with("did:") {
            return Some(parsed.authority);
        }
        return None;
    }
    if uri.starts_with("did:") {
        return Some(uri.to_string());
    }
    None
}

/// Moderator-only: appends the reported account to the external block list
/// CSV, which the file watcher folds back in.
pub async fn create_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(input): JsonBody<ReportInput>,
) -> Response {
    let auth = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(bearer) = auth.strip_prefix("Bearer ") else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "InvalidToken",
            "Missing Bearer token",
        );
    };

    let caller = match verify_service_jwt(&state.directory, &state.cfg.user_did, bearer).await {
        Ok(caller) => caller,
        Err(e) => {
            return error_response(StatusCode::UNAUTHORIZED, "InvalidToken", e.to_string())
        }
    };
    let is_moderator = caller
        .handle
        .as_deref()
        .map(|handle| state.cfg.moderator_handles.iter().any(|m| m == handle))
        .unwrap_or(false);
    if !is_moderator {
        return error_response(StatusCode::UNAUTHORIZED, "InvalidToken", "Not a moderator");
    }

    let Some(offender) = offender_did(&input.subject) else {
        return error_response(StatusCode::BAD_REQUEST, "BadRequest", "Missing subject");
    };
    if offender.contains('"') {
        return error_response(
            StatusCode::BAD_REQUEST,
            "BadRequest",
            "Invalid character in uri did",
        );
    }

    {
        let block_list = state.block_list.clone();
        let offender = offender.clone();
        let reason_type = input.reason_type.clone();
        let reason = input.reason.clone();
        let result = tokio::task::spawn_blocking(move || {
            block_list.append_report(&offender, reason_type.as_deref(), reason.as_deref())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to append report to block list: {e:#}"),
            Err(e) => warn!("block list append task failed: {e}"),
        }
    }

    Json(serde_json::json!({
        "id": 0,
        "createdAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "reasonType": input.reason_type,
        "reason": input.reason,
        "reportedBy": caller.did,
        "subject": input.subject,
    }))
    .into_response()
}
