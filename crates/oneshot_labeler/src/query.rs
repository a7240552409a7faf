/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use crate::routes::error_response;
use crate::state::AppState;

/// Translates a `queryLabels` uri pattern to a SQL LIKE pattern over
/// compact DIDs. Only trailing wildcards are allowed; LIKE metacharacters
/// in the input are neutralized.
pub fn pattern_to_like(pattern: &str) -> Result<String, &'static str> {
    let mut p = pattern.replace('%', "").replace('_', "\\_");
    if let Some(rest) = p.strip_prefix("at://did:") {
        p = rest.to_string();
    } else if let Some(rest) = p.strip_prefix("did:") {
        p = rest.to_string();
    }
    if let Some(stem) = p.strip_suffix('*') {
        if stem.contains('*') {
            return Err("only trailing wildcards allowed");
        }
        return Ok(format!("{stem}%"));
    }
    if p.contains('*') {
        return Err("only trailing wildcards allowed");
    }
    Ok(p)
}

pub async fn query_labels(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let mut patterns: Vec<String> = Vec::new();
    let mut sources: Vec<String> = Vec::new();
    let mut cursor: i64 = 0;
    let mut limit: i64 = 10;
    for (key, value) in &params {
        match key.as_str() {
            "uriPatterns" => patterns.push(value.clone()),
            "sources" => sources.push(value.clone()),
            "cursor" => match value.parse() {
                Ok(v) => cursor = v,
                Err(_) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "InvalidRequest",
                        "Invalid cursor",
                    )
                }
            },
            "limit" => match value.parse() {
                Ok(v) => limit = v,
                Err(_) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "InvalidRequest",
                        "Invalid limit",
                    )
                }
            },
            _ => {}
        }
    }
    if limit <= 0 || limit > 250 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "InvalidRequest",
            "limit out of range (0 < limit <= 250)",
        );
    }

    // When the caller filters by source and this instance is not listed,
    // the answer is simply empty.
    if !sources.is_empty() && !sources.iter().any(|s| s == state.keys.src_did()) {
        return Json(serde_json::json!({"labels": []})).into_response();
    }

    let mut like_patterns = Vec::with_capacity(patterns.len());
    for pattern in &patterns {
        match pattern_to_like(pattern) {
            Ok(p) => like_patterns.push(p),
            Err(message) => {
                return error_response(StatusCode::BAD_REQUEST, "InvalidRequest", message)
            }
        }
    }

    let rows = match state.store.query_blocks(&like_patterns, cursor, limit) {
        Ok(rows) => rows,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalError",
                e.to_string(),
            )
        }
    };

    let next_cursor = rows.last().map(|row| row.id.to_string());
    let mut labels = Vec::with_capacity(rows.len());
    for row in rows {
        let decision = oneshot_core::notifier::BlockDecision {
            id: row.id,
            compact_did: row.compact_did,
            created_at: row.created_at,
        };
        match state.keys.sign_decision(&decision) {
            Ok(label) => labels.push(label),
            Err(e) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    e.to_string(),
                )
            }
        }
    }

    Json(serde_json::json!({
        "cursor": next_cursor,
        "labels": labels,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_wildcard_becomes_like() {
        assert_eq!(pattern_to_like("at://did:plc:abc*").unwrap(), "plc:abc%");
        assert_eq!(pattern_to_like("did:plc:abc*").unwrap(), "plc:abc%");
        assert_eq!(pattern_to_like("at://did:plc:abc").unwrap(), "plc:abc");
    }

    #[test]
    fn interior_wildcards_are_rejected() {
        assert!(pattern_to_like("at://did:plc:*abc*").is_err());
        assert!(pattern_to_like("at://did:plc:a*bc").is_err());
    }

    #[test]
    fn like_metacharacters_are_neutralized() {
        assert_eq!(pattern_to_like("at://did:plc:a%b_c").unwrap(), "plc:ab\\_c");
    }
}
