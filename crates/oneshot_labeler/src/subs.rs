/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::anyhow;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use oneshot_core::notifier::Flow;
use oneshot_protocol::{LabelsMessage, StreamFrame};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    #[serde(default)]
    pub cursor: Option<i64>,
}

pub async fn subscribe_labels(
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_subscription(state, query.cursor.unwrap_or(0), socket))
}

async fn close_with_error(mut socket: WebSocket, error: &str, message: &str) {
    if let Ok(frame) = StreamFrame::encode_error(error, message) {
        let _ = socket.send(Message::Binary(frame)).await;
    }
    let _ = socket.close().await;
}

async fn handle_subscription(state: AppState, cursor: i64, mut socket: WebSocket) {
    let latest = match state.store.last_block_id() {
        Ok(latest) => latest,
        Err(e) => {
            close_with_error(socket, "InternalError", &e.to_string()).await;
            return;
        }
    };
    if cursor > latest {
        close_with_error(socket, "FutureCursor", "Cursor is in the future").await;
        return;
    }

    // The notifier callback is synchronous; frames travel to the socket
    // writer over a bounded relay. A client that cannot keep up fills the
    // relay and gets disconnected.
    let (frames_tx, mut frames_rx) = mpsc::channel::<Vec<u8>>(64);
    let cancel = CancellationToken::new();

    let producer = {
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            state
                .notifier
                .for_all_decisions_since(&cancel, cursor, |decision, _| {
                    let label = state.keys.sign_decision(decision)?;
                    let frame = StreamFrame::encode_labels(&LabelsMessage {
                        seq: decision.id,
                        labels: vec![label],
                    })?;
                    frames_tx
                        .try_send(frame)
                        .map_err(|_| anyhow!("subscriber not keeping up"))?;
                    Ok(Flow::Continue)
                })
                .await
        })
    };

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    // recv() also services ping/pong transparently.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            frame = frames_rx.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    cancel.cancel();
    match producer.await {
        Ok(Ok(())) => debug!("label subscriber disconnected"),
        Ok(Err(e)) => warn!("label subscription ended: {e:#}"),
        Err(e) => warn!("label subscription task failed: {e}"),
    }
    let _ = socket.close().await;
}
