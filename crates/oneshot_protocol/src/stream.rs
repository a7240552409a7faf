/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

use crate::label::Label;

pub const OP_MESSAGE: i64 = 1;
pub const OP_ERROR: i64 = -1;

/// Header of one binary websocket frame on a label subscription stream.
/// The frame body is a second CBOR item immediately following the header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    pub op: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsMessage {
    pub seq: i64,
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// A `#labels` message.
    Labels(LabelsMessage),
    /// An error frame; the stream ends after one of these.
    Error(ErrorFrame),
    /// A message type we do not consume (skipped).
    Other(String),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame decode: {0}")]
    Decode(String),
}

impl StreamFrame {
    /// Decodes one binary frame: CBOR header followed by CBOR payload.
    pub fn decode(bytes: &[u8]) -> Result<StreamFrame, FrameError> {
        let mut cursor = Cursor::new(bytes);
        let header: EventHeader = ciborium::de::from_reader(&mut cursor)
            .map_err(|e| FrameError::Decode(format!("header: {e}")))?;

        if header.op == OP_ERROR {
            let body: ErrorFrame = ciborium::de::from_reader(&mut cursor)
                .map_err(|e| FrameError::Decode(format!("error frame: {e}")))?;
            return Ok(StreamFrame::Error(body));
        }

        match header.t.as_deref() {
            Some("#labels") => {
                let body: LabelsMessage = ciborium::de::from_reader(&mut cursor)
                    .map_err(|e| FrameError::Decode(format!("labels body: {e}")))?;
                Ok(StreamFrame::Labels(body))
            }
            other => Ok(StreamFrame::Other(other.unwrap_or("").to_string())),
        }
    }

    /// Encodes a `#labels` frame as sent to our own subscribers.
    pub fn encode_labels(msg: &LabelsMessage) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::new();
        let header = EventHeader {
            op: OP_MESSAGE,
            t: Some("#labels".to_string()),
        };
        ciborium::ser::into_writer(&header, &mut buf)
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        ciborium::ser::into_writer(msg, &mut buf).map_err(|e| FrameError::Decode(e.to_string()))?;
        Ok(buf)
    }

    pub fn encode_error(error: &str, message: &str) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::new();
        let header = EventHeader {
            op: OP_ERROR,
            t: None,
        };
        let body = ErrorFrame {
            error: error.to_string(),
            message: Some(message.to_string()),
        };
        ciborium::ser::into_writer(&header, &mut buf)
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        ciborium::ser::into_writer(&body, &mut buf)
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_frame_round_trip() {
        let msg = LabelsMessage {
            seq: 42,
            labels: vec![Label {
                cid: None,
                cts: "2026-01-02T03:04:05Z".to_string(),
                exp: None,
                neg: None,
                src: "did:plc:me".to_string(),
                uri: "did:plc:them".to_string(),
                val: "offender".to_string(),
                ver: Some(1),
                sig: Some(serde_bytes::ByteBuf::from(vec![1u8, 2, 3])),
            }],
        };
        let bytes = StreamFrame::encode_labels(&msg).unwrap();
        match StreamFrame::decode(&bytes).unwrap() {
            StreamFrame::Labels(decoded) => {
                assert_eq!(decoded.seq, 42);
                assert_eq!(decoded.labels.len(), 1);
                assert_eq!(decoded.labels[0].val, "offender");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn error_frame_round_trip() {
        let bytes = StreamFrame::encode_error("FutureCursor", "cursor is in the future").unwrap();
        match StreamFrame::decode(&bytes).unwrap() {
            StreamFrame::Error(e) => {
                assert_eq!(e.error, "FutureCursor");
                assert_eq!(e.message.as_deref(), Some("cursor is in the future"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_message_types_are_skipped() {
        let mut buf = Vec::new();
        let header = EventHeader {
            op: OP_MESSAGE,
            t: Some("#info".to_string()),
        };
        ciborium::ser::into_writer(&header, &mut buf).unwrap();
        ciborium::ser::into_writer(&serde_json::json!({"name": "OutdatedCursor"}), &mut buf)
            .unwrap();
        match StreamFrame::decode(&buf).unwrap() {
            StreamFrame::Other(t) => assert_eq!(t, "#info"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
