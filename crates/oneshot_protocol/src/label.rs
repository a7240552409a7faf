/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub const ATPROTO_VERSION: i64 = 1;

/// A label before signing. Field order matches the canonical (sorted) key
/// order so the CBOR signing input is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedLabel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub cts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neg: Option<bool>,
    pub src: String,
    pub uri: String,
    pub val: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ver: Option<i64>,
}

impl UnsignedLabel {
    /// CBOR of the unsigned fields, the input to the ECDSA-P256 signature.
    pub fn bytes_for_signing(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    pub fn into_signed(self, sig: Vec<u8>) -> Label {
        Label {
            cid: self.cid,
            cts: self.cts,
            exp: self.exp,
            neg: self.neg,
            src: self.src,
            uri: self.uri,
            val: self.val,
            ver: self.ver,
            sig: Some(serde_bytes::ByteBuf::from(sig)),
        }
    }
}

/// A published label, as carried both in `#labels` stream frames and in
/// `queryLabels` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub cts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neg: Option<bool>,
    pub src: String,
    pub uri: String,
    pub val: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ver: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<serde_bytes::ByteBuf>,
}

impl Label {
    pub fn is_negated(&self) -> bool {
        self.neg.unwrap_or(false)
    }
}
