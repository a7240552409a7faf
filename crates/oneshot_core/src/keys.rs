/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::notifier::BlockDecision;
use crate::store::Store;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{SecondsFormat, TimeZone, Utc};
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey};

use oneshot_protocol::{Label, UnsignedLabel, ATPROTO_VERSION};

pub const LABEL_OFFENDER: &str = "offender";

/// The instance signing identity: an ECDSA P-256 key generated on first run
/// and kept base64-encoded under the `server-key` config row.
pub struct ServerKeys {
    signing: SigningKey,
    src_did: String,
}

impl ServerKeys {
    pub fn load_or_generate(store: &Store, src_did: &str) -> Result<Self> {
        let signing = match store.get_config("server-key")? {
            Some(encoded) => {
                let bytes = B64.decode(encoded).context("decode server-key")?;
                SigningKey::from_slice(&bytes).context("parse server-key")?
            }
            None => {
                let key = SigningKey::random(&mut rand::rngs::OsRng);
                store.set_config("server-key", &B64.encode(key.to_bytes()))?;
                key
            }
        };
        Ok(Self {
            signing,
            src_did: src_did.to_string(),
        })
    }

    pub fn src_did(&self) -> &str {
        &self.src_did
    }

    /// The public key as a `did:key` string (compressed P-256 point behind
    /// the multicodec prefix), as advertised in the DID document.
    pub fn public_did_key(&self) -> String {
        use p256::elliptic_curve::sec1::ToEncodedPoint as _;
        let point = self.signing.verifying_key().to_encoded_point(true);
        let mut bytes = vec![0x80, 0x24];
        bytes.extend_from_slice(point.as_bytes());
        format!("did:key:z{}", bs58::encode(bytes).into_string())
    }

    /// Translates a block decision into a signed account-level label.
    /// `"did:" + compact` reconstitutes the subject DID.
    pub fn sign_decision(&self, decision: &BlockDecision) -> Result<Label> {
        let cts = Utc
            .timestamp_millis_opt(decision.created_at)
            .single()
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let unsigned = UnsignedLabel {
            cid: None,
            cts,
            exp: None,
            neg: None,
            src: self.src_did.clone(),
            uri: format!("did:{}", decision.compact_did),
            val: LABEL_OFFENDER.to_string(),
            ver: Some(ATPROTO_VERSION),
        };
        let bytes = unsigned.bytes_for_signing()?;
        let signature: Signature = self.signing.sign(&bytes);
        Ok(unsigned.into_signed(signature.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier as _;
    use p256::ecdsa::VerifyingKey;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn key_is_generated_once_and_reloaded() {
        let (_dir, store) = open_store();
        let first = ServerKeys::load_or_generate(&store, "did:plc:me").unwrap();
        let second = ServerKeys::load_or_generate(&store, "did:plc:me").unwrap();
        assert_eq!(
            first.signing.to_bytes().as_slice(),
            second.signing.to_bytes().as_slice()
        );
        assert!(store.get_config("server-key").unwrap().is_some());
    }

    #[test]
    fn signed_labels_verify() {
        let (_dir, store) = open_store();
        let keys = ServerKeys::load_or_generate(&store, "did:plc:me").unwrap();
        let label = keys
            .sign_decision(&BlockDecision {
                id: 7,
                compact_did: "plc:offender".to_string(),
                created_at: 1_700_000_000_000,
            })
            .unwrap();
        assert_eq!(label.uri, "did:plc:offender");
        assert_eq!(label.val, "offender");
        assert_eq!(label.src, "did:plc:me");

        let unsigned = UnsignedLabel {
            cid: label.cid.clone(),
            cts: label.cts.clone(),
            exp: label.exp.clone(),
            neg: label.neg,
            src: label.src.clone(),
            uri: label.uri.clone(),
            val: label.val.clone(),
            ver: label.ver,
        };
        let verifying: &VerifyingKey = keys.signing.verifying_key();
        let signature =
            Signature::from_slice(label.sig.as_ref().unwrap().as_slice()).unwrap();
        verifying
            .verify(&unsigned.bytes_for_signing().unwrap(), &signature)
            .unwrap();
    }

    #[test]
    fn did_key_has_p256_prefix() {
        let (_dir, store) = open_store();
        let keys = ServerKeys::load_or_generate(&store, "did:plc:me").unwrap();
        assert!(keys.public_did_key().starts_with("did:key:z"));
    }
}
