/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::identity::IdentityDirectory;
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine as _;
use serde::Deserialize;

/// Multicodec prefixes inside `publicKeyMultibase`.
const PREFIX_SECP256K1: [u8; 2] = [0xe7, 0x01];
const PREFIX_P256: [u8; 2] = [0x80, 0x24];

#[derive(Debug, Clone)]
pub struct VerifiedCaller {
    pub did: String,
    pub handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    iss: String,
    #[serde(default)]
    aud: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

/// Verifies an inter-service bearer JWT: audience must be this instance,
/// the signature must verify against the issuer's atproto signing key from
/// the DID directory.
pub async fn verify_service_jwt(
    directory: &IdentityDirectory,
    audience_did: &str,
    token: &str,
) -> Result<VerifiedCaller> {
    let claims = peek_claims(token)?;
    let doc = directory
        .did_document(&claims.iss)
        .await
        .context("resolve token issuer")?;
    let key = doc
        .atproto_key_multibase()
        .context("issuer has no atproto signing key")?;
    verify_with_key(token, audience_did, key)?;
    Ok(VerifiedCaller {
        did: claims.iss,
        handle: doc.handle().map(|h| h.to_string()),
    })
}

fn peek_claims(token: &str) -> Result<Claims> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed token");
    };
    let payload = B64URL.decode(payload).context("token payload encoding")?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Signature and claim checks against a known multibase key. Split out so
/// it is testable without a directory.
pub fn verify_with_key(token: &str, audience_did: &str, key_multibase: &str) -> Result<VerifiedClaims> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed token");
    };

    let claims: Claims = serde_json::from_slice(&B64URL.decode(payload)?)?;
    match claims.aud.as_deref() {
        Some(aud) if aud == audience_did => {}
        Some(_) => bail!("invalid audience"),
        None => bail!("token has no audience"),
    }
    if let Some(exp) = claims.exp {
        let now = crate::store::now_ms() / 1000;
        if exp < now {
            bail!("token expired");
        }
    }

    let message = format!("{header}.{payload}");
    let sig_bytes = B64URL.decode(signature).context("token signature encoding")?;

    let encoded = key_multibase
        .strip_prefix('z')
        .context("unsupported multibase encoding")?;
    let decoded = bs58::decode(encoded)
        .into_vec()
        .context("decode signing key")?;
    if decoded.len() < 3 {
        bail!("signing key too short");
    }
    let (prefix, point) = decoded.split_at(2);

    if prefix == PREFIX_SECP256K1 {
        use k256::ecdsa::signature::Verifier as _;
        let key = k256::ecdsa::VerifyingKey::from_sec1_bytes(point)
            .context("parse secp256k1 key")?;
        let mut sig =
            k256::ecdsa::Signature::from_slice(&sig_bytes).context("parse signature")?;
        if let Some(normalized) = sig.normalize_s() {
            sig = normalized;
        }
        key.verify(message.as_bytes(), &sig)
            .context("signature verification failed")?;
    } else if prefix == PREFIX_P256 {
        use p256::ecdsa::signature::Verifier as _;
        let key =
            p256::ecdsa::VerifyingKey::from_sec1_bytes(point).context("parse p256 key")?;
        let mut sig =
            p256::ecdsa::Signature::from_slice(&sig_bytes).context("parse signature")?;
        if let Some(normalized) = sig.normalize_s() {
            sig = normalized;
        }
        key.verify(message.as_bytes(), &sig)
            .context("signature verification failed")?;
    } else {
        bail!("unsupported key type");
    }

    Ok(VerifiedClaims { iss: claims.iss })
}

/// The verified issuer.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    pub iss: String,
}
