/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::identity::IdentityDirectory;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

/// The persisted slice of a PDS auth session. Only the refresh token is
/// kept on disk; access tokens live in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub did: String,
    pub password: String,
    #[serde(rename = "session_token")]
    pub refresh_token: String,
    pub pds: String,
}

/// Minimal authenticated XRPC client against the user's PDS.
#[derive(Clone)]
pub struct XrpcClient {
    http: reqwest::Client,
    pub pds: String,
    pub did: String,
    access_jwt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionTokens {
    did: String,
    access_jwt: String,
    refresh_jwt: String,
}

impl AuthSession {
    pub fn load(path: &Path) -> Result<Option<AuthSession>> {
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read session file: {}", path.display()))?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("write session file: {}", path.display()))?;
        Ok(())
    }
}

impl XrpcClient {
    /// Loads the persisted session and refreshes it, falling back to a
    /// fresh password login when the refresh token expired.
    pub async fn login(
        http: reqwest::Client,
        directory: &IdentityDirectory,
        identifier: &str,
        password: &str,
        session_file: PathBuf,
    ) -> Result<XrpcClient> {
        if let Some(session) = AuthSession::load(&session_file)? {
            match Self::refresh(&http, &session).await {
                Ok((client, refreshed)) => {
                    refreshed.persist(&session_file)?;
                    return Ok(client);
                }
                Err(e) => info!("session refresh failed, retrying with password: {e:#}"),
            }
        }

        let did = if identifier.starts_with("did:") {
            identifier.to_string()
        } else {
            directory.resolve_handle(identifier).await?
        };
        let doc = directory.did_document(&did).await?;
        let pds = doc
            .pds_endpoint()
            .with_context(|| format!("{did} has no PDS endpoint"))?
            .trim_end_matches('/')
            .to_string();

        let tokens: SessionTokens = http
            .post(format!("{pds}/xrpc/com.atproto.server.createSession"))
            .json(&json!({"identifier": identifier, "password": password}))
            .send()
            .await
            .context("createSession")?
            .error_for_status()?
            .json()
            .await?;
        if tokens.did != did {
            bail!("session DID mismatch: {} != {did}", tokens.did);
        }

        let session = AuthSession {
            did: did.clone(),
            password: password.to_string(),
            refresh_token: tokens.refresh_jwt,
            pds: pds.clone(),
        };
        session.persist(&session_file)?;

        Ok(XrpcClient {
            http,
            pds,
            did,
            access_jwt: tokens.access_jwt,
        })
    }

    async fn refresh(
        http: &reqwest::Client,
        session: &AuthSession,
    ) -> Result<(XrpcClient, AuthSession)> {
        let tokens: SessionTokens = http
            .post(format!(
                "{}/xrpc/com.atproto.server.refreshSession",
                session.pds
            ))
            .bearer_auth(&session.refresh_token)
            .send()
            .await
            .context("refreshSession")?
            .error_for_status()?
            .json()
            .await?;
        let refreshed = AuthSession {
            refresh_token: tokens.refresh_jwt,
            ..session.clone()
        };
        Ok((
            XrpcClient {
                http: http.clone(),
                pds: session.pds.clone(),
                did: tokens.did,
                access_jwt: tokens.access_jwt,
            },
            refreshed,
        ))
    }

    pub async fn get_record(
        &self,
        collection: &str,
        rkey: &str,
    ) -> Result<Option<serde_json::Value>> {
        let response = self
            .http
            .get(format!("{}/xrpc/com.atproto.repo.getRecord", self.pds))
            .query(&[
                ("repo", self.did.as_str()),
                ("collection", collection),
                ("rkey", rkey),
            ])
            .bearer_auth(&self.access_jwt)
            .send()
            .await
            .context("getRecord")?;
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            // RecordNotFound comes back as InvalidRequest-shaped 400.
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    pub async fn put_record(
        &self,
        collection: &str,
        rkey: &str,
        record: serde_json::Value,
    ) -> Result<()> {
        self.http
            .post(format!("{}/xrpc/com.atproto.repo.putRecord", self.pds))
            .bearer_auth(&self.access_jwt)
            .json(&json!({
                "repo": self.did,
                "collection": collection,
                "rkey": rkey,
                "record": record,
                "validate": true,
            }))
            .send()
            .await
            .context("putRecord")?
            .error_for_status()?;
        Ok(())
    }

    pub async fn upload_blob(&self, bytes: Vec<u8>, mime: &str) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        struct Output {
            blob: serde_json::Value,
        }
        let out: Output = self
            .http
            .post(format!("{}/xrpc/com.atproto.repo.uploadBlob", self.pds))
            .bearer_auth(&self.access_jwt)
            .header("Content-Type", mime)
            .body(bytes)
            .send()
            .await
            .context("uploadBlob")?
            .error_for_status()?
            .json()
            .await?;
        Ok(out.blob)
    }

    pub async fn procedure(
        &self,
        nsid: &str,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(format!("{}/xrpc/{nsid}", self.pds))
            .bearer_auth(&self.access_jwt)
            .json(input)
            .send()
            .await
            .with_context(|| nsid.to_string())?
            .error_for_status()?;
        if response.content_length() == Some(0) {
            return Ok(serde_json::Value::Null);
        }
        Ok(response.json().await.unwrap_or(serde_json::Value::Null))
    }

    pub async fn query(&self, nsid: &str, params: &[(&str, &str)]) -> Result<serde_json::Value> {
        Ok(self
            .http
            .get(format!("{}/xrpc/{nsid}", self.pds))
            .query(params)
            .bearer_auth(&self.access_jwt)
            .send()
            .await
            .with_context(|| nsid.to_string())?
            .error_for_status()?
            .json()
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        assert!(AuthSession::load(&path).unwrap().is_none());

        let session = AuthSession {
            did: "did:plc:me".to_string(),
            password: "hunter2".to_string(),
            refresh_token: "refresh-jwt".to_string(),
            pds: "https://pds.example.com".to_string(),
        };
        session.persist(&path).unwrap();

        let loaded = AuthSession::load(&path).unwrap().unwrap();
        assert_eq!(loaded.did, session.did);
        assert_eq!(loaded.refresh_token, session.refresh_token);
        assert_eq!(loaded.pds, session.pds);
    }
}
