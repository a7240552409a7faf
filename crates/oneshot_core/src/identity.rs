/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

const DEFAULT_PLC_HOST: &str = "https://plc.directory";
const DEFAULT_APPVIEW_HOST: &str = "https://public.api.bsky.app";

/// DID and handle resolution against the PLC directory and the public
/// app-view. One instance is built at startup and passed around.
#[derive(Clone)]
pub struct IdentityDirectory {
    http: reqwest::Client,
    plc_host: String,
    appview_host: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    #[serde(default)]
    pub public_key_multibase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub service_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelerPolicy {
    pub identifier: String,
    #[serde(default)]
    pub adult_only: Option<bool>,
    #[serde(default)]
    pub blurs: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LabelerInfo {
    pub did: String,
    /// Base endpoint of the labeler service, e.g. `https://mod.example`.
    pub endpoint: String,
    pub policies: Vec<LabelerPolicy>,
}

impl DidDocument {
    pub fn handle(&self) -> Option<&str> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
    }

    pub fn service_endpoint(&self, id_suffix: &str, service_type: &str) -> Option<&str> {
        self.service
            .iter()
            .find(|s| s.id.ends_with(id_suffix) && s.service_type == service_type)
            .map(|s| s.service_endpoint.as_str())
    }

    pub fn pds_endpoint(&self) -> Option<&str> {
        self.service_endpoint("#atproto_pds", "AtprotoPersonalDataServer")
    }

    pub fn labeler_endpoint(&self) -> Option<&str> {
        self.service_endpoint("#atproto_labeler", "AtprotoLabeler")
    }

    /// The repo signing key, multibase-encoded.
    pub fn atproto_key_multibase(&self) -> Option<&str> {
        self.verification_method
            .iter()
            .find(|m| m.id.ends_with("#atproto"))
            .and_then(|m| m.public_key_multibase.as_deref())
    }
}

impl IdentityDirectory {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            plc_host: DEFAULT_PLC_HOST.to_string(),
            appview_host: DEFAULT_APPVIEW_HOST.to_string(),
        }
    }

    pub async fn resolve_handle(&self, handle: &str) -> Result<String> {
        let url = format!(
            "{}/xrpc/com.atproto.identity.resolveHandle?handle={}",
            self.appview_host,
            urlencoding::encode(handle)
        );
        #[derive(Deserialize)]
        struct Output {
            did: String,
        }
        let out: Output = self
            .http
            .get(url)
            .send()
            .await
            .context("resolve handle")?
            .error_for_status()?
            .json()
            .await?;
        Ok(out.did)
    }

    pub async fn did_document(&self, did: &str) -> Result<DidDocument> {
        let url = if did.starts_with("did:plc:") {
            format!("{}/{did}", self.plc_host)
        } else if let Some(host) = did.strip_prefix("did:web:") {
            format!("https://{host}/.well-known/did.json")
        } else {
            bail!("unsupported DID method: {did}");
        };
        let doc: DidDocument = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("fetch DID document for {did}"))?
            .error_for_status()?
            .json()
            .await?;
        Ok(doc)
    }

    /// Resolves the upstream labeler (by handle or DID) to its service
    /// endpoint and published label policies.
    pub async fn resolve_labeler(&self, identifier: &str) -> Result<LabelerInfo> {
        let did = if identifier.starts_with("did:") {
            identifier.to_string()
        } else {
            self.resolve_handle(identifier).await?
        };
        let doc = self.did_document(&did).await?;
        let endpoint = doc
            .labeler_endpoint()
            .with_context(|| format!("{did} does not declare a labeler service"))?
            .trim_end_matches('/')
            .to_string();
        debug!(%did, %endpoint, "resolved upstream labeler");

        let url = format!(
            "{}/xrpc/app.bsky.labeler.getServices?dids={}&detailed=true",
            self.appview_host,
            urlencoding::encode(&did)
        );
        #[derive(Deserialize)]
        struct Output {
            views: Vec<View>,
        }
        #[derive(Deserialize)]
        struct View {
            #[serde(default)]
            policies: Option<Policies>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Policies {
            #[serde(default)]
            label_value_definitions: Vec<LabelerPolicy>,
        }
        let out: Output = self
            .http
            .get(url)
            .send()
            .await
            .context("labeler getServices")?
            .error_for_status()?
            .json()
            .await?;
        if out.views.len() != 1 {
            bail!("expected one labeler service view, got {}", out.views.len());
        }
        let policies = out
            .views
            .into_iter()
            .next()
            .and_then(|v| v.policies)
            .map(|p| p.label_value_definitions)
            .unwrap_or_default();
        Ok(LabelerInfo {
            did,
            endpoint,
            policies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_document_accessors() {
        let doc: DidDocument = serde_json::from_value(serde_json::json!({
            "id": "did:plc:labeler",
            "alsoKnownAs": ["at://mod.example.com"],
            "verificationMethod": [{
                "id": "did:plc:labeler#atproto",
                "type": "Multikey",
                "publicKeyMultibase": "zQ3shc"
            }],
            "service": [
                {
                    "id": "#atproto_pds",
                    "type": "AtprotoPersonalDataServer",
                    "serviceEndpoint": "https://pds.example.com"
                },
                {
                    "id": "#atproto_labeler",
                    "type": "AtprotoLabeler",
                    "serviceEndpoint": "https://mod.example.com"
                }
            ]
        }))
        .unwrap();
        assert_eq!(doc.handle(), Some("mod.example.com"));
        assert_eq!(doc.pds_endpoint(), Some("https://pds.example.com"));
        assert_eq!(doc.labeler_endpoint(), Some("https://mod.example.com"));
        assert_eq!(doc.atproto_key_multibase(), Some("zQ3shc"));
    }

    #[test]
    fn unsupported_did_methods_error() {
        let dir = IdentityDirectory::new(reqwest::Client::new());
        let err = futures_util::future::FutureExt::now_or_never(
            dir.did_document("did:example:123"),
        )
        .unwrap()
        .unwrap_err();
        assert!(err.to_string().contains("unsupported DID method"));
    }
}
