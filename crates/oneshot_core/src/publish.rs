/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::Config;
use crate::keys::{ServerKeys, LABEL_OFFENDER};
use crate::session::XrpcClient;
use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tracing::info;

/// One-shot `--publish`: declare the labeler in the account's DID document,
/// publish the labeler service record and the feed generator record.
pub async fn publish_all(cfg: &Config, client: &XrpcClient, keys: &ServerKeys) -> Result<()> {
    publish_labeler_identity(cfg, client, keys).await?;
    publish_labeler_record(client).await?;
    publish_feed_record(cfg, client).await?;
    Ok(())
}

/// Adds the `atproto_label` verification method and the labeler service
/// endpoint to the account's PLC document. Requires an email confirmation
/// token; `PLC_TOKEN` skips the prompt.
async fn publish_labeler_identity(
    cfg: &Config,
    client: &XrpcClient,
    keys: &ServerKeys,
) -> Result<()> {
    let mut credentials = client
        .query("com.atproto.identity.getRecommendedDidCredentials", &[])
        .await
        .context("get recommended DID credentials")?;

    let endpoint = format!("https://{}", cfg.host);
    let label_key = keys.public_did_key();

    let methods = credentials
        .get("verificationMethods")
        .cloned()
        .unwrap_or_else(|| json!({}));
    if let Some(existing) = methods.get("atproto_label").and_then(|v| v.as_str()) {
        if existing != label_key {
            bail!("verificationMethods.atproto_label already set to a different key: {existing}");
        }
        let services = credentials.get("services").cloned().unwrap_or_default();
        let labeler = services.get("atproto_labeler");
        let published = labeler
            .and_then(|l| l.get("endpoint"))
            .and_then(|e| e.as_str())
            == Some(endpoint.as_str());
        if published {
            info!("labeler identity already published");
            return Ok(());
        }
    }

    let object = credentials
        .as_object_mut()
        .context("unexpected credentials shape")?;
    let methods = object
        .entry("verificationMethods")
        .or_insert_with(|| json!({}));
    methods["atproto_label"] = json!(label_key);
    let services = object.entry("services").or_insert_with(|| json!({}));
    services["atproto_labeler"] = json!({
        "type": "AtprotoLabeler",
        "endpoint": endpoint,
    });

    let token = match &cfg.plc_token {
        Some(token) => token.clone(),
        None => {
            client
                .procedure(
                    "com.atproto.identity.requestPlcOperationSignature",
                    &json!({}),
                )
                .await
                .context("request PLC operation signature")?;
            eprint!(
                "Bluesky should have sent you a token to publish the labeler.\n\
                 Please paste it here: "
            );
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .context("read PLC token")?;
            line.trim().to_string()
        }
    };

    let mut input = credentials.clone();
    input["token"] = json!(token);
    let signed = client
        .procedure("com.atproto.identity.signPlcOperation", &input)
        .await
        .context("sign PLC operation")?;
    client
        .procedure("com.atproto.identity.submitPlcOperation", &signed)
        .await
        .context("submit PLC operation")?;
    client
        .procedure(
            "com.atproto.identity.updateHandle",
            &json!({"handle": cfg.username}),
        )
        .await
        .context("update handle")?;
    info!("labeler identity published");
    Ok(())
}

async fn publish_labeler_record(client: &XrpcClient) -> Result<()> {
    let record = json!({
        "$type": "app.bsky.labeler.service",
        "createdAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "policies": {
            "labelValues": [LABEL_OFFENDER],
            "labelValueDefinitions": [{
                "identifier": LABEL_OFFENDER,
                "adultOnly": true,
                "blurs": "content",
                "severity": "alert",
                "defaultSetting": "hide",
                "locales": [{
                    "lang": "en",
                    "name": "Incorrigible",
                    "description": "Accounts that repeatedly post content flagged by the upstream moderation service."
                }]
            }]
        }
    });
    client
        .put_record("app.bsky.labeler.service", "self", record)
        .await
        .context("publish labeler service record")?;
    info!("labeler service record published");
    Ok(())
}

async fn publish_feed_record(cfg: &Config, client: &XrpcClient) -> Result<()> {
    let mut record = json!({
        "$type": "app.bsky.feed.generator",
        "did": cfg.user_did,
        "displayName": cfg.feed_name,
        "description": cfg.feed_description,
        "createdAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    if let Some(avatar) = &cfg.feed_avatar {
        let bytes = std::fs::read(avatar)
            .with_context(|| format!("read feed avatar: {avatar}"))?;
        let mime = if avatar.ends_with(".png") {
            "image/png"
        } else {
            "image/jpeg"
        };
        let blob = client.upload_blob(bytes, mime).await?;
        record["avatar"] = blob;
    }
    client
        .put_record("app.bsky.feed.generator", "oneshot", record)
        .await
        .context("publish feed generator record")?;
    info!("feed generator record published");
    Ok(())
}
