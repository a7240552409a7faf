/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

const DEFAULT_JETSTREAM_HOST: &str = "wss://jetstream2.us-west.bsky.network";

/// What a profile-level upstream label does to the per-actor counter.
/// Account-level labels always promote immediately and post-level labels
/// always increment; this hook is operator policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileLabelPolicy {
    /// Skip the label entirely.
    Ignore,
    /// Treat it like an account-level label: promote immediately.
    Promote,
    /// Double the counter for that kind.
    Multiply,
}

#[derive(Debug, Clone)]
pub struct NsfwFilterConfig {
    pub url: String,
    pub nsfw_threshold: f64,
    pub min_diff: f64,
    pub max_conns: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub password: String,
    pub user_did: String,
    pub upstream_user: String,

    pub database_file: PathBuf,
    pub session_file: PathBuf,

    pub host: String,
    pub port: u16,

    pub appview_rate_limit: u32,
    pub offending_post_ratio: f64,
    pub offender_threshold: i64,
    pub profile_label_policy: ProfileLabelPolicy,

    pub plc_token: Option<String>,

    pub feed_name: String,
    pub feed_avatar: Option<String>,
    pub feed_description: String,

    pub external_block_list: Option<PathBuf>,
    pub moderator_handles: Vec<String>,

    pub jetstream_host: String,
    pub nsfw_filter: Option<NsfwFilterConfig>,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let require = |key: &str| -> Result<String> {
            match lookup(key) {
                Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
                _ => bail!("environment variable {key} is not set"),
            }
        };
        let optional = |key: &str| -> Option<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port: u16 = require("PORT")?
            .parse()
            .context("PORT is not a valid port number")?;
        let appview_rate_limit: u32 = require("APPVIEW_RATE_LIMIT")?
            .parse()
            .context("APPVIEW_RATE_LIMIT is not a valid integer")?;
        let offending_post_ratio: f64 = require("OFFENDING_POST_RATIO")?
            .parse()
            .context("OFFENDING_POST_RATIO is not a valid float")?;
        if offending_post_ratio <= 0.0 || offending_post_ratio > 1.0 {
            bail!("invalid offending post ratio: {offending_post_ratio}");
        }
        let offender_threshold: i64 = match optional("OFFENDER_THRESHOLD") {
            Some(v) => v.parse().context("OFFENDER_THRESHOLD is not an integer")?,
            None => 10,
        };

        let profile_label_policy = match optional("PROFILE_LABEL_POLICY").as_deref() {
            None | Some("promote") => ProfileLabelPolicy::Promote,
            Some("ignore") => ProfileLabelPolicy::Ignore,
            Some("multiply") => ProfileLabelPolicy::Multiply,
            Some(other) => bail!("unknown PROFILE_LABEL_POLICY: {other}"),
        };

        let moderator_handles = optional("MODERATOR_HANDLES")
            .map(|raw| {
                raw.split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let nsfw_filter = match optional("NSFW_VIT_URL") {
            Some(url) => Some(NsfwFilterConfig {
                url,
                nsfw_threshold: optional("NSFW_VIT_THRESHOLD")
                    .map(|v| v.parse())
                    .transpose()
                    .context("NSFW_VIT_THRESHOLD is not a valid float")?
                    .unwrap_or(1.8),
                min_diff: optional("NSFW_VIT_MIN_DIFF")
                    .map(|v| v.parse())
                    .transpose()
                    .context("NSFW_VIT_MIN_DIFF is not a valid float")?
                    .unwrap_or(1.2),
                max_conns: optional("NSFW_VIT_MAX_CONNS")
                    .map(|v| v.parse())
                    .transpose()
                    .context("NSFW_VIT_MAX_CONNS is not a valid integer")?
                    .unwrap_or(4),
            }),
            None => None,
        };

        Ok(Config {
            username: require("USERNAME")?,
            password: require("PASSWORD")?,
            user_did: require("USER_DID")?,
            upstream_user: require("UPSTREAM_USER")?,
            database_file: PathBuf::from(require("DATABASE_FILE")?),
            session_file: PathBuf::from(require("SESSION_FILE")?),
            host: require("HOST")?,
            port,
            appview_rate_limit,
            offending_post_ratio,
            offender_threshold,
            profile_label_policy,
            plc_token: optional("PLC_TOKEN"),
            feed_name: require("FEED_NAME")?,
            feed_avatar: optional("FEED_AVATAR"),
            feed_description: require("FEED_DESCRIPTION")?,
            external_block_list: optional("EXTERNAL_BLOCK_LIST").map(PathBuf::from),
            moderator_handles,
            jetstream_host: optional("JETSTREAM_HOST")
                .unwrap_or_else(|| DEFAULT_JETSTREAM_HOST.to_string()),
            nsfw_filter,
        })
    }

    /// `at://<did>/app.bsky.feed.generator/oneshot`, the only feed this
    /// instance serves.
    pub fn feed_uri(&self) -> String {
        format!("at://{}/app.bsky.feed.generator/oneshot", self.user_did)
    }
}
