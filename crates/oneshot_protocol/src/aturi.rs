/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

/// Minimal `at://<authority>/<collection>/<rkey>` parser. Only the shapes
/// this service consumes are accepted; anything else is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtUri {
    pub authority: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn parse(uri: &str) -> Option<AtUri> {
        let rest = uri.strip_prefix("at://")?;
        let mut parts = rest.splitn(3, '/');
        let authority = parts.next()?.trim();
        let collection = parts.next()?.trim();
        let rkey = parts.next()?.trim();
        if authority.is_empty() || collection.is_empty() || rkey.is_empty() {
            return None;
        }
        Some(AtUri {
            authority: authority.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }
}

impl std::fmt::Display for AtUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at://{}/{}/{}", self.authority, self.collection, self.rkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_post_uri() {
        let uri = AtUri::parse("at://did:plc:abc/app.bsky.feed.post/3kxyz").unwrap();
        assert_eq!(uri.authority, "did:plc:abc");
        assert_eq!(uri.collection, "app.bsky.feed.post");
        assert_eq!(uri.rkey, "3kxyz");
        assert_eq!(uri.to_string(), "at://did:plc:abc/app.bsky.feed.post/3kxyz");
    }

    #[test]
    fn rejects_partial_uris() {
        assert!(AtUri::parse("at://did:plc:abc").is_none());
        assert!(AtUri::parse("at://did:plc:abc/app.bsky.feed.post").is_none());
        assert!(AtUri::parse("did:plc:abc").is_none());
        assert!(AtUri::parse("at://did:plc:abc//rkey").is_none());
    }
}
