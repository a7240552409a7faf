/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Deserialize;

/// One frame from the post firehose.
#[derive(Debug, Clone, Deserialize)]
pub struct JetstreamEvent {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    #[serde(default)]
    pub commit: Option<Commit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub operation: String,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
    #[serde(default)]
    pub cid: Option<String>,
}

/// The subset of `app.bsky.feed.post` this service looks at.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPost {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub langs: Vec<String>,
    #[serde(default)]
    pub reply: Option<serde_json::Value>,
    /// Outer tags plus, after `ExtractTags` ran, the rich-text facet tags.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub facets: Vec<RichTextFacet>,
    #[serde(default)]
    pub embed: Option<EmbedView>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RichTextFacet {
    #[serde(default)]
    pub features: Vec<FacetFeature>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FacetFeature {
    #[serde(rename = "$type", default)]
    pub kind: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Post embed, flattened over the handful of `$type`s we care about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbedView {
    #[serde(rename = "$type", default)]
    pub kind: String,
    #[serde(default)]
    pub images: Vec<EmbedImage>,
    #[serde(default)]
    pub external: Option<ExternalEmbed>,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
    #[serde(default)]
    pub media: Option<Box<EmbedView>>,
    #[serde(default)]
    pub video: Option<BlobRef>,
    #[serde(default)]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbedImage {
    #[serde(default)]
    pub alt: String,
    #[serde(default)]
    pub image: Option<BlobRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEmbed {
    #[serde(default)]
    pub external: ExternalInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalInfo {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlobRef {
    #[serde(rename = "ref", default)]
    pub link: Option<RefLink>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefLink {
    #[serde(rename = "$link", default)]
    pub link: String,
}

impl FeedPost {
    /// The text a language detector should see: the body, or when that is
    /// empty, the embed descriptions and alt texts.
    pub fn classifier_text(&self) -> String {
        if !self.text.is_empty() {
            return self.text.clone();
        }
        let Some(embed) = &self.embed else {
            return String::new();
        };
        let mut text = String::new();
        if let Some(external) = &embed.external {
            text = external.external.description.clone();
            if text.is_empty() {
                text = external.external.title.clone();
            }
        }
        if !embed.images.is_empty() {
            for image in &embed.images {
                text.push_str(&image.alt);
            }
        }
        if embed.video.is_some() {
            if let Some(alt) = &embed.alt {
                text = alt.clone();
            }
        }
        text
    }

    /// Tags declared through rich-text facet features.
    pub fn facet_tags(&self) -> impl Iterator<Item = &str> {
        self.facets
            .iter()
            .flat_map(|f| f.features.iter())
            .filter(|f| f.kind == "app.bsky.richtext.facet#tag")
            .filter_map(|f| f.tag.as_deref())
    }

    /// Blob links of attached images, for the vision classifier.
    pub fn image_blob_links(&self) -> Vec<&str> {
        let Some(embed) = &self.embed else {
            return Vec::new();
        };
        let images = if embed.images.is_empty() {
            match &embed.media {
                Some(media) => &media.images,
                None => &embed.images,
            }
        } else {
            &embed.images
        };
        images
            .iter()
            .filter_map(|i| i.image.as_ref())
            .filter_map(|b| b.link.as_ref())
            .map(|l| l.link.as_str())
            .collect()
    }

    /// The uri of a quoted record, under both the plain record embed and
    /// the record-with-media embed.
    pub fn embedded_record_uri(&self) -> Option<&str> {
        let record = self.embed.as_ref()?.record.as_ref()?;
        if let Some(uri) = record.get("uri").and_then(|v| v.as_str()) {
            return Some(uri);
        }
        record
            .get("record")
            .and_then(|r| r.get("uri"))
            .and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_commit_event() {
        let raw = r#"{
            "did": "did:plc:author",
            "time_us": 1700000000000000,
            "kind": "commit",
            "commit": {
                "operation": "create",
                "collection": "app.bsky.feed.post",
                "rkey": "3kabc",
                "record": {
                    "text": "你好世界",
                    "langs": ["zh"],
                    "createdAt": "2026-01-02T03:04:05Z"
                }
            }
        }"#;
        let event: JetstreamEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.kind, "commit");
        let commit = event.commit.unwrap();
        assert_eq!(commit.collection, "app.bsky.feed.post");
        let post: FeedPost = serde_json::from_value(commit.record.unwrap()).unwrap();
        assert_eq!(post.text, "你好世界");
        assert_eq!(post.langs, vec!["zh"]);
        assert!(post.reply.is_none());
    }

    #[test]
    fn classifier_text_falls_back_to_embeds() {
        let post: FeedPost = serde_json::from_value(serde_json::json!({
            "text": "",
            "embed": {
                "$type": "app.bsky.embed.external",
                "external": {"uri": "https://example.com", "title": "标题", "description": ""}
            }
        }))
        .unwrap();
        assert_eq!(post.classifier_text(), "标题");

        let post: FeedPost = serde_json::from_value(serde_json::json!({
            "text": "",
            "embed": {
                "$type": "app.bsky.embed.images",
                "images": [
                    {"alt": "first ", "image": {"ref": {"$link": "bafy1"}}},
                    {"alt": "second", "image": {"ref": {"$link": "bafy2"}}}
                ]
            }
        }))
        .unwrap();
        assert_eq!(post.classifier_text(), "first second");
        assert_eq!(post.image_blob_links(), vec!["bafy1", "bafy2"]);
    }

    #[test]
    fn facet_tags_come_from_tag_features_only() {
        let post: FeedPost = serde_json::from_value(serde_json::json!({
            "text": "hello #tag",
            "facets": [
                {"features": [{"$type": "app.bsky.richtext.facet#tag", "tag": "tag"}]},
                {"features": [{"$type": "app.bsky.richtext.facet#link", "uri": "https://x"}]}
            ]
        }))
        .unwrap();
        let tags: Vec<&str> = post.facet_tags().collect();
        assert_eq!(tags, vec!["tag"]);
    }

    #[test]
    fn embedded_record_uri_handles_both_shapes() {
        let plain: FeedPost = serde_json::from_value(serde_json::json!({
            "text": "quote",
            "embed": {
                "$type": "app.bsky.embed.record",
                "record": {"uri": "at://did:plc:quoted/app.bsky.feed.post/3k", "cid": "bafy"}
            }
        }))
        .unwrap();
        assert_eq!(
            plain.embedded_record_uri(),
            Some("at://did:plc:quoted/app.bsky.feed.post/3k")
        );

        let with_media: FeedPost = serde_json::from_value(serde_json::json!({
            "text": "quote with media",
            "embed": {
                "$type": "app.bsky.embed.recordWithMedia",
                "record": {"record": {"uri": "at://did:plc:other/app.bsky.feed.post/3m"}},
                "media": {"$type": "app.bsky.embed.images", "images": []}
            }
        }))
        .unwrap();
        assert_eq!(
            with_media.embedded_record_uri(),
            Some("at://did:plc:other/app.bsky.feed.post/3m")
        );
    }
}
