/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types shared between the pipeline and the serving surface: the
//! label envelope, the subscription stream framing, the jetstream commit
//! schema and the XRPC error envelope. No I/O happens here.

mod aturi;
mod jetstream;
mod label;
mod stream;
mod xrpc;

pub use aturi::AtUri;
pub use jetstream::{
    BlobRef, Commit, EmbedImage, EmbedView, ExternalEmbed, ExternalInfo, FacetFeature, FeedPost,
    JetstreamEvent, RefLink, RichTextFacet,
};
pub use label::{Label, UnsignedLabel, ATPROTO_VERSION};
pub use stream::{ErrorFrame, EventHeader, FrameError, LabelsMessage, StreamFrame, OP_ERROR, OP_MESSAGE};
pub use xrpc::XrpcError;

/// `<did>/<rkey>` as stored in the feed list.
pub fn compact_uri(did: &str, rkey: &str) -> String {
    format!("{did}/{rkey}")
}

/// Splits a compact feed uri back into `(did, rkey)`.
pub fn split_compact_uri(uri: &str) -> Option<(&str, &str)> {
    let (did, rkey) = uri.split_once('/')?;
    if did.is_empty() || rkey.is_empty() {
        return None;
    }
    Some((did, rkey))
}

/// Projects a compact feed uri to its full `at://` post uri.
pub fn post_uri_from_compact(uri: &str) -> Option<String> {
    let (did, rkey) = split_compact_uri(uri)?;
    Some(format!("at://{did}/app.bsky.feed.post/{rkey}"))
}
