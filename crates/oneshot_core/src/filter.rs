/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::lang::{claimed_lang_matches, looks_chinese};
use crate::limiter::KeyedRateLimiter;
use lingua::{Language, LanguageDetector};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use oneshot_protocol::FeedPost;

/// One predicate over a decoded post. Filters may materialize derived
/// fields on the post (see `extract_tags`); the chain short-circuits on the
/// first rejection.
pub type FeedFilter = Box<dyn Fn(&mut FeedPost, &str) -> bool + Send + Sync>;

pub struct FilterChain {
    filters: Vec<FeedFilter>,
}

impl FilterChain {
    pub fn new(filters: Vec<FeedFilter>) -> Self {
        Self { filters }
    }

    pub fn should_keep(&self, post: &mut FeedPost, author_did: &str) -> bool {
        self.filters.iter().all(|f| f(post, author_did))
    }

    /// The deployed chain: Chinese/English posts, spam-shaped tags and
    /// text dropped, one post per author every 40 seconds on average.
    pub fn standard(detector: Arc<LanguageDetector>) -> Self {
        Self::new(vec![
            is_not_comment(),
            is_claimed_langs(&["zh", "en"]),
            is_detected_langs(detector, &[Language::Chinese]),
            extract_tags(),
            max_tag_count(7),
            has_no_tags(&["nsfw"]),
            has_bad_tags(2, false),
            not(contains_any_text(&["发布了一篇小红书笔记，快来看吧！"])),
            rate_limit(3, Duration::from_secs(120)),
        ])
    }
}

pub fn not(filter: FeedFilter) -> FeedFilter {
    Box::new(move |post, did| !filter(post, did))
}

pub fn is_not_comment() -> FeedFilter {
    Box::new(|post, _| post.reply.is_none())
}

/// Accepts posts whose author-claimed language tags include any wanted
/// language.
pub fn is_claimed_langs(wanted: &[&str]) -> FeedFilter {
    let wanted: Vec<String> = wanted.iter().map(|s| s.to_string()).collect();
    Box::new(move |post, _| {
        post.langs
            .iter()
            .any(|tag| claimed_lang_matches(tag, &wanted))
    })
}

/// Runs the statistical detector over the post text. The Japanese special
/// case exists because ideograph-only posts are frequently mis-detected;
/// see `looks_chinese`.
pub fn is_detected_langs(detector: Arc<LanguageDetector>, wanted: &[Language]) -> FeedFilter {
    let wanted: HashSet<Language> = wanted.iter().copied().collect();
    let wants_chinese = wanted.contains(&Language::Chinese);
    Box::new(move |post, _| {
        let text = post.classifier_text();
        let mut saw_japanese = false;
        for detection in detector.detect_multiple_languages_of(&text) {
            if wanted.contains(&detection.language()) {
                return true;
            }
            if wants_chinese && detection.language() == Language::Japanese {
                saw_japanese = true;
            }
        }
        if wants_chinese && saw_japanese {
            return looks_chinese(&text);
        }
        false
    })
}

/// Side-effecting: copies rich-text facet tags onto `post.tags` for the
/// tag filters further down the chain. Always accepts.
pub fn extract_tags() -> FeedFilter {
    Box::new(|post, _| {
        let tags: Vec<String> = post.facet_tags().map(|t| t.to_string()).collect();
        post.tags.extend(tags);
        true
    })
}

pub fn max_tag_count(max: usize) -> FeedFilter {
    Box::new(move |post, _| post.tags.len() <= max)
}

fn normalize_tag(text: &str) -> String {
    let stripped: String = text.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    stripped.nfkc().collect::<String>().to_lowercase()
}

pub fn has_any_tag(tags: &[&str]) -> FeedFilter {
    let wanted: HashSet<String> = tags.iter().map(|t| normalize_tag(t)).collect();
    Box::new(move |post, _| post.tags.iter().any(|t| wanted.contains(&normalize_tag(t))))
}

pub fn has_no_tags(tags: &[&str]) -> FeedFilter {
    not(has_any_tag(tags))
}

/// Bots and spammers tend to post tags like `#a#b#c` as a single tag, or
/// hash-shaped text without declaring any facet tag. Both shapes are
/// rejected here.
pub fn has_bad_tags(max_hashes_in_tag: usize, allow_non_tag_hashes: bool) -> FeedFilter {
    // Invisible characters the rich-text tokenizer ignores.
    let invisible = r"\x{00AD}\x{2060}\x{200A}-\x{200D}\x{20E2}\x{FE0F}";
    let pattern = format!(
        r"(^|\s)[#＃]([^\s{invisible}]*[^\d\s\p{{P}}{invisible}]+[^\s{invisible}]*)?"
    );
    let hash_regex = match Regex::new(&pattern) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!("hash regex failed to compile: {e}");
            None
        }
    };
    Box::new(move |post, _| {
        for tag in &post.tags {
            if tag.matches('#').count() > max_hashes_in_tag {
                return false;
            }
        }
        if allow_non_tag_hashes || !post.tags.is_empty() || !post.text.contains('#') {
            return true;
        }
        match &hash_regex {
            Some(regex) => !regex.is_match(&post.text),
            None => true,
        }
    })
}

/// Case-insensitive literal substring match over the post body. Usually
/// wrapped in `not` to drop known spam phrasings.
pub fn contains_any_text(snippets: &[&str]) -> FeedFilter {
    if snippets.is_empty() {
        return Box::new(|_, _| true);
    }
    let pattern = format!(
        "(?i){}",
        snippets
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|")
    );
    let matcher = match Regex::new(&pattern) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!("text regex failed to compile: {e}");
            None
        }
    };
    Box::new(move |post, _| match &matcher {
        Some(regex) => regex.is_match(&post.text),
        None => false,
    })
}

/// Per-author token bucket: `burst` posts, refilled over `window`.
pub fn rate_limit(burst: u32, window: Duration) -> FeedFilter {
    let limiter = KeyedRateLimiter::new(burst, window);
    Box::new(move |_, did| limiter.try_acquire(did))
}
