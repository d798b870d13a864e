use std::sync::LazyLock;

use regex::{Captures, Regex};
use unicode_normalization::UnicodeNormalization;

use crate::config::PreprocessConfig;
use crate::schema::RawReview;
use crate::util::text::{truncate_chars, word_count};

static MARKUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^<>]*>").expect("compile markup pattern"));
static HTML_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").expect("compile entity pattern")
});
static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:https?://|www\.)[^\s<>]+").expect("compile url pattern")
});
/// Runs of one repeated mark, each collapsed to two of that mark.
static PUNCTUATION_RUNS: LazyLock<[(Regex, &'static str); 3]> = LazyLock::new(|| {
    [
        (Regex::new(r"!{3,}").expect("compile exclamation pattern"), "!!"),
        (Regex::new(r"\?{3,}").expect("compile question pattern"), "??"),
        (Regex::new(r"\.{3,}").expect("compile ellipsis pattern"), ".."),
    ]
});

/// A review whose text survived cleaning. The course code is still raw.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PreprocessedReview<'a> {
    pub(crate) raw: &'a RawReview,
    pub(crate) text: String,
}

/// Strips markup and noise from review text and drops uninformative reviews.
#[derive(Debug, Clone)]
pub(crate) struct TextPreprocessor {
    min_words: usize,
    max_chars: usize,
}

impl TextPreprocessor {
    pub(crate) fn new(config: &PreprocessConfig) -> Self {
        Self {
            min_words: config.min_words,
            max_chars: config.max_chars,
        }
    }

    /// Clean every review, preserving input order. Reviews that clean to
    /// nothing, or to fewer than the minimum number of words, are dropped.
    pub(crate) fn clean<'a, I>(&self, reviews: I) -> Vec<PreprocessedReview<'a>>
    where
        I: IntoIterator<Item = &'a RawReview>,
    {
        reviews
            .into_iter()
            .filter_map(|raw| {
                self.clean_text(&raw.text)
                    .map(|text| PreprocessedReview { raw, text })
            })
            .collect()
    }

    pub(crate) fn clean_text(&self, text: &str) -> Option<String> {
        let cleaned = normalize_text(text);
        if cleaned.is_empty() || word_count(&cleaned) < self.min_words {
            return None;
        }
        Some(truncate_chars(&cleaned, self.max_chars))
    }
}

/// NFC, markup/entity/url/emoji removal, punctuation runs, whitespace.
pub(crate) fn normalize_text(text: &str) -> String {
    let nfc: String = text.nfc().collect();
    let without_tags = MARKUP_TAG.replace_all(&nfc, " ");
    let without_entities = HTML_ENTITY.replace_all(&without_tags, |caps: &Captures<'_>| {
        decode_entity(&caps[0])
    });
    let without_urls = URL.replace_all(&without_entities, " ");
    let without_emoji: String = without_urls
        .chars()
        .filter(|ch| !is_emoji(*ch))
        .collect();
    let collapsed = PUNCTUATION_RUNS
        .iter()
        .fold(without_emoji, |text, (pattern, replacement)| {
            pattern.replace_all(&text, *replacement).into_owned()
        });
    collapsed.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entity(entity: &str) -> &'static str {
    match entity {
        "&amp;" => "&",
        "&quot;" | "&#34;" => "\"",
        "&apos;" | "&#39;" => "'",
        _ => " ",
    }
}

fn is_emoji(ch: char) -> bool {
    matches!(
        u32::from(ch),
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B00..=0x2BFF | 0xFE00..=0xFE0F | 0x200D
    )
}
