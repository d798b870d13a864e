/// Text utilities shared by the pipeline stages.
///
/// Sentence splitting, content hashing, shingle similarity and
/// deterministic truncation/chunking.
use rustc_hash::FxHashSet;
use unicode_segmentation::UnicodeSegmentation;
use xxhash_rust::xxh3::{xxh3_64, xxh3_128};

/// Words that carry no topical signal. Kept short on purpose: polarity
/// words such as "not" must survive for sentiment scoring.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "for", "from", "had", "has",
    "have", "he", "her", "his", "i", "if", "in", "into", "is", "it", "its", "me", "my", "of", "on",
    "or", "our", "she", "so", "than", "that", "the", "their", "them", "then", "there", "they",
    "this", "to", "was", "we", "were", "what", "when", "which", "who", "will", "with", "you",
    "your",
];

/// 64-bit XXH3 hash of a text.
#[must_use]
pub(crate) fn hash_text(text: &str) -> u64 {
    xxh3_64(text.as_bytes())
}

/// 128-bit XXH3 hash of a text, used where collisions must be negligible.
#[must_use]
pub(crate) fn hash_text_128(text: &str) -> u128 {
    xxh3_128(text.as_bytes())
}

/// Split text into sentences (Unicode UAX#29 boundaries).
#[must_use]
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    text.unicode_sentences()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Lowercased word tokens (UAX#29 words that contain an alphanumeric char).
#[must_use]
pub(crate) fn word_tokens(text: &str) -> Vec<String> {
    text.unicode_words().map(str::to_lowercase).collect()
}

/// Word tokens minus stopwords and very short fragments.
#[must_use]
pub(crate) fn content_tokens(text: &str) -> Vec<String> {
    word_tokens(text)
        .into_iter()
        .filter(|token| token.chars().count() >= 3 && !STOPWORDS.contains(&token.as_str()))
        .collect()
}

/// Count whitespace-separated words.
#[must_use]
pub(crate) fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Comparison fingerprint: lowercase, punctuation stripped, whitespace collapsed.
#[must_use]
pub(crate) fn fingerprint(text: &str) -> String {
    text.chars()
        .map(|ch| {
            if ch.is_alphanumeric() {
                ch.to_lowercase().next().unwrap_or(ch)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Character n-gram shingle hashes of a text.
#[must_use]
pub(crate) fn shingles(text: &str, window_size: usize) -> FxHashSet<u64> {
    let chars: Vec<char> = text.chars().collect();
    let mut hashes = FxHashSet::default();

    if chars.len() < window_size || window_size == 0 {
        hashes.insert(hash_text(text));
        return hashes;
    }

    for window in chars.windows(window_size) {
        let window_text: String = window.iter().collect();
        hashes.insert(hash_text(&window_text));
    }

    hashes
}

/// Jaccard similarity of two shingle sets.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub(crate) fn jaccard(left: &FxHashSet<u64>, right: &FxHashSet<u64>) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(right).count();
    let union = left.len() + right.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Whether two texts are near-duplicates under shingle Jaccard similarity.
#[must_use]
pub(crate) fn is_near_duplicate(
    text1: &str,
    text2: &str,
    window_size: usize,
    threshold: f64,
) -> bool {
    if text1.is_empty() || text2.is_empty() {
        return false;
    }
    jaccard(&shingles(text1, window_size), &shingles(text2, window_size)) >= threshold
}

/// Truncate to at most `max_chars` characters, backing off to the last
/// word boundary when one exists in the second half of the window.
#[must_use]
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(char::is_whitespace) {
        Some(index) if cut[..index].chars().count() * 2 >= max_chars => {
            cut[..index].trim_end().to_string()
        }
        _ => cut.trim_end().to_string(),
    }
}

/// Pack sentences into chunks of at most `max_chars` characters.
///
/// A single sentence longer than the cap becomes its own (truncated) chunk.
#[must_use]
pub(crate) fn chunk_sentences(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        let sentence = truncate_chars(&sentence, max_chars);
        let projected = current.chars().count() + sentence.chars().count() + 1;
        if !current.is_empty() && projected > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&sentence);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
