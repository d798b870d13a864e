//! Keyword topic classification and lexicon sentiment.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::schema::{Sentiment, TopicTag};
use crate::util::text::word_tokens;

/// Maps texts onto the fixed topic taxonomy by keyword hits.
#[derive(Debug, Clone)]
pub(crate) struct TopicTaxonomy {
    topics: Vec<(TopicTag, FxHashSet<String>)>,
}

impl TopicTaxonomy {
    pub(crate) fn new(keywords: &BTreeMap<TopicTag, Vec<String>>) -> Self {
        let topics = keywords
            .iter()
            .filter(|(tag, _)| **tag != TopicTag::Other)
            .map(|(tag, words)| {
                (
                    *tag,
                    words.iter().map(|word| word.to_lowercase()).collect(),
                )
            })
            .collect();
        Self { topics }
    }

    /// Topic with the most keyword hits across `texts`. Ties go to the
    /// topic declared first; no hits at all means [`TopicTag::Other`].
    pub(crate) fn classify<'a, I>(&self, texts: I) -> TopicTag
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut hits = vec![0_usize; self.topics.len()];
        for text in texts {
            for token in word_tokens(text) {
                for (slot, (_, words)) in hits.iter_mut().zip(&self.topics) {
                    if words.contains(&token) {
                        *slot += 1;
                    }
                }
            }
        }

        // `topics` is ordered by tag, so the first maximum wins ties.
        let mut best: Option<(TopicTag, usize)> = None;
        for ((tag, _), count) in self.topics.iter().zip(hits) {
            if count > 0 && best.is_none_or(|(_, top)| count > top) {
                best = Some((*tag, count));
            }
        }
        best.map_or(TopicTag::Other, |(tag, _)| tag)
    }
}

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "amazing", "love", "loved", "best", "helpful", "clear",
    "awesome", "engaging", "fair", "recommend", "organized", "interesting", "caring",
    "knowledgeable", "easy", "nice", "fantastic",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "worst", "hate", "hated", "confusing", "unclear", "difficult",
    "boring", "unfair", "rude", "disorganized", "useless", "avoid", "unhelpful", "harsh",
    "impossible", "horrible", "poor",
];

const NEGATORS: &[&str] = &["not", "no", "never", "hardly", "barely", "without"];

/// Polarity counts over a fixed word list.
#[derive(Debug, Clone)]
pub(crate) struct SentimentLexicon {
    positive: FxHashSet<&'static str>,
    negative: FxHashSet<&'static str>,
    ratio: f32,
}

impl SentimentLexicon {
    pub(crate) fn new(ratio: f32) -> Self {
        Self {
            positive: POSITIVE_WORDS.iter().copied().collect(),
            negative: NEGATIVE_WORDS.iter().copied().collect(),
            ratio,
        }
    }

    /// (positive hits, negative hits); a negator right before a polarity
    /// word flips it.
    pub(crate) fn polarity<'a, I>(&self, texts: I) -> (usize, usize)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut positive = 0;
        let mut negative = 0;
        for text in texts {
            let mut negated = false;
            for token in word_tokens(text) {
                let token = token.as_str();
                let is_positive = self.positive.contains(token);
                let is_negative = self.negative.contains(token);
                match (is_positive, is_negative, negated) {
                    (true, _, false) | (_, true, true) => positive += 1,
                    (true, _, true) | (_, true, false) => negative += 1,
                    _ => {}
                }
                negated = NEGATORS.contains(&token) || token.ends_with("n't");
            }
        }
        (positive, negative)
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn label(&self, positive: usize, negative: usize) -> Sentiment {
        match (positive, negative) {
            (0, 0) => Sentiment::Neutral,
            (p, n) if p as f32 > n as f32 * self.ratio => Sentiment::Positive,
            (p, n) if n as f32 > p as f32 * self.ratio => Sentiment::Negative,
            _ => Sentiment::Mixed,
        }
    }

    pub(crate) fn classify<'a, I>(&self, texts: I) -> Sentiment
    where
        I: IntoIterator<Item = &'a str>,
    {
        let (positive, negative) = self.polarity(texts);
        self.label(positive, negative)
    }
}
