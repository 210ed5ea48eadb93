//! Index functions over topics.
//!
//! * `backrefs`: every key a topic points at maps back to the topic, so
//!   "what links here" is a single index lookup.
//! * `terms`: words of the title and body map to the topic, for simple
//!   full-text lookup.

use quire_common::Topic;
use std::collections::BTreeSet;

/// Name of the reverse-link index
pub const BACKREFS: &str = "backrefs";

/// Name of the full-text term index
pub const TERMS: &str = "terms";

/// Shortest word, in letters, that is indexed as a term.
///
/// Three-letter words are kept deliberately (a strict "longer than three"
/// rule would drop words like "fox"); noise words of that length are handled
/// by `STOPWORDS` instead.
pub const MIN_TERM_LEN: usize = 3;

/// Words too common to be worth a term entry
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "was", "our", "has",
    "had", "its", "his", "her", "who", "why", "how", "with", "this", "that", "from", "have",
    "into", "they", "them", "then", "than", "were", "will", "what", "when", "your", "there",
    "their", "which", "about", "would",
];

/// Backref index function: outbound references of a topic
#[must_use]
pub fn backrefs(_key: &str, topic: &Topic) -> Vec<String> {
    topic.references().into_iter().collect()
}

/// Term index function: distinct searchable words of a topic
#[must_use]
pub fn terms(_key: &str, topic: &Topic) -> Vec<String> {
    let mut words = BTreeSet::new();
    for text in topic.text_fields() {
        words.extend(tokenize(text));
    }
    words.into_iter().collect()
}

/// Lower-cased alphabetic words of `text`, minus short words and stopwords
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphabetic())
        .filter(|word| word.chars().count() >= MIN_TERM_LEN)
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
}
