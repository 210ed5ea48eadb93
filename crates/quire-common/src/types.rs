//! Core types for Quire
//!
//! Documents stored by the knowledge base and the small value types shared
//! by the store and the replication layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// A knowledge-base topic as stored in the `topics` namespace.
///
/// Known fields are typed; anything else the remote document carries is kept
/// in `extra` so a round trip through the store loses nothing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    /// Display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Body text (may contain `[[wiki links]]`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Keys of broader topics
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub broader: Vec<String>,
    /// Keys of narrower topics
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub narrower: Vec<String>,
    /// Keys of related topics
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
    /// Unrecognised document fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Topic {
    /// Create a topic with only a title
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    /// Set the body text
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Add a broader reference
    #[must_use]
    pub fn with_broader(mut self, key: impl Into<String>) -> Self {
        self.broader.push(key.into());
        self
    }

    /// Every key this topic points at: the reference lists plus any
    /// `[[wiki links]]` found in the body text. Deduplicated and sorted.
    #[must_use]
    pub fn references(&self) -> BTreeSet<String> {
        let mut refs: BTreeSet<String> = self
            .broader
            .iter()
            .chain(&self.narrower)
            .chain(&self.related)
            .filter(|r| !r.is_empty())
            .cloned()
            .collect();
        if let Some(text) = &self.text {
            refs.extend(wiki_links(text));
        }
        refs
    }

    /// Title and body text, in that order, skipping absent fields
    pub fn text_fields(&self) -> impl Iterator<Item = &str> {
        self.title.as_deref().into_iter().chain(self.text.as_deref())
    }
}

/// Extract `[[target]]` and `[[target|label]]` link targets from text
fn wiki_links(text: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("[[") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("]]") else {
            break;
        };
        let inner = &after[..end];
        let target = inner.split('|').next().unwrap_or_default().trim();
        if !target.is_empty() {
            links.push(target.to_string());
        }
        rest = &after[end + 2..];
    }
    links
}

/// Opaque position within a remote change feed.
///
/// Feeds hand out either numeric or string sequence tokens; the token is
/// passed back verbatim and never compared or incremented locally.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncCursor {
    /// Numeric sequence
    Seq(u64),
    /// Opaque string token
    Token(String),
}

impl SyncCursor {
    /// Render the cursor as a query-string value
    #[must_use]
    pub fn as_query_value(&self) -> String {
        match self {
            Self::Seq(n) => n.to_string(),
            Self::Token(t) => t.clone(),
        }
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seq(n) => write!(f, "{n}"),
            Self::Token(t) => write!(f, "{t}"),
        }
    }
}

impl From<u64> for SyncCursor {
    fn from(n: u64) -> Self {
        Self::Seq(n)
    }
}

impl From<&str> for SyncCursor {
    fn from(t: &str) -> Self {
        Self::Token(t.to_string())
    }
}

/// Inclusive range of remote document ids that belong to the synced entity.
///
/// Ids outside the range (queue markers, design documents) are skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Lowest id included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Highest id included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl KeyRange {
    /// Range covering every id
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// Range covering `[start, end]`
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }

    /// Check whether an id falls inside the range
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.start.as_deref().is_none_or(|s| id >= s) && self.end.as_deref().is_none_or(|e| id <= e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_references() {
        let topic = Topic {
            text: Some("see [[Alpha]] and [[Beta|the beta page]]".into()),
            broader: vec!["Gamma".into(), "Alpha".into()],
            related: vec![String::new()],
            ..Default::default()
        };
        let refs: Vec<_> = topic.references().into_iter().collect();
        assert_eq!(refs, vec!["Alpha", "Beta", "Gamma"]);
    }

    #[test]
    fn test_wiki_link_unterminated() {
        assert_eq!(wiki_links("open [[never closed"), Vec::<String>::new());
        assert_eq!(wiki_links("[[]] [[ x ]]"), vec!["x".to_string()]);
    }

    #[test]
    fn test_topic_keeps_unknown_fields() {
        let json = r#"{"title":"x","color":"blue","broader":["A"]}"#;
        let topic: Topic = serde_json::from_str(json).unwrap();
        assert_eq!(topic.title.as_deref(), Some("x"));
        assert_eq!(topic.extra.get("color"), Some(&Value::from("blue")));

        let back = serde_json::to_value(&topic).unwrap();
        assert_eq!(back["color"], "blue");
        assert!(back.get("narrower").is_none());
    }

    #[test]
    fn test_cursor_untagged() {
        let seq: SyncCursor = serde_json::from_str("42").unwrap();
        assert_eq!(seq, SyncCursor::Seq(42));
        let token: SyncCursor = serde_json::from_str(r#""17-g1AAAA""#).unwrap();
        assert_eq!(token, SyncCursor::Token("17-g1AAAA".into()));
        assert_eq!(token.as_query_value(), "17-g1AAAA");
    }

    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::new("topic:", "topic:\u{fff0}");
        assert!(range.contains("topic:alpha"));
        assert!(!range.contains("queue:1"));
        assert!(KeyRange::all().contains("anything"));
    }
}
