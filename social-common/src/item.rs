use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{0} is not a valid Source")]
pub struct ParseSourceError(String);

/// The social platform a content item was scraped from. Determines which
/// enrichment path and field-extraction rules apply, and scopes every key
/// namespace in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Reddit,
    YouTube,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Reddit, Source::YouTube];

    /// Lowercase label used in key namespaces and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Source::Reddit => "reddit",
            Source::YouTube => "youtube",
        }
    }

    /// Prefix of the per-partition dedup index sets for this source.
    pub fn dedup_prefix(&self) -> &'static str {
        match self {
            Source::Reddit => "processed_reddit_ids",
            Source::YouTube => "processed_youtube_ids",
        }
    }

    /// Name of this source's append-only stream.
    pub fn stream_name(&self) -> &'static str {
        match self {
            Source::Reddit => "reddit_data_stream",
            Source::YouTube => "youtube_data_stream",
        }
    }
}

impl FromStr for Source {
    type Err = ParseSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Reddit" | "reddit" => Ok(Source::Reddit),
            "YouTube" | "youtube" => Ok(Source::YouTube),
            invalid => Err(ParseSourceError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Source::Reddit => write!(f, "Reddit"),
            Source::YouTube => write!(f, "YouTube"),
        }
    }
}

/// Sentiment label attached by the enrichment stage. The five ordered classes
/// match what the classification service emits; `Neutral` doubles as the
/// absorbing default when classification fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sentiment {
    #[serde(rename = "Very Negative")]
    VeryNegative,
    #[serde(rename = "Negative")]
    Negative,
    #[default]
    #[serde(rename = "Neutral")]
    Neutral,
    #[serde(rename = "Positive")]
    Positive,
    #[serde(rename = "Very Positive")]
    VeryPositive,
}

impl Sentiment {
    pub const ORDERED: [Sentiment; 5] = [
        Sentiment::VeryNegative,
        Sentiment::Negative,
        Sentiment::Neutral,
        Sentiment::Positive,
        Sentiment::VeryPositive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::VeryNegative => "Very Negative",
            Sentiment::Negative => "Negative",
            Sentiment::Neutral => "Neutral",
            Sentiment::Positive => "Positive",
            Sentiment::VeryPositive => "Very Positive",
        }
    }

    /// Find a label inside free-form classifier output. Checked in `ORDERED`
    /// order so "Very Negative" wins over the "Negative" it contains.
    pub fn match_label(text: &str) -> Option<Sentiment> {
        Sentiment::ORDERED
            .into_iter()
            .find(|label| text.contains(label.as_str()))
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Producer-provided metadata carried through the pipeline unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_post_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emoji: Vec<String>,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub reply_count: i64,
    #[serde(default)]
    pub repost_count: i64,
    #[serde(default)]
    pub quote_count: i64,
    #[serde(default)]
    pub bookmark_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A child item nested under a hierarchical parent, e.g. a comment embedded
/// in its Reddit post's staged record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildItem {
    pub content_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(flatten)]
    pub metadata: ItemMetadata,
}

/// The unit of work flowing through the pipeline: one scraped post or
/// comment, plus embedded children for hierarchical sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Globally unique, stable across producer retries. The format encodes
    /// source and kind: `reddit_post_<id>`, `reddit_comm_<id>`, `yt_comm_<id>`.
    pub content_id: String,
    /// Subreddit name or video identifier; scopes dedup and staging keys.
    #[serde(default)]
    pub partition_key: String,
    #[serde(rename = "social_media")]
    pub source: Source,
    /// Primary text: the post or comment body.
    #[serde(default)]
    pub text: String,
    /// Ordered child texts for hierarchical sources.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<ChildItem>,
    #[serde(flatten)]
    pub metadata: ItemMetadata,
}

impl ContentItem {
    /// Serialize into the flat string fields of a stream entry. Non-string
    /// values (counts, nested child arrays) become JSON text; the consumer
    /// side undoes this with `FieldValue::decode`.
    pub fn to_stream_fields(&self) -> Result<Vec<(String, String)>, serde_json::Error> {
        let Value::Object(map) = serde_json::to_value(self)? else {
            unreachable!("ContentItem serializes to an object");
        };

        Ok(map
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| match value {
                Value::String(s) => (name, s),
                other => (name, other.to_string()),
            })
            .collect())
    }

    /// Rebuild an item from the flat string fields of a stream entry,
    /// decoding each value once at this boundary.
    pub fn from_stream_fields(
        fields: &[(String, String)],
    ) -> Result<ContentItem, serde_json::Error> {
        let mut map = serde_json::Map::new();
        for (name, raw) in fields {
            let value = match FieldValue::decode(raw) {
                FieldValue::Structured(value) => value,
                FieldValue::Raw(s) => Value::String(s),
            };
            map.insert(name.clone(), value);
        }

        serde_json::from_value(Value::Object(map))
    }
}

/// A stream field value after the one-shot decode at the drainer boundary:
/// either a structured JSON value or the raw string it refused to be.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Structured(Value),
    Raw(String),
}

impl FieldValue {
    pub fn decode(raw: &str) -> FieldValue {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => FieldValue::Structured(value),
            Err(_) => FieldValue::Raw(raw.to_owned()),
        }
    }
}

/// A content item the enrichment stage has classified. A distinct type so an
/// unenriched item cannot reach the sink, and so the label is set exactly once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedItem {
    #[serde(flatten)]
    pub item: ContentItem,
    pub sentiment: Sentiment,
    /// The exact text the classifier saw, kept for the per-source report.
    #[serde(skip)]
    pub classified_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reddit_item() -> ContentItem {
        ContentItem {
            content_id: "reddit_post_abc".to_owned(),
            partition_key: "formula1".to_owned(),
            source: Source::Reddit,
            text: "A".to_owned(),
            comments: vec![
                ChildItem {
                    content_id: "reddit_comm_def".to_owned(),
                    text: "B".to_owned(),
                    metadata: ItemMetadata::default(),
                },
                ChildItem {
                    content_id: "reddit_comm_ghi".to_owned(),
                    text: "C".to_owned(),
                    metadata: ItemMetadata::default(),
                },
            ],
            metadata: ItemMetadata {
                user: Some("driver61".to_owned()),
                like_count: 42,
                ..Default::default()
            },
        }
    }

    #[test]
    fn field_value_decodes_structured_or_raw() {
        assert_eq!(
            FieldValue::decode("[1, 2]"),
            FieldValue::Structured(serde_json::json!([1, 2]))
        );
        assert_eq!(
            FieldValue::decode("42"),
            FieldValue::Structured(serde_json::json!(42))
        );
        assert_eq!(
            FieldValue::decode("not json at all"),
            FieldValue::Raw("not json at all".to_owned())
        );
    }

    #[test]
    fn stream_fields_round_trip() {
        let item = reddit_item();
        let fields = item.to_stream_fields().unwrap();

        // Nested children travel as JSON text, counts as numeric text.
        let comments = &fields.iter().find(|(k, _)| k == "comments").unwrap().1;
        assert!(comments.starts_with('['));
        let likes = &fields.iter().find(|(k, _)| k == "like_count").unwrap().1;
        assert_eq!(likes, "42");

        let decoded = ContentItem::from_stream_fields(&fields).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn from_stream_fields_rejects_missing_identity() {
        let fields = vec![("text".to_owned(), "hello".to_owned())];
        assert!(ContentItem::from_stream_fields(&fields).is_err());
    }

    #[test]
    fn sentiment_label_matching_prefers_longest() {
        assert_eq!(
            Sentiment::match_label("the answer is Very Negative."),
            Some(Sentiment::VeryNegative)
        );
        assert_eq!(
            Sentiment::match_label("Negative"),
            Some(Sentiment::Negative)
        );
        assert_eq!(Sentiment::match_label("no label here"), None);
    }

    #[test]
    fn sentiment_serializes_with_spaced_labels() {
        let json = serde_json::to_string(&Sentiment::VeryPositive).unwrap();
        assert_eq!(json, r#""Very Positive""#);
        let back: Sentiment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Sentiment::VeryPositive);
    }

    #[test]
    fn source_parsing() {
        assert_eq!("Reddit".parse::<Source>().unwrap(), Source::Reddit);
        assert_eq!("youtube".parse::<Source>().unwrap(), Source::YouTube);
        assert!("Facebook".parse::<Source>().is_err());
    }
}
