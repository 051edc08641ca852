use std::sync::atomic::{AtomicUsize, Ordering};
use std::time;

use async_trait::async_trait;
use reqwest::header;
use serde::Deserialize;
use serde_derive::Serialize;
use tracing::warn;

use social_common::item::{ContentItem, Sentiment, Source};

/// Delimiter joining a hierarchical parent's text with each of its child
/// texts before classification. Deterministic: "A" with children ["B", "C"]
/// always classifies as "A commento:B commento:C".
pub const CHILD_TEXT_DELIMITER: &str = " commento:";

/// Extract the text to classify according to source-specific rules.
///
/// Single-text sources (YouTube) classify the primary text alone.
/// Hierarchical sources (Reddit) concatenate the primary text with a
/// delimiter-joined sequence of child texts. Returns `None` when nothing
/// non-blank could be extracted; the caller must treat that as a
/// data-quality condition, not a success.
pub fn extract_text(item: &ContentItem) -> Option<String> {
    let mut combined = String::new();

    match item.source {
        Source::YouTube => {
            if !item.text.trim().is_empty() {
                combined.push_str(&item.text);
            }
        }
        Source::Reddit => {
            if !item.text.trim().is_empty() {
                combined.push_str(&item.text);
            }
            for child in &item.comments {
                if !child.text.trim().is_empty() {
                    combined.push_str(CHILD_TEXT_DELIMITER);
                    combined.push_str(&child.text);
                }
            }
        }
    }

    if combined.trim().is_empty() {
        None
    } else {
        Some(combined)
    }
}

/// The opaque external classification call.
///
/// Implementations must absorb their own transient failures into a `Neutral`
/// label: a single unreachable classifier never stalls the drain loop.
#[async_trait]
pub trait SentimentClient: Send + Sync {
    async fn classify(&self, text: &str) -> Sentiment;
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    label: String,
}

/// `SentimentClient` calling an HTTP classification service.
pub struct HttpSentimentClient {
    client: reqwest::Client,
    url: String,
}

impl HttpSentimentClient {
    pub fn new(url: &str, request_timeout: time::Duration) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Social Sentiment Worker")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for sentiment worker");

        Self {
            client,
            url: url.to_owned(),
        }
    }

    async fn request(&self, text: &str) -> Result<Sentiment, reqwest::Error> {
        let response = self
            .client
            .post(&self.url)
            .json(&ClassifyRequest { text })
            .send()
            .await?
            .error_for_status()?
            .json::<ClassifyResponse>()
            .await?;

        match Sentiment::match_label(&response.label) {
            Some(label) => Ok(label),
            None => {
                warn!(
                    label = %response.label,
                    "classifier answered with an unknown label, assigning Neutral"
                );
                Ok(Sentiment::Neutral)
            }
        }
    }
}

#[async_trait]
impl SentimentClient for HttpSentimentClient {
    async fn classify(&self, text: &str) -> Sentiment {
        match self.request(text).await {
            Ok(label) => label,
            Err(error) => {
                warn!("classification request failed, assigning Neutral: {}", error);
                Sentiment::Neutral
            }
        }
    }
}

/// `SentimentClient` answering a fixed label, counting calls. For tests.
pub struct FixedSentimentClient {
    label: Sentiment,
    calls: AtomicUsize,
}

impl FixedSentimentClient {
    pub fn new(label: Sentiment) -> Self {
        Self {
            label,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SentimentClient for FixedSentimentClient {
    async fn classify(&self, _text: &str) -> Sentiment {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.label
    }
}
