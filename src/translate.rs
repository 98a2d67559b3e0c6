//! Translation adapter: a paid primary backend with quota, a best-effort
//! fallback, and the length management around them (caption pre-truncation,
//! paragraph re-chunking, post-translation safety truncation).

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const DEEPL_API_BASE: &str = "https://api.deepl.com/";
const GOOGLE_API_BASE: &str = "https://translate.googleapis.com/";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Platform caption limit, conservative.
pub const CAPTION_LIMIT: usize = 1024;
/// Reserved space for the attribution footer.
pub const FOOTER_RESERVE: usize = 200;

// Re-chunking kicks in past either of these.
const CHUNK_TRIGGER_LEN: usize = 1200;
const CHUNK_TRIGGER_BREAKS: usize = 5;
// Adjacent chunks are merged while their combined length stays below this.
const CHUNK_MERGE_THRESHOLD: usize = 440;
// A sentence boundary only counts when this many non-digit characters precede
// the punctuation, so "3.5" or enumerations do not split.
const SENTENCE_LOOKBEHIND: usize = 20;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("translation quota exceeded")]
    Quota,
    #[error("translation service error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("translation transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("translation response unparseable: {0}")]
    Parse(String),
}

/// Strategy seam the pipeline orchestrator depends on.
#[async_trait]
pub trait TranslateService: Send + Sync {
    async fn translate(&self, text: &str, is_caption: bool) -> Result<String>;
}

#[derive(Clone)]
pub struct DeeplClient {
    http: Client,
    base_url: Url,
    api_key: String,
    target_lang: String,
}

impl fmt::Debug for DeeplClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeeplClient")
            .field("base_url", &self.base_url)
            .field("target_lang", &self.target_lang)
            .finish_non_exhaustive()
    }
}

impl DeeplClient {
    pub fn new(api_key: String, target_lang: String) -> Self {
        let base_url = Url::parse(DEEPL_API_BASE).expect("valid default DeepL URL");
        Self::with_base_url(api_key, target_lang, base_url)
    }

    pub fn with_base_url(api_key: String, target_lang: String, base_url: Url) -> Self {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
            target_lang,
        }
    }

    pub fn build_request(&self, text: &str) -> Result<reqwest::Request, TranslateError> {
        let endpoint = self
            .base_url
            .join("v2/translate")
            .map_err(|e| TranslateError::Parse(e.to_string()))?;
        let body = json!({
            "text": [text],
            "target_lang": self.target_lang.to_uppercase(),
            "tag_handling": "html",
            "split_sentences": "1",
        });
        Ok(self
            .http
            .post(endpoint)
            .header("Authorization", format!("DeepL-Auth-Key {}", self.api_key))
            .json(&body)
            .build()?)
    }

    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let request = self.build_request(text)?;
        debug!(url = %request.url(), "sending deepl request");
        let res = self.http.execute(request).await?;

        // 456 is DeepL's "quota exceeded" status.
        if res.status().as_u16() == 456 {
            return Err(TranslateError::Quota);
        }
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(TranslateError::Api { status, body });
        }

        let payload: Value = res.json().await?;
        payload["translations"][0]["text"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| TranslateError::Parse("missing translations[0].text".into()))
    }
}

/// Free web endpoint used when the primary backend is unavailable.
#[derive(Clone)]
pub struct GoogleWebClient {
    http: Client,
    base_url: Url,
    target_lang: String,
}

impl GoogleWebClient {
    pub fn new(target_lang: String) -> Self {
        let base_url = Url::parse(GOOGLE_API_BASE).expect("valid default translate URL");
        Self::with_base_url(target_lang, base_url)
    }

    pub fn with_base_url(target_lang: String, base_url: Url) -> Self {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            target_lang,
        }
    }

    pub fn build_request(&self, text: &str) -> Result<reqwest::Request, TranslateError> {
        let endpoint = self
            .base_url
            .join("translate_a/single")
            .map_err(|e| TranslateError::Parse(e.to_string()))?;
        Ok(self
            .http
            .get(endpoint)
            .query(&[
                ("client", "gtx"),
                ("sl", "auto"),
                ("tl", self.target_lang.as_str()),
                ("dt", "t"),
                ("q", text),
            ])
            .build()?)
    }

    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let request = self.build_request(text)?;
        debug!(url = %request.url().path(), "sending fallback translation request");
        let res = self.http.execute(request).await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(TranslateError::Api { status, body });
        }

        let payload: Value = res.json().await?;
        let mut out = String::new();
        if let Some(rows) = payload.get(0).and_then(Value::as_array) {
            for row in rows {
                if let Some(segment) = row.get(0).and_then(Value::as_str) {
                    out.push_str(segment);
                }
            }
        }
        if out.is_empty() {
            return Err(TranslateError::Parse("empty translation payload".into()));
        }
        Ok(out)
    }
}

/// Primary-with-fallback selector. Backend errors never reach the caller
/// unless both backends fail.
pub struct Translator {
    primary: DeeplClient,
    fallback: GoogleWebClient,
}

impl Translator {
    pub fn new(deepl_key: String, target_lang: String) -> Self {
        Translator {
            primary: DeeplClient::new(deepl_key, target_lang.clone()),
            fallback: GoogleWebClient::new(target_lang),
        }
    }
}

#[async_trait]
impl TranslateService for Translator {
    async fn translate(&self, text: &str, is_caption: bool) -> Result<String> {
        let budget = CAPTION_LIMIT - FOOTER_RESERVE;
        let mut input = text.to_string();
        // Truncating before translation avoids paying for text the caption
        // limit will cut anyway.
        if is_caption && input.chars().count() > budget {
            info!(
                from = input.chars().count(),
                to = budget,
                "pre-truncating caption before translation"
            );
            input = truncate_text(&input, budget);
        }

        let translated = match self.primary.translate(&input).await {
            Ok(text) => text,
            Err(TranslateError::Quota) => {
                info!("translation quota exceeded, using fallback backend");
                self.fallback
                    .translate(&input)
                    .await
                    .context("fallback translation failed after quota exhaustion")?
            }
            Err(err) => {
                warn!(%err, "primary translation failed, using fallback backend");
                self.fallback
                    .translate(&input)
                    .await
                    .context("both translation backends failed")?
            }
        };

        let mut out = chunk_paragraphs(&translated);
        if is_caption && out.chars().count() > budget {
            warn!(len = out.chars().count(), "post-translation truncation needed");
            out = truncate_text(&out, budget);
        }
        Ok(out)
    }
}

/// Split into sentence-bounded pieces. A boundary is punctuation followed by
/// whitespace, with at least [`SENTENCE_LOOKBEHIND`] non-digit characters in
/// front of the punctuation.
fn split_sentences(text: &str) -> Vec<String> {
    static BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").unwrap());

    let mut pieces = Vec::new();
    let mut start = 0usize;
    for m in BOUNDARY.find_iter(text) {
        let punct_at = m.start();
        if punct_at < start {
            continue;
        }
        let lookbehind: Vec<char> = text[..punct_at]
            .chars()
            .rev()
            .take(SENTENCE_LOOKBEHIND)
            .collect();
        if lookbehind.len() == SENTENCE_LOOKBEHIND && lookbehind.iter().all(|c| !c.is_numeric()) {
            // Punctuation is a single ASCII byte; keep it, drop the whitespace.
            pieces.push(text[start..=punct_at].to_string());
            start = m.end();
        }
    }
    pieces.push(text[start..].to_string());
    pieces
}

/// Re-segment oversized translated text into paragraph-sized chunks, merging
/// short neighbors. Idempotent: re-chunking chunked output is a no-op.
pub fn chunk_paragraphs(text: &str) -> String {
    if text.chars().count() <= CHUNK_TRIGGER_LEN
        && text.matches("\n\n").count() < CHUNK_TRIGGER_BREAKS
    {
        return text.to_string();
    }

    let mut chunks: Vec<String> = Vec::new();
    for piece in split_sentences(text) {
        match chunks.last_mut() {
            Some(last)
                if piece.chars().count() + last.chars().count() < CHUNK_MERGE_THRESHOLD =>
            {
                last.push(' ');
                last.push_str(&piece);
            }
            _ => chunks.push(piece),
        }
    }
    chunks.join("\n\n")
}

/// Truncate at the nearest sentence boundary before `max_length` characters,
/// provided the boundary is past 60% of the budget, otherwise hard-cut.
/// Appends an ellipsis marker.
pub fn truncate_text(text: &str, max_length: usize) -> String {
    if text.chars().count() <= max_length {
        return text.to_string();
    }

    // Reserve space for the " ..." marker.
    let budget = max_length.saturating_sub(4);
    let chars: Vec<char> = text.chars().take(budget).collect();

    let mut last_end = None;
    for (i, c) in chars.iter().enumerate() {
        match c {
            '.' | '!' | '?' => last_end = Some(i),
            '\n' if chars.get(i + 1) == Some(&'\n') => last_end = Some(i),
            _ => {}
        }
    }

    let cut = match last_end {
        Some(idx) if idx as f64 > budget as f64 * 0.6 => idx + 1,
        _ => chars.len(),
    };
    let truncated: String = chars[..cut].iter().collect();
    let mut out = truncated.trim_end().to_string();
    out.push_str(" ...");
    out
}
