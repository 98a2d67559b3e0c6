//! Content-based destination router: asks a classification service for the
//! best-matching region and resolves it through the cache's precomputed map.
//! Routing failure must never block publication: every error path falls back
//! to the source's statically configured destination.

use crate::cache::RefCache;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/";
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Below this the classifier's pick is ignored.
pub const CONFIDENCE_THRESHOLD: f64 = 0.6;
/// Classified text is bounded to keep request cost flat.
const CLASSIFY_PREFIX_CHARS: usize = 1500;

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub region: String,
    pub confidence: f64,
}

/// Seam over the classification backend, so routing decisions are testable
/// without HTTP.
#[async_trait]
pub trait Classify: Send + Sync {
    async fn classify(&self, text: &str, regions: &[String]) -> Result<Classification>;
}

#[derive(Clone)]
pub struct OpenRouterClassifier {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for OpenRouterClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenRouterClassifier")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenRouterClassifier {
    pub fn new(api_key: String, model: String) -> Self {
        let base_url = Url::parse(OPENROUTER_API_BASE).expect("valid default OpenRouter URL");
        Self::with_base_url(api_key, model, base_url)
    }

    pub fn with_base_url(api_key: String, model: String, base_url: Url) -> Self {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
            model,
        }
    }

    pub fn build_request(&self, text: &str, regions: &[String]) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("api/v1/chat/completions")
            .context("invalid OpenRouter base URL")?;
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": build_prompt(text, regions),
            }],
            "temperature": 0.1,
            "max_tokens": 50,
        });
        self.http
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .build()
            .context("failed to build classification request")
    }
}

#[async_trait]
impl Classify for OpenRouterClassifier {
    async fn classify(&self, text: &str, regions: &[String]) -> Result<Classification> {
        let request = self.build_request(text, regions)?;
        debug!(url = %request.url().path(), "sending classification request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach classification service")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("classification error {}: {}", status, body));
        }

        let payload: Value = res.json().await.context("invalid classification response")?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("classification reply has no content"))?;
        parse_classification(content)
    }
}

fn build_prompt(text: &str, regions: &[String]) -> String {
    let prefix: String = text.chars().take(CLASSIFY_PREFIX_CHARS).collect();
    format!(
        "Classify this news into ONE region: {}\n\n\
         Regions:\n\
         - kaukasus: Armenia, Azerbaijan, Georgia\n\
         - südamerika: South America\n\
         - afrika: Africa\n\
         - ukraine: Ukraine\n\
         - asien: Asia, China, India, Japan, Korea, Southeast Asia\n\
         - naher osten: Middle East, Syria, Iran, Turkey, Saudi Arabia, Israel\n\n\
         Text: {}\n\n\
         Reply ONLY with JSON: {{\"region\": \"name\", \"confidence\": 0.9}}",
        regions.join(", "),
        prefix
    )
}

/// Parse the classifier's free-form reply, tolerating code-fence wrapping.
pub fn parse_classification(content: &str) -> Result<Classification> {
    let mut body = content.trim().to_string();
    if body.contains("```") {
        let inner = body
            .split("```")
            .nth(1)
            .ok_or_else(|| anyhow!("unterminated code fence in classifier reply"))?;
        body = inner.replacen("json", "", 1).trim().to_string();
    }
    let value: Value =
        serde_json::from_str(&body).context("classifier reply is not valid JSON")?;
    let region = value
        .get("region")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("classifier reply missing region"))?
        .to_lowercase();
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("classifier reply missing confidence"))?;
    Ok(Classification { region, confidence })
}

pub struct Router {
    classifier: Box<dyn Classify>,
}

impl Router {
    pub fn new(classifier: Box<dyn Classify>) -> Self {
        Router { classifier }
    }

    /// Pick a destination for cleaned message text, falling back to
    /// `default_dest` on low confidence, unknown region, or any error. Reads
    /// only the precomputed destination index and never triggers a cache warm.
    pub async fn route(&self, text: &str, default_dest: i64, cache: &RefCache) -> i64 {
        if text.is_empty() {
            return default_dest;
        }

        let index = cache.destination_index();
        if index.list.is_empty() {
            return default_dest;
        }

        match self.classifier.classify(text, &index.regions).await {
            Ok(result) if result.confidence >= CONFIDENCE_THRESHOLD => {
                match index.map.get(&result.region) {
                    Some(channel_id) => {
                        info!(
                            region = %result.region,
                            confidence = result.confidence,
                            "routed by content"
                        );
                        *channel_id
                    }
                    None => {
                        info!(region = %result.region, "unknown region, using default destination");
                        default_dest
                    }
                }
            }
            Ok(result) => {
                info!(
                    confidence = result.confidence,
                    "low routing confidence, using default destination"
                );
                default_dest
            }
            Err(err) => {
                warn!(%err, "routing failed, using default destination");
                default_dest
            }
        }
    }

    /// Resolve the final destination for a source's message. Returns `None`
    /// when the source has no configured destination at all (do not publish).
    pub async fn get_destination(
        &self,
        text: &str,
        source_id: i64,
        cache: &RefCache,
    ) -> Result<Option<i64>> {
        let Some(source) = cache.get_source(source_id).await? else {
            warn!(source_id, "routing request for unknown source");
            return Ok(None);
        };
        let Some(default_dest) = source.destination else {
            warn!(source_id, "no destination configured for source");
            return Ok(None);
        };
        Ok(Some(self.route(text, default_dest, cache).await))
    }
}
