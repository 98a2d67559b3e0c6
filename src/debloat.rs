//! Text-debloating pipeline: an ordered list of named transformation stages
//! that turn raw platform-formatted text into clean, translatable text, or
//! reject it. Ordering is load-bearing: patterns match against markup-
//! stripped text and symbols are spaced before extraction, while restoration
//! happens after translation.

use crate::cache::RefCache;
use crate::translate::TranslateService;
use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

/// Token substituted for every extracted symbol/anchor. Translation backends
/// leave it alone, so restoration is purely positional.
pub const PLACEHOLDER: &str = "<body translate=\"no\">";

/// Minimum surviving length for media captions.
pub const CAPTION_MIN_LEN: usize = 20;
/// Minimum surviving length for plain text posts.
pub const TEXT_MIN_LEN: usize = 30;

static BLACKLIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new("(?i)(Нічний чат, правила стандартні:)|(paypal)|(patreon)").unwrap()
});

// Strips every tag that does not contain an 'a', which keeps anchor tags for
// the footer/"read more" semantics downstream.
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^a>]+>").unwrap());

static TRAILING_HASHTAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\s+#\S*)*$").unwrap());

static INVITE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"t\.me/\+").unwrap());

// U+203C joins the symbol/pictograph class: it shows up in news posts as an
// attention marker and must be protected like an emoji.
static SYMBOL_SPACING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\x{203C}\p{So}])([^\s\x{203C}\p{So}]+)").unwrap());

static SYMBOL_OR_ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x{203C}\p{So}]|</?a[^>]*>").unwrap());

// Skin-tone modifiers and gender signs that survive translation as orphans
// once their base emoji moved.
static SKIN_MODIFIERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x{1F3FB}-\x{1F3FF}\x{2640}\x{2642}\x{FE0F}]").unwrap());

/// Literal phrases rewritten before translation (case-insensitive).
const REPLACEMENTS: &[(&str, &str)] = &[("ЗСУ", "Збро́йні си́ли Украї́ни")];

/// Whole-word abbreviations expanded before translation (case-insensitive).
const ABBREVIATIONS: &[(&str, &str)] = &[("AFU", "ukrainian Armed forces")];

static REPLACEMENT_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    REPLACEMENTS
        .iter()
        .map(|(from, to)| {
            let re = Regex::new(&format!("(?i){}", regex::escape(from)))
                .expect("escaped replacement literal");
            (re, *to)
        })
        .collect()
});

static ABBREVIATION_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    ABBREVIATIONS
        .iter()
        .map(|(from, to)| {
            let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(from)))
                .expect("escaped abbreviation literal");
            (re, *to)
        })
        .collect()
});

/// Why a message was dropped. Not an error: rejection is an expected outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Blacklisted,
    NoPatternMatch,
    AdLink,
    TooShort { len: usize, limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean(String),
    Rejected(Rejection),
}

/// Outcome of the per-channel allow-pattern stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternOutcome {
    /// Channel has no configured patterns; filtering is skipped entirely.
    NoPatterns,
    /// At least one pattern matched; all matched spans have been deleted.
    Matched(String),
    /// Patterns exist but none matched; candidate for review.
    Unmatched,
}

/// Side-channel for rejected-but-ambiguous messages.
#[async_trait]
pub trait ReviewSink: Send + Sync {
    /// Forward the original message to the review channel.
    async fn forward_to_review(&self, chat_id: i64, message_id: i64) -> Result<()>;
    /// Send a plain note to the review channel.
    async fn send_review_note(&self, text: &str) -> Result<()>;
}

/// The inbound text the pipeline operates on.
#[derive(Debug, Clone)]
pub struct InboundText {
    pub chat_id: i64,
    pub message_id: i64,
    /// Raw rich text or caption, platform markup included.
    pub text: String,
    pub is_caption: bool,
    /// Public username of the source channel, for self-mention stripping.
    pub chat_username: Option<String>,
    /// Public link to the original message, used in review notes.
    pub link: String,
}

pub fn is_blacklisted(text: &str) -> bool {
    BLACKLIST.is_match(text)
}

pub fn strip_markup(text: &str) -> String {
    HTML_TAG.replace_all(text, "").trim_end().to_string()
}

/// Allow-pattern filter: patterns are markup-stripped and regex-escaped, then
/// matched case-insensitively as one alternation.
pub fn apply_patterns(text: &str, patterns: &[String]) -> PatternOutcome {
    let escaped: Vec<String> = patterns
        .iter()
        .map(|p| regex::escape(&HTML_TAG.replace_all(p, "")))
        .filter(|p| !p.is_empty())
        .collect();
    if escaped.is_empty() {
        return PatternOutcome::NoPatterns;
    }

    let alternation = format!("(?i)({})", escaped.join(")|("));
    let re = Regex::new(&alternation).expect("escaped pattern alternation");

    if !re.is_match(text) {
        return PatternOutcome::Unmatched;
    }
    PatternOutcome::Matched(re.replace_all(text, "").into_owned())
}

/// Remove a trailing `@<username>` token.
pub fn strip_self_mention(text: &str, username: Option<&str>) -> String {
    let Some(username) = username else {
        return text.to_string();
    };
    let re = Regex::new(&format!("(?i)@{}$", regex::escape(username)))
        .expect("escaped username mention");
    re.replace(text, "").trim_end().to_string()
}

/// Remove a trailing run of whitespace-separated hashtag tokens.
pub fn strip_trailing_hashtags(text: &str) -> String {
    TRAILING_HASHTAGS.replace(text, "").trim_end().to_string()
}

pub fn has_invite_link(text: &str) -> bool {
    INVITE_LINK.is_match(text)
}

/// Insert a space between a symbol and a following word so translation does
/// not glue the two together.
pub fn space_out_symbols(text: &str) -> String {
    SYMBOL_SPACING.replace_all(text, "$1 $2").into_owned()
}

/// Record every symbol/anchor occurrence in order and replace each with the
/// shared placeholder token.
pub fn extract_symbols(text: &str) -> (String, Vec<String>) {
    let symbols: Vec<String> = SYMBOL_OR_ANCHOR
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    let replaced = SYMBOL_OR_ANCHOR
        .replace_all(text, PLACEHOLDER)
        .trim_end()
        .to_string();
    (replaced, symbols)
}

/// Positional restoration: first placeholder gets the first extracted symbol.
pub fn restore_symbols(text: &str, symbols: &[String]) -> String {
    let mut out = text.to_string();
    for symbol in symbols {
        out = out.replacen(PLACEHOLDER, symbol, 1);
    }
    out
}

/// Apply the literal-replacement and abbreviation tables.
pub fn expand_abbreviations(text: &str) -> String {
    let mut out = text.to_string();
    for (re, replacement) in REPLACEMENT_PATTERNS.iter() {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    for (re, replacement) in ABBREVIATION_PATTERNS.iter() {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    out
}

/// Drop orphaned skin-tone/gender modifier sequences left after translation.
pub fn strip_skin_modifiers(text: &str) -> String {
    SKIN_MODIFIERS.replace_all(text, "").trim_end().to_string()
}

/// Rejection stages only (no translation): blacklist, markup strip, pattern
/// filter, mention/hashtag strip, ad-link heuristic, minimum length. Performs
/// at most one review-forward per rejected message.
async fn debloat_message(
    msg: &InboundText,
    cache: &RefCache,
    review: &dyn ReviewSink,
) -> Result<Verdict> {
    let limit = if msg.is_caption {
        CAPTION_MIN_LEN
    } else {
        TEXT_MIN_LEN
    };

    if is_blacklisted(&msg.text) {
        debug!(chat_id = msg.chat_id, "blacklist hit");
        return Ok(Verdict::Rejected(Rejection::Blacklisted));
    }

    let patterns = cache.get_patterns(msg.chat_id).await?;
    let text = strip_markup(&msg.text);

    let text = match apply_patterns(&text, &patterns) {
        PatternOutcome::NoPatterns => text,
        PatternOutcome::Matched(stripped) => stripped,
        PatternOutcome::Unmatched => {
            info!(chat_id = msg.chat_id, "no allow-pattern matched, forwarding for review");
            if let Err(err) = review.forward_to_review(msg.chat_id, msg.message_id).await {
                warn!(%err, "failed to forward message for review");
            }
            if let Err(err) = review.send_review_note(&text).await {
                warn!(%err, "failed to send review note");
            }
            return Ok(Verdict::Rejected(Rejection::NoPatternMatch));
        }
    };

    let text = strip_self_mention(&text, msg.chat_username.as_deref());
    let text = strip_trailing_hashtags(&text);

    if has_invite_link(&text) {
        info!(link = %msg.link, "invite-style link, likely undisclosed ad");
        let note = format!("likely contains an ad, please check! -- {}", msg.link);
        if let Err(err) = review.send_review_note(&note).await {
            warn!(%err, "failed to send review note");
        }
        return Ok(Verdict::Rejected(Rejection::AdLink));
    }

    let len = text.chars().count();
    if len < limit {
        debug!(len, limit, "text too short");
        return Ok(Verdict::Rejected(Rejection::TooShort { len, limit }));
    }

    Ok(Verdict::Clean(text))
}

/// Full pipeline: rejection stages, symbol protection, abbreviation
/// expansion, translation, restoration, modifier cleanup.
pub async fn debloat_text(
    msg: &InboundText,
    cache: &RefCache,
    translator: &dyn TranslateService,
    review: &dyn ReviewSink,
) -> Result<Verdict> {
    let text = match debloat_message(msg, cache, review).await? {
        Verdict::Clean(text) => text,
        rejected => return Ok(rejected),
    };

    let text = space_out_symbols(&text);
    let (text, symbols) = extract_symbols(&text);
    debug!(count = symbols.len(), "extracted symbols");
    let text = expand_abbreviations(&text);

    let translated = translator.translate(&text, msg.is_caption).await?;

    let restored = restore_symbols(&translated, &symbols);
    Ok(Verdict::Clean(strip_skin_modifiers(&restored)))
}
