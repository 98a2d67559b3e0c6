use serde::{Deserialize, Serialize};

/// A watched origin channel whose posts are candidates for syndication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub channel_id: i64,
    pub channel_name: String,
    pub bias: Option<String>,
    pub destination: Option<i64>,
    pub display_name: Option<String>,
    pub invite: Option<String>,
    pub username: Option<String>,
    pub api_id: Option<i64>,
    pub description: Option<String>,
    pub rating: Option<i64>,
    pub detail_id: Option<i64>,
    pub is_spread: bool,
    pub is_active: bool,
}

/// Read-optimized projection of [`Source`] used by formatting and routing.
/// Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDisplay {
    pub display_name: String,
    pub is_spread: bool,
    pub bias: Option<String>,
    pub invite: Option<String>,
    pub username: Option<String>,
    pub detail_id: Option<i64>,
    pub destination: Option<i64>,
}

impl From<Source> for SourceDisplay {
    fn from(s: Source) -> Self {
        SourceDisplay {
            // An explicit display name overrides the raw channel name.
            display_name: s.display_name.unwrap_or(s.channel_name),
            is_spread: s.is_spread,
            bias: s.bias,
            invite: s.invite,
            username: s.username,
            detail_id: s.detail_id,
            destination: s.destination,
        }
    }
}

/// A target channel that receives translated, reformatted posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub channel_id: i64,
    pub name: String,
    pub group_id: Option<i64>,
    pub footer: Option<String>,
}

/// Durable record of a published message, unique by
/// (source_channel_id, source_message_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub destination: i64,
    pub message_id: i64,
    pub source_channel_id: i64,
    pub source_message_id: i64,
    pub backup_id: i64,
    pub reply_id: Option<i64>,
    pub message_text: Option<String>,
    pub file_id: Option<String>,
}

/// Messaging-platform credentials owning a set of source channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub api_id: i64,
    pub api_hash: String,
    pub name: String,
    pub phone_number: String,
    pub description: Option<String>,
}
