use crate::deserializers::{deserialize_loose_string, deserialize_timestamp, deserialize_truthy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Author of a transcript entry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    Error,
    System,
    #[serde(other)]
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Error => "error",
            Role::System => "system",
            Role::Other => "other",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// A single transcript entry
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    #[serde(default = "new_id")]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    // The history store calls this field `createdAt`
    #[serde(default = "Utc::now", alias = "createdAt", deserialize_with = "deserialize_timestamp")]
    pub date: DateTime<Utc>,
    // Single feedback tag or a comma-joined list of negative reasons
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            date: Utc::now(),
            feedback: None,
            context: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(Role::Error, content)
    }
}

// A conversation thread with its ordered transcript
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default = "Utc::now", alias = "createdAt", deserialize_with = "deserialize_timestamp")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Starts a conversation with a client-generated identifier.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            title: title.into(),
            date: Utc::now(),
            messages: Vec::new(),
        }
    }
}

/// A retrieved document referenced by an answer.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Citation {
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub filepath: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub metadata: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub chunk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reindex_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_index: Option<u32>,
}

/// Payload carried in the content of a `tool` message.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ToolMessageContent {
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub intent: serde_json::Value,
}

// --- Streaming response envelope ---

/// One message fragment inside a streamed choice.
#[derive(Deserialize, Clone, Debug)]
pub struct ResponseMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    // Either a JSON string or an inline object; both end up as tool message content
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

impl ResponseMessage {
    pub fn context_text(&self) -> Option<String> {
        match self.context.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ResponseChoice {
    #[serde(default)]
    pub messages: Vec<ResponseMessage>,
}

/// Returned by the history backend with every generated chunk.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct HistoryMetadata {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ChatResponse {
    pub id: String,
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub history_metadata: Option<HistoryMetadata>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum ErrorPayload {
    Text(String),
    Detailed { message: String },
}

impl ErrorPayload {
    pub fn message(&self) -> &str {
        match self {
            ErrorPayload::Text(text) => text,
            ErrorPayload::Detailed { message } => message,
        }
    }
}

/// A decoded line of the response stream. Anything that matches neither shape
/// is a protocol failure.
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum Envelope {
    Failure { error: ErrorPayload },
    Chunk(ChatResponse),
}

// --- Feedback ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    Neutral,
    Positive,
    Negative,
    MissingCitation,
    WrongCitation,
    OutOfScope,
    InaccurateOrIrrelevant,
    OtherUnhelpful,
    HateSpeech,
    Violent,
    Sexual,
    Manipulative,
    // The backend stores this tag with its historical spelling
    #[serde(rename = "other_harmlful")]
    OtherHarmful,
}

impl Feedback {
    pub const ALL: [Feedback; 13] = [
        Feedback::Neutral,
        Feedback::Positive,
        Feedback::Negative,
        Feedback::MissingCitation,
        Feedback::WrongCitation,
        Feedback::OutOfScope,
        Feedback::InaccurateOrIrrelevant,
        Feedback::OtherUnhelpful,
        Feedback::HateSpeech,
        Feedback::Violent,
        Feedback::Sexual,
        Feedback::Manipulative,
        Feedback::OtherHarmful,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feedback::Neutral => "neutral",
            Feedback::Positive => "positive",
            Feedback::Negative => "negative",
            Feedback::MissingCitation => "missing_citation",
            Feedback::WrongCitation => "wrong_citation",
            Feedback::OutOfScope => "out_of_scope",
            Feedback::InaccurateOrIrrelevant => "inaccurate_or_irrelevant",
            Feedback::OtherUnhelpful => "other_unhelpful",
            Feedback::HateSpeech => "hate_speech",
            Feedback::Violent => "violent",
            Feedback::Sexual => "sexual",
            Feedback::Manipulative => "manipulative",
            Feedback::OtherHarmful => "other_harmlful",
        }
    }

    /// True for the sub-reasons offered after a thumbs-down.
    pub fn is_negative_reason(&self) -> bool {
        !matches!(self, Feedback::Neutral | Feedback::Positive | Feedback::Negative)
    }

    /// Interprets the raw feedback field stored on a message. A list of reasons
    /// reads as negative; anything unrecognised reads as neutral.
    pub fn from_stored(raw: &str) -> Feedback {
        if raw.split(',').count() > 1 {
            return Feedback::Negative;
        }
        raw.parse().unwrap_or(Feedback::Neutral)
    }

    /// Comma-joined wire form of a set of negative reasons.
    pub fn join(reasons: &[Feedback]) -> String {
        reasons.iter().map(Feedback::as_str).collect::<Vec<_>>().join(",")
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feedback {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Feedback::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown feedback tag: {}", s))
    }
}

// --- Backend status and settings ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryStatus {
    Working,
    NotConfigured,
    InvalidCredentials,
    NotWorking,
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HistoryStatus::Working => "CosmosDB is configured and working",
            HistoryStatus::NotConfigured => "CosmosDB is not configured",
            HistoryStatus::InvalidCredentials => "CosmosDB has invalid credentials",
            HistoryStatus::NotWorking => "CosmosDB is not working",
        };
        f.write_str(text)
    }
}

/// Availability of the history store as reported by the ensure endpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryHealth {
    pub available: bool,
    pub status: HistoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HistoryHealth {
    pub fn unavailable(status: HistoryStatus) -> Self {
        Self {
            available: false,
            status,
            detail: None,
        }
    }

    /// Text shown to the user; a misconfiguration detail wins over the generic status.
    pub fn describe(&self) -> String {
        self.detail.clone().unwrap_or_else(|| self.status.to_string())
    }
}

impl Default for HistoryHealth {
    fn default() -> Self {
        Self::unavailable(HistoryStatus::NotConfigured)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct UiSettings {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub chat_title: Option<String>,
    #[serde(default)]
    pub chat_description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_truthy")]
    pub show_share_button: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FrontendSettings {
    #[serde(default, deserialize_with = "deserialize_truthy")]
    pub auth_enabled: bool,
    #[serde(default, deserialize_with = "deserialize_truthy")]
    pub feedback_enabled: bool,
    #[serde(default, deserialize_with = "deserialize_truthy")]
    pub sanitize_answer: bool,
    #[serde(default)]
    pub ui: Option<UiSettings>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LoadingState {
    #[default]
    NotStarted,
    Loading,
    Success,
    Fail,
}

/// Entry of the `/history/list` response.
#[derive(Deserialize, Clone, Debug)]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "Utc::now", rename = "createdAt", deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct HistoryReadResponse {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}
