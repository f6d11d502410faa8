use crate::api::{ApiResponse, ByteStream, ChatApi, StreamOpen};
use crate::deserializers::parse_timestamp;
use crate::models::{Conversation, HistoryHealth, HistoryMetadata, Message, Role};
use crate::state::ConversationStore;
use crate::stream::{StreamResult, GENERIC_ERROR};

const GENERATE_ERROR_PREFIX: &str =
    "There was an error generating a response. Chat history can't be saved at this time.";
const GENERATE_ERROR_FALLBACK: &str =
    "Please try again. If the problem persists, please contact the site administrator.";
pub const SAVE_ERROR: &str = "An error occurred. Answers can't be saved at this time. If the problem persists, please contact the site administrator.";

/// Where a conversation lives between turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceStrategy {
    /// No history store: one conversation held in memory, ids made up locally.
    Ephemeral,
    /// The history store assigns ids and titles and keeps the transcript.
    Backend,
}

/// A stream ready to read, or the result that replaces it.
pub enum Opened {
    Stream(ByteStream),
    Failed(StreamResult),
}

impl PersistenceStrategy {
    pub fn from_health(health: &HistoryHealth) -> Self {
        if health.available {
            PersistenceStrategy::Backend
        } else {
            PersistenceStrategy::Ephemeral
        }
    }

    /// Finds the conversation a follow-up turn refers to.
    pub fn locate(&self, store: &ConversationStore, conversation_id: &str) -> Option<Conversation> {
        match self {
            PersistenceStrategy::Ephemeral => store
                .current()
                .filter(|c| c.id == conversation_id)
                .cloned(),
            PersistenceStrategy::Backend => store.find_in_history(conversation_id).cloned(),
        }
    }

    /// Opens the response stream for `messages`.
    pub async fn open(
        &self,
        api: &dyn ChatApi,
        messages: &[Message],
        conversation_id: Option<&str>,
    ) -> Opened {
        let opened = match self {
            PersistenceStrategy::Ephemeral => api.conversation(messages).await,
            PersistenceStrategy::Backend => api.history_generate(messages, conversation_id).await,
        };

        match opened {
            Ok(StreamOpen::Streaming(body)) => Opened::Stream(body),
            Ok(StreamOpen::Rejected(response)) => {
                log::error!("Stream request rejected with status {}", response.status);
                Opened::Failed(StreamResult::failed(
                    self.rejection_message(&response),
                    format!("request rejected with status {}", response.status),
                ))
            }
            Err(e) => {
                log::error!("Failed to open response stream: {:?}", e);
                let content = match self {
                    PersistenceStrategy::Ephemeral => GENERIC_ERROR.to_string(),
                    PersistenceStrategy::Backend => {
                        format!("{} {}", GENERATE_ERROR_PREFIX, GENERATE_ERROR_FALLBACK)
                    }
                };
                Opened::Failed(StreamResult::failed(content, format!("{:#}", e)))
            }
        }
    }

    fn rejection_message(&self, response: &ApiResponse) -> String {
        match self {
            PersistenceStrategy::Ephemeral => response
                .error_message()
                .unwrap_or_else(|| GENERIC_ERROR.to_string()),
            PersistenceStrategy::Backend => format!(
                "{} {}",
                GENERATE_ERROR_PREFIX,
                response
                    .error_message()
                    .unwrap_or_else(|| GENERATE_ERROR_FALLBACK.to_string())
            ),
        }
    }

    /// Applies server-owned identity to a conversation started this turn.
    pub fn adopt_metadata(&self, conversation: &mut Conversation, metadata: Option<&HistoryMetadata>) -> bool {
        if *self != PersistenceStrategy::Backend {
            return false;
        }
        let Some(metadata) = metadata else {
            return false;
        };
        let Some(id) = metadata.conversation_id.as_ref() else {
            return false;
        };
        log::info!("History store assigned conversation id {}", id);
        conversation.id = id.clone();
        if let Some(title) = metadata.title.as_ref() {
            conversation.title = title.clone();
        }
        if let Some(date) = metadata.date.as_deref().and_then(parse_timestamp) {
            conversation.date = date;
        }
        true
    }

    /// Saves a finished turn. Returns an error message to show when the save fails.
    pub async fn commit(&self, api: &dyn ChatApi, conversation: &Conversation) -> Option<Message> {
        match self {
            PersistenceStrategy::Ephemeral => None,
            PersistenceStrategy::Backend => {
                if conversation.messages.last().map(|m| m.role) != Some(Role::Assistant) {
                    log::warn!("Not committing conversation {}: no assistant answer", conversation.id);
                    return None;
                }
                let response = api.history_update(&conversation.messages, &conversation.id).await;
                if response.ok {
                    None
                } else {
                    log::error!(
                        "Failed to save conversation {}: {:?}",
                        conversation.id,
                        response.error_message()
                    );
                    Some(Message::error(SAVE_ERROR))
                }
            }
        }
    }
}
