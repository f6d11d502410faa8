// Operations a front end invokes. Each one reads the store, talks to the
// service, and records the result through store intents.

use crate::citations::{image_sources, replace_spans};
use crate::models::{Citation, Conversation, Feedback, HistoryStatus, LoadingState, Message, Role};
use crate::persistence::{Opened, PersistenceStrategy};
use crate::state::{AppState, ErrorDialog, Intent, NEW_CONVERSATION_KEY};
use crate::stream::{self, cancel_pair, CancelSignal, StreamOutcome};
use dashmap::mapref::entry::Entry;
use futures::future::join_all;

const RETRY_HINT: &str = "Please try again. If the problem persists, please contact the site administrator.";

/// How a `send_question` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    /// Cancelled; the conversation keeps the user message only.
    Aborted,
    /// Ended with an error message in the transcript.
    Failed(String),
    /// A follow-up turn named a conversation the store does not hold.
    ConversationNotFound,
    /// Another stream for this conversation is still running.
    Busy,
    /// Blank question; nothing was sent.
    Ignored,
}

/// Loads backend status, settings and, when available, the history list.
pub async fn initialize(state: &AppState) {
    log::info!("Initializing chat client");
    let health = state.api.history_ensure().await;
    log::info!("History store status: {} (available: {})", health.status, health.available);
    state.dispatch(Intent::SetHistoryHealth(health.clone())).await;

    match state.api.frontend_settings().await {
        Ok(settings) => state.dispatch(Intent::SetFrontendSettings(settings)).await,
        Err(e) => log::warn!("Using default frontend settings: {:?}", e),
    }

    if health.available {
        load_history(state, 0).await;
    } else {
        state.dispatch(Intent::SetLoadingState(LoadingState::Fail)).await;
    }

    let failed = state.read(|s| s.loading_state() == LoadingState::Fail).await;
    if failed
        && health.status != HistoryStatus::Working
        && health.status != HistoryStatus::NotConfigured
    {
        state
            .dispatch(Intent::ShowError(ErrorDialog::new(
                "Chat history is not enabled",
                format!("{}. Please contact the site administrator.", health.describe()),
            )))
            .await;
    }
}

/// Fetches a page of history, each conversation with its messages.
pub async fn load_history(state: &AppState, offset: usize) -> bool {
    state.dispatch(Intent::SetLoadingState(LoadingState::Loading)).await;

    let summaries = match state.api.history_list(offset).await {
        Ok(summaries) => summaries,
        Err(e) => {
            log::error!("Failed to load conversation history: {:?}", e);
            state.dispatch(Intent::SetLoadingState(LoadingState::Fail)).await;
            return false;
        }
    };
    log::info!("Fetched {} conversations at offset {}", summaries.len(), offset);

    let reads = summaries.iter().map(|summary| state.api.history_read(&summary.id));
    let transcripts = join_all(reads).await;

    let conversations: Vec<Conversation> = summaries
        .into_iter()
        .zip(transcripts)
        .map(|(summary, messages)| {
            let messages = messages.unwrap_or_else(|e| {
                log::error!("Failed to fetch messages for {}: {:?}", summary.id, e);
                Vec::new()
            });
            Conversation {
                id: summary.id,
                title: summary.title,
                date: summary.created_at,
                messages,
            }
        })
        .collect();

    let intent = if offset == 0 {
        Intent::SetHistory(conversations)
    } else {
        Intent::AppendHistoryPage(conversations)
    };
    state.dispatch(intent).await;
    state.dispatch(Intent::SetLoadingState(LoadingState::Success)).await;
    true
}

/// Sends a question and streams the answer into the conversation.
///
/// `conversation_id` is `None` for the first turn of a new conversation.
pub async fn send_question(state: &AppState, question: &str, conversation_id: Option<&str>) -> SendOutcome {
    let question = question.trim();
    if question.is_empty() {
        return SendOutcome::Ignored;
    }

    let key = conversation_id.unwrap_or(NEW_CONVERSATION_KEY).to_string();
    let (handle, mut signal) = cancel_pair();
    match state.active_streams.entry(key.clone()) {
        Entry::Occupied(_) => {
            log::warn!("A response is already streaming for {}", key);
            return SendOutcome::Busy;
        }
        Entry::Vacant(slot) => {
            slot.insert(handle);
        }
    }

    state.dispatch(Intent::SetGenerating(true)).await;
    let outcome = run_turn(state, question, conversation_id, &mut signal).await;
    state.active_streams.remove(&key);
    if state.active_streams.is_empty() {
        state.dispatch(Intent::SetGenerating(false)).await;
    }
    log::info!("Turn for {} finished: {:?}", key, outcome);
    outcome
}

async fn run_turn(
    state: &AppState,
    question: &str,
    conversation_id: Option<&str>,
    signal: &mut CancelSignal,
) -> SendOutcome {
    let strategy = state
        .read(|s| PersistenceStrategy::from_health(s.history_health()))
        .await;

    let mut conversation = match conversation_id {
        Some(id) => match state.read(|s| strategy.locate(s, id)).await {
            Some(conversation) => conversation,
            None => {
                log::error!("Conversation {} not found", id);
                return SendOutcome::ConversationNotFound;
            }
        },
        None => Conversation::new(question),
    };
    conversation.messages.push(Message::user(question));
    state
        .dispatch(Intent::ReplaceCurrentConversation(Some(conversation.clone())))
        .await;
    // A follow-up question stays in the saved transcript even if the answer is cancelled
    if conversation_id.is_some() {
        state
            .dispatch(Intent::UpsertHistoryEntry(conversation.clone()))
            .await;
    }

    // Every turn resends the whole transcript except error entries
    let request: Vec<Message> = conversation
        .messages
        .iter()
        .filter(|m| m.role != Role::Error)
        .cloned()
        .collect();

    let opened = tokio::select! {
        biased;
        _ = signal.cancelled() => return SendOutcome::Aborted,
        opened = strategy.open(state.api.as_ref(), &request, conversation_id) => opened,
    };
    let result = match opened {
        Opened::Stream(body) => stream::reconcile(body, signal, state.events.as_ref()).await,
        Opened::Failed(result) => result,
    };

    if result.outcome == StreamOutcome::Aborted {
        return SendOutcome::Aborted;
    }

    // The conversation may have been deleted while the answer streamed in
    if let Some(id) = conversation_id {
        let exists = state
            .read(|s| s.find_in_history(id).is_some() || s.current().is_some_and(|c| c.id == id))
            .await;
        if !exists {
            log::error!("Conversation {} disappeared during the turn; dropping answer", id);
            return SendOutcome::ConversationNotFound;
        }
    }

    let provisional_id = conversation.id.clone();
    let adopted = conversation_id.is_some()
        || strategy.adopt_metadata(&mut conversation, result.history_metadata.as_ref());
    conversation.messages.extend(result.messages);

    if result.outcome == StreamOutcome::Completed {
        if let Some(error) = strategy.commit(state.api.as_ref(), &conversation).await {
            conversation.messages.push(error);
        }
    }

    // Leave the current conversation alone if the user moved on mid-stream
    let still_current = state
        .read(|s| s.current().is_some_and(|c| c.id == provisional_id))
        .await;
    if still_current {
        state
            .dispatch(Intent::ReplaceCurrentConversation(Some(conversation.clone())))
            .await;
    }
    // A backend conversation without a server id was never created there
    if strategy == PersistenceStrategy::Ephemeral || adopted {
        state.dispatch(Intent::UpsertHistoryEntry(conversation)).await;
    }

    match result.outcome {
        StreamOutcome::Failed(reason) => SendOutcome::Failed(reason),
        _ => SendOutcome::Completed,
    }
}

/// Cancels the stream for one conversation. Returns whether a running,
/// not yet cancelled stream was found.
pub fn stop_generation(state: &AppState, conversation_id: Option<&str>) -> bool {
    let key = conversation_id.unwrap_or(NEW_CONVERSATION_KEY);
    match state.active_streams.get(key) {
        Some(handle) if handle.is_cancelled() => false,
        Some(handle) => {
            log::warn!("Cancellation requested for {}", key);
            handle.cancel();
            true
        }
        None => false,
    }
}

/// Cancels every in-flight stream.
pub fn stop_all(state: &AppState) -> usize {
    let mut stopped = 0;
    for entry in state.active_streams.iter() {
        entry.value().cancel();
        stopped += 1;
    }
    if stopped > 0 {
        log::warn!("Cancelled {} in-flight streams", stopped);
    }
    stopped
}

pub async fn new_chat(state: &AppState) {
    state.dispatch(Intent::ReplaceCurrentConversation(None)).await;
    close_citation(state).await;
}

/// Makes a history entry the current conversation.
pub async fn select_conversation(state: &AppState, conversation_id: &str) -> bool {
    let Some(conversation) = state.read(|s| s.find_in_history(conversation_id).cloned()).await else {
        log::error!("Conversation {} not found in history", conversation_id);
        return false;
    };
    state
        .dispatch(Intent::ReplaceCurrentConversation(Some(conversation)))
        .await;
    close_citation(state).await;
    true
}

/// Removes every message of the current conversation from the history store.
pub async fn clear_chat(state: &AppState) -> bool {
    let (current_id, available) = state
        .read(|s| (s.current().map(|c| c.id.clone()), s.history_health().available))
        .await;
    let (Some(id), true) = (current_id, available) else {
        return false;
    };

    let response = state.api.history_clear(&id).await;
    if !response.ok {
        state
            .dispatch(Intent::ShowError(ErrorDialog::new("Error clearing current chat", RETRY_HINT)))
            .await;
        return false;
    }
    state.dispatch(Intent::ClearConversationMessages(id)).await;
    close_citation(state).await;
    true
}

pub async fn rename_conversation(state: &AppState, conversation_id: &str, title: &str) -> bool {
    let title = title.trim();
    if title.is_empty() {
        log::warn!("Refusing to rename {} to an empty title", conversation_id);
        return false;
    }

    if state.read(|s| s.history_health().available).await {
        let response = state.api.history_rename(conversation_id, title).await;
        if !response.ok {
            state
                .dispatch(Intent::ShowError(ErrorDialog::new("Error renaming conversation", RETRY_HINT)))
                .await;
            return false;
        }
    }
    state
        .dispatch(Intent::RenameHistoryEntry {
            id: conversation_id.to_string(),
            title: title.to_string(),
        })
        .await;
    true
}

pub async fn delete_conversation(state: &AppState, conversation_id: &str) -> bool {
    log::warn!("Deleting conversation {}", conversation_id);
    if state.read(|s| s.history_health().available).await {
        let response = state.api.history_delete(conversation_id).await;
        if !response.ok {
            state
                .dispatch(Intent::ShowError(ErrorDialog::new("Error deleting conversation", RETRY_HINT)))
                .await;
            return false;
        }
    }
    state
        .dispatch(Intent::DeleteHistoryEntry(conversation_id.to_string()))
        .await;
    true
}

pub async fn delete_all_history(state: &AppState) -> bool {
    log::warn!("Deleting all chat history");
    if state.read(|s| s.history_health().available).await {
        let response = state.api.history_delete_all().await;
        if !response.ok {
            state
                .dispatch(Intent::ShowError(ErrorDialog::new(
                    "Error deleting all of chat history",
                    RETRY_HINT,
                )))
                .await;
            return false;
        }
    }
    state.dispatch(Intent::DeleteAllHistory).await;
    close_citation(state).await;
    true
}

async fn post_feedback(state: &AppState, message_id: &str, feedback: &str) {
    if !state.read(|s| s.feedback_enabled()).await {
        log::debug!("Feedback disabled; not posting '{}' for {}", feedback, message_id);
        return;
    }
    let response = state.api.message_feedback(message_id, feedback).await;
    if !response.ok {
        log::warn!("Feedback for {} was not recorded: {:?}", message_id, response.error_message());
    }
}

/// Thumbs-up toggles between positive and neutral.
pub async fn like_answer(state: &AppState, message_id: &str) -> Feedback {
    let current = state.read(|s| s.feedback_for(message_id)).await;
    let next = if current == Some(Feedback::Positive) {
        Feedback::Neutral
    } else {
        Feedback::Positive
    };
    state
        .dispatch(Intent::SetFeedback {
            message_id: message_id.to_string(),
            feedback: next,
        })
        .await;
    post_feedback(state, message_id, next.as_str()).await;
    next
}

/// Thumbs-down. From neutral or positive it marks the answer negative and waits
/// for reasons via [`report_negative`]; from negative it resets to neutral.
pub async fn dislike_answer(state: &AppState, message_id: &str) -> Feedback {
    let current = state.read(|s| s.feedback_for(message_id)).await;
    let next = match current {
        None | Some(Feedback::Neutral) | Some(Feedback::Positive) => Feedback::Negative,
        Some(_) => Feedback::Neutral,
    };
    state
        .dispatch(Intent::SetFeedback {
            message_id: message_id.to_string(),
            feedback: next,
        })
        .await;
    if next == Feedback::Neutral {
        post_feedback(state, message_id, next.as_str()).await;
    }
    next
}

/// Posts the negative reasons picked for an answer.
pub async fn report_negative(state: &AppState, message_id: &str, reasons: &[Feedback]) -> bool {
    let reasons: Vec<Feedback> = reasons.iter().copied().filter(Feedback::is_negative_reason).collect();
    if reasons.is_empty() {
        return false;
    }
    post_feedback(state, message_id, &Feedback::join(&reasons)).await;
    state
        .dispatch(Intent::SetFeedback {
            message_id: message_id.to_string(),
            feedback: Feedback::Negative,
        })
        .await;
    true
}

/// Opens a citation, swapping inline image sources for signed URLs first.
pub async fn show_citation(state: &AppState, citation: &Citation) -> Citation {
    let sources = image_sources(&citation.content);
    let lookups = sources.iter().map(|source| state.api.blob_url(source.blob_name()));
    let urls = join_all(lookups).await;

    let replacements: Vec<_> = sources
        .iter()
        .zip(urls)
        .filter_map(|(source, url)| match url {
            Ok(url) => Some((source.span.clone(), url)),
            Err(e) => {
                log::warn!("Keeping original image source {}: {:?}", source.src, e);
                None
            }
        })
        .collect();

    let mut resolved = citation.clone();
    if !replacements.is_empty() {
        resolved.content = replace_spans(&citation.content, &replacements);
    }
    state.dispatch(Intent::SetCitation(Some(resolved.clone()))).await;
    state.dispatch(Intent::ToggleCitationPanel(true)).await;
    resolved
}

pub async fn close_citation(state: &AppState) {
    state.dispatch(Intent::SetCitation(None)).await;
    state.dispatch(Intent::ToggleCitationPanel(false)).await;
}

pub async fn dismiss_error(state: &AppState) {
    state.dispatch(Intent::DismissError).await;
}
