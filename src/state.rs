use crate::api::ChatApi;
use crate::models::{
    Citation, Conversation, Feedback, FrontendSettings, HistoryHealth, LoadingState, Message,
};
use crate::stream::{CancelHandle, EventSink};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Key of the in-flight stream for a conversation that has no id yet.
pub const NEW_CONVERSATION_KEY: &str = "__new__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDialog {
    pub title: String,
    pub subtitle: String,
}

impl ErrorDialog {
    pub fn new(title: impl Into<String>, subtitle: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            subtitle: subtitle.into(),
        }
    }
}

/// Every change the store accepts.
#[derive(Debug, Clone)]
pub enum Intent {
    ReplaceCurrentConversation(Option<Conversation>),
    /// Replaces the history entry with the same id, or appends it.
    UpsertHistoryEntry(Conversation),
    SetHistory(Vec<Conversation>),
    AppendHistoryPage(Vec<Conversation>),
    DeleteHistoryEntry(String),
    DeleteAllHistory,
    ClearConversationMessages(String),
    RenameHistoryEntry { id: String, title: String },
    SetFeedback { message_id: String, feedback: Feedback },
    ToggleHistoryPanel,
    ToggleCitationPanel(bool),
    SetCitation(Option<Citation>),
    SetLoadingState(LoadingState),
    SetGenerating(bool),
    SetHistoryHealth(HistoryHealth),
    SetFrontendSettings(FrontendSettings),
    ShowError(ErrorDialog),
    DismissError,
}

/// Client-side view of conversations and UI flags. Fields are private so that
/// [`ConversationStore::dispatch`] is the only way in.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    current: Option<Conversation>,
    history: Vec<Conversation>,
    loading_state: LoadingState,
    feedback: HashMap<String, Feedback>,
    history_panel_open: bool,
    citation_panel_open: bool,
    active_citation: Option<Citation>,
    generating: bool,
    history_health: HistoryHealth,
    settings: FrontendSettings,
    error_dialog: Option<ErrorDialog>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&mut self, intent: Intent) {
        log::debug!("Store intent: {}", intent_name(&intent));
        match intent {
            Intent::ReplaceCurrentConversation(conversation) => self.current = conversation,
            Intent::UpsertHistoryEntry(conversation) => {
                match self.history.iter_mut().find(|c| c.id == conversation.id) {
                    Some(existing) => *existing = conversation,
                    None => self.history.push(conversation),
                }
            }
            Intent::SetHistory(conversations) => self.history = conversations,
            Intent::AppendHistoryPage(conversations) => {
                for conversation in conversations {
                    if !self.history.iter().any(|c| c.id == conversation.id) {
                        self.history.push(conversation);
                    }
                }
            }
            Intent::DeleteHistoryEntry(id) => {
                self.history.retain(|c| c.id != id);
                if self.current.as_ref().is_some_and(|c| c.id == id) {
                    self.current = None;
                }
            }
            Intent::DeleteAllHistory => {
                self.history.clear();
                self.current = None;
            }
            Intent::ClearConversationMessages(id) => {
                let current = self.current.iter_mut();
                for conversation in current.chain(self.history.iter_mut()) {
                    if conversation.id == id {
                        conversation.messages.clear();
                    }
                }
            }
            Intent::RenameHistoryEntry { id, title } => {
                let current = self.current.iter_mut();
                for conversation in current.chain(self.history.iter_mut()) {
                    if conversation.id == id {
                        conversation.title = title.clone();
                    }
                }
            }
            Intent::SetFeedback { message_id, feedback } => {
                self.feedback.insert(message_id, feedback);
            }
            Intent::ToggleHistoryPanel => self.history_panel_open = !self.history_panel_open,
            Intent::ToggleCitationPanel(open) => self.citation_panel_open = open,
            Intent::SetCitation(citation) => self.active_citation = citation,
            Intent::SetLoadingState(state) => self.loading_state = state,
            Intent::SetGenerating(generating) => self.generating = generating,
            Intent::SetHistoryHealth(health) => self.history_health = health,
            Intent::SetFrontendSettings(settings) => self.settings = settings,
            Intent::ShowError(dialog) => self.error_dialog = Some(dialog),
            Intent::DismissError => self.error_dialog = None,
        }
    }

    pub fn current(&self) -> Option<&Conversation> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &[Conversation] {
        &self.history
    }

    pub fn find_in_history(&self, id: &str) -> Option<&Conversation> {
        self.history.iter().find(|c| c.id == id)
    }

    pub fn loading_state(&self) -> LoadingState {
        self.loading_state
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn history_panel_open(&self) -> bool {
        self.history_panel_open
    }

    pub fn citation_panel_open(&self) -> bool {
        self.citation_panel_open
    }

    pub fn active_citation(&self) -> Option<&Citation> {
        self.active_citation.as_ref()
    }

    pub fn history_health(&self) -> &HistoryHealth {
        &self.history_health
    }

    pub fn settings(&self) -> &FrontendSettings {
        &self.settings
    }

    pub fn error_dialog(&self) -> Option<&ErrorDialog> {
        self.error_dialog.as_ref()
    }

    /// Feedback may only be sent when the backend stores it.
    pub fn feedback_enabled(&self) -> bool {
        self.settings.feedback_enabled && self.history_health.available
    }

    fn find_message(&self, message_id: &str) -> Option<&Message> {
        self.current
            .iter()
            .chain(self.history.iter())
            .flat_map(|c| c.messages.iter())
            .find(|m| m.id == message_id)
    }

    /// Feedback for a message: a local override if set, else what the message
    /// was loaded with.
    pub fn feedback_for(&self, message_id: &str) -> Option<Feedback> {
        if let Some(feedback) = self.feedback.get(message_id) {
            return Some(*feedback);
        }
        self.find_message(message_id)?
            .feedback
            .as_deref()
            .map(Feedback::from_stored)
    }
}

fn intent_name(intent: &Intent) -> &'static str {
    match intent {
        Intent::ReplaceCurrentConversation(_) => "ReplaceCurrentConversation",
        Intent::UpsertHistoryEntry(_) => "UpsertHistoryEntry",
        Intent::SetHistory(_) => "SetHistory",
        Intent::AppendHistoryPage(_) => "AppendHistoryPage",
        Intent::DeleteHistoryEntry(_) => "DeleteHistoryEntry",
        Intent::DeleteAllHistory => "DeleteAllHistory",
        Intent::ClearConversationMessages(_) => "ClearConversationMessages",
        Intent::RenameHistoryEntry { .. } => "RenameHistoryEntry",
        Intent::SetFeedback { .. } => "SetFeedback",
        Intent::ToggleHistoryPanel => "ToggleHistoryPanel",
        Intent::ToggleCitationPanel(_) => "ToggleCitationPanel",
        Intent::SetCitation(_) => "SetCitation",
        Intent::SetLoadingState(_) => "SetLoadingState",
        Intent::SetGenerating(_) => "SetGenerating",
        Intent::SetHistoryHealth(_) => "SetHistoryHealth",
        Intent::SetFrontendSettings(_) => "SetFrontendSettings",
        Intent::ShowError(_) => "ShowError",
        Intent::DismissError => "DismissError",
    }
}

// Handle passed to every command
#[derive(Clone)]
pub struct AppState {
    // Never held across an await
    pub store: Arc<Mutex<ConversationStore>>,
    pub api: Arc<dyn ChatApi>,
    pub events: Option<EventSink>,
    // One in-flight stream per conversation key
    pub active_streams: Arc<DashMap<String, CancelHandle>>,
}

impl AppState {
    pub fn new(api: Arc<dyn ChatApi>, events: Option<EventSink>) -> Self {
        Self {
            store: Arc::new(Mutex::new(ConversationStore::new())),
            api,
            events,
            active_streams: Arc::new(DashMap::new()),
        }
    }

    pub async fn dispatch(&self, intent: Intent) {
        self.store.lock().await.dispatch(intent);
    }

    /// Runs `f` against the current store contents.
    pub async fn read<R>(&self, f: impl FnOnce(&ConversationStore) -> R) -> R {
        let store = self.store.lock().await;
        f(&store)
    }

    pub async fn snapshot(&self) -> ConversationStore {
        self.store.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn conversation(id: &str, title: &str) -> Conversation {
        let mut c = Conversation::new(title);
        c.id = id.to_string();
        c.messages.push(Message::user("hello"));
        c
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut store = ConversationStore::new();
        store.dispatch(Intent::SetHistory(vec![conversation("a", "A"), conversation("b", "B")]));

        let mut updated = conversation("a", "A2");
        updated.messages.push(Message::new(Role::Assistant, "hi"));
        store.dispatch(Intent::UpsertHistoryEntry(updated));
        store.dispatch(Intent::UpsertHistoryEntry(conversation("c", "C")));

        let titles: Vec<_> = store.history().iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["A2", "B", "C"]);
        assert_eq!(store.find_in_history("a").unwrap().messages.len(), 2);
    }

    #[test]
    fn test_delete_current_clears_it() {
        let mut store = ConversationStore::new();
        store.dispatch(Intent::SetHistory(vec![conversation("a", "A"), conversation("b", "B")]));
        store.dispatch(Intent::ReplaceCurrentConversation(Some(conversation("a", "A"))));

        store.dispatch(Intent::DeleteHistoryEntry("b".to_string()));
        assert!(store.current().is_some());

        store.dispatch(Intent::DeleteHistoryEntry("a".to_string()));
        assert!(store.current().is_none());
        assert!(store.history().is_empty());
    }

    #[test]
    fn test_clear_and_rename_touch_current_and_history() {
        let mut store = ConversationStore::new();
        store.dispatch(Intent::SetHistory(vec![conversation("a", "A")]));
        store.dispatch(Intent::ReplaceCurrentConversation(Some(conversation("a", "A"))));

        store.dispatch(Intent::RenameHistoryEntry {
            id: "a".to_string(),
            title: "Budget".to_string(),
        });
        store.dispatch(Intent::ClearConversationMessages("a".to_string()));

        let current = store.current().unwrap();
        assert_eq!(current.title, "Budget");
        assert!(current.messages.is_empty());
        assert!(store.find_in_history("a").unwrap().messages.is_empty());
    }

    #[test]
    fn test_feedback_override_wins() {
        let mut store = ConversationStore::new();
        let mut c = conversation("a", "A");
        let mut answer = Message::new(Role::Assistant, "answer");
        answer.id = "m1".to_string();
        answer.feedback = Some("missing_citation,out_of_scope".to_string());
        c.messages.push(answer);
        store.dispatch(Intent::ReplaceCurrentConversation(Some(c)));

        assert_eq!(store.feedback_for("m1"), Some(Feedback::Negative));
        store.dispatch(Intent::SetFeedback {
            message_id: "m1".to_string(),
            feedback: Feedback::Positive,
        });
        assert_eq!(store.feedback_for("m1"), Some(Feedback::Positive));
        assert_eq!(store.feedback_for("unknown"), None);
    }

    #[test]
    fn test_append_page_skips_known_ids() {
        let mut store = ConversationStore::new();
        store.dispatch(Intent::SetHistory(vec![conversation("a", "A")]));
        store.dispatch(Intent::AppendHistoryPage(vec![conversation("a", "dup"), conversation("b", "B")]));
        let ids: Vec<_> = store.history().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.history()[0].title, "A");
    }

    #[test]
    fn test_toggles_and_dialog() {
        let mut store = ConversationStore::new();
        store.dispatch(Intent::ToggleHistoryPanel);
        assert!(store.history_panel_open());
        store.dispatch(Intent::ToggleHistoryPanel);
        assert!(!store.history_panel_open());

        store.dispatch(Intent::ShowError(ErrorDialog::new("t", "s")));
        assert_eq!(store.error_dialog().unwrap().title, "t");
        store.dispatch(Intent::DismissError);
        assert!(store.error_dialog().is_none());
    }
}
