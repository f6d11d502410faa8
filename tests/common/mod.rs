//! Shared test utilities for integration tests
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use ragchat_lib::api::{ApiResponse, ByteStream, ChatApi, StreamOpen};
use ragchat_lib::models::{
    ConversationSummary, FrontendSettings, HistoryHealth, HistoryStatus, Message,
};
use ragchat_lib::state::AppState;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// What the next stream-opening call returns.
pub enum Script {
    /// Delivers the chunks, then ends.
    Chunks(Vec<Vec<u8>>),
    /// Delivers the chunks, then stalls until cancelled.
    Stall(Vec<Vec<u8>>),
    /// Delivers `before`, waits for the gate to open, then delivers `after`.
    Gated {
        before: Vec<Vec<u8>>,
        gate: oneshot::Receiver<()>,
        after: Vec<Vec<u8>>,
    },
    Rejected(ApiResponse),
    Unreachable,
}

/// A request the fake received, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Conversation { messages: Vec<Message> },
    Generate { conversation_id: Option<String>, messages: Vec<Message> },
    Update { conversation_id: String, messages: Vec<Message> },
    Feedback { message_id: String, feedback: String },
    Clear(String),
    Rename { conversation_id: String, title: String },
    Delete(String),
    DeleteAll,
    BlobUrl(String),
}

/// Scripted `ChatApi` used in place of the HTTP client.
pub struct FakeChatApi {
    health: HistoryHealth,
    settings: FrontendSettings,
    scripts: Mutex<VecDeque<Script>>,
    history: Vec<(ConversationSummary, Vec<Message>)>,
    update_fails: bool,
    mutations_fail: bool,
    unreadable: Vec<String>,
    page_size: usize,
    calls: Mutex<Vec<Call>>,
}

impl FakeChatApi {
    /// No history store configured.
    pub fn ephemeral() -> Self {
        Self {
            health: HistoryHealth::default(),
            settings: FrontendSettings::default(),
            scripts: Mutex::new(VecDeque::new()),
            history: Vec::new(),
            update_fails: false,
            mutations_fail: false,
            unreadable: Vec::new(),
            page_size: usize::MAX,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// History store configured and working.
    pub fn backend() -> Self {
        Self {
            health: HistoryHealth {
                available: true,
                status: HistoryStatus::Working,
                detail: None,
            },
            ..Self::ephemeral()
        }
    }

    pub fn with_health(mut self, health: HistoryHealth) -> Self {
        self.health = health;
        self
    }

    pub fn with_feedback_enabled(mut self) -> Self {
        self.settings.feedback_enabled = true;
        self
    }

    pub fn with_script(self, script: Script) -> Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }

    pub fn with_saved(mut self, id: &str, title: &str, messages: Vec<Message>) -> Self {
        let summary = ConversationSummary {
            id: id.to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
        };
        self.history.push((summary, messages));
        self
    }

    pub fn with_failing_update(mut self) -> Self {
        self.update_fails = true;
        self
    }

    pub fn with_failing_mutations(mut self) -> Self {
        self.mutations_fail = true;
        self
    }

    /// Limits how many conversations one `history_list` call returns.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Makes `history_read` fail for one conversation.
    pub fn with_unreadable(mut self, id: &str) -> Self {
        self.unreadable.push(id.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_stream(&self) -> Result<StreamOpen> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Chunks(Vec::new()));
        match script {
            Script::Chunks(chunks) => {
                let body: ByteStream = Box::pin(stream::iter(chunks.into_iter().map(Ok)));
                Ok(StreamOpen::Streaming(body))
            }
            Script::Stall(chunks) => {
                let body: ByteStream =
                    Box::pin(stream::iter(chunks.into_iter().map(Ok)).chain(stream::pending()));
                Ok(StreamOpen::Streaming(body))
            }
            Script::Gated { before, gate, after } => {
                let rest = stream::once(async move {
                    let _ = gate.await;
                    stream::iter(after.into_iter().map(Ok))
                })
                .flatten();
                let body: ByteStream = Box::pin(stream::iter(before.into_iter().map(Ok)).chain(rest));
                Ok(StreamOpen::Streaming(body))
            }
            Script::Rejected(response) => Ok(StreamOpen::Rejected(response)),
            Script::Unreachable => Err(anyhow!("connection refused")),
        }
    }

    fn mutation(&self) -> ApiResponse {
        if self.mutations_fail {
            ApiResponse::failed(500, "CosmosDB is not working")
        } else {
            ApiResponse::success(json!({"success": true}))
        }
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn conversation(&self, messages: &[Message]) -> Result<StreamOpen> {
        self.record(Call::Conversation {
            messages: messages.to_vec(),
        });
        self.next_stream()
    }

    async fn history_generate(
        &self,
        messages: &[Message],
        conversation_id: Option<&str>,
    ) -> Result<StreamOpen> {
        self.record(Call::Generate {
            conversation_id: conversation_id.map(str::to_string),
            messages: messages.to_vec(),
        });
        self.next_stream()
    }

    async fn history_update(&self, messages: &[Message], conversation_id: &str) -> ApiResponse {
        self.record(Call::Update {
            conversation_id: conversation_id.to_string(),
            messages: messages.to_vec(),
        });
        if self.update_fails {
            ApiResponse::failed(500, "update failed")
        } else {
            ApiResponse::success(json!({"success": true}))
        }
    }

    async fn history_list(&self, offset: usize) -> Result<Vec<ConversationSummary>> {
        Ok(self
            .history
            .iter()
            .skip(offset)
            .take(self.page_size)
            .map(|(summary, _)| summary.clone())
            .collect())
    }

    async fn history_read(&self, conversation_id: &str) -> Result<Vec<Message>> {
        if self.unreadable.iter().any(|id| id == conversation_id) {
            return Err(anyhow!("read of {} failed", conversation_id));
        }
        self.history
            .iter()
            .find(|(summary, _)| summary.id == conversation_id)
            .map(|(_, messages)| messages.clone())
            .ok_or_else(|| anyhow!("no conversation {}", conversation_id))
    }

    async fn history_delete(&self, conversation_id: &str) -> ApiResponse {
        self.record(Call::Delete(conversation_id.to_string()));
        self.mutation()
    }

    async fn history_delete_all(&self) -> ApiResponse {
        self.record(Call::DeleteAll);
        self.mutation()
    }

    async fn history_clear(&self, conversation_id: &str) -> ApiResponse {
        self.record(Call::Clear(conversation_id.to_string()));
        self.mutation()
    }

    async fn history_rename(&self, conversation_id: &str, title: &str) -> ApiResponse {
        self.record(Call::Rename {
            conversation_id: conversation_id.to_string(),
            title: title.to_string(),
        });
        self.mutation()
    }

    async fn history_ensure(&self) -> HistoryHealth {
        self.health.clone()
    }

    async fn frontend_settings(&self) -> Result<FrontendSettings> {
        Ok(self.settings.clone())
    }

    async fn message_feedback(&self, message_id: &str, feedback: &str) -> ApiResponse {
        self.record(Call::Feedback {
            message_id: message_id.to_string(),
            feedback: feedback.to_string(),
        });
        ApiResponse::success(json!({"message": "Successfully updated message"}))
    }

    async fn blob_url(&self, blob_name: &str) -> Result<String> {
        self.record(Call::BlobUrl(blob_name.to_string()));
        if blob_name.starts_with("missing") {
            return Err(anyhow!("blob not found"));
        }
        Ok(format!("https://blobs.example/{}?sig=abc", blob_name))
    }

    async fn use_case_names(&self, _user: &str) -> Result<Value> {
        Ok(json!(["hr", "finance"]))
    }
}

/// Wraps the fake in an initialized `AppState`.
pub async fn app(api: FakeChatApi) -> (AppState, Arc<FakeChatApi>) {
    let api = Arc::new(api);
    let state = AppState::new(api.clone(), None);
    ragchat_lib::commands::initialize(&state).await;
    (state, api)
}

// --- Stream line builders ---

pub fn assistant_line(id: &str, content: &str) -> Vec<u8> {
    line(json!({
        "id": id,
        "choices": [{"messages": [{"role": "assistant", "content": content}]}],
    }))
}

pub fn tool_line(id: &str, citations: Value) -> Vec<u8> {
    let content = json!({"citations": citations, "intent": "[]"}).to_string();
    line(json!({
        "id": id,
        "choices": [{"messages": [{"role": "tool", "content": content}]}],
    }))
}

pub fn metadata_line(id: &str, conversation_id: &str, title: &str) -> Vec<u8> {
    line(json!({
        "id": id,
        "choices": [],
        "history_metadata": {
            "conversation_id": conversation_id,
            "title": title,
            "date": "2024-05-01T10:00:00.000000",
        },
    }))
}

pub fn error_line(message: &str) -> Vec<u8> {
    line(json!({"error": message}))
}

fn line(value: Value) -> Vec<u8> {
    let mut bytes = value.to_string().into_bytes();
    bytes.push(b'\n');
    bytes
}
