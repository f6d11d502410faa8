use crate::config::{self, ClientConfig};
use crate::models::{
    ConversationSummary, FrontendSettings, HistoryHealth, HistoryReadResponse, HistoryStatus,
    Message,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::pin::Pin;

// Raw body chunks of a streaming response
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Outcome of a non-streaming call. Transport failures are folded in as
/// `ok == false, status == 500` so callers never have to unwind them.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub ok: bool,
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn success(body: Value) -> Self {
        Self { ok: true, status: 200, body }
    }

    pub fn failed(status: u16, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            body: json!({ "error": message.into() }),
        }
    }

    /// The `error` field of the body, if the server sent one.
    pub fn error_message(&self) -> Option<String> {
        match self.body.get("error")? {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj.get("message").and_then(Value::as_str).map(str::to_string),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Result of opening a streaming endpoint.
pub enum StreamOpen {
    Streaming(ByteStream),
    // Non-success status; the body explains why
    Rejected(ApiResponse),
}

// Interface of the chat service as seen by the client
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn conversation(&self, messages: &[Message]) -> Result<StreamOpen>;
    async fn history_generate(
        &self,
        messages: &[Message],
        conversation_id: Option<&str>,
    ) -> Result<StreamOpen>;
    async fn history_update(&self, messages: &[Message], conversation_id: &str) -> ApiResponse;
    async fn history_list(&self, offset: usize) -> Result<Vec<ConversationSummary>>;
    async fn history_read(&self, conversation_id: &str) -> Result<Vec<Message>>;
    async fn history_delete(&self, conversation_id: &str) -> ApiResponse;
    async fn history_delete_all(&self) -> ApiResponse;
    async fn history_clear(&self, conversation_id: &str) -> ApiResponse;
    async fn history_rename(&self, conversation_id: &str, title: &str) -> ApiResponse;
    async fn history_ensure(&self) -> HistoryHealth;
    async fn frontend_settings(&self) -> Result<FrontendSettings>;
    async fn message_feedback(&self, message_id: &str, feedback: &str) -> ApiResponse;
    async fn blob_url(&self, blob_name: &str) -> Result<String>;
    async fn use_case_names(&self, user: &str) -> Result<Value>;
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateRequestBody<'a> {
    #[serde(rename = "conversation_id", skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    messages: &'a [Message],
    container_name: Option<&'a str>,
    index_name: Option<&'a str>,
}

/// `ChatApi` over HTTP.
pub struct HttpChatApi {
    client: Client,
    config: ClientConfig,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let token = config::get_access_token(&config)?;
        Ok(Self {
            client: Client::new(),
            config,
            token,
        })
    }

    fn container(&self) -> Option<&str> {
        self.config.use_case.as_deref()
    }

    // Query strings always carry the key, empty when no use case is set
    fn container_query(&self) -> (&'static str, String) {
        ("containerName", self.container().unwrap_or_default().to_string())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.config.endpoint(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> ApiResponse {
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                log::error!("{} request failed: {:?}", what, e);
                return ApiResponse::failed(500, e.to_string());
            }
        };
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        if !status.is_success() {
            log::warn!("{} returned status {}: {}", what, status, body);
        }
        ApiResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            body,
        }
    }

    async fn open_stream(&self, path: &str, body: &GenerateRequestBody<'_>) -> Result<StreamOpen> {
        log::info!("Opening response stream at {} ({} messages)", path, body.messages.len());
        let response = self
            .request(Method::POST, path)
            .json(body)
            .send()
            .await
            .context(format!("Failed to send stream request to {}", path))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            log::error!("Stream request to {} failed with status {}: {}", path, status, body);
            return Ok(StreamOpen::Rejected(ApiResponse {
                ok: false,
                status: status.as_u16(),
                body,
            }));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).context("Error reading response stream"));
        Ok(StreamOpen::Streaming(Box::pin(stream)))
    }
}

/// Maps the ensure endpoint's reply onto a history status.
pub fn history_health_from(status: u16, body: &Value) -> HistoryHealth {
    let available = (200..300).contains(&status);
    if body.get("message").is_some() {
        return HistoryHealth {
            available,
            status: HistoryStatus::Working,
            detail: None,
        };
    }
    let error_text = body.get("error").and_then(Value::as_str).map(str::to_string);
    let (status, detail) = match status {
        500 => (HistoryStatus::NotWorking, None),
        401 => (HistoryStatus::InvalidCredentials, None),
        422 => (HistoryStatus::NotWorking, error_text),
        _ => (HistoryStatus::NotConfigured, None),
    };
    HistoryHealth {
        available,
        status,
        detail,
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn conversation(&self, messages: &[Message]) -> Result<StreamOpen> {
        let body = GenerateRequestBody {
            conversation_id: None,
            messages,
            container_name: self.container(),
            index_name: self.container(),
        };
        self.open_stream("/conversation", &body).await
    }

    async fn history_generate(
        &self,
        messages: &[Message],
        conversation_id: Option<&str>,
    ) -> Result<StreamOpen> {
        let body = GenerateRequestBody {
            conversation_id,
            messages,
            container_name: self.container(),
            index_name: self.container(),
        };
        self.open_stream("/history/generate", &body).await
    }

    async fn history_update(&self, messages: &[Message], conversation_id: &str) -> ApiResponse {
        log::info!("Committing {} messages to conversation {}", messages.len(), conversation_id);
        let body = json!({
            "conversation_id": conversation_id,
            "messages": messages,
            "containerName": self.container(),
        });
        self.send(self.request(Method::POST, "/history/update").json(&body), "history/update")
            .await
    }

    async fn history_list(&self, offset: usize) -> Result<Vec<ConversationSummary>> {
        let query = [("offset", offset.to_string()), self.container_query()];
        let payload: Value = self
            .request(Method::GET, "/history/list")
            .query(&query)
            .send()
            .await
            .context("Failed to fetch conversation list")?
            .json()
            .await
            .context("Failed to decode conversation list")?;

        if !payload.is_array() {
            return Err(anyhow::anyhow!("There was an issue fetching your data: {}", payload));
        }
        serde_json::from_value(payload).context("Unexpected conversation list format")
    }

    async fn history_read(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let body = json!({
            "conversation_id": conversation_id,
            "containerName": self.container(),
        });
        let payload: HistoryReadResponse = self
            .request(Method::POST, "/history/read")
            .json(&body)
            .send()
            .await
            .context(format!("Failed to read conversation {}", conversation_id))?
            .json()
            .await
            .context(format!("Failed to decode conversation {}", conversation_id))?;
        Ok(payload.messages)
    }

    async fn history_delete(&self, conversation_id: &str) -> ApiResponse {
        let body = json!({
            "conversation_id": conversation_id,
            "containerName": self.container(),
        });
        self.send(self.request(Method::DELETE, "/history/delete").json(&body), "history/delete")
            .await
    }

    async fn history_delete_all(&self) -> ApiResponse {
        let body = json!({ "containerName": self.container() });
        self.send(
            self.request(Method::DELETE, "/history/delete_all").json(&body),
            "history/delete_all",
        )
        .await
    }

    async fn history_clear(&self, conversation_id: &str) -> ApiResponse {
        let body = json!({
            "conversation_id": conversation_id,
            "containerName": self.container(),
        });
        self.send(self.request(Method::POST, "/history/clear").json(&body), "history/clear")
            .await
    }

    async fn history_rename(&self, conversation_id: &str, title: &str) -> ApiResponse {
        let body = json!({
            "conversation_id": conversation_id,
            "title": title,
            "containerName": self.container(),
        });
        self.send(self.request(Method::POST, "/history/rename").json(&body), "history/rename")
            .await
    }

    async fn history_ensure(&self) -> HistoryHealth {
        let builder = self
            .request(Method::GET, "/history/ensure")
            .query(&[self.container_query()]);
        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.json::<Value>().await.unwrap_or(Value::Null);
                history_health_from(status.as_u16(), &body)
            }
            Err(e) => {
                log::error!("History ensure request failed: {:?}", e);
                HistoryHealth {
                    available: false,
                    status: HistoryStatus::NotWorking,
                    detail: Some(e.to_string()),
                }
            }
        }
    }

    async fn frontend_settings(&self) -> Result<FrontendSettings> {
        self.request(Method::GET, "/frontend_settings")
            .send()
            .await
            .context("Failed to fetch frontend settings")?
            .json()
            .await
            .context("Failed to decode frontend settings")
    }

    async fn message_feedback(&self, message_id: &str, feedback: &str) -> ApiResponse {
        log::info!("Posting feedback '{}' for message {}", feedback, message_id);
        let body = json!({
            "message_id": message_id,
            "message_feedback": feedback,
            "containerName": self.container(),
        });
        self.send(
            self.request(Method::POST, "/history/message_feedback").json(&body),
            "history/message_feedback",
        )
        .await
    }

    async fn blob_url(&self, blob_name: &str) -> Result<String> {
        let response = self
            .request(Method::POST, "/get_pdf_sas_url")
            .json(&json!({ "blob_name": blob_name }))
            .send()
            .await
            .context(format!("Failed to request signed URL for {}", blob_name))?;
        let status = response.status();
        let payload: Value = response.json().await.context("Failed to decode signed URL response")?;
        if status != StatusCode::OK {
            let reason = payload.get("error").and_then(Value::as_str).unwrap_or("unknown error");
            return Err(anyhow::anyhow!("Signed URL request for {} failed: {}", blob_name, reason));
        }
        payload
            .get("sas_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Missing 'sas_url' in signed URL response")
    }

    async fn use_case_names(&self, user: &str) -> Result<Value> {
        self.request(Method::GET, "/useCase/name_list")
            .query(&[("user", user)])
            .send()
            .await
            .context("Failed to fetch use case list")?
            .json()
            .await
            .context("Failed to decode use case list")
    }
}
