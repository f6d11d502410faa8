//! Incremental reader for the newline-delimited JSON response stream.
//!
//! A chunk may end in the middle of an envelope, or carry several envelopes
//! separated by newlines. [`FrameDecoder`] reassembles envelopes across chunk
//! boundaries, [`TurnAccumulator`] merges their message fragments into the
//! messages of one turn, and [`reconcile`] drives both over a byte stream until
//! it ends, fails or is cancelled.

use crate::models::{new_id, ChatResponse, Envelope, HistoryMetadata, Message, Role};
use anyhow::Result;
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};

pub const GENERIC_ERROR: &str =
    "An error occurred. Please try again. If the problem persists, please contact the site administrator.";

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Aborted,
    Failed(String),
}

/// Why decoding stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFailure {
    /// The server sent an `error` envelope.
    Server(String),
    /// Bytes that are neither a partial nor a well-formed envelope.
    Protocol(String),
    /// The connection broke while reading.
    Transport(String),
}

impl StreamFailure {
    /// Content of the synthetic error message shown in the transcript.
    pub fn user_message(&self) -> String {
        match self {
            StreamFailure::Server(text) => text.clone(),
            StreamFailure::Protocol(_) | StreamFailure::Transport(_) => GENERIC_ERROR.to_string(),
        }
    }

    fn reason(&self) -> String {
        match self {
            StreamFailure::Server(text) => format!("server error: {}", text),
            StreamFailure::Protocol(text) => format!("protocol error: {}", text),
            StreamFailure::Transport(text) => format!("transport error: {}", text),
        }
    }
}

/// Progress notifications for a UI rendering the stream as it arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Assistant text received so far for the response.
    Delta { response_id: String, content: String },
    /// A citation payload arrived.
    Tool { content: String },
}

pub type EventSink = mpsc::UnboundedSender<StreamEvent>;

// --- Cancellation ---

/// Owner side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelHandle(watch::Sender<bool>);

/// Reader side handed to the stream loop.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

impl CancelSignal {
    /// Resolves once cancellation is requested. Never resolves if the handle is
    /// dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

// --- Frame decoding ---

/// Turns raw chunks into decoded envelopes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    // Tail of a UTF-8 sequence cut by a chunk boundary
    pending_bytes: Vec<u8>,
    // Fragments of an envelope that has not parsed yet
    accumulator: String,
}

impl FrameDecoder {
    fn decode_text(&mut self, chunk: &[u8]) -> String {
        self.pending_bytes.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending_bytes) {
            Ok(text) => {
                let text = text.to_string();
                self.pending_bytes.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending_bytes[..valid]).into_owned();
                self.pending_bytes.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending_bytes).into_owned();
                self.pending_bytes.clear();
                text
            }
        }
    }

    /// Feeds one chunk. Returns the envelopes completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<ChatResponse>, StreamFailure> {
        let text = self.decode_text(chunk);
        let mut envelopes = Vec::new();

        for fragment in text.split('\n') {
            let trimmed = fragment.trim();
            if trimmed.is_empty() || trimmed == "{}" {
                continue;
            }
            self.accumulator.push_str(fragment);

            let value = match serde_json::from_str::<serde_json::Value>(&self.accumulator) {
                Ok(value) => value,
                Err(e) if e.is_eof() => {
                    log::debug!("Incomplete envelope ({} bytes buffered), continuing", self.accumulator.len());
                    continue;
                }
                Err(e) => {
                    return Err(StreamFailure::Protocol(format!(
                        "{} in {:?}",
                        e, self.accumulator
                    )));
                }
            };
            self.accumulator.clear();

            match serde_json::from_value::<Envelope>(value) {
                Ok(Envelope::Chunk(response)) => envelopes.push(response),
                Ok(Envelope::Failure { error }) => {
                    return Err(StreamFailure::Server(error.message().to_string()));
                }
                Err(e) => {
                    return Err(StreamFailure::Protocol(format!("unexpected envelope: {}", e)));
                }
            }
        }
        Ok(envelopes)
    }

    /// Bytes still buffered, as text. Non-empty after the stream ends means the
    /// last envelope never completed.
    pub fn leftover(&self) -> &str {
        &self.accumulator
    }
}

// --- Delta merging ---

/// Messages of the turn being streamed.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    assistant: Option<Message>,
    tool: Option<Message>,
    metadata: Option<HistoryMetadata>,
}

impl TurnAccumulator {
    /// Merges one envelope. Assistant content is appended; a tool payload
    /// replaces the previous one.
    pub fn merge(&mut self, response: ChatResponse, events: Option<&EventSink>) {
        if let Some(incoming) = response.history_metadata {
            let current = self.metadata.get_or_insert_with(HistoryMetadata::default);
            if incoming.conversation_id.is_some() {
                current.conversation_id = incoming.conversation_id;
            }
            if incoming.title.is_some() {
                current.title = incoming.title;
            }
            if incoming.date.is_some() {
                current.date = incoming.date;
            }
        }

        let fragments = response.choices.into_iter().flat_map(|choice| choice.messages);
        for fragment in fragments {
            let now = Utc::now();
            match fragment.role {
                Role::Assistant => {
                    let context = fragment.context_text();
                    let assistant = self
                        .assistant
                        .get_or_insert_with(|| Message::new(Role::Assistant, String::new()));
                    assistant.content.push_str(&fragment.content);
                    assistant.id = response.id.clone();
                    assistant.date = now;
                    notify(
                        events,
                        StreamEvent::Delta {
                            response_id: response.id.clone(),
                            content: assistant.content.clone(),
                        },
                    );

                    if let Some(context) = context {
                        self.set_tool(new_id(), context, events);
                    }
                }
                Role::Tool => self.set_tool(response.id.clone(), fragment.content, events),
                other => log::debug!("Ignoring streamed fragment with role {}", other),
            }
        }
    }

    fn set_tool(&mut self, id: String, content: String, events: Option<&EventSink>) {
        notify(events, StreamEvent::Tool { content: content.clone() });
        let mut tool = Message::new(Role::Tool, content);
        tool.id = id;
        self.tool = Some(tool);
    }

    /// Finalized messages: the tool message, if any, then the assistant message.
    pub fn finish(self) -> (Vec<Message>, Option<HistoryMetadata>) {
        let messages = self.tool.into_iter().chain(self.assistant).collect();
        (messages, self.metadata)
    }
}

fn notify(events: Option<&EventSink>, event: StreamEvent) {
    if let Some(sink) = events {
        // A closed sink only means nobody is watching
        let _ = sink.send(event);
    }
}

/// Everything one stream produced.
#[derive(Debug, Clone)]
pub struct StreamResult {
    /// Messages to append to the conversation, in order.
    pub messages: Vec<Message>,
    pub outcome: StreamOutcome,
    pub history_metadata: Option<HistoryMetadata>,
}

impl StreamResult {
    /// Result for a stream that could not be opened or failed outright.
    pub fn failed(content: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::error(content)],
            outcome: StreamOutcome::Failed(reason.into()),
            history_metadata: None,
        }
    }
}

/// Reads `body` to the end, merging every envelope into one turn.
///
/// On failure the turn's partial messages are dropped and a single error
/// message takes their place. On cancellation nothing is returned.
pub async fn reconcile<S>(mut body: S, cancel: &mut CancelSignal, events: Option<&EventSink>) -> StreamResult
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    let mut decoder = FrameDecoder::default();
    let mut turn = TurnAccumulator::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::warn!("Stream cancelled by caller, discarding partial response");
                return StreamResult {
                    messages: Vec::new(),
                    outcome: StreamOutcome::Aborted,
                    history_metadata: turn.metadata,
                };
            }
            next = body.next() => next,
        };

        let failure = match next {
            None => break,
            Some(Ok(chunk)) => match decoder.push(&chunk) {
                Ok(envelopes) => {
                    log::debug!("Chunk of {} bytes held {} envelopes", chunk.len(), envelopes.len());
                    for envelope in envelopes {
                        turn.merge(envelope, events);
                    }
                    continue;
                }
                Err(failure) => failure,
            },
            Some(Err(e)) => StreamFailure::Transport(format!("{:#}", e)),
        };

        log::error!("Response stream failed: {}", failure.reason());
        return StreamResult {
            messages: vec![Message::error(failure.user_message())],
            outcome: StreamOutcome::Failed(failure.reason()),
            history_metadata: turn.metadata,
        };
    }

    if !decoder.leftover().is_empty() {
        log::warn!("Stream ended inside an envelope; dropping {:?}", decoder.leftover());
    }
    let (messages, history_metadata) = turn.finish();
    log::info!("Stream completed with {} messages", messages.len());
    StreamResult {
        messages,
        outcome: StreamOutcome::Completed,
        history_metadata,
    }
}
