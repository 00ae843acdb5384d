//! In-process backend.
//!
//! `MemoryChatApi` answers turn requests from memory and records every call;
//! `ChannelTransport` hands out push channels fed through tokio channels, so a
//! driver (a test, a demo) decides exactly which events a turn observes and when.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use super::{ChatApi, StreamTransport};
use crate::api::{
    Chat, ChatStatus, Conversation, CreateChatRequest, FileRecord, RegenerateRequest, StreamScope,
};
use crate::client::BoxedStream;
use crate::event_stream::SseEvent;

#[derive(Clone, Debug, PartialEq)]
pub enum ApiCall {
    CreateConversation,
    CreateChat(CreateChatRequest),
    RegenerateChat(String, RegenerateRequest),
    StopStream(String),
    ListMessages(StreamScope),
}

#[derive(Default)]
struct MemoryState {
    conversations: u32,
    chats: u32,
    history: Vec<Chat>,
    scripted: VecDeque<Result<Chat, String>>,
    calls: Vec<ApiCall>,
    fail_stop: bool,
    latency: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryChatApi {
    inner: Mutex<MemoryState>,
}

impl MemoryChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns returned by `list_messages`
    pub fn with_history(history: Vec<Chat>) -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                history,
                ..Default::default()
            }),
        }
    }

    /// Queue the next answer to `create_chat`/`regenerate_chat`.
    pub async fn script(&self, response: Result<Chat, String>) {
        self.inner.lock().await.scripted.push_back(response);
    }

    /// Make stream termination calls fail.
    pub async fn fail_stop(&self, fail: bool) {
        self.inner.lock().await.fail_stop = fail;
    }

    /// Delay every turn request.
    pub async fn set_latency(&self, latency: Duration) {
        self.inner.lock().await.latency = Some(latency);
    }

    pub async fn calls(&self) -> Vec<ApiCall> {
        self.inner.lock().await.calls.clone()
    }

    async fn record(&self, call: ApiCall) -> Option<Duration> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(call);
        inner.latency
    }

    async fn next_chat(&self, make: impl FnOnce(&mut MemoryState) -> Chat) -> anyhow::Result<Chat> {
        let mut inner = self.inner.lock().await;
        let chat = match inner.scripted.pop_front() {
            Some(Ok(chat)) => chat,
            Some(Err(message)) => return Err(anyhow::anyhow!(message)),
            None => make(&mut inner),
        };
        match inner.history.iter_mut().find(|c| c.id == chat.id) {
            Some(existing) => *existing = chat.clone(),
            None => inner.history.push(chat.clone()),
        }
        Ok(chat)
    }
}

#[async_trait]
impl ChatApi for MemoryChatApi {
    async fn create_conversation(&self, project_code: Option<&str>) -> anyhow::Result<Conversation> {
        self.record(ApiCall::CreateConversation).await;
        let mut inner = self.inner.lock().await;
        inner.conversations += 1;
        Ok(Conversation {
            code: format!("conversation-{}", inner.conversations),
            project_code: project_code.map(str::to_string),
            subject: None,
            status: Some(ChatStatus::Pending),
        })
    }

    async fn create_chat(&self, scope: &StreamScope, request: &CreateChatRequest) -> anyhow::Result<Chat> {
        if let Some(latency) = self.record(ApiCall::CreateChat(request.clone())).await {
            tokio::time::sleep(latency).await;
        }
        self.next_chat(|inner| {
            inner.chats += 1;
            let mut chat = Chat::new(format!("chat-{}", inner.chats));
            chat.project_code = scope.project_code.clone().unwrap_or_default();
            chat.conversation_code = scope.conversation_code.clone();
            chat.model = request.model.clone();
            chat.credential_code = request.credential_code.clone();
            chat.knowledge_codes = request.knowledge_codes.clone();
            chat.options = request.options.clone();
            chat.prompt = request.message.content.clone();
            chat.files = request
                .message
                .file_ids
                .iter()
                .map(|id| FileRecord {
                    id: id.clone(),
                    ..Default::default()
                })
                .collect();
            chat.stateful = Some(request.stateful);
            chat.streaming = Some(request.streaming);
            if request.streaming {
                chat.stream_id = Some(format!("stream-{}", inner.chats));
            } else {
                chat.status = ChatStatus::Completed;
            }
            chat
        })
        .await
    }

    async fn regenerate_chat(
        &self,
        _scope: &StreamScope,
        chat_id: &str,
        request: &RegenerateRequest,
    ) -> anyhow::Result<Chat> {
        if let Some(latency) = self
            .record(ApiCall::RegenerateChat(chat_id.to_string(), *request))
            .await
        {
            tokio::time::sleep(latency).await;
        }
        let existing = {
            let inner = self.inner.lock().await;
            inner.history.iter().find(|c| c.id == chat_id).cloned()
        };
        self.next_chat(|inner| {
            inner.chats += 1;
            let mut chat = existing.unwrap_or_else(|| Chat::new(chat_id));
            chat.status = ChatStatus::Pending;
            chat.completion = None;
            chat.reasoning = None;
            chat.completion_chunks.clear();
            chat.reasoning_chunks.clear();
            chat.error_message = None;
            chat.stream_id = request
                .streaming
                .then(|| format!("stream-{}", inner.chats));
            chat
        })
        .await
    }

    async fn stop_stream(&self, _scope: &StreamScope, stream_id: &str) -> anyhow::Result<()> {
        self.record(ApiCall::StopStream(stream_id.to_string())).await;
        if self.inner.lock().await.fail_stop {
            return Err(anyhow::anyhow!("Request failed with status: 500"));
        }
        Ok(())
    }

    async fn list_messages(&self, scope: &StreamScope) -> anyhow::Result<Vec<Chat>> {
        self.record(ApiCall::ListMessages(scope.clone())).await;
        Ok(self.inner.lock().await.history.clone())
    }
}

type EventSender = mpsc::UnboundedSender<anyhow::Result<SseEvent>>;
type EventReceiver = mpsc::UnboundedReceiver<anyhow::Result<SseEvent>>;

#[derive(Default)]
struct Channels {
    senders: HashMap<String, EventSender>,
    receivers: HashMap<String, EventReceiver>,
    opened: Vec<String>,
}

/// Push channels keyed by stream id.
///
/// Events sent before the channel is opened are buffered and delivered on open.
#[derive(Default)]
pub struct ChannelTransport {
    channels: Mutex<Channels>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender feeding the channel of `stream_id`.
    pub async fn sender(&self, stream_id: &str) -> EventSender {
        let mut channels = self.channels.lock().await;
        Self::ensure(&mut channels, stream_id).clone()
    }

    /// Queue events for `stream_id` in order.
    pub async fn script(&self, stream_id: &str, events: Vec<SseEvent>) {
        let sender = self.sender(stream_id).await;
        for event in events {
            let _ = sender.send(Ok(event));
        }
    }

    /// Drop the transport's own sender; the channel ends once every other sender is gone.
    pub async fn close(&self, stream_id: &str) {
        self.channels.lock().await.senders.remove(stream_id);
    }

    /// Stream ids opened so far, in order
    pub async fn opened(&self) -> Vec<String> {
        self.channels.lock().await.opened.clone()
    }

    fn ensure<'a>(channels: &'a mut Channels, stream_id: &str) -> &'a EventSender {
        if !channels.senders.contains_key(stream_id) {
            let (tx, rx) = mpsc::unbounded_channel();
            channels.senders.insert(stream_id.to_string(), tx);
            channels.receivers.insert(stream_id.to_string(), rx);
        }
        &channels.senders[stream_id]
    }
}

#[async_trait]
impl StreamTransport for ChannelTransport {
    async fn open(
        &self,
        _scope: &StreamScope,
        stream_id: &str,
    ) -> anyhow::Result<BoxedStream<anyhow::Result<SseEvent>>> {
        let mut channels = self.channels.lock().await;
        Self::ensure(&mut channels, stream_id);
        let receiver = channels
            .receivers
            .remove(stream_id)
            .ok_or_else(|| anyhow::anyhow!("Stream {} already opened", stream_id))?;
        channels.opened.push(stream_id.to_string());

        let events = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        });
        Ok(Box::pin(events))
    }
}

/// A `message` event carrying `payload`
pub fn message_event(payload: Value) -> SseEvent {
    SseEvent::new("message", Some(payload.to_string()))
}

/// An `error` event, optionally with a body
pub fn error_event(body: Option<Value>) -> SseEvent {
    SseEvent::new("error", body.map(|b| b.to_string()))
}

pub fn close_event() -> SseEvent {
    SseEvent::new("close", None)
}
