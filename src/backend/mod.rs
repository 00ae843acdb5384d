//! Collaborators the chat core talks to.
//!
//! `ChatApi` is the request/response side (conversations, turns, stream
//! termination, history). `StreamTransport` opens the server-push channel of a
//! turn. Both are object safe so the controller can hold them behind `Arc<dyn _>`.

use async_trait::async_trait;

use crate::api::{Chat, Conversation, CreateChatRequest, RegenerateRequest, StreamScope};
use crate::client::BoxedStream;
use crate::event_stream::SseEvent;

pub mod http;
pub mod memory;

pub use http::HttpChatApi;
pub use memory::{ApiCall, ChannelTransport, MemoryChatApi};

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `POST /conversations`
    async fn create_conversation(&self, project_code: Option<&str>) -> anyhow::Result<Conversation>;

    /// `POST /chat`
    async fn create_chat(&self, scope: &StreamScope, request: &CreateChatRequest) -> anyhow::Result<Chat>;

    /// `PUT /chat/{id}`
    async fn regenerate_chat(
        &self,
        scope: &StreamScope,
        chat_id: &str,
        request: &RegenerateRequest,
    ) -> anyhow::Result<Chat>;

    /// `DELETE /chat/stream/{stream_id}`, best effort
    async fn stop_stream(&self, scope: &StreamScope, stream_id: &str) -> anyhow::Result<()>;

    /// `GET /conversations/{code}/messages`
    async fn list_messages(&self, scope: &StreamScope) -> anyhow::Result<Vec<Chat>>;
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open the push channel for `stream_id`. Events must be yielded in arrival order.
    async fn open(
        &self,
        scope: &StreamScope,
        stream_id: &str,
    ) -> anyhow::Result<BoxedStream<anyhow::Result<SseEvent>>>;
}
