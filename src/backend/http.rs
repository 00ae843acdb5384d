use async_trait::async_trait;

use super::{ChatApi, StreamTransport};
use crate::api::{Chat, Conversation, CreateChatRequest, RegenerateRequest, StreamScope};
use crate::client::{BoxedStream, Client};
use crate::event_stream::SseEvent;

/// REST + server-sent-events backend
#[derive(Clone)]
pub struct HttpChatApi {
    client: Client,
}

impl HttpChatApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn create_conversation(&self, project_code: Option<&str>) -> anyhow::Result<Conversation> {
        let query: Vec<(&str, String)> = project_code
            .map(|code| vec![("project_code", code.to_string())])
            .unwrap_or_default();
        self.client
            .post("/conversations", &query, &serde_json::json!({}))
            .await
    }

    async fn create_chat(&self, scope: &StreamScope, request: &CreateChatRequest) -> anyhow::Result<Chat> {
        self.client.post("/chat", &scope.query(), request).await
    }

    async fn regenerate_chat(
        &self,
        scope: &StreamScope,
        chat_id: &str,
        request: &RegenerateRequest,
    ) -> anyhow::Result<Chat> {
        self.client
            .put(&format!("/chat/{}", chat_id), &scope.query(), request)
            .await
    }

    async fn stop_stream(&self, scope: &StreamScope, stream_id: &str) -> anyhow::Result<()> {
        self.client
            .delete(&format!("/chat/stream/{}", stream_id), &scope.query())
            .await
    }

    async fn list_messages(&self, scope: &StreamScope) -> anyhow::Result<Vec<Chat>> {
        let Some(code) = &scope.conversation_code else {
            return Err(anyhow::anyhow!("No conversation selected"));
        };
        self.client
            .get(&format!("/conversations/{}/messages", code), &scope.query())
            .await
    }
}

#[async_trait]
impl StreamTransport for HttpChatApi {
    async fn open(
        &self,
        scope: &StreamScope,
        stream_id: &str,
    ) -> anyhow::Result<BoxedStream<anyhow::Result<SseEvent>>> {
        self.client
            .event_source(&format!("/chat/stream/{}", stream_id), &scope.query())
            .await
    }
}
