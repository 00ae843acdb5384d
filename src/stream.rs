//! Stream session: follows one turn's push channel to completion.
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Closed
//!             \            \
//!              +------------+--> Errored
//! ```
//!
//! Events are folded strictly in arrival order. Every `message` event is
//! decoded as a patch payload, applied to the working document, and the
//! assistant message is re-derived from the result.

use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{Chat, ChatStatus, StreamScope};
use crate::backend::StreamTransport;
use crate::error::ChatError;
use crate::event_stream::SseEvent;
use crate::message::{Message, Role};
use crate::patch::{self, Operation, PatchPayload};
use crate::projector::Projector;
use crate::state::SharedState;

/// Message used when the server signals an error without saying why
pub const UNKNOWN_ERROR: &str = "Unknown error";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Closed,
    Errored,
}

/// A decoded stream channel event
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Message(PatchPayload),
    Error {
        message: String,
        code: Option<String>,
    },
    Close,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    code: Option<String>,
}

impl StreamEvent {
    /// Decode a raw channel event. Unknown event names yield `None`.
    pub fn decode(event: &SseEvent) -> Result<Option<Self>, ChatError> {
        match event.event.as_str() {
            "message" => {
                let data = event.data.as_deref().ok_or_else(|| ChatError::Decode {
                    message: "message event without payload".to_string(),
                })?;
                Ok(Some(StreamEvent::Message(serde_json::from_str(data)?)))
            }
            "error" => {
                let data = event.data.as_deref().map(str::trim).unwrap_or("");
                if data.is_empty() {
                    return Ok(Some(StreamEvent::Error {
                        message: UNKNOWN_ERROR.to_string(),
                        code: None,
                    }));
                }
                Ok(Some(match serde_json::from_str::<ErrorBody>(data) {
                    Ok(body) => StreamEvent::Error {
                        message: body.message.unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
                        code: body.code,
                    },
                    Err(_) => StreamEvent::Error {
                        message: data.to_string(),
                        code: None,
                    },
                }))
            }
            "close" => Ok(Some(StreamEvent::Close)),
            _ => Ok(None),
        }
    }
}

/// Apply a payload to a chat document and re-materialize its text fields.
pub fn fold(chat: &Chat, payload: &PatchPayload) -> Result<Chat, ChatError> {
    let document = serde_json::to_value(chat)?;
    let patched = patch::apply(&document, payload)?;
    let mut next: Chat = serde_json::from_value(patched)?;
    next.materialize();
    Ok(next)
}

pub struct StreamSession {
    state: SharedState,
    transport: Arc<dyn StreamTransport>,
    projector: Projector,
    status: StreamState,
}

impl StreamSession {
    pub fn new(state: SharedState, transport: Arc<dyn StreamTransport>, projector: Projector) -> Self {
        Self {
            state,
            transport,
            projector,
            status: StreamState::Idle,
        }
    }

    pub fn status(&self) -> StreamState {
        self.status
    }

    /// Follow `chat`'s stream until the server closes it.
    ///
    /// A turn without a stream id is already resolved and is returned as is.
    #[instrument(level = "info", skip_all, fields(chat_id = %chat.id))]
    pub async fn start(
        &mut self,
        chat: Chat,
        scope: &StreamScope,
        cancel: &CancellationToken,
    ) -> Result<Chat, ChatError> {
        let Some(stream_id) = chat.stream_id.clone() else {
            debug!("Turn has no stream id, nothing to stream");
            return Ok(chat);
        };

        self.status = StreamState::Connecting;
        self.state
            .update(|s| {
                s.stream_id = Some(stream_id.clone());
                s.streaming = false;
            })
            .await;

        let result = self.run(chat, scope, &stream_id, cancel).await;

        match &result {
            Ok(_) => self.status = StreamState::Closed,
            Err(e) => {
                self.status = if e.is_abort() {
                    StreamState::Closed
                } else {
                    StreamState::Errored
                };
                self.state
                    .update(|s| {
                        s.streaming = false;
                        s.live_message = None;
                        if s.stream_id.as_deref() == Some(stream_id.as_str()) {
                            s.stream_id = None;
                        }
                    })
                    .await;
            }
        }
        result
    }

    async fn run(
        &mut self,
        mut chat: Chat,
        scope: &StreamScope,
        stream_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Chat, ChatError> {
        let mut events = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::TransportAbort),
            opened = self.transport.open(scope, stream_id) => {
                opened.map_err(ChatError::from_anyhow)?
            }
        };
        info!("Stream {} opened", stream_id);

        let assistant_id = Message::id_for(Role::Assistant, &chat.id);
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stream {} cancelled", stream_id);
                    return Err(ChatError::TransportAbort);
                }
                next = events.next() => next,
            };
            let Some(next) = next else {
                warn!("Stream {} ended without a close event", stream_id);
                return Err(ChatError::stream("stream ended unexpectedly", None));
            };
            let Some(event) = StreamEvent::decode(&next.map_err(ChatError::from_anyhow)?)? else {
                debug!("Ignoring unknown stream event");
                continue;
            };

            match event {
                StreamEvent::Message(payload) => {
                    if self.status != StreamState::Streaming {
                        self.begin_streaming(&chat).await;
                    }
                    if payload.is_empty() {
                        debug!("Ignoring empty patch batch");
                        continue;
                    }
                    debug!("Applying {} operations to {}", payload.len(), chat.id);
                    chat = fold(&chat, &payload).inspect_err(|e| {
                        let paths = payload
                            .operations()
                            .iter()
                            .map(Operation::path)
                            .collect::<Vec<_>>();
                        warn!("Failed to apply patch {:?} to {}: {}", paths, chat.id, e);
                    })?;
                    let projector = &self.projector;
                    let current = &chat;
                    self.state
                        .update(|s| {
                            if let Some(message) = s.message_mut(&assistant_id) {
                                projector.apply_assistant_parts(message, current);
                            }
                        })
                        .await;
                }
                StreamEvent::Error { message, code } => {
                    warn!("Stream {} reported error: {} ({:?})", stream_id, message, code);
                    return Err(ChatError::stream(message, code));
                }
                StreamEvent::Close => {
                    self.finish(&mut chat, stream_id, &assistant_id).await;
                    info!("Stream {} closed", stream_id);
                    return Ok(chat);
                }
            }
        }
    }

    /// First payload: make sure an assistant message exists and start it from empty text.
    async fn begin_streaming(&mut self, chat: &Chat) {
        self.status = StreamState::Streaming;
        let projector = &self.projector;
        self.state
            .update(|s| {
                s.streaming = true;
                let id = Message::id_for(Role::Assistant, &chat.id);
                if s.message(&id).is_none() {
                    s.messages.push(projector.assistant_message(chat));
                }
                if let Some(message) = s.message_mut(&id) {
                    message.reset_text();
                }
                s.live_message = Some(id);
            })
            .await;
        debug!("Streaming {}", chat.id);
    }

    async fn finish(&mut self, chat: &mut Chat, stream_id: &str, assistant_id: &str) {
        chat.stream_id = None;
        if chat.status == ChatStatus::Pending {
            chat.status = ChatStatus::Completed;
        }
        let projector = &self.projector;
        let current = &*chat;
        self.state
            .update(|s| {
                s.streaming = false;
                if s.stream_id.as_deref() == Some(stream_id) {
                    s.stream_id = None;
                }
                if let Some(message) = s.message_mut(assistant_id) {
                    projector.apply_assistant_parts(message, current);
                }
                s.live_message = None;
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChannelTransport;
    use crate::backend::memory::{close_event, error_event, message_event};
    use serde_json::json;

    fn pending_chat() -> Chat {
        let mut chat = Chat::new("t1");
        chat.prompt = "2+2?".into();
        chat.stream_id = Some("s1".into());
        chat
    }

    fn new_session(transport: Arc<ChannelTransport>) -> (StreamSession, SharedState) {
        let state = SharedState::default();
        let session = StreamSession::new(state.clone(), transport, Projector::new("http://api"));
        (session, state)
    }

    #[test]
    fn test_decode_events() {
        let event = StreamEvent::decode(&message_event(json!([
            {"op": "add", "path": "/completion_chunks/-", "value": "a"}
        ])))
        .unwrap();
        assert!(matches!(event, Some(StreamEvent::Message(PatchPayload::Batch(_)))));

        let event = StreamEvent::decode(&error_event(None)).unwrap();
        assert_eq!(
            event,
            Some(StreamEvent::Error {
                message: UNKNOWN_ERROR.into(),
                code: None
            })
        );

        let event =
            StreamEvent::decode(&error_event(Some(json!({"message": "rate limited", "code": "E_RATE"}))))
                .unwrap();
        assert_eq!(
            event,
            Some(StreamEvent::Error {
                message: "rate limited".into(),
                code: Some("E_RATE".into())
            })
        );

        assert_eq!(StreamEvent::decode(&close_event()).unwrap(), Some(StreamEvent::Close));
        assert_eq!(StreamEvent::decode(&SseEvent::new("ping", None)).unwrap(), None);
    }

    #[test]
    fn test_fold_materializes_text() {
        let chat = pending_chat();
        let payload: PatchPayload = serde_json::from_value(json!([
            {"op": "add", "path": "/completion_chunks/-", "value": "The"},
            {"op": "add", "path": "/completion_chunks/-", "value": " answer"},
            {"op": "add", "path": "/reasoning_chunks/-", "value": "hm"}
        ]))
        .unwrap();
        let next = fold(&chat, &payload).unwrap();
        assert_eq!(next.completion_text(), "The answer");
        assert_eq!(next.reasoning_text(), "hm");
        assert!(chat.completion_chunks.is_empty());
    }

    #[test]
    fn test_fold_tolerates_null_fragment_lists() {
        let mut chat = pending_chat();
        chat.reasoning_chunks = vec!["stale".into()];
        let payload: PatchPayload =
            serde_json::from_value(json!({"op": "replace", "path": "/reasoning_chunks", "value": null}))
                .unwrap();
        let next = fold(&chat, &payload).unwrap();
        assert!(next.reasoning_chunks.is_empty());
        assert_eq!(next.reasoning_text(), "");
    }

    #[test]
    fn test_fold_remove_of_absent_field_is_missing() {
        let payload: PatchPayload =
            serde_json::from_value(json!({"op": "remove", "path": "/error_message"})).unwrap();
        assert_eq!(
            fold(&pending_chat(), &payload).unwrap_err(),
            ChatError::PatchTargetMissing {
                path: "/error_message".into()
            }
        );
    }

    #[test]
    fn test_empty_batch_is_empty() {
        let payload: PatchPayload = serde_json::from_value(json!([])).unwrap();
        assert!(payload.is_empty());
        assert_eq!(payload.len(), 0);
    }

    #[tokio::test]
    async fn test_without_stream_id_is_noop() {
        let transport = Arc::new(ChannelTransport::new());
        let (mut session, state) = new_session(transport.clone());
        let chat = Chat::new("t1");
        let result = session
            .start(chat.clone(), &StreamScope::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, chat);
        assert_eq!(session.status(), StreamState::Idle);
        assert!(transport.opened().await.is_empty());
        assert_eq!(state.revision(), 0);
    }

    #[tokio::test]
    async fn test_stream_to_close() {
        let transport = Arc::new(ChannelTransport::new());
        transport
            .script(
                "s1",
                vec![
                    message_event(json!({"op": "add", "path": "/reasoning_chunks/-", "value": "Let me"})),
                    message_event(json!([
                        {"op": "add", "path": "/reasoning_chunks/-", "value": " think"},
                        {"op": "add", "path": "/completion_chunks/-", "value": "The"},
                        {"op": "add", "path": "/completion_chunks/-", "value": " answer"},
                        {"op": "add", "path": "/completion_chunks/-", "value": " is 4"}
                    ])),
                    close_event(),
                ],
            )
            .await;
        let (mut session, state) = new_session(transport);

        let chat = session
            .start(pending_chat(), &StreamScope::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.status(), StreamState::Closed);
        assert_eq!(chat.status, ChatStatus::Completed);
        assert_eq!(chat.stream_id, None);
        assert_eq!(chat.completion_text(), "The answer is 4");

        let snapshot = state.snapshot().await;
        assert!(!snapshot.streaming);
        assert_eq!(snapshot.stream_id, None);
        assert_eq!(snapshot.live_message, None);
        let message = snapshot.message("assistant-t1").unwrap();
        assert_eq!(message.text(), Some("The answer is 4"));
        assert_eq!(message.reasoning(), Some("Let me think"));
        assert_eq!(message.metadata.status, ChatStatus::Completed);
    }

    #[tokio::test]
    async fn test_existing_message_is_reset_on_first_event() {
        let transport = Arc::new(ChannelTransport::new());
        transport
            .script(
                "s1",
                vec![
                    message_event(json!({"op": "replace", "path": "/status", "value": "PENDING"})),
                    close_event(),
                ],
            )
            .await;
        let (mut session, state) = new_session(transport);
        let mut stale = Message::new(Role::Assistant, "t1", ChatStatus::Failed);
        stale.set_text("old answer");
        stale.set_reasoning("old reasoning");
        state.update(|s| s.messages.push(stale)).await;

        session
            .start(pending_chat(), &StreamScope::default(), &CancellationToken::new())
            .await
            .unwrap();

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.messages.len(), 1);
        let message = &snapshot.messages[0];
        assert_eq!(message.text(), Some(""));
        assert_eq!(message.reasoning(), None);
    }

    #[tokio::test]
    async fn test_error_event_fails_turn() {
        let transport = Arc::new(ChannelTransport::new());
        transport
            .script(
                "s1",
                vec![error_event(Some(json!({"message": "rate limited", "code": "E_RATE"})))],
            )
            .await;
        let (mut session, state) = new_session(transport);

        let err = session
            .start(pending_chat(), &StreamScope::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, ChatError::stream("rate limited", Some("E_RATE".into())));
        assert_eq!(session.status(), StreamState::Errored);
        assert_eq!(state.read(|s| s.stream_id.clone()).await, None);
    }

    #[tokio::test]
    async fn test_missing_patch_target_is_fatal() {
        let transport = Arc::new(ChannelTransport::new());
        transport
            .script(
                "s1",
                vec![
                    message_event(json!({"op": "remove", "path": "/nope"})),
                    close_event(),
                ],
            )
            .await;
        let (mut session, state) = new_session(transport);

        let err = session
            .start(pending_chat(), &StreamScope::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, ChatError::PatchTargetMissing { path: "/nope".into() });
        assert_eq!(session.status(), StreamState::Errored);
        assert!(!state.read(|s| s.streaming).await);
    }

    #[tokio::test]
    async fn test_cancel_aborts_stream() {
        let transport = Arc::new(ChannelTransport::new());
        let sender = transport.sender("s1").await;
        sender
            .send(Ok(message_event(
                json!({"op": "add", "path": "/completion_chunks/-", "value": "partial"}),
            )))
            .unwrap();
        let (mut session, state) = new_session(transport);
        let cancel = CancellationToken::new();

        let mut changes = state.subscribe();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = session
                    .start(pending_chat(), &StreamScope::default(), &cancel)
                    .await;
                (result, session.status())
            })
        };
        while !state.read(|s| s.streaming).await {
            changes.changed().await.unwrap();
        }
        cancel.cancel();

        let (result, status) = task.await.unwrap();
        assert_eq!(result.unwrap_err(), ChatError::TransportAbort);
        assert_eq!(status, StreamState::Closed);
        assert!(!state.read(|s| s.streaming).await);
        drop(sender);
    }

    #[tokio::test]
    async fn test_channel_ending_without_close_is_an_error() {
        let transport = Arc::new(ChannelTransport::new());
        transport
            .script(
                "s1",
                vec![message_event(
                    json!({"op": "add", "path": "/completion_chunks/-", "value": "a"}),
                )],
            )
            .await;
        transport.close("s1").await;
        let (mut session, state) = new_session(transport);

        let err = session
            .start(pending_chat(), &StreamScope::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, ChatError::stream("stream ended unexpectedly", None));
        assert_eq!(err.code(), "E_UNKNOWN");
        let snapshot = state.snapshot().await;
        assert!(!snapshot.streaming);
        assert_eq!(snapshot.live_message, None);
    }

    #[tokio::test]
    async fn test_knowledge_part_is_replaced_per_event() {
        let transport = Arc::new(ChannelTransport::new());
        let sender = transport.sender("s1").await;
        let (mut session, state) = new_session(transport);
        let task = tokio::spawn(async move {
            session
                .start(pending_chat(), &StreamScope::default(), &CancellationToken::new())
                .await
        });
        let mut changes = state.subscribe();
        let knowledge = |state: &crate::state::SessionState| {
            state
                .message("assistant-t1")
                .and_then(|m| m.knowledge().map(|items| items.to_vec()))
        };

        sender
            .send(Ok(message_event(json!({
                "op": "add",
                "path": "/knowledge_retrieved",
                "value": [{"file_id": "f1", "chunk_content": "first", "score": 0.9}]
            }))))
            .unwrap();
        let first = loop {
            if let Some(items) = state.read(knowledge).await {
                break items;
            }
            changes.changed().await.unwrap();
        };
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].file_id, "f1");

        sender
            .send(Ok(message_event(json!([
                {"op": "add", "path": "/knowledge_retrieved/-",
                 "value": {"file_id": "f2", "chunk_content": "second", "score": 0.5}},
                {"op": "add", "path": "/completion_chunks/-", "value": "done"}
            ]))))
            .unwrap();
        sender.send(Ok(close_event())).unwrap();
        task.await.unwrap().unwrap();

        let snapshot = state.snapshot().await;
        let message = snapshot.message("assistant-t1").unwrap();
        let knowledge_parts = message
            .parts
            .iter()
            .filter(|p| matches!(p, crate::message::MessagePart::Knowledge { .. }))
            .count();
        assert_eq!(knowledge_parts, 1);
        let items = message.knowledge().unwrap();
        assert_eq!(
            items.iter().map(|i| i.file_id.as_str()).collect::<Vec<_>>(),
            vec!["f1", "f2"]
        );
        assert_eq!(message.text(), Some("done"));
    }

    #[tokio::test]
    async fn test_knowledge_from_metadata() {
        let transport = Arc::new(ChannelTransport::new());
        transport
            .script(
                "s1",
                vec![
                    message_event(json!({
                        "op": "add",
                        "path": "/metadata/knowledge_retrieved",
                        "value": [{"file_id": "m1", "score": 0.7}]
                    })),
                    close_event(),
                ],
            )
            .await;
        let (mut session, state) = new_session(transport);

        session
            .start(pending_chat(), &StreamScope::default(), &CancellationToken::new())
            .await
            .unwrap();

        let snapshot = state.snapshot().await;
        let items = snapshot.message("assistant-t1").unwrap().knowledge().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].file_id, "m1");
    }
}
