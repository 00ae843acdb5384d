//! Session state of one open conversation view.
//!
//! The state lives behind [`SharedState`], which is the only way the stream
//! session and the controller write it. Every write bumps a revision on a
//! `watch` channel; the rendering layer subscribes to it and re-reads the
//! state instead of aliasing messages.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::api::{ChatOptions, DEFAULT_MODEL};
use crate::error::ChatError;
use crate::message::{Message, Role};
use crate::upload::{Attachment, FileEntry, UploadStatus};

/// What the UI should show for the session as a whole
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Ready,
    Submitted,
    Streaming,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Ready => "ready",
            SessionStatus::Submitted => "submitted",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Model selection and generation options sent with every turn
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub credential_code: Option<String>,
    pub knowledge_codes: Vec<String>,
    pub options: ChatOptions,
    pub streaming: bool,
    pub stateful: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            credential_code: None,
            knowledge_codes: Vec::new(),
            options: ChatOptions::default(),
            streaming: true,
            stateful: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionState {
    pub conversation_code: Option<String>,
    pub messages: Vec<Message>,
    /// Prompt draft
    pub prompt: String,
    /// Upload queue
    pub files: Vec<FileEntry>,
    pub params: GenerationParams,
    pub last_chat_id: Option<String>,
    /// Correlation id of the stream in flight
    pub stream_id: Option<String>,
    /// A turn request is in flight
    pub loading: bool,
    /// The stream of the current turn has delivered its first event
    pub streaming: bool,
    pub error: Option<ChatError>,
    /// Id of the message currently mutated by a stream
    pub live_message: Option<String>,
    /// Cancellation token of the turn in flight
    pub abort: Option<CancellationToken>,
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        if self.error.is_some() {
            SessionStatus::Error
        } else if self.streaming {
            SessionStatus::Streaming
        } else if self.loading {
            SessionStatus::Submitted
        } else {
            SessionStatus::Ready
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn turn_message(&self, role: Role, turn_id: &str) -> Option<&Message> {
        self.message(&Message::id_for(role, turn_id))
    }

    /// Replace the message with the same id, or append it.
    pub fn upsert_message(&mut self, message: Message) {
        match self.message_mut(&message.id) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
    }

    pub fn remove_message(&mut self, id: &str) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(index))
    }

    pub fn is_uploading(&self) -> bool {
        self.files.iter().any(|f| f.status == UploadStatus::Uploading)
    }

    pub fn uploaded_files(&self) -> Vec<Attachment> {
        self.files
            .iter()
            .filter(|f| f.status == UploadStatus::Uploaded)
            .filter_map(|f| {
                f.uploaded.as_ref().map(|uploaded| Attachment {
                    id: uploaded.id.clone(),
                    url: uploaded.url.clone(),
                    filename: f.file.name.clone(),
                    media_type: f.file.media_type.clone(),
                })
            })
            .collect()
    }
}

/// Handle to the session state shared by the controller and its stream sessions
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<SessionState>>,
    revision: Arc<watch::Sender<u64>>,
}

impl SharedState {
    pub fn new(state: SessionState) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(state)),
            revision: Arc::new(revision),
        }
    }

    pub async fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let state = self.inner.lock().await;
        f(&state)
    }

    /// Mutate the state and notify subscribers.
    pub async fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let result = {
            let mut state = self.inner.lock().await;
            f(&mut state)
        };
        self.revision.send_modify(|revision| *revision += 1);
        result
    }

    pub async fn snapshot(&self) -> SessionState {
        self.inner.lock().await.clone()
    }

    /// Change notifications; the value is a revision counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(SessionState::default())
    }
}
