//! Conversation controller: the public face of a chat session.
//!
//! Owns the session state, serializes turns (one in flight at a time), and
//! funnels every failure of a turn into a renderable failed assistant message.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::api::{Chat, ChatOptions, ChatInput, ChatStatus, CreateChatRequest, RegenerateRequest, StreamScope};
use crate::backend::{ChatApi, StreamTransport};
use crate::error::ChatError;
use crate::message::{Message, Role};
use crate::projector::Projector;
use crate::state::{GenerationParams, SessionState, SessionStatus, SharedState};
use crate::stream::StreamSession;
use crate::upload::{DisabledUploader, FileEntry, LocalFile, MemoryPreviews, PreviewStore, UploadStatus, Uploader};

/// Text shown in place of an answer when a turn fails
pub const FAILURE_APOLOGY: &str = "Sorry, something went wrong. Please try again.";

/// Session error recorded when a rehydrated conversation ended in a failed turn
pub const CHAT_FAILED: &str = "Chat failed";

/// Where the controller talks to and what it asks for by default
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub api_base: String,
    pub project_code: Option<String>,
    pub params: GenerationParams,
}

impl ChatConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            project_code: None,
            params: GenerationParams::default(),
        }
    }

    pub fn from_settings(settings: &config::Settings) -> Self {
        Self {
            api_base: settings.api_base.clone(),
            project_code: settings.project_code.clone(),
            params: GenerationParams {
                model: settings.model.clone(),
                credential_code: settings.credential_code.clone(),
                knowledge_codes: settings.knowledge_codes.clone(),
                options: ChatOptions {
                    temperature: settings.temperature,
                    top_p: settings.top_p,
                    window_size: settings.window_size,
                },
                streaming: settings.streaming,
                stateful: settings.stateful,
            },
        }
    }
}

/// How a turn ended
#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    Completed(Chat),
    /// Aborted by the caller; the session carries no error
    Cancelled,
    /// Recorded as the session error and rendered as a failed assistant message
    Failed(ChatError),
}

impl TurnOutcome {
    pub fn chat(&self) -> Option<&Chat> {
        match self {
            TurnOutcome::Completed(chat) => Some(chat),
            _ => None,
        }
    }
}

pub struct ChatController {
    config: ChatConfig,
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn StreamTransport>,
    uploader: Arc<dyn Uploader>,
    previews: Arc<dyn PreviewStore>,
    projector: Projector,
    state: SharedState,
    conversation: Mutex<()>,
}

impl ChatController {
    pub fn new(config: ChatConfig, api: Arc<dyn ChatApi>, transport: Arc<dyn StreamTransport>) -> Self {
        let projector = Projector::new(config.api_base.clone());
        let state = SharedState::new(SessionState {
            params: config.params.clone(),
            ..Default::default()
        });
        Self {
            config,
            api,
            transport,
            uploader: Arc::new(DisabledUploader),
            previews: Arc::new(MemoryPreviews::new()),
            projector,
            state,
            conversation: Mutex::new(()),
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>, previews: Arc<dyn PreviewStore>) -> Self {
        self.uploader = uploader;
        self.previews = previews;
        self
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    /// Change notifications for the rendering layer
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.state.subscribe()
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.read(SessionState::status).await
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.read(|s| s.messages.clone()).await
    }

    pub async fn error(&self) -> Option<ChatError> {
        self.state.read(|s| s.error.clone()).await
    }

    pub async fn conversation_code(&self) -> Option<String> {
        self.state.read(|s| s.conversation_code.clone()).await
    }

    pub async fn last_chat_id(&self) -> Option<String> {
        self.state.read(|s| s.last_chat_id.clone()).await
    }

    pub async fn set_prompt(&self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.state.update(|s| s.prompt = prompt).await;
    }

    /// Change model selection, references, modes or generation options for later turns.
    pub async fn update_params(&self, f: impl FnOnce(&mut GenerationParams)) {
        self.state.update(|s| f(&mut s.params)).await;
    }

    pub async fn params(&self) -> GenerationParams {
        self.state.read(|s| s.params.clone()).await
    }

    /// Rehydrate the session from the history of `conversation_code`.
    ///
    /// A last turn still `PENDING` is resumed and awaited; its outcome is returned.
    #[instrument(level = "info", skip(self))]
    pub async fn open(&self, conversation_code: &str) -> Result<Option<TurnOutcome>, ChatError> {
        let scope = StreamScope::new(self.config.project_code.clone(), Some(conversation_code.to_string()));
        let chats = self
            .api
            .list_messages(&scope)
            .await
            .map_err(ChatError::from_anyhow)?;
        info!("Loaded {} turns of conversation {}", chats.len(), conversation_code);

        let projector = &self.projector;
        let last = chats.last().cloned();
        self.state
            .update(|s| {
                s.conversation_code = Some(conversation_code.to_string());
                s.messages.clear();
                for chat in &chats {
                    let (user, assistant) = projector.project(chat);
                    s.messages.push(user);
                    s.messages.push(assistant);
                    s.last_chat_id = Some(chat.id.clone());
                }
                if let Some(last) = &last {
                    s.params.credential_code = last.credential_code.clone();
                    s.params.knowledge_codes = last.knowledge_codes.clone();
                    if last.status == ChatStatus::Failed {
                        s.error = Some(ChatError::stream(CHAT_FAILED, None));
                    }
                }
            })
            .await;

        match last {
            Some(chat) if chat.status == ChatStatus::Pending && chat.stream_id.is_some() => {
                info!("Resuming pending turn {}", chat.id);
                let cancel = self.begin_turn().await?;
                let turn_id = chat.id.clone();
                let result = self.stream_turn(chat, &scope, &cancel).await;
                Ok(Some(self.settle(Some(turn_id), result).await))
            }
            _ => Ok(None),
        }
    }

    /// Create the conversation on first use; returns its code.
    pub async fn ensure_conversation(&self) -> Result<String, ChatError> {
        let _guard = self.conversation.lock().await;
        if let Some(code) = self.conversation_code().await {
            return Ok(code);
        }
        let conversation = self
            .api
            .create_conversation(self.config.project_code.as_deref())
            .await
            .map_err(ChatError::from_anyhow)?;
        info!("Created conversation {}", conversation.code);
        let code = conversation.code.clone();
        self.state.update(|s| s.conversation_code = Some(conversation.code)).await;
        Ok(code)
    }

    /// Send a new turn and follow it to completion.
    ///
    /// Only validation failures are returned as `Err`; everything that goes
    /// wrong on the network is reported through the outcome and the session state.
    #[instrument(level = "info", skip(self, prompt, file_ids), fields(files = file_ids.len()))]
    pub async fn submit(&self, prompt: &str, file_ids: Vec<String>) -> Result<TurnOutcome, ChatError> {
        let content = prompt.trim().to_string();
        if content.is_empty() && file_ids.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        let cancel = self.begin_turn().await?;

        let result: Result<Chat, ChatError> = async {
            let conversation_code = self.cancellable(&cancel, self.ensure_conversation()).await?;
            self.clear_input().await;

            let scope = self.scope(Some(conversation_code));
            let request = self.chat_request(content, file_ids).await;
            debug!("Creating chat with model {}", request.model);
            let chat = self
                .cancellable(&cancel, async {
                    self.api
                        .create_chat(&scope, &request)
                        .await
                        .map_err(ChatError::from_anyhow)
                })
                .await?;
            info!("Created chat {}", chat.id);

            let user = self.projector.user_message(&chat);
            let chat_id = chat.id.clone();
            self.state
                .update(|s| {
                    s.upsert_message(user);
                    s.last_chat_id = Some(chat_id);
                })
                .await;

            self.stream_turn(chat, &scope, &cancel).await
        }
        .await;

        Ok(self.settle(None, result).await)
    }

    /// Submit the prompt draft with every uploaded attachment, once uploads settle.
    pub async fn send(&self) -> Result<TurnOutcome, ChatError> {
        self.wait_for_uploads().await;
        let (prompt, file_ids) = self
            .state
            .read(|s| {
                let ids = s.uploaded_files().into_iter().map(|f| f.id).collect::<Vec<_>>();
                (s.prompt.clone(), ids)
            })
            .await;
        self.submit(&prompt, file_ids).await
    }

    /// Ask the backend to answer an existing turn again.
    #[instrument(level = "info", skip(self))]
    pub async fn regenerate(&self, turn_id: &str) -> Result<TurnOutcome, ChatError> {
        let cancel = self.begin_turn().await?;

        let result: Result<Chat, ChatError> = async {
            let conversation_code = self.conversation_code().await;
            let scope = self.scope(conversation_code);
            let request = self
                .state
                .read(|s| RegenerateRequest {
                    stateful: s.params.stateful,
                    streaming: s.params.streaming,
                })
                .await;
            let chat = self
                .cancellable(&cancel, async {
                    self.api
                        .regenerate_chat(&scope, turn_id, &request)
                        .await
                        .map_err(ChatError::from_anyhow)
                })
                .await?;
            info!("Regenerating chat {}", chat.id);
            self.stream_turn(chat, &scope, &cancel).await
        }
        .await;

        Ok(self.settle(Some(turn_id.to_string()), result).await)
    }

    /// Abort the turn in flight and terminate its stream on the server.
    #[instrument(level = "info", skip(self))]
    pub async fn stop(&self) {
        let (abort, stream_id, conversation_code) = self
            .state
            .read(|s| (s.abort.clone(), s.stream_id.clone(), s.conversation_code.clone()))
            .await;
        if let Some(abort) = abort {
            abort.cancel();
        }
        if let Some(stream_id) = stream_id {
            let scope = self.scope(conversation_code);
            if let Err(e) = self.api.stop_stream(&scope, &stream_id).await {
                warn!("Failed to stop stream {}: {:#}", stream_id, e);
            }
            self.state
                .update(|s| {
                    if s.stream_id.as_deref() == Some(stream_id.as_str()) {
                        s.stream_id = None;
                    }
                })
                .await;
        }
        self.state
            .update(|s| {
                s.streaming = false;
                s.live_message = None;
            })
            .await;
    }

    /// Queue files and upload them one after another.
    ///
    /// Returns the local entry ids. A failed upload marks only its own entry.
    pub async fn add_files(&self, files: Vec<LocalFile>) -> Vec<String> {
        let entries = files
            .into_iter()
            .map(|file| {
                let preview = self.previews.create(&file);
                FileEntry::new(file, preview)
            })
            .collect::<Vec<_>>();
        let queued = entries
            .iter()
            .map(|e| (e.id.clone(), e.file.clone()))
            .collect::<Vec<_>>();
        self.state.update(|s| s.files.extend(entries)).await;

        for (id, file) in &queued {
            let result = self.uploader.upload(file).await;
            let still_queued = self
                .state
                .update(|s| {
                    let Some(entry) = s.files.iter_mut().find(|f| &f.id == id) else {
                        return false;
                    };
                    match &result {
                        Ok(uploaded) => entry.mark_uploaded(uploaded.clone()),
                        Err(e) => entry.mark_failed(format!("{:#}", e)),
                    }
                    true
                })
                .await;
            match result {
                Ok(uploaded) if still_queued => info!("Uploaded {} as {}", file.name, uploaded.id),
                Ok(_) => debug!("Uploaded {} after it was removed from the queue", file.name),
                Err(e) => {
                    let failure = ChatError::Upload {
                        file: file.name.clone(),
                        message: format!("{:#}", e),
                    };
                    error!("{}", failure);
                }
            }
        }
        queued.into_iter().map(|(id, _)| id).collect()
    }

    /// Drop one entry from the upload queue and release its preview.
    pub async fn remove_file(&self, id: &str) -> bool {
        let removed = self
            .state
            .update(|s| {
                let index = s.files.iter().position(|f| f.id == id)?;
                Some(s.files.remove(index))
            })
            .await;
        let Some(entry) = removed else {
            return false;
        };
        self.previews.revoke(&entry.preview);
        if entry.status == UploadStatus::Uploading {
            if let Err(e) = self.uploader.terminate(&entry.file).await {
                warn!("Failed to terminate upload of {}: {:#}", entry.file.name, e);
            }
        }
        true
    }

    pub async fn clear_files(&self) {
        let removed = self.state.update(|s| std::mem::take(&mut s.files)).await;
        for entry in &removed {
            self.previews.revoke(&entry.preview);
        }
    }

    pub async fn files(&self) -> Vec<FileEntry> {
        self.state.read(|s| s.files.clone()).await
    }

    pub async fn is_uploading(&self) -> bool {
        self.state.read(SessionState::is_uploading).await
    }

    pub async fn user_message(&self, turn_id: &str) -> Option<Message> {
        self.state
            .read(|s| s.turn_message(Role::User, turn_id).cloned())
            .await
    }

    pub async fn assistant_message(&self, turn_id: &str) -> Option<Message> {
        self.state
            .read(|s| s.turn_message(Role::Assistant, turn_id).cloned())
            .await
    }

    pub async fn remove_user_message(&self, turn_id: &str) -> Option<Message> {
        let id = Message::id_for(Role::User, turn_id);
        self.state.update(|s| s.remove_message(&id)).await
    }

    pub async fn remove_assistant_message(&self, turn_id: &str) -> Option<Message> {
        let id = Message::id_for(Role::Assistant, turn_id);
        self.state.update(|s| s.remove_message(&id)).await
    }

    async fn begin_turn(&self) -> Result<CancellationToken, ChatError> {
        self.state
            .update(|s| {
                if s.loading {
                    return Err(ChatError::EmptyPrompt);
                }
                let cancel = CancellationToken::new();
                s.loading = true;
                s.error = None;
                s.abort = Some(cancel.clone());
                Ok(cancel)
            })
            .await
    }

    async fn stream_turn(
        &self,
        chat: Chat,
        scope: &StreamScope,
        cancel: &CancellationToken,
    ) -> Result<Chat, ChatError> {
        if chat.stream_id.is_none() {
            let assistant = self.projector.assistant_message(&chat);
            self.state.update(|s| s.upsert_message(assistant)).await;
            return Ok(chat);
        }
        let mut session = StreamSession::new(self.state.clone(), self.transport.clone(), self.projector.clone());
        session.start(chat, scope, cancel).await
    }

    /// Close the turn in flight and turn its result into an outcome.
    async fn settle(&self, turn_id: Option<String>, result: Result<Chat, ChatError>) -> TurnOutcome {
        match result {
            Ok(chat) => {
                self.state
                    .update(|s| {
                        s.loading = false;
                        s.abort = None;
                    })
                    .await;
                info!("Chat {} finished with status {:?}", chat.id, chat.status);
                TurnOutcome::Completed(chat)
            }
            Err(e) if e.is_abort() => {
                info!("{}", e);
                self.state
                    .update(|s| {
                        s.loading = false;
                        s.streaming = false;
                        s.live_message = None;
                        s.abort = None;
                    })
                    .await;
                TurnOutcome::Cancelled
            }
            Err(e) => {
                error!("Failed to complete chat: {}", e);
                let recorded = e.clone();
                self.state
                    .update(|s| {
                        let turn_id = turn_id
                            .or_else(|| s.last_chat_id.clone())
                            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                        let id = Message::id_for(Role::Assistant, &turn_id);
                        match s.message_mut(&id) {
                            Some(message) => {
                                message.metadata.id = turn_id;
                                message.metadata.status = ChatStatus::Failed;
                                if message.text().is_none_or(str::is_empty) {
                                    message.set_text(FAILURE_APOLOGY);
                                }
                            }
                            None => {
                                let mut message = Message::new(Role::Assistant, &turn_id, ChatStatus::Failed);
                                message.set_text(FAILURE_APOLOGY);
                                s.messages.push(message);
                            }
                        }
                        s.error = Some(recorded);
                        s.loading = false;
                        s.streaming = false;
                        s.stream_id = None;
                        s.live_message = None;
                        s.abort = None;
                    })
                    .await;
                TurnOutcome::Failed(e)
            }
        }
    }

    /// Race `fut` against the turn's cancellation token.
    async fn cancellable<T>(
        &self,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T, ChatError>>,
    ) -> Result<T, ChatError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ChatError::TransportAbort),
            result = fut => result,
        }
    }

    async fn clear_input(&self) {
        self.state.update(|s| s.prompt.clear()).await;
        self.clear_files().await;
    }

    async fn wait_for_uploads(&self) {
        let mut changes = self.subscribe();
        while self.is_uploading().await {
            debug!("Waiting for uploads to finish");
            if changes.changed().await.is_err() {
                break;
            }
        }
    }

    fn scope(&self, conversation_code: Option<String>) -> StreamScope {
        StreamScope::new(self.config.project_code.clone(), conversation_code)
    }

    async fn chat_request(&self, content: String, file_ids: Vec<String>) -> CreateChatRequest {
        self.state
            .read(|s| CreateChatRequest {
                model: s.params.model.clone(),
                credential_code: s.params.credential_code.clone(),
                knowledge_codes: s.params.knowledge_codes.clone(),
                message: ChatInput { content, file_ids },
                stateful: s.params.stateful,
                streaming: s.params.streaming,
                options: s.params.options.clone(),
            })
            .await
    }
}
