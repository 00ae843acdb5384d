//! Derives renderable user/assistant messages from a chat document.

use crate::api::Chat;
use crate::message::{Message, MessagePart, Role};

#[derive(Clone, Debug)]
pub struct Projector {
    api_base: String,
}

impl Projector {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Retrieval URL for an uploaded file
    pub fn file_url(&self, file_id: &str) -> String {
        format!("{}/files/thumbnail/{}", self.api_base, file_id)
    }

    /// Prompt text followed by one file part per attachment.
    pub fn user_message(&self, chat: &Chat) -> Message {
        let mut message = Message::new(Role::User, &chat.id, chat.status);
        message.parts.push(MessagePart::text(chat.prompt.clone()));
        for file in &chat.files {
            message.parts.push(MessagePart::File {
                media_type: file.media_type.clone(),
                filename: file.name.clone(),
                url: self.file_url(&file.id),
            });
        }
        message
    }

    pub fn assistant_message(&self, chat: &Chat) -> Message {
        let mut message = Message::new(Role::Assistant, &chat.id, chat.status);
        message.parts.push(MessagePart::text(""));
        self.apply_assistant_parts(&mut message, chat);
        message
    }

    /// Refresh an assistant message from the current document.
    ///
    /// Each part type is updated in place; the text part always exists, the
    /// reasoning and knowledge parts appear once the document has content for them.
    pub fn apply_assistant_parts(&self, message: &mut Message, chat: &Chat) {
        message.set_text(chat.completion_text());
        message.set_reasoning(chat.reasoning_text());
        message.set_knowledge(chat.knowledge_items());
        message.metadata.status = chat.status;
    }

    pub fn project(&self, chat: &Chat) -> (Message, Message) {
        (self.user_message(chat), self.assistant_message(chat))
    }
}
