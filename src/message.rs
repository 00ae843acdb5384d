//! UI-facing messages derived from chat documents.
//!
//! Messages are never patched directly. Each one is keyed by a stable id built
//! from the turn id and its role, so re-deriving a turn replaces its messages
//! instead of duplicating them.

use serde::{Deserialize, Serialize};

use crate::api::{ChatStatus, KnowledgeRetrievedItem};

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    File {
        #[serde(rename = "mediaType")]
        media_type: String,
        filename: String,
        url: String,
    },
    #[serde(rename = "data-knowledge")]
    Knowledge {
        data: Vec<KnowledgeRetrievedItem>,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MessageMetadata {
    /// Turn id
    pub id: String,
    pub status: ChatStatus,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(role: Role, turn_id: &str, status: ChatStatus) -> Self {
        Self {
            id: Self::id_for(role, turn_id),
            role,
            parts: Vec::new(),
            metadata: MessageMetadata {
                id: turn_id.to_string(),
                status,
            },
        }
    }

    pub fn id_for(role: Role, turn_id: &str) -> String {
        match role {
            Role::User => format!("user-{}", turn_id),
            Role::Assistant => format!("assistant-{}", turn_id),
        }
    }

    pub fn turn_id(&self) -> &str {
        &self.metadata.id
    }

    pub fn text(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            MessagePart::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            MessagePart::Reasoning { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn knowledge(&self) -> Option<&[KnowledgeRetrievedItem]> {
        self.parts.iter().find_map(|part| match part {
            MessagePart::Knowledge { data } => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn files(&self) -> impl Iterator<Item = &MessagePart> {
        self.parts
            .iter()
            .filter(|part| matches!(part, MessagePart::File { .. }))
    }

    /// Overwrite the text part, adding it if absent. Empty input is ignored.
    pub fn set_text(&mut self, value: &str) {
        if value.is_empty() {
            return;
        }
        match self.parts.iter_mut().find_map(|part| match part {
            MessagePart::Text { text } => Some(text),
            _ => None,
        }) {
            Some(text) => value.clone_into(text),
            None => self.parts.push(MessagePart::text(value)),
        }
    }

    /// Overwrite the reasoning part, adding it if absent. Empty input is ignored.
    pub fn set_reasoning(&mut self, value: &str) {
        if value.is_empty() {
            return;
        }
        match self.parts.iter_mut().find_map(|part| match part {
            MessagePart::Reasoning { text } => Some(text),
            _ => None,
        }) {
            Some(text) => value.clone_into(text),
            None => self.parts.push(MessagePart::Reasoning {
                text: value.to_string(),
            }),
        }
    }

    /// Replace the retrieved knowledge, adding the part if absent. Empty input is ignored.
    pub fn set_knowledge(&mut self, items: &[KnowledgeRetrievedItem]) {
        if items.is_empty() {
            return;
        }
        match self.parts.iter_mut().find_map(|part| match part {
            MessagePart::Knowledge { data } => Some(data),
            _ => None,
        }) {
            Some(data) => *data = items.to_vec(),
            None => self.parts.push(MessagePart::Knowledge {
                data: items.to_vec(),
            }),
        }
    }

    /// Drop every part and start over from a single empty text part.
    pub fn reset_text(&mut self) {
        self.parts = vec![MessagePart::text("")];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_derived_from_turn_and_role() {
        let user = Message::new(Role::User, "t1", ChatStatus::Pending);
        let assistant = Message::new(Role::Assistant, "t1", ChatStatus::Pending);
        assert_eq!(user.id, "user-t1");
        assert_eq!(assistant.id, "assistant-t1");
        assert_eq!(assistant.turn_id(), "t1");
    }

    #[test]
    fn test_empty_updates_are_noops() {
        let mut message = Message::new(Role::Assistant, "t1", ChatStatus::Pending);
        message.set_text("hello");
        message.set_reasoning("hmm");
        message.set_text("");
        message.set_reasoning("");
        message.set_knowledge(&[]);
        assert_eq!(message.text(), Some("hello"));
        assert_eq!(message.reasoning(), Some("hmm"));
        assert!(message.knowledge().is_none());
    }

    #[test]
    fn test_setters_update_in_place() {
        let mut message = Message::new(Role::Assistant, "t1", ChatStatus::Pending);
        message.reset_text();
        message.set_text("a");
        message.set_text("ab");
        message.set_reasoning("r");
        message.set_reasoning("rr");
        assert_eq!(message.parts.len(), 2);
        assert_eq!(message.text(), Some("ab"));
        assert_eq!(message.reasoning(), Some("rr"));
    }

    #[test]
    fn test_part_wire_format() {
        let part = MessagePart::File {
            media_type: "image/png".into(),
            filename: "a.png".into(),
            url: "http://x/files/thumbnail/f1".into(),
        };
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "file");
        assert_eq!(value["mediaType"], "image/png");

        let value = serde_json::to_value(MessagePart::Knowledge { data: vec![] }).unwrap();
        assert_eq!(value["type"], "data-knowledge");
    }
}
