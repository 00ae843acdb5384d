//! Wire records exchanged with the chat backend.
//!
//! `Chat` is the unit of synchronization for one turn. While a turn streams,
//! its response facet is only ever changed through patches, so every field
//! here must survive a round trip through `serde_json::Value` untouched.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Model used when the caller did not select one.
pub const DEFAULT_MODEL: &str = "openrouter/x-ai/grok-4.1-fast";

#[derive(Copy, Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChatOptions {
    pub temperature: f64,
    pub top_p: f64,
    pub window_size: u32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            window_size: 20,
        }
    }
}

/// A file attached to a turn
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct KnowledgeRetrievedItem {
    #[serde(default)]
    pub project_code: String,
    #[serde(default)]
    pub knowledge_code: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub chunk_content: String,
    #[serde(default)]
    pub chunk_number: u32,
    #[serde(default)]
    pub embedding_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub score: f64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ChatMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_retrieved: Option<Vec<KnowledgeRetrievedItem>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The chat document for one turn.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Chat {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub project_code: String,
    #[serde(
        default,
        deserialize_with = "code_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_code: Option<String>,
    /// Correlation id of the push channel, present while the turn is in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub model: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: ChatOptions,
    #[serde(default, deserialize_with = "null_as_default")]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reasoning_chunks: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub completion_chunks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_retrieved: Option<Vec<KnowledgeRetrievedItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub status: ChatStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChatMetadata>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<FileRecord>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub knowledge_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Recompute `reasoning` and `completion` from their fragment lists.
    pub fn materialize(&mut self) {
        self.reasoning = Some(self.reasoning_chunks.concat());
        self.completion = Some(self.completion_chunks.concat());
    }

    /// Retrieved knowledge, wherever the backend placed it
    pub fn knowledge_items(&self) -> &[KnowledgeRetrievedItem] {
        if let Some(items) = &self.knowledge_retrieved {
            return items;
        }
        self.metadata
            .as_ref()
            .and_then(|m| m.knowledge_retrieved.as_deref())
            .unwrap_or(&[])
    }

    pub fn reasoning_text(&self) -> &str {
        self.reasoning.as_deref().unwrap_or("")
    }

    pub fn completion_text(&self) -> &str {
        self.completion.as_deref().unwrap_or("")
    }
}

/// `null` decodes like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Conversation codes have been sent both as strings and as numbers.
fn code_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Conversation {
    pub code: String,
    #[serde(default)]
    pub project_code: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub status: Option<ChatStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ChatInput {
    pub content: String,
    pub file_ids: Vec<String>,
}

/// Body of `POST /chat`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CreateChatRequest {
    pub model: String,
    pub credential_code: Option<String>,
    pub knowledge_codes: Vec<String>,
    pub message: ChatInput,
    pub stateful: bool,
    pub streaming: bool,
    pub options: ChatOptions,
}

/// Body of `PUT /chat/{id}`
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct RegenerateRequest {
    pub stateful: bool,
    pub streaming: bool,
}

/// Project and conversation a request is scoped to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamScope {
    pub project_code: Option<String>,
    pub conversation_code: Option<String>,
}

impl StreamScope {
    pub fn new(project_code: Option<String>, conversation_code: Option<String>) -> Self {
        Self {
            project_code,
            conversation_code,
        }
    }

    /// Query parameters carried by every scoped request
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(project) = &self.project_code {
            query.push(("project_code", project.clone()));
        }
        if let Some(conversation) = &self.conversation_code {
            query.push(("conversation_code", conversation.clone()));
        }
        query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_keeps_unknown_fields() {
        let value = json!({
            "id": "c1",
            "conversation_code": 42,
            "status": "PENDING",
            "stream_id": "s1",
            "user_code": 7,
            "output_parts": []
        });
        let chat: Chat = serde_json::from_value(value).unwrap();
        assert_eq!(chat.conversation_code.as_deref(), Some("42"));
        assert_eq!(chat.stream_id.as_deref(), Some("s1"));
        assert_eq!(chat.extra.get("user_code"), Some(&json!(7)));

        let back = serde_json::to_value(&chat).unwrap();
        assert_eq!(back["output_parts"], json!([]));
    }

    #[test]
    fn test_null_collections_decode_as_empty() {
        let chat: Chat = serde_json::from_str(
            r#"{"id":"t","reasoning_chunks":null,"completion_chunks":null,"files":null,
                "knowledge_codes":null,"options":null,"prompt":null,"status":"PENDING"}"#,
        )
        .unwrap();
        assert!(chat.reasoning_chunks.is_empty());
        assert!(chat.completion_chunks.is_empty());
        assert!(chat.files.is_empty());
        assert!(chat.knowledge_codes.is_empty());
        assert_eq!(chat.options, ChatOptions::default());
        assert_eq!(chat.prompt, "");
    }

    #[test]
    fn test_absent_options_are_not_written() {
        let value = serde_json::to_value(Chat::new("c1")).unwrap();
        let object = value.as_object().unwrap();
        for key in ["knowledge_retrieved", "error_message", "stream_id", "metadata", "completion"] {
            assert!(!object.contains_key(key), "{} should be omitted", key);
        }
        assert_eq!(value["completion_chunks"], serde_json::json!([]));
    }

    #[test]
    fn test_materialize_concatenates_fragments() {
        let mut chat = Chat::new("c1");
        chat.reasoning_chunks = vec!["Let me".into(), " think".into()];
        chat.completion_chunks = vec!["The".into(), " answer".into(), " is 4".into()];
        chat.materialize();
        assert_eq!(chat.reasoning_text(), "Let me think");
        assert_eq!(chat.completion_text(), "The answer is 4");
    }

    #[test]
    fn test_knowledge_falls_back_to_metadata() {
        let chat: Chat = serde_json::from_value(json!({
            "id": "c1",
            "metadata": {"knowledge_retrieved": [{"file_id": "f1", "score": 0.9}]}
        }))
        .unwrap();
        assert_eq!(chat.knowledge_items().len(), 1);
        assert_eq!(chat.knowledge_items()[0].file_id, "f1");
    }

    #[test]
    fn test_scope_query() {
        let scope = StreamScope::new(Some("p1".into()), None);
        assert_eq!(scope.query(), vec![("project_code", "p1".to_string())]);
    }
}
