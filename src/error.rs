use std::fmt;

/// Code attached to stream errors when the server does not supply one.
pub const DEFAULT_ERROR_CODE: &str = "E_UNKNOWN";

/// Errors raised while driving a chat turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Nothing to send, or a submission is already in flight
    EmptyPrompt,

    /// A `remove` (or `move`/`copy` source) addressed a path that does not exist
    PatchTargetMissing { path: String },

    /// A patch operation could not be applied to the document
    InvalidPatch { message: String },

    /// The server reported an error on the stream channel
    Stream { message: String, code: String },

    /// The caller cancelled the turn. Not an error for the session.
    TransportAbort,

    /// A single attachment failed to upload
    Upload { file: String, message: String },

    /// A payload or patched document could not be decoded
    Decode { message: String },

    /// Any other transport failure
    Request { message: String },
}

impl ChatError {
    pub fn stream(message: impl Into<String>, code: Option<String>) -> Self {
        ChatError::Stream {
            message: message.into(),
            code: code.unwrap_or_else(|| DEFAULT_ERROR_CODE.to_string()),
        }
    }

    /// Whether this is a benign client-side cancellation
    pub fn is_abort(&self) -> bool {
        matches!(self, ChatError::TransportAbort)
    }

    /// Server or client supplied code, used by the UI to style failures
    pub fn code(&self) -> &str {
        match self {
            ChatError::Stream { code, .. } => code,
            _ => DEFAULT_ERROR_CODE,
        }
    }

    /// Classify an error coming out of a collaborator call.
    ///
    /// `ChatError`s pass through untouched; anything else becomes a `Request` error.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<ChatError>() {
            Ok(chat_error) => chat_error,
            Err(other) => ChatError::Request {
                message: format!("{:#}", other),
            },
        }
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::EmptyPrompt => write!(f, "Prompt is required"),
            ChatError::PatchTargetMissing { path } => {
                write!(f, "Patch target missing: {}", path)
            }
            ChatError::InvalidPatch { message } => write!(f, "Invalid patch: {}", message),
            ChatError::Stream { message, .. } => write!(f, "{}", message),
            ChatError::TransportAbort => write!(f, "Chat response aborted"),
            ChatError::Upload { file, message } => {
                write!(f, "Upload of {} failed: {}", file, message)
            }
            ChatError::Decode { message } => write!(f, "Decode error: {}", message),
            ChatError::Request { message } => write!(f, "Request failed: {}", message),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Decode {
            message: err.to_string(),
        }
    }
}
