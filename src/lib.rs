//! Client core for streamed, patch-synchronized chat turns.
//!
//! A [`controller::ChatController`] sends turns through a [`backend::ChatApi`],
//! follows each turn's push channel with a [`stream::StreamSession`] that folds
//! JSON patches into the turn's [`api::Chat`] document, and projects the result
//! into renderable [`message::Message`]s held in the shared session state.

pub mod api;
pub mod backend;
pub mod client;
pub mod controller;
pub mod error;
pub mod event_stream;
pub mod message;
pub mod patch;
pub mod projector;
pub mod state;
pub mod stream;
pub mod upload;

pub use api::{Chat, ChatStatus};
pub use controller::{ChatConfig, ChatController, TurnOutcome};
pub use error::ChatError;
pub use message::{Message, MessagePart, Role};
pub use state::{SessionStatus, SharedState};
