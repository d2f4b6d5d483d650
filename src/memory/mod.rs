//! Per-session conversation memory
//!
//! Each session owns its own state; nothing here is shared across sessions.

pub mod store;

pub use store::{ConversationState, MessageRole, Turn};
