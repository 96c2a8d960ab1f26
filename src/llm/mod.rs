//! Conversation: prompt assembly and chat turns.

pub mod chat;
pub mod prompts;

pub use chat::{ChatReply, ChatService};
pub use prompts::{greeting_text, merge_context, InteractionContext, SYSTEM_PROMPT};
