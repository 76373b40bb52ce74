//! 短期记忆：对话消息与有界历史

pub mod conversation;

pub use conversation::{ConversationMemory, Message, Role};
