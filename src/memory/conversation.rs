//! 短期记忆：单次循环会话的对话历史
//!
//! 每轮的补全请求由「系统提示 + 这里累积的历史」拼成，因此下一轮必须等
//! 当前轮的 Observation 写回后才开始。历史有界：超出容量时从首条用户消息
//! 之后开始丢弃最旧的消息 —— 首条用户消息是任务锚点（脱敏后的原始请求），
//! 剪枝永远保留它，否则长会话里模型会丢失任务本身。

use serde::{Deserialize, Serialize};

/// 消息角色（与补全端点的 role 字段一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 有界对话历史：容量为 max_turns*2（每轮一来一回），
/// 溢出时保留任务锚点并丢弃其后最旧的消息
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn prune(&mut self) {
        let cap = self.max_turns * 2;
        if cap < 2 || self.messages.len() <= cap {
            return;
        }
        let overflow = self.messages.len() - cap;
        // 锚点之后开始丢弃
        self.messages.drain(1..1 + overflow);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
