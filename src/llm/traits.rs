//! 补全端点抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::complete。回复除正文外可携带
//! 端点原生的结构化 tool call 字段，解析器优先使用该字段。

use async_trait::async_trait;

use crate::memory::Message;

/// 一次补全的回复：正文 + 可选的端点原生 tool call（`{"tool": ..., "params": ...}`）
#[derive(Debug, Clone, Default)]
pub struct LlmReply {
    pub content: String,
    pub tool_call: Option<serde_json::Value>,
}

impl LlmReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_call: None,
        }
    }
}

/// 补全端点 trait：调用方负责角色交替不变量（不出现连续同角色消息）
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<LlmReply, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
