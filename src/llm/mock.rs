//! Mock 补全端点（用于测试，无需 API）
//!
//! 按脚本顺序吐出预置回复（也可预置端点错误），便于测试多轮循环与失败关闭路径；
//! 脚本耗尽后回落到一个 finish 动作。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmReply};
use crate::memory::Message;

/// Mock 客户端：依次返回预置回复或预置错误；记录最近一次收到的消息供断言
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<LlmReply, String>>>,
    captured: Mutex<Vec<Message>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以文本脚本构造（每条作为一次 complete 的正文）
    pub fn scripted(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            script: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| Ok(LlmReply::text(r)))
                    .collect(),
            ),
            captured: Mutex::new(Vec::new()),
        }
    }

    /// 最近一次 complete 收到的完整消息列表
    pub fn last_messages(&self) -> Vec<Message> {
        self.captured.lock().unwrap().clone()
    }

    pub fn push_reply(&self, reply: LlmReply) {
        self.script.lock().unwrap().push_back(Ok(reply));
    }

    /// 预置一次端点故障（网络错误等传输层失败）
    pub fn push_error(&self, error: impl Into<String>) {
        self.script.lock().unwrap().push_back(Err(error.into()));
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<LlmReply, String> {
        *self.captured.lock().unwrap() = messages.to_vec();
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => Ok(LlmReply::text(
                r#"{"thought": "nothing scripted", "action": {"tool": "finish", "params": {"message": "done"}}}"#,
            )),
        }
    }
}
