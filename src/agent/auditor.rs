//! 审计器：动作执行前的独立审查
//!
//! 对每个提议动作发起一次额外的补全请求，按固定准则裁决：
//! 越出许可根目录的相对路径、无终止保证的代码、提权尝试一律拒绝；
//! 对话中已有完成证据时批准 finish。
//! 裁决解析复用解析器的长度优先 JSON 扫描，另留 "APPROVED"/"REJECT: ..." 文本兜底。
//! 失败关闭：审计自身的网络或解析故障一律返回拒绝，绝不放行。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::action::{scan_json_candidates, Action, FINISH_TOOL};
use crate::llm::LlmClient;
use crate::memory::{Message, Role};

/// 审计结论：每个提议动作恰好产生一次，从不静默重试
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditVerdict {
    pub fn approved() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

/// 审计快照提供者：当前已知文件/状态的紧凑视图
pub trait StateSnapshot: Send + Sync {
    fn known_files(&self) -> Vec<String>;
}

/// 无状态审查者：持有独立的补全端点与许可根目录
pub struct Auditor {
    llm: Arc<dyn LlmClient>,
    sandbox_root: String,
}

impl Auditor {
    pub fn new(llm: Arc<dyn LlmClient>, sandbox_root: impl Into<String>) -> Self {
        Self {
            llm,
            sandbox_root: sandbox_root.into(),
        }
    }

    fn rubric(&self, action: &Action, files_snapshot: &[String]) -> String {
        format!(
            "你是独立的安全审计员，审查一个数据处理智能体提出的下一步动作。\n\
             审查准则：\n\
             1. 文件路径必须在 {root} 之内；任何逃逸到 {root} 之外的相对或绝对路径，拒绝。\n\
             2. 代码必须有终止保证；出现无退出条件的循环、无限递归或等待外部输入，拒绝。\n\
             3. 任何提权尝试（子进程、网络外联、修改解释器环境），拒绝。\n\
             4. 若动作是 {finish} 且以上对话中已有任务完成的证据，批准。\n\
             当前沙箱内已知文件：{files}\n\
             待审动作：\n{action}\n\
             只输出一个 JSON 对象：{{\"approved\": true}} 或 {{\"approved\": false, \"reason\": \"原因\"}}。",
            root = self.sandbox_root,
            finish = FINISH_TOOL,
            files = if files_snapshot.is_empty() {
                "（无）".to_string()
            } else {
                files_snapshot.join(", ")
            },
            action = serde_json::to_string_pretty(action).unwrap_or_else(|_| format!("{:?}", action)),
        )
    }

    /// 审查一个提议动作。任何内部故障都折叠为拒绝（失败关闭）。
    pub async fn audit(
        &self,
        action: &Action,
        files_snapshot: &[String],
        dialogue: &[Message],
    ) -> AuditVerdict {
        let mut messages = vec![Message::system(self.rubric(action, files_snapshot))];
        messages.extend(re_anchor(dialogue));

        match self.llm.complete(&messages).await {
            Ok(reply) => parse_verdict(&reply.content)
                .unwrap_or_else(|| AuditVerdict::rejected("auditor reply was not parseable")),
            Err(e) => AuditVerdict::rejected(format!("auditor endpoint failure: {}", e)),
        }
    }
}

/// 裁剪并重新锚定历史：去掉 system，丢弃首个 user 之前的内容，
/// 合并连续同角色消息 —— 满足严格交替端点的角色不变量
pub(crate) fn re_anchor(dialogue: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    for msg in dialogue {
        if msg.role == Role::System {
            continue;
        }
        if out.is_empty() && msg.role != Role::User {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.role == msg.role => {
                last.content.push('\n');
                last.content.push_str(&msg.content);
            }
            _ => out.push(msg.clone()),
        }
    }
    out
}

/// 从审计回复提取结论：先 JSON 候选（长度降序），再关键词兜底
fn parse_verdict(content: &str) -> Option<AuditVerdict> {
    let mut candidates = scan_json_candidates(content);
    candidates.sort_by(|a, b| b.len().cmp(&a.len()));
    for candidate in candidates {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
            if let Some(approved) = value.get("approved").and_then(|a| a.as_bool()) {
                return Some(AuditVerdict {
                    approved,
                    reason: value
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .map(str::to_string),
                });
            }
        }
    }

    // 旧版文本格式兜底
    let upper = content.trim().to_uppercase();
    if upper.starts_with("APPROVED") {
        return Some(AuditVerdict::approved());
    }
    if let Some(rest) = upper.strip_prefix("REJECT") {
        let reason = rest.trim_start_matches([':', ' ']).trim();
        return Some(AuditVerdict::rejected(if reason.is_empty() {
            "rejected".to_string()
        } else {
            // 从原文取理由，避免大写化
            content
                .trim()
                .splitn(2, ':')
                .nth(1)
                .unwrap_or(reason)
                .trim()
                .to_string()
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn action() -> Action {
        Action::new("run_code", serde_json::json!({"code": "print(1)"}))
    }

    #[tokio::test]
    async fn test_json_verdict_approved() {
        let llm = Arc::new(MockLlmClient::scripted([r#"{"approved": true}"#]));
        let auditor = Auditor::new(llm, "/mnt");
        let verdict = auditor.audit(&action(), &[], &[]).await;
        assert!(verdict.approved);
    }

    #[tokio::test]
    async fn test_json_verdict_rejected_with_reason() {
        let llm = Arc::new(MockLlmClient::scripted([
            r#"审查意见如下 {"approved": false, "reason": "路径越界"}"#,
        ]));
        let auditor = Auditor::new(llm, "/mnt");
        let verdict = auditor.audit(&action(), &[], &[]).await;
        assert!(!verdict.approved);
        assert_eq!(verdict.reason.as_deref(), Some("路径越界"));
    }

    #[tokio::test]
    async fn test_legacy_keyword_fallback() {
        let llm = Arc::new(MockLlmClient::scripted(["APPROVED"]));
        let auditor = Auditor::new(llm, "/mnt");
        assert!(auditor.audit(&action(), &[], &[]).await.approved);

        let llm = Arc::new(MockLlmClient::scripted(["REJECT: 代码没有终止保证"]));
        let auditor = Auditor::new(llm, "/mnt");
        let verdict = auditor.audit(&action(), &[], &[]).await;
        assert!(!verdict.approved);
        assert_eq!(verdict.reason.as_deref(), Some("代码没有终止保证"));
    }

    #[tokio::test]
    async fn test_fail_closed_on_garbage() {
        let llm = Arc::new(MockLlmClient::scripted(["嗯，这个动作看起来还行吧"]));
        let auditor = Auditor::new(llm, "/mnt");
        assert!(!auditor.audit(&action(), &[], &[]).await.approved);
    }

    #[test]
    fn test_re_anchor_alternation() {
        let dialogue = vec![
            Message::system("sys"),
            Message::assistant("先到的助手消息"),
            Message::user("u1"),
            Message::user("u2"),
            Message::assistant("a1"),
        ];
        let anchored = re_anchor(&dialogue);
        assert_eq!(anchored.len(), 2);
        assert_eq!(anchored[0].role, Role::User);
        assert!(anchored[0].content.contains("u1"));
        assert!(anchored[0].content.contains("u2"));
        assert_eq!(anchored[1].role, Role::Assistant);
    }
}
