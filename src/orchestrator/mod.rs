//! 编排层：二阶循环
//!
//! 工具集不是沙箱代码执行，而是整个子循环：按种类委派一个完整的工作智能体，
//! 其最终解释作为 Observation 写回。委派严格串行（沙箱文件系统不支持并发写）。
//! search-shared-context 在既往委派结果的滚动摘要上做子串查找，原始数据行
//! 从不重发，token 体量有界。每步动作同样先过审计。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agent::action::{parse_model_reply, AgentStep, StepStatus, FINISH_TOOL};
use crate::agent::auditor::{AuditVerdict, Auditor};
use crate::agent::events::AgentEvent;
use crate::agent::loop_::{LoopController, LoopOutcome};
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::{ConversationMemory, Message};
use crate::privacy::Masker;

pub const DELEGATE_SPREADSHEET_TOOL: &str = "delegate-to-spreadsheet-agent";
pub const DELEGATE_DOCUMENT_TOOL: &str = "delegate-to-document-agent";
pub const SEARCH_SHARED_CONTEXT_TOOL: &str = "search-shared-context";

/// 摘要最大字符数（滚动摘要只存截断后的最终解释）
const SUMMARY_MAX_CHARS: usize = 500;

/// 委派的智能体种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegateKind {
    Spreadsheet,
    Document,
}

impl DelegateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegateKind::Spreadsheet => "spreadsheet",
            DelegateKind::Document => "document",
        }
    }

    fn from_tool(tool: &str) -> Option<Self> {
        match tool {
            DELEGATE_SPREADSHEET_TOOL => Some(DelegateKind::Spreadsheet),
            DELEGATE_DOCUMENT_TOOL => Some(DelegateKind::Document),
            _ => None,
        }
    }
}

/// 编排轮记录：与 AgentStep 同构，另带 agent_type 归属标签
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStep {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(flatten)]
    pub step: AgentStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditVerdict>,
}

/// 一次委派的滚动摘要条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationSummary {
    pub agent_type: String,
    pub instruction: String,
    pub summary: String,
}

/// 既往委派结果的共享上下文：只存摘要，支持子串检索
#[derive(Debug, Default)]
pub struct SharedContext {
    entries: Vec<DelegationSummary>,
}

impl SharedContext {
    pub fn record(
        &mut self,
        agent_type: impl Into<String>,
        instruction: impl Into<String>,
        summary: &str,
    ) {
        let truncated: String = summary.chars().take(SUMMARY_MAX_CHARS).collect();
        self.entries.push(DelegationSummary {
            agent_type: agent_type.into(),
            instruction: instruction.into(),
            summary: truncated,
        });
    }

    /// 子串查找：在指令与摘要上匹配，返回命中的条目渲染文本
    pub fn search(&self, query: &str) -> String {
        let hits: Vec<&DelegationSummary> = self
            .entries
            .iter()
            .filter(|e| e.instruction.contains(query) || e.summary.contains(query))
            .collect();
        if hits.is_empty() {
            return format!("共享上下文中没有匹配 \"{}\" 的记录", query);
        }
        hits.iter()
            .map(|e| format!("[{}] 指令: {} => {}", e.agent_type, e.instruction, e.summary))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn entries(&self) -> &[DelegationSummary] {
        &self.entries
    }
}

/// 委派执行者：把一条指令交给指定种类的工作循环跑完
#[async_trait]
pub trait Delegate: Send + Sync {
    async fn run(&self, kind: DelegateKind, instruction: &str) -> Result<LoopOutcome, AgentError>;
}

/// 基于 LoopController 的委派执行者：每种类一个控制器，
/// Mutex 串行化同种类的委派（沙箱状态不支持并发变更）
pub struct LoopDelegate {
    spreadsheet: Mutex<LoopController>,
    document: Mutex<LoopController>,
}

impl LoopDelegate {
    pub fn new(spreadsheet: LoopController, document: LoopController) -> Self {
        Self {
            spreadsheet: Mutex::new(spreadsheet),
            document: Mutex::new(document),
        }
    }
}

#[async_trait]
impl Delegate for LoopDelegate {
    async fn run(&self, kind: DelegateKind, instruction: &str) -> Result<LoopOutcome, AgentError> {
        match kind {
            DelegateKind::Spreadsheet => {
                let mut controller = self.spreadsheet.lock().await;
                controller.run(instruction, serde_json::Value::Null).await
            }
            DelegateKind::Document => {
                let mut controller = self.document.lock().await;
                controller.run(instruction, serde_json::Value::Null).await
            }
        }
    }
}

/// 编排边界配置：每次「工具调用」本身是一个多轮子循环，预算更小
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_turns: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_turns: 8 }
    }
}

/// 编排终态
#[derive(Debug)]
pub struct OrchestratorOutcome {
    pub final_report: Option<String>,
    pub error: Option<String>,
    pub steps: Vec<OrchestratorStep>,
}

impl OrchestratorOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 二阶循环控制器
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    auditor: Arc<Auditor>,
    delegate: Arc<dyn Delegate>,
    masker: Masker,
    config: OrchestratorConfig,
    cancel: CancellationToken,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        auditor: Arc<Auditor>,
        delegate: Arc<dyn Delegate>,
        masker: Masker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            llm,
            auditor,
            delegate,
            masker,
            config: OrchestratorConfig::default(),
            cancel,
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, ev: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "你是任务编排器，把用户任务拆解并委派给专职智能体。每轮只输出一个 JSON 对象：\n\
             {{\"thought\": \"...\", \"action\": {{\"tool\": \"工具名\", \"params\": {{...}}}}}}\n\
             可用工具：\n\
             - {ds}: params {{\"instruction\": \"交给表格智能体的完整指令\"}}\n\
             - {dd}: params {{\"instruction\": \"交给文档智能体的完整指令\"}}\n\
             - {sc}: params {{\"query\": \"在既往委派结果摘要中检索的子串\"}}\n\
             - {fin}: params {{\"message\": \"面向用户的最终汇总报告\"}}\n\
             委派是阻塞的：一个子任务完成后才能发起下一个。",
            ds = DELEGATE_SPREADSHEET_TOOL,
            dd = DELEGATE_DOCUMENT_TOOL,
            sc = SEARCH_SHARED_CONTEXT_TOOL,
            fin = FINISH_TOOL,
        )
    }

    fn vocabulary() -> Vec<String> {
        vec![
            DELEGATE_SPREADSHEET_TOOL.to_string(),
            DELEGATE_DOCUMENT_TOOL.to_string(),
            SEARCH_SHARED_CONTEXT_TOOL.to_string(),
            FINISH_TOOL.to_string(),
        ]
    }

    /// 运行一次编排会话。委派串行执行；子循环的最终解释作为 Observation 写回。
    pub async fn run(&mut self, user_prompt: &str) -> Result<OrchestratorOutcome, AgentError> {
        let system = self.system_prompt();
        let vocabulary = Self::vocabulary();
        let mut conversation = ConversationMemory::new(self.config.max_turns);
        conversation.push(Message::user(self.masker.mask(user_prompt)));

        let mut shared_context = SharedContext::default();
        let mut steps: Vec<OrchestratorStep> = Vec::new();

        for turn in 0..self.config.max_turns {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            self.emit(AgentEvent::TurnUpdate {
                turn,
                max_turns: self.config.max_turns,
            });
            self.emit(AgentEvent::Thinking);

            let mut messages = vec![Message::system(system.clone())];
            messages.extend(conversation.messages().iter().cloned());

            let reply = match self.llm.complete(&messages).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(turn, error = %e, "orchestrator completion failed");
                    self.emit(AgentEvent::Error {
                        text: format!("completion endpoint failure: {}", e),
                    });
                    continue;
                }
            };

            let parsed = parse_model_reply(&reply, &vocabulary);
            conversation.push(Message::assistant(reply.content.clone()));

            let Some(action) = parsed.action else {
                let feedback = "上一轮没有可执行的委派动作，请输出一个 JSON 动作对象。";
                conversation.push(Message::user(feedback.to_string()));
                continue;
            };

            let agent_type = DelegateKind::from_tool(&action.tool).map(|k| k.as_str().to_string());
            let mut step = AgentStep::new(parsed.thought, parsed.speak, action.clone());
            step.status = StepStatus::AwaitingApproval;
            steps.push(OrchestratorStep {
                agent_type: agent_type.clone(),
                step,
                audit: None,
            });
            self.emit(AgentEvent::ActionProposed {
                tool: action.tool.clone(),
                params: action.params.clone(),
            });

            let verdict = self
                .auditor
                .audit(&action, &[], conversation.messages())
                .await;
            self.emit(AgentEvent::AuditVerdict {
                approved: verdict.approved,
                reason: verdict.reason.clone(),
            });
            let approved = verdict.approved;
            let reason = verdict.reason.clone();
            if let Some(last) = steps.last_mut() {
                last.step.status = if approved {
                    StepStatus::Executing
                } else {
                    StepStatus::Rejected
                };
                last.audit = Some(verdict);
            }
            if !approved {
                conversation.push(Message::user(format!(
                    "提议的委派被审计拒绝：{}。请换一种拆解方式。",
                    reason.unwrap_or_else(|| "无理由".to_string())
                )));
                continue;
            }

            if action.tool == FINISH_TOOL {
                let message = action
                    .params
                    .get("message")
                    .or_else(|| action.params.get("summary"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("任务完成")
                    .to_string();
                let display = self.masker.unmask(&message);
                if let Some(last) = steps.last_mut() {
                    last.step.status = StepStatus::Completed;
                }
                self.emit(AgentEvent::Final {
                    text: display.clone(),
                });
                return Ok(OrchestratorOutcome {
                    final_report: Some(display),
                    error: None,
                    steps,
                });
            }

            let observation = self
                .dispatch(&action.tool, &action.params, &mut shared_context)
                .await;
            if let Some(last) = steps.last_mut() {
                last.step.observation = Some(observation.clone());
                last.step.status = StepStatus::Completed;
            }
            let preview: String = observation.chars().take(200).collect();
            self.emit(AgentEvent::Observation {
                tool: action.tool.clone(),
                preview,
            });
            // 回传给编排模型的文本重新进入脱敏会话
            let masked = self.masker.mask(&observation);
            conversation.push(Message::user(format!(
                "Observation from {}: {}",
                action.tool, masked
            )));
        }

        let msg = AgentError::TurnBudgetExhausted(self.config.max_turns).to_string();
        self.emit(AgentEvent::Error { text: msg.clone() });
        Ok(OrchestratorOutcome {
            final_report: None,
            error: Some(msg),
            steps,
        })
    }

    /// 执行一个已批准的编排动作；可恢复失败折叠为 Observation 文本
    async fn dispatch(
        &mut self,
        tool: &str,
        params: &serde_json::Value,
        shared_context: &mut SharedContext,
    ) -> String {
        if let Some(kind) = DelegateKind::from_tool(tool) {
            let instruction = params
                .get("instruction")
                .or_else(|| params.get("task"))
                .and_then(|i| i.as_str())
                .unwrap_or_default();
            if instruction.is_empty() {
                return "Error: 委派缺少 instruction 参数".to_string();
            }
            // 指令离开本脱敏会话，还原后交给子循环（子循环自带脱敏）
            let instruction = self.masker.unmask(instruction);
            self.emit(AgentEvent::Delegation {
                agent_type: kind.as_str().to_string(),
                instruction: instruction.clone(),
            });
            return match self.delegate.run(kind, &instruction).await {
                Ok(outcome) => {
                    let summary = outcome
                        .final_explanation
                        .or(outcome.error)
                        .unwrap_or_else(|| "子任务没有产生结果".to_string());
                    shared_context.record(kind.as_str(), instruction, &summary);
                    summary
                }
                Err(e) => format!("Error: 委派执行失败: {}", e),
            };
        }

        if tool == SEARCH_SHARED_CONTEXT_TOOL {
            let query = params
                .get("query")
                .and_then(|q| q.as_str())
                .unwrap_or_default();
            return shared_context.search(query);
        }

        format!("Error: 未知的编排工具 {}", tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmReply, MockLlmClient};
    use crate::trace::TraceLogger;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeDelegate {
        instructions: std::sync::Mutex<Vec<(DelegateKind, String)>>,
        in_flight: AtomicBool,
        overlap: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeDelegate {
        fn new() -> Self {
            Self {
                instructions: std::sync::Mutex::new(Vec::new()),
                in_flight: AtomicBool::new(false),
                overlap: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Delegate for FakeDelegate {
        async fn run(
            &self,
            kind: DelegateKind,
            instruction: &str,
        ) -> Result<LoopOutcome, AgentError> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlap.store(true, Ordering::SeqCst);
            }
            tokio::task::yield_now().await;
            self.in_flight.store(false, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.instructions
                .lock()
                .unwrap()
                .push((kind, instruction.to_string()));
            Ok(LoopOutcome {
                final_explanation: Some(format!("{} 子任务完成: {}", kind.as_str(), instruction)),
                error: None,
                trace: TraceLogger::new(instruction, serde_json::Value::Null).into_session(),
            })
        }
    }

    fn approving_auditor() -> Arc<Auditor> {
        let llm = MockLlmClient::new();
        for _ in 0..32 {
            llm.push_reply(LlmReply::text(r#"{"approved": true}"#));
        }
        Arc::new(Auditor::new(Arc::new(llm), "/mnt"))
    }

    fn orchestrator(llm: Arc<MockLlmClient>, delegate: Arc<FakeDelegate>) -> Orchestrator {
        Orchestrator::new(
            llm,
            approving_auditor(),
            delegate,
            Masker::new(Vec::new(), Vec::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_delegation_then_finish() {
        let llm = Arc::new(MockLlmClient::scripted([
            r#"{"thought":"先处理表格","action":{"tool":"delegate-to-spreadsheet-agent","params":{"instruction":"核对两张账目表"}}}"#,
            r#"{"thought":"汇总","action":{"tool":"finish","params":{"message":"账目核对完毕"}}}"#,
        ]));
        let delegate = Arc::new(FakeDelegate::new());
        let mut orch = orchestrator(llm, Arc::clone(&delegate));
        let outcome = orch.run("核对账目").await.unwrap();
        assert_eq!(outcome.final_report.as_deref(), Some("账目核对完毕"));
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 1);
        let recorded = delegate.instructions.lock().unwrap();
        assert_eq!(recorded[0].0, DelegateKind::Spreadsheet);
        assert_eq!(recorded[0].1, "核对两张账目表");
        // 委派步骤带归属标签
        assert_eq!(outcome.steps[0].agent_type.as_deref(), Some("spreadsheet"));
        assert!(outcome.steps[0]
            .step
            .observation
            .as_deref()
            .unwrap()
            .contains("子任务完成"));
    }

    #[tokio::test]
    async fn test_search_shared_context_finds_prior_summary() {
        let llm = Arc::new(MockLlmClient::scripted([
            r#"{"thought":"","action":{"tool":"delegate-to-document-agent","params":{"instruction":"提取合同要点"}}}"#,
            r#"{"thought":"","action":{"tool":"search-shared-context","params":{"query":"合同"}}}"#,
            r#"{"thought":"","action":{"tool":"finish","params":{"message":"done"}}}"#,
        ]));
        let delegate = Arc::new(FakeDelegate::new());
        let mut orch = orchestrator(llm, delegate);
        let outcome = orch.run("处理合同").await.unwrap();
        let search_obs = outcome.steps[1].step.observation.as_deref().unwrap();
        assert!(search_obs.contains("document"));
        assert!(search_obs.contains("提取合同要点"));
    }

    #[tokio::test]
    async fn test_search_without_match_reports_empty() {
        let ctx = SharedContext::default();
        assert!(ctx.search("不存在").contains("没有匹配"));
    }

    #[tokio::test]
    async fn test_delegations_are_serialized() {
        let llm = Arc::new(MockLlmClient::scripted([
            r#"{"thought":"","action":{"tool":"delegate-to-spreadsheet-agent","params":{"instruction":"任务一"}}}"#,
            r#"{"thought":"","action":{"tool":"delegate-to-document-agent","params":{"instruction":"任务二"}}}"#,
            r#"{"thought":"","action":{"tool":"finish","params":{"message":"done"}}}"#,
        ]));
        let delegate = Arc::new(FakeDelegate::new());
        let mut orch = orchestrator(llm, Arc::clone(&delegate));
        let outcome = orch.run("两个子任务").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 2);
        assert!(!delegate.overlap.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_fatal() {
        let llm = Arc::new(MockLlmClient::new());
        for _ in 0..8 {
            llm.push_reply(LlmReply::text(
                r#"{"thought":"","action":{"tool":"search-shared-context","params":{"query":"x"}}}"#,
            ));
        }
        let delegate = Arc::new(FakeDelegate::new());
        let mut orch = orchestrator(llm, delegate).with_config(OrchestratorConfig { max_turns: 3 });
        let outcome = orch.run("p").await.unwrap();
        assert!(!outcome.is_success());
        assert!(outcome.error.as_deref().unwrap().contains("budget"));
        assert_eq!(outcome.steps.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_instruction_is_observation_not_crash() {
        let llm = Arc::new(MockLlmClient::scripted([
            r#"{"thought":"","action":{"tool":"delegate-to-spreadsheet-agent","params":{}}}"#,
            r#"{"thought":"","action":{"tool":"finish","params":{"message":"done"}}}"#,
        ]));
        let delegate = Arc::new(FakeDelegate::new());
        let mut orch = orchestrator(llm, Arc::clone(&delegate));
        let outcome = orch.run("p").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 0);
        assert!(outcome.steps[0]
            .step
            .observation
            .as_deref()
            .unwrap()
            .contains("instruction"));
    }
}
