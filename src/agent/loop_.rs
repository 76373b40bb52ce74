//! Observe-Think-Act-Verify 主循环
//!
//! 每轮：取消检查 -> 请求补全 -> 解析动作 -> 审计 -> 执行 -> 写回 Observation。
//! 轮数上限与会话级拒绝上限共同保证终止。轮与轮严格串行：下一轮的 prompt
//! 依赖上一轮 Observation 已写回历史。只有审计通过的动作才会到达执行器；
//! 工具失败包装为 Observation 喂回模型自我纠正，不中断循环。
//! 出站的用户请求、上下文与工具 Observation 先过脱敏器，面向展示的文本再还原。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::action::{parse_model_reply, Action, AgentStep, StepStatus, FINISH_TOOL};
use crate::agent::auditor::{Auditor, StateSnapshot};
use crate::agent::events::AgentEvent;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::{ConversationMemory, Message};
use crate::privacy::Masker;
use crate::tools::ToolExecutor;
use crate::trace::{TraceLogger, TraceSession};

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 思考内容展示最大字符数
const THINKING_PREVIEW_CHARS: usize = 800;

/// 未提取到动作时写回的纠正反馈
const NO_ACTION_FEEDBACK: &str =
    "上一轮输出中没有可执行的动作。请只输出一个 JSON 对象：\
     {\"thought\": \"...\", \"action\": {\"tool\": \"工具名\", \"params\": {...}}}";

/// 循环边界配置
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_turns: usize,
    pub rejection_ceiling: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            rejection_ceiling: 10,
        }
    }
}

/// 终态结果：成功给 final_explanation，致命失败给 error；trace 总是完整保留
#[derive(Debug)]
pub struct LoopOutcome {
    pub final_explanation: Option<String>,
    pub error: Option<String>,
    pub trace: TraceSession,
}

impl LoopOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 单会话循环控制器
pub struct LoopController {
    llm: Arc<dyn LlmClient>,
    auditor: Arc<Auditor>,
    executor: Arc<ToolExecutor>,
    masker: Masker,
    snapshot: Option<Arc<dyn StateSnapshot>>,
    config: LoopConfig,
    cancel: CancellationToken,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl LoopController {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        auditor: Arc<Auditor>,
        executor: Arc<ToolExecutor>,
        masker: Masker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            llm,
            auditor,
            executor,
            masker,
            snapshot: None,
            config: LoopConfig::default(),
            cancel,
            event_tx: None,
        }
    }

    /// 设置审计用的状态快照来源（通常是沙箱桥）
    pub fn with_snapshot(mut self, snapshot: Arc<dyn StateSnapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// 设置事件推送通道
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
        let mut tools_block = String::new();
        for (name, desc) in self.executor.tool_descriptions() {
            tools_block.push_str(&format!("- {}: {}\n", name, desc));
        }
        format!(
            "你是一个数据/文档处理智能体。每轮只输出一个 JSON 对象：\n\
             {{\"thought\": \"推理过程\", \"speak\": \"（可选）对用户说的话\", \
             \"action\": {{\"tool\": \"工具名\", \"params\": {{...}}}}}}\n\
             可用工具：\n{}\
             任务完成时输出 {{\"action\": {{\"tool\": \"{}\", \"params\": {{\"message\": \"最终解释\"}}}}}}。",
            tools_block, FINISH_TOOL
        )
    }

    /// 运行一次完整会话。除取消外的所有终态（含致命失败）都以 Ok 返回，
    /// 错误写入 outcome.error 与 trace.error。
    pub async fn run(
        &mut self,
        user_prompt: &str,
        initial_context: serde_json::Value,
    ) -> Result<LoopOutcome, AgentError> {
        let mut trace = TraceLogger::new(user_prompt, initial_context.clone());
        let system = self.system_prompt();
        let tool_names = self.executor.tool_names();

        // 出站前脱敏：用户请求与上下文元数据
        let masked_prompt = self.masker.mask(user_prompt);
        let mut first_message = masked_prompt;
        if !initial_context.is_null() {
            let masked_context = self.masker.mask_context(&initial_context);
            first_message.push_str(&format!("\n\n上下文：{}", masked_context));
        }

        let mut conversation = ConversationMemory::new(self.config.max_turns);
        conversation.push(Message::user(first_message));

        let mut rejections = 0usize;

        for turn in 0..self.config.max_turns {
            if self.cancel.is_cancelled() {
                let msg = AgentError::Cancelled.to_string();
                self.emit(AgentEvent::Error { text: msg.clone() });
                trace.finish(None, Some(msg));
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
                    // 端点故障消耗一轮，记入 trace，下一轮重试；预算耗尽即致命
                    let msg = format!("completion endpoint failure: {}", e);
                    tracing::warn!(turn, error = %e, "completion request failed");
                    self.emit(AgentEvent::Error { text: msg.clone() });
                    trace.log_error(msg);
                    continue;
                }
            };

            let parsed = parse_model_reply(&reply, &tool_names);
            conversation.push(Message::assistant(reply.content.clone()));

            let thinking_preview: String = self
                .masker
                .unmask(&parsed.thought)
                .chars()
                .take(THINKING_PREVIEW_CHARS)
                .collect();
            self.emit(AgentEvent::ThinkingContent {
                text: thinking_preview,
            });
            if let Some(speak) = &parsed.speak {
                self.emit(AgentEvent::Speak {
                    text: self.masker.unmask(speak),
                });
            }

            let Some(action) = parsed.action else {
                // 解析失败：可上报状态而非异常，写回纠正反馈后继续
                trace.log_step(AgentStep::new(
                    parsed.thought,
                    parsed.speak,
                    Action::new("", serde_json::Value::Null),
                ));
                trace.log_observation(NO_ACTION_FEEDBACK);
                conversation.push(Message::user(NO_ACTION_FEEDBACK));
                continue;
            };

            let mut step = AgentStep::new(parsed.thought, parsed.speak, action.clone());
            step.status = StepStatus::AwaitingApproval;
            trace.log_step(step);
            self.emit(AgentEvent::ActionProposed {
                tool: action.tool.clone(),
                params: action.params.clone(),
            });

            // 独立审计：拒绝的动作绝不到达执行器
            let files = self
                .snapshot
                .as_ref()
                .map(|s| s.known_files())
                .unwrap_or_default();
            let verdict = self
                .auditor
                .audit(&action, &files, conversation.messages())
                .await;
            self.emit(AgentEvent::AuditVerdict {
                approved: verdict.approved,
                reason: verdict.reason.clone(),
            });
            let reason = verdict.reason.clone();
            trace.log_audit(verdict.clone());

            if !verdict.approved {
                rejections += 1;
                if rejections >= self.config.rejection_ceiling {
                    let msg = AgentError::RejectionCeilingReached(rejections).to_string();
                    self.emit(AgentEvent::Error { text: msg.clone() });
                    trace.finish(None, Some(msg.clone()));
                    return Ok(LoopOutcome {
                        final_explanation: None,
                        error: Some(msg),
                        trace: trace.into_session(),
                    });
                }
                // 拒绝即纠正反馈；下一轮由模型提出新动作，从不静默重试
                let feedback = format!(
                    "提议的动作被安全审计拒绝：{}。请提出修正后的新动作。",
                    reason.unwrap_or_else(|| "无理由".to_string())
                );
                conversation.push(Message::user(feedback));
                continue;
            }

            if action.tool == FINISH_TOOL {
                let message = action
                    .params
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("任务完成")
                    .to_string();
                // 只有面向用户展示的最终文本才还原脱敏
                let display = self.masker.unmask(&message);
                trace.log_observation("session finished");
                trace.finish(Some(display.clone()), None);
                self.emit(AgentEvent::Final {
                    text: display.clone(),
                });
                return Ok(LoopOutcome {
                    final_explanation: Some(display),
                    error: None,
                    trace: trace.into_session(),
                });
            }

            self.emit(AgentEvent::Executing {
                tool: action.tool.clone(),
            });
            let observation = match self
                .executor
                .execute(&action.tool, action.params.clone())
                .await
            {
                Ok(o) => o,
                // 可恢复失败折叠为 Observation，让模型自我纠正
                Err(e) => format!("Error: {}", e),
            };
            trace.log_observation(observation.clone());
            let preview: String = observation.chars().take(OBSERVATION_PREVIEW_CHARS).collect();
            self.emit(AgentEvent::Observation {
                tool: action.tool.clone(),
                preview,
            });
            // 回传给模型的 Observation 重新进入脱敏会话；追踪里保留原文
            let masked_observation = self.masker.mask(&observation);
            conversation.push(Message::user(format!(
                "Observation from {}: {}",
                action.tool, masked_observation
            )));
        }

        let msg = AgentError::TurnBudgetExhausted(self.config.max_turns).to_string();
        self.emit(AgentEvent::Error { text: msg.clone() });
        trace.finish(None, Some(msg.clone()));
        Ok(LoopOutcome {
            final_explanation: None,
            error: Some(msg),
            trace: trace.into_session(),
        })
    }
}
