//! 循环过程事件：供前端流式展示思考、审计、工具调用与观察结果

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 轮数更新（当前第几轮）
    TurnUpdate { turn: usize, max_turns: usize },
    /// 正在调用补全端点
    Thinking,
    /// 模型的思考内容（已还原脱敏，供展示）
    ThinkingContent { text: String },
    /// 模型对用户说的话（已还原脱敏）
    Speak { text: String },
    /// 提出动作，等待审计
    ActionProposed {
        tool: String,
        params: serde_json::Value,
    },
    /// 审计结论
    AuditVerdict {
        approved: bool,
        reason: Option<String>,
    },
    /// 工具执行中
    Executing { tool: String },
    /// 沙箱实时输出（长代码执行期间的 stdout 透传）
    PartialOutput { content: String },
    /// 工具返回（预览，避免过长）
    Observation { tool: String, preview: String },
    /// 委派子智能体（编排层）
    Delegation { agent_type: String, instruction: String },
    /// 最终回复
    Final { text: String },
    /// 错误
    Error { text: String },
}
