//! Agent 错误类型
//!
//! 错误分级：解析失败（本地可恢复）、审计拒绝（可恢复，超上限致命）、
//! 工具失败（包装为 Observation 喂回循环）、端点故障（按轮重试）、Worker 故障（会话级不可恢复）。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误（端点、解析、审计、沙箱 RPC 等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 审计拒绝达到上限，循环终止
    #[error("Audit rejection ceiling reached after {0} rejections")]
    RejectionCeilingReached(usize),

    #[error("Turn budget exhausted after {0} turns")]
    TurnBudgetExhausted(usize),

    /// 沙箱 RPC 超时：pending 条目已移除，调用方收到拒绝
    #[error("Sandbox RPC timeout: {0}")]
    RpcTimeout(String),

    /// Worker 发来硬 ERROR：该会话的 worker 视为死亡，需显式重新初始化
    #[error("Sandbox worker fault: {0}")]
    WorkerFault(String),

    #[error("Sandbox worker is not available")]
    WorkerUnavailable,

    #[error("Cancelled")]
    Cancelled,
}
