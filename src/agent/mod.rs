//! 智能体核心：动作解析、审计、主循环与过程事件

pub mod action;
pub mod auditor;
pub mod events;
pub mod loop_;

pub use action::{parse_model_reply, Action, AgentStep, ParsedStep, StepStatus};
pub use action::{CODE_EXECUTION_TOOL, FINISH_TOOL};
pub use auditor::{AuditVerdict, Auditor, StateSnapshot};
pub use events::AgentEvent;
pub use loop_::{LoopConfig, LoopController, LoopOutcome};
