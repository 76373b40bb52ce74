//! Weaver - 数据/文档智能体编排核心
//!
//! 有界、可审计的多轮循环：向补全端点询问下一步，从非结构化回复中提取动作，
//! 动作先过独立审计再进沙箱，沙箱只经消息关联 RPC 到达，观察结果写回下一轮。
//!
//! 模块划分：
//! - **agent**: 动作解析、审计器、Observe-Think-Act-Verify 主循环与过程事件
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **llm**: 补全端点抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 短期记忆（有界对话历史）
//! - **orchestrator**: 二阶循环，把子任务委派给专职工作循环
//! - **privacy**: 可逆实体脱敏（出站打码、展示还原）
//! - **sandbox**: 沙箱 RPC 桥与工作进程协议
//! - **tools**: 工具注册表、带超时的执行器与沙箱工具
//! - **trace**: 每轮只追加的结构化追踪与报告导出

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod privacy;
pub mod sandbox;
pub mod tools;
pub mod trace;

pub use crate::agent::{LoopConfig, LoopController, LoopOutcome};
pub use crate::core::AgentError;
pub use crate::orchestrator::{Orchestrator, OrchestratorOutcome};
