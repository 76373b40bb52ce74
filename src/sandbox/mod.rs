//! 沙箱层：隔离执行 worker 的消息协议、RPC 桥与 worker 侧协议处理
//!
//! 控制线程与沙箱之间只通过消息传递通信，不共享内存；每个请求带新鲜的
//! 关联 id，按 id 解复用响应。投递语义为至多一次 + 显式超时。

pub mod bridge;
pub mod protocol;
pub mod worker;

pub use bridge::{ExecOutcome, RpcTimeouts, SandboxBridge};
pub use protocol::{Dataset, WorkerMessage};
pub use worker::{spawn_worker, CodeRuntime, ScriptedRuntime, VirtualFs};
