//! 工具箱：注册表、带超时的执行器与沙箱工具

pub mod executor;
pub mod registry;
pub mod sandbox_tools;

pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
pub use sandbox_tools::{ListFilesTool, ReadDocumentTool, ResetSandboxTool, RunCodeTool};
