//! 沙箱工具：经 RPC 桥访问隔离 worker 的工具集
//!
//! run_code / list_files / read_document / reset_sandbox。所有可恢复失败都
//! 返回描述性字符串，让模型在下一轮自我纠正；只有 worker 级故障向上抛。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::action::CODE_EXECUTION_TOOL;
use crate::sandbox::{Dataset, SandboxBridge};
use crate::tools::registry::Tool;

/// 代码执行工具：params.code 必填，params.datasets 可选（执行前写入）
pub struct RunCodeTool {
    bridge: Arc<SandboxBridge>,
    /// 可选订阅者：长代码执行期间的 stdout 透传（类型化通道，而非层层回调）
    stdout_tx: Option<mpsc::UnboundedSender<String>>,
}

impl RunCodeTool {
    pub fn new(bridge: Arc<SandboxBridge>, stdout_tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self { bridge, stdout_tx }
    }
}

#[async_trait]
impl Tool for RunCodeTool {
    fn name(&self) -> &str {
        CODE_EXECUTION_TOOL
    }

    fn description(&self) -> &str {
        "在隔离沙箱中执行 Python 代码。数据文件位于 /mnt 下。"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "要执行的代码" },
                "datasets": {
                    "type": "array",
                    "description": "执行前写入沙箱的数据集 [{name, records}]"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, params: Value) -> Result<String, String> {
        let code = params
            .get("code")
            .and_then(|c| c.as_str())
            .filter(|c| !c.trim().is_empty())
            .ok_or("run_code requires a non-empty `code` parameter")?;
        let datasets: Vec<Dataset> = params
            .get("datasets")
            .map(|d| serde_json::from_value(d.clone()))
            .transpose()
            .map_err(|e| format!("invalid datasets: {}", e))?
            .unwrap_or_default();

        let outcome = self
            .bridge
            .run_code(code, datasets, self.stdout_tx.clone())
            .await
            .map_err(|e| e.to_string())?;

        let mut report = String::new();
        if outcome.success {
            report.push_str("Execution succeeded.");
            if let Some(result) = &outcome.result {
                if !result.is_empty() {
                    report.push_str(&format!(" Result: {}", result));
                }
            }
        } else {
            report.push_str(&format!(
                "Execution failed: {}",
                outcome.result.as_deref().unwrap_or("unknown error")
            ));
        }
        if !outcome.stdout.is_empty() {
            report.push_str(&format!("\nStdout:\n{}", outcome.stdout.trim_end()));
        }
        if !outcome.generated_files.is_empty() {
            report.push_str(&format!(
                "\nGenerated files: {}",
                outcome.generated_files.join(", ")
            ));
        }
        Ok(report)
    }
}

/// 列出沙箱内当前文件
pub struct ListFilesTool {
    bridge: Arc<SandboxBridge>,
}

impl ListFilesTool {
    pub fn new(bridge: Arc<SandboxBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "列出沙箱内当前的所有文件。"
    }

    async fn execute(&self, _params: Value) -> Result<String, String> {
        let files = self.bridge.list_files().await.map_err(|e| e.to_string())?;
        if files.is_empty() {
            Ok("(no files)".to_string())
        } else {
            Ok(files.join("\n"))
        }
    }
}

/// 从沙箱内的二进制文档提取文本
pub struct ReadDocumentTool {
    bridge: Arc<SandboxBridge>,
}

impl ReadDocumentTool {
    pub fn new(bridge: Arc<SandboxBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Tool for ReadDocumentTool {
    fn name(&self) -> &str {
        "read_document"
    }

    fn description(&self) -> &str {
        "提取沙箱内文档文件的文本内容。"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_name": { "type": "string" }
            },
            "required": ["file_name"]
        })
    }

    async fn execute(&self, params: Value) -> Result<String, String> {
        let file_name = params
            .get("file_name")
            .and_then(|f| f.as_str())
            .ok_or("read_document requires a `file_name` parameter")?;
        self.bridge
            .extract_text(file_name)
            .await
            .map_err(|e| e.to_string())
    }
}

/// 重置沙箱（清空文件系统与追踪状态）
pub struct ResetSandboxTool {
    bridge: Arc<SandboxBridge>,
}

impl ResetSandboxTool {
    pub fn new(bridge: Arc<SandboxBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Tool for ResetSandboxTool {
    fn name(&self) -> &str {
        "reset_sandbox"
    }

    fn description(&self) -> &str {
        "重置沙箱，清空其中所有文件。"
    }

    async fn execute(&self, _params: Value) -> Result<String, String> {
        self.bridge.reset().await.map_err(|e| e.to_string())?;
        Ok("Sandbox reset.".to_string())
    }
}
