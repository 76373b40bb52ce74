//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, params) 在超时内调用
//! registry.execute，超时或失败时转为 AgentError（ToolTimeout / ToolExecutionFailed /
//! UnknownTool）；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::ToolRegistry;

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行指定工具；未知工具与超时走显式错误，工具返回 Err 则转为 ToolExecutionFailed
    pub async fn execute(
        &self,
        tool_name: &str,
        params: serde_json::Value,
    ) -> Result<String, AgentError> {
        if self.registry.get(tool_name).is_none() {
            return Err(AgentError::UnknownTool(tool_name.to_string()));
        }

        let start = Instant::now();
        let params_preview = params_preview(&params);
        let result = timeout(self.timeout, self.registry.execute(tool_name, params)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "params_preview": params_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
            Err(_) => Err(AgentError::ToolTimeout(tool_name.to_string())),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.registry.tool_descriptions()
    }
}

fn params_preview(params: &serde_json::Value) -> String {
    let s = params.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::Tool;
    use async_trait::async_trait;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps forever"
        }
        async fn execute(&self, _params: serde_json::Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("never".to_string())
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_explicit_error() {
        let executor = ToolExecutor::new(ToolRegistry::new(), 1);
        let err = executor
            .execute("nonexistent", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownTool(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_tool_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let executor = ToolExecutor::new(registry, 1);
        let err = executor
            .execute("slow", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolTimeout(_)));
    }
}
