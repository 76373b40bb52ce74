//! 追踪日志：每轮的只追加结构化记录
//!
//! 一个 TraceSession 由一次循环调用独占，记录每轮的 thought/action、审计结论、
//! 观察结果与错误；可导出为 JSON 文档或拍平的人类可读报告。
//! 过去的条目不回改，唯一的修改是把观察/审计结果附到产生该动作的最近一轮上。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::action::{AgentStep, StepStatus};
use crate::agent::auditor::AuditVerdict;

/// 单轮追踪记录：AgentStep + 审计结论 + 时间戳
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceTurn {
    pub turn: usize,
    #[serde(flatten)]
    pub step: AgentStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// 一次会话的完整追踪
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSession {
    pub id: String,
    pub user_prompt: String,
    pub initial_context: serde_json::Value,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub steps: Vec<TraceTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 只追加的会话追踪器
#[derive(Debug)]
pub struct TraceLogger {
    session: TraceSession,
}

impl TraceLogger {
    pub fn new(user_prompt: impl Into<String>, initial_context: serde_json::Value) -> Self {
        Self {
            session: TraceSession {
                id: uuid::Uuid::new_v4().to_string(),
                user_prompt: user_prompt.into(),
                initial_context,
                start_time: Utc::now(),
                end_time: None,
                steps: Vec::new(),
                final_result: None,
                error: None,
            },
        }
    }

    /// 追加一轮（动作刚解析出来、尚未审计时调用）
    pub fn log_step(&mut self, step: AgentStep) {
        let turn = self.session.steps.len();
        self.session.steps.push(TraceTurn {
            turn,
            step,
            audit: None,
            error: None,
            at: Utc::now(),
        });
    }

    /// 把审计结论附到最近一轮
    pub fn log_audit(&mut self, verdict: AuditVerdict) {
        if let Some(last) = self.session.steps.last_mut() {
            last.step.status = if verdict.approved {
                StepStatus::Executing
            } else {
                StepStatus::Rejected
            };
            last.audit = Some(verdict);
        }
    }

    /// 把观察结果附到最近一轮并标记完成
    pub fn log_observation(&mut self, observation: impl Into<String>) {
        if let Some(last) = self.session.steps.last_mut() {
            last.step.observation = Some(observation.into());
            last.step.status = StepStatus::Completed;
        }
    }

    /// 轮级错误：附到最近一轮；若本轮尚无记录则单独记一条错误轮
    pub fn log_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        match self.session.steps.last_mut() {
            Some(last) if last.error.is_none() && last.step.observation.is_none() => {
                last.error = Some(error);
            }
            _ => {
                let turn = self.session.steps.len();
                self.session.steps.push(TraceTurn {
                    turn,
                    step: AgentStep::new(String::new(), None, crate::agent::action::Action::new("", serde_json::Value::Null)),
                    audit: None,
                    error: Some(error),
                    at: Utc::now(),
                });
            }
        }
    }

    /// 终结会话：成功给 final_result，失败给 error；二者都会落 end_time
    pub fn finish(&mut self, final_result: Option<String>, error: Option<String>) {
        self.session.end_time = Some(Utc::now());
        self.session.final_result = final_result;
        self.session.error = error;
    }

    pub fn session(&self) -> &TraceSession {
        &self.session
    }

    pub fn into_session(self) -> TraceSession {
        self.session
    }

    /// 结构化导出（JSON 文档）
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.session)
    }

    /// 拍平的人类可读报告：按时间顺序逐轮列出 thought/action/observation/audit/error
    pub fn render_report(&self) -> String {
        let s = &self.session;
        let mut out = String::new();
        out.push_str(&format!("# Session {}\n", s.id));
        out.push_str(&format!("Prompt: {}\n", s.user_prompt));
        out.push_str(&format!("Started: {}\n\n", s.start_time.to_rfc3339()));
        for t in &s.steps {
            out.push_str(&format!("## Turn {}\n", t.turn + 1));
            if !t.step.thought.is_empty() {
                out.push_str(&format!("Thought: {}\n", t.step.thought));
            }
            if !t.step.action.tool.is_empty() {
                out.push_str(&format!(
                    "Action: {} {}\n",
                    t.step.action.tool, t.step.action.params
                ));
            }
            if let Some(audit) = &t.audit {
                out.push_str(&format!(
                    "Audit: {}{}\n",
                    if audit.approved { "approved" } else { "rejected" },
                    audit
                        .reason
                        .as_ref()
                        .map(|r| format!(" ({})", r))
                        .unwrap_or_default()
                ));
            }
            if let Some(obs) = &t.step.observation {
                out.push_str(&format!("Observation: {}\n", obs));
            }
            if let Some(err) = &t.error {
                out.push_str(&format!("Error: {}\n", err));
            }
            out.push('\n');
        }
        if let Some(result) = &s.final_result {
            out.push_str(&format!("Final: {}\n", result));
        }
        if let Some(err) = &s.error {
            out.push_str(&format!("Session error: {}\n", err));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::action::Action;

    fn step(tool: &str) -> AgentStep {
        AgentStep::new("thinking", None, Action::new(tool, serde_json::json!({})))
    }

    #[test]
    fn test_audit_and_observation_attach_to_latest_turn() {
        let mut trace = TraceLogger::new("核对账目", serde_json::Value::Null);
        trace.log_step(step("list_files"));
        trace.log_audit(AuditVerdict::approved());
        trace.log_observation("a.xlsx, b.xlsx");
        trace.log_step(step("run_code"));
        trace.log_audit(AuditVerdict::rejected("unsafe path"));

        let s = trace.session();
        assert_eq!(s.steps.len(), 2);
        assert_eq!(s.steps[0].step.observation.as_deref(), Some("a.xlsx, b.xlsx"));
        assert_eq!(s.steps[0].step.status, StepStatus::Completed);
        assert_eq!(s.steps[1].step.status, StepStatus::Rejected);
        assert!(!s.steps[1].audit.as_ref().unwrap().approved);
    }

    #[test]
    fn test_fatal_path_populates_error() {
        let mut trace = TraceLogger::new("p", serde_json::Value::Null);
        trace.log_error("endpoint unreachable");
        trace.finish(None, Some("endpoint unreachable".to_string()));
        let s = trace.session();
        assert!(s.end_time.is_some());
        assert_eq!(s.error.as_deref(), Some("endpoint unreachable"));
    }

    #[test]
    fn test_report_contains_turns() {
        let mut trace = TraceLogger::new("p", serde_json::Value::Null);
        trace.log_step(step("run_code"));
        trace.log_audit(AuditVerdict::approved());
        trace.log_observation("ok");
        trace.finish(Some("done".to_string()), None);
        let report = trace.render_report();
        assert!(report.contains("Turn 1"));
        assert!(report.contains("run_code"));
        assert!(report.contains("Final: done"));
    }

    #[test]
    fn test_export_json_round_trips() {
        let mut trace = TraceLogger::new("p", serde_json::Value::Null);
        trace.log_step(step("finish"));
        let json = trace.export_json().unwrap();
        let parsed: TraceSession = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.steps.len(), 1);
    }
}
