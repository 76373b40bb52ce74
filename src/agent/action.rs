//! 动作解析：从模型回复中提取 {thought, speak?, action}
//!
//! 模型输出格式没有契约保证：回复里可能混着零个、一个或多个 JSON 片段与散文，
//! 端点也可能直接给出原生 tool call。按优先级逐级回退：
//! 1. 端点原生 tool call 字段
//! 2. 全文扫描平衡花括号的 JSON 候选，按长度降序逐个试解析
//!    （更长的对象更完整，不易把内层子对象误当整体）
//! 3. JSON 之外的 python/代码围栏拼接进 params.code（模型常为可读性把代码放在载荷外）
//! 4. 完成关键词扫描，合成 finish 动作
//!
//! 解析器永不报错：提取不到动作本身就是一种可上报状态（action = None）。

use serde::{Deserialize, Serialize};

use crate::llm::LlmReply;

/// 代码执行工具名（围栏拼接只对该工具生效）
pub const CODE_EXECUTION_TOOL: &str = "run_code";

/// 终止工具名
pub const FINISH_TOOL: &str = "finish";

/// 模型给出的单轮指令：开放字符串工具名 + 工具自定参数
/// （参数由工具执行器校验，循环控制器不管）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Action {
    pub fn new(tool: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            params,
        }
    }

    pub fn finish(message: impl Into<String>) -> Self {
        Self::new(FINISH_TOOL, serde_json::json!({ "message": message.into() }))
    }
}

/// 单轮步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    AwaitingApproval,
    Executing,
    Completed,
    Rejected,
}

/// 一轮完整记录：追加进 Trace 后不再变更
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub thought: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speak: Option<String>,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    pub status: StepStatus,
}

impl AgentStep {
    pub fn new(thought: impl Into<String>, speak: Option<String>, action: Action) -> Self {
        Self {
            thought: thought.into(),
            speak,
            action,
            observation: None,
            status: StepStatus::Pending,
        }
    }
}

/// 解析结果：action 缺失不是错误
#[derive(Debug, Clone, Default)]
pub struct ParsedStep {
    pub thought: String,
    pub speak: Option<String>,
    pub action: Option<Action>,
}

/// 回复文本中判定「任务已完成」的关键词
const COMPLETION_KEYWORDS: &[&str] = &[
    "任务完成",
    "任务已完成",
    "已全部完成",
    "task complete",
    "task is complete",
    "all done",
];

/// 从原始回复提取单轮步骤。永不失败，最坏情况 action 为 None。
pub fn parse_model_reply(reply: &LlmReply, known_tools: &[String]) -> ParsedStep {
    // 1. 端点原生 tool call
    if let Some(tc) = &reply.tool_call {
        if let Some(action) = action_from_value(tc, known_tools) {
            return ParsedStep {
                thought: reply.content.trim().to_string(),
                speak: None,
                action: Some(action),
            };
        }
    }

    let text = reply.content.as_str();

    // 2. JSON 候选扫描，长度降序
    let mut candidates = scan_json_candidates(text);
    candidates.sort_by(|a, b| b.len().cmp(&a.len()));
    for candidate in &candidates {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) else {
            continue;
        };
        if let Some(mut parsed) = step_from_value(&value, known_tools) {
            // 3. 代码围栏拼接：代码执行动作缺 code 时，从 JSON 之外找围栏
            if let Some(action) = &mut parsed.action {
                if action.tool == CODE_EXECUTION_TOOL && !has_code_param(action) {
                    if let Some(code) = find_code_fence(text, Some(candidate)) {
                        set_code_param(action, code);
                    }
                }
            }
            return parsed;
        }
    }

    // 3b. 完全没有 JSON 动作，但存在代码围栏且代码执行工具可用
    if known_tools.iter().any(|t| t == CODE_EXECUTION_TOOL) {
        if let Some(code) = find_code_fence(text, None) {
            return ParsedStep {
                thought: text.trim().to_string(),
                speak: None,
                action: Some(Action::new(
                    CODE_EXECUTION_TOOL,
                    serde_json::json!({ "code": code }),
                )),
            };
        }
    }

    // 4. 完成关键词 → 合成 finish
    let lowered = text.to_lowercase();
    if COMPLETION_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return ParsedStep {
            thought: text.trim().to_string(),
            speak: None,
            action: Some(Action::finish(text.trim())),
        };
    }

    ParsedStep {
        thought: text.trim().to_string(),
        speak: None,
        action: None,
    }
}

/// 扫描文本中所有顶层平衡的 `{...}` 片段（忽略字符串字面量内的花括号）
pub(crate) fn scan_json_candidates(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        candidates.push(&text[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    candidates
}

/// 把一个 JSON 值解释为步骤：要么带 `action` 对象，要么本身就是已知工具的 Action
fn step_from_value(value: &serde_json::Value, known_tools: &[String]) -> Option<ParsedStep> {
    let obj = value.as_object()?;

    if let Some(action_value) = obj.get("action") {
        let action = action_from_value(action_value, known_tools)?;
        return Some(ParsedStep {
            thought: obj
                .get("thought")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            speak: obj
                .get("speak")
                .and_then(|s| s.as_str())
                .map(str::to_string),
            action: Some(action),
        });
    }

    // 顶层就是 {"tool": ..., "params": ...}，但必须命中已知工具名，
    // 否则任意 JSON 对象都会被误认为动作
    if let Some(tool) = obj.get("tool").and_then(|t| t.as_str()) {
        if known_tools.iter().any(|t| t == tool) || tool == FINISH_TOOL {
            return Some(ParsedStep {
                thought: obj
                    .get("thought")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                speak: None,
                action: Some(Action::new(
                    tool,
                    obj.get("params")
                        .or_else(|| obj.get("args"))
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                )),
            });
        }
    }
    None
}

fn action_from_value(value: &serde_json::Value, known_tools: &[String]) -> Option<Action> {
    let obj = value.as_object()?;
    let tool = obj.get("tool").and_then(|t| t.as_str())?;
    if tool.is_empty() {
        return None;
    }
    let _ = known_tools; // 带显式 action 包装的 JSON 按原样接受，未知工具由执行器报错
    Some(Action::new(
        tool,
        obj.get("params")
            .or_else(|| obj.get("args"))
            .cloned()
            .unwrap_or(serde_json::Value::Null),
    ))
}

fn has_code_param(action: &Action) -> bool {
    action
        .params
        .get("code")
        .and_then(|c| c.as_str())
        .map(|c| !c.trim().is_empty())
        .unwrap_or(false)
}

fn set_code_param(action: &mut Action, code: String) {
    if !action.params.is_object() {
        action.params = serde_json::json!({});
    }
    if let Some(obj) = action.params.as_object_mut() {
        obj.insert("code".to_string(), serde_json::Value::String(code));
    }
}

/// 找出围栏代码块（```python / ```py / 裸 ```），排除与给定 JSON 片段重叠的围栏
fn find_code_fence(text: &str, exclude_span: Option<&str>) -> Option<String> {
    let exclude_range = exclude_span.and_then(|span| {
        let start = span.as_ptr() as usize - text.as_ptr() as usize;
        Some(start..start + span.len())
    });

    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find("```") {
        let open = search_from + rel;
        let after_ticks = open + 3;
        let rest = &text[after_ticks..];
        let body_start = rest.find('\n').map(|n| after_ticks + n + 1)?;
        let lang = text[after_ticks..body_start].trim();
        let close = text[body_start..].find("```").map(|n| body_start + n)?;

        let overlaps = exclude_range
            .as_ref()
            .map(|r| open < r.end && close > r.start)
            .unwrap_or(false);
        let lang_ok = lang.is_empty() || lang.eq_ignore_ascii_case("python") || lang.eq_ignore_ascii_case("py");
        if !overlaps && lang_ok {
            let code = text[body_start..close].trim();
            if !code.is_empty() {
                return Some(code.to_string());
            }
        }
        search_from = close + 3;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> Vec<String> {
        vec!["run_code".to_string(), "list_files".to_string()]
    }

    fn parse(content: &str) -> ParsedStep {
        parse_model_reply(&LlmReply::text(content), &tools())
    }

    #[test]
    fn test_plain_action_json() {
        let step = parse(r#"{"thought":"t","action":{"tool":"finish","params":{"message":"done"}}}"#);
        let action = step.action.unwrap();
        assert_eq!(step.thought, "t");
        assert_eq!(action.tool, "finish");
        assert_eq!(action.params["message"], "done");
    }

    #[test]
    fn test_json_embedded_in_prose() {
        let step = parse(
            "好的，我来列出文件。\n{\"thought\":\"看看有什么\",\"action\":{\"tool\":\"list_files\",\"params\":{}}}\n之后再处理。",
        );
        assert_eq!(step.action.unwrap().tool, "list_files");
    }

    #[test]
    fn test_longest_candidate_wins() {
        let step = parse(
            r#"{"thought":"先列文件","speak":"稍等","action":{"tool":"list_files","params":{"path":"{"}}}"#,
        );
        let action = step.action.unwrap();
        assert_eq!(action.tool, "list_files");
        assert_eq!(step.speak.as_deref(), Some("稍等"));
    }

    #[test]
    fn test_native_tool_call_takes_priority() {
        let reply = LlmReply {
            content: r#"{"action":{"tool":"list_files","params":{}}}"#.to_string(),
            tool_call: Some(serde_json::json!({"tool": "run_code", "params": {"code": "1+1"}})),
        };
        let step = parse_model_reply(&reply, &tools());
        assert_eq!(step.action.unwrap().tool, "run_code");
    }

    #[test]
    fn test_code_fence_spliced_into_params() {
        let step = parse(
            "{\"thought\":\"算一下\",\"action\":{\"tool\":\"run_code\",\"params\":{}}}\n```python\nprint(42)\n```",
        );
        let action = step.action.unwrap();
        assert_eq!(action.params["code"], "print(42)");
    }

    #[test]
    fn test_bare_fence_synthesizes_run_code() {
        let step = parse("直接跑这段：\n```python\ndf.head()\n```");
        let action = step.action.unwrap();
        assert_eq!(action.tool, "run_code");
        assert_eq!(action.params["code"], "df.head()");
    }

    #[test]
    fn test_completion_keyword_synthesizes_finish() {
        let step = parse("所有表格已经核对，任务完成。");
        assert_eq!(step.action.unwrap().tool, "finish");
    }

    #[test]
    fn test_no_action_is_not_an_error() {
        let step = parse("我还需要更多信息，请问是哪个文件？");
        assert!(step.action.is_none());
        assert!(!step.thought.is_empty());
    }

    #[test]
    fn test_args_alias_accepted() {
        let step = parse(r#"{"tool":"list_files","args":{"path":"/mnt"}}"#);
        assert_eq!(step.action.unwrap().params["path"], "/mnt");
    }

    #[test]
    fn test_unknown_top_level_json_ignored() {
        let step = parse(r#"{"rows": [1, 2, 3], "total": 3}"#);
        assert!(step.action.is_none());
    }

    #[test]
    fn test_braces_inside_strings() {
        let candidates = scan_json_candidates(r#"x {"a": "}{"} y {"b": 1}"#);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], r#"{"a": "}{"}"#);
    }
}
