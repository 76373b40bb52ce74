//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WEAVER__*` 覆盖（双下划线表示嵌套，
//! 如 `WEAVER__LLM__MODEL=gpt-4o-mini`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub privacy: PrivacySection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

/// [app] 段：应用名、单个工作循环的轮数上限与审计拒绝上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 单次工作循环最大轮数
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// 审计拒绝次数上限（会话级），到达即终止
    #[serde(default = "default_rejection_ceiling")]
    pub rejection_ceiling: usize,
}

fn default_max_turns() -> usize {
    20
}

fn default_rejection_ceiling() -> usize {
    10
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_turns: default_max_turns(),
            rejection_ceiling: default_rejection_ceiling(),
        }
    }
}

/// [llm] 段：OpenAI 兼容端点与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// [audit] 段：动作审计（独立的第二次补全请求）
#[derive(Debug, Clone, Deserialize)]
pub struct AuditSection {
    /// 沙箱内唯一许可的文件根目录；相对路径逃逸到此目录之外即拒绝
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: String,
}

fn default_true() -> bool {
    true
}

fn default_sandbox_root() -> String {
    "/mnt".to_string()
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            sandbox_root: default_sandbox_root(),
        }
    }
}

/// [privacy] 段：实体脱敏
#[derive(Debug, Clone, Deserialize)]
pub struct PrivacySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 领域名词跳过列表：命中的词不脱敏（如「账目」「报表」等业务词）
    #[serde(default)]
    pub skip_words: Vec<String>,
    /// 结构化数据中保留明文的键（自由文本备注、文件/列名等结构键）
    #[serde(default = "default_preserve_keys")]
    pub preserve_keys: Vec<String>,
}

fn default_preserve_keys() -> Vec<String> {
    vec![
        "note".into(),
        "summary".into(),
        "description".into(),
        "file_name".into(),
        "sheet_name".into(),
        "columns".into(),
    ]
}

impl Default for PrivacySection {
    fn default() -> Self {
        Self {
            enabled: true,
            skip_words: Vec::new(),
            preserve_keys: default_preserve_keys(),
        }
    }
}

/// [sandbox] 段：RPC 超时（按请求类型区分：列目录短、执行代码长）
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

fn default_exec_timeout() -> u64 {
    120
}

fn default_query_timeout() -> u64 {
    10
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            exec_timeout_secs: default_exec_timeout(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

/// [orchestrator] 段：上层编排循环（每个"工具调用"本身是一个多轮子循环，预算更小）
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_orchestrator_turns")]
    pub max_turns: usize,
}

fn default_orchestrator_turns() -> usize {
    8
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_turns: default_orchestrator_turns(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            audit: AuditSection::default(),
            privacy: PrivacySection::default(),
            sandbox: SandboxSection::default(),
            orchestrator: OrchestratorSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 WEAVER__* 可覆盖
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WEAVER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_turns, 20);
        assert_eq!(cfg.app.rejection_ceiling, 10);
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
        assert_eq!(cfg.llm.request_timeout_secs, 60);
        assert_eq!(cfg.orchestrator.max_turns, 8);
        assert_eq!(cfg.audit.sandbox_root, "/mnt");
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        // 配置源缺失 [app]/[llm] 段时，循环边界不能塌缩为 0
        let cfg: AppConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.app.max_turns, 20);
        assert_eq!(cfg.app.rejection_ceiling, 10);
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
    }
}
