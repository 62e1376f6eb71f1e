//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ONBOARDER__*` 覆盖（双下划线表示嵌套，如 `ONBOARDER__LLM__PROVIDER=mock`）。
//! 所有字段都有默认值，空配置即可运行。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::tools::RepoToolLimits;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub session: SessionSection,
}

/// [app] 段：克隆目录与数据库路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 存放仓库检出的目录
    pub workspace_root: PathBuf,
    pub database_path: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspace/repos"),
            database_path: PathBuf::from("onboarder.db"),
        }
    }
}

/// [llm] 段：后端选择与采样温度
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / deepseek / mock
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY / DEEPSEEK_API_KEY
    pub api_key: Option<String>,
    pub temperature: f32,
    /// 分镜角色使用更高的温度
    pub storyboard_temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            base_url: None,
            api_key: None,
            temperature: 0.2,
            storyboard_temperature: 0.8,
        }
    }
}

/// [agent] 段：各角色工具调用上限、重试次数、时间预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub mapper_max_tool_calls: usize,
    pub document_max_tool_calls: usize,
    pub qa_max_tool_calls: usize,
    pub storyboard_max_tool_calls: usize,
    pub clarification_retries: u32,
    pub storyboard_retries: u32,
    /// 单次运行的时间预算（秒），0 表示不限
    pub wall_clock_budget_secs: u64,
    /// 无法克隆时是否只凭 PROJECT.md 生成文档与回答
    pub context_only_fallback: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            mapper_max_tool_calls: 60,
            document_max_tool_calls: 40,
            qa_max_tool_calls: 25,
            storyboard_max_tool_calls: 0,
            clarification_retries: 1,
            storyboard_retries: 1,
            wall_clock_budget_secs: 900,
            context_only_fallback: true,
        }
    }
}

impl AgentSection {
    pub fn wall_clock_budget(&self) -> Option<Duration> {
        (self.wall_clock_budget_secs > 0).then(|| Duration::from_secs(self.wall_clock_budget_secs))
    }
}

/// [tools] 段：工具超时与输出上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub default_tree_depth: usize,
    pub max_tree_depth: usize,
    pub max_tree_entries: usize,
    pub max_read_bytes: usize,
    pub max_search_matches: usize,
    pub max_search_file_bytes: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        let limits = RepoToolLimits::default();
        Self {
            tool_timeout_secs: 30,
            default_tree_depth: limits.default_tree_depth,
            max_tree_depth: limits.max_tree_depth,
            max_tree_entries: limits.max_tree_entries,
            max_read_bytes: limits.max_read_bytes,
            max_search_matches: limits.max_search_matches,
            max_search_file_bytes: limits.max_search_file_bytes,
        }
    }
}

impl ToolsSection {
    pub fn to_tool_limits(&self) -> RepoToolLimits {
        RepoToolLimits {
            default_tree_depth: self.default_tree_depth,
            max_tree_depth: self.max_tree_depth.max(1),
            max_tree_entries: self.max_tree_entries,
            max_read_bytes: self.max_read_bytes,
            max_search_matches: self.max_search_matches,
            max_search_file_bytes: self.max_search_file_bytes,
        }
    }
}

/// [session] 段：检出有效期与克隆参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 0 表示永不过期
    pub ttl_secs: u64,
    pub clone_depth: u32,
    pub clone_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            clone_depth: 1,
            clone_timeout_secs: 300,
        }
    }
}

impl SessionSection {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

/// 从 config 目录加载配置，环境变量 ONBOARDER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ONBOARDER__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("ONBOARDER")
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
        assert_eq!(cfg.agent.mapper_max_tool_calls, 60);
        assert_eq!(cfg.agent.document_max_tool_calls, 40);
        assert_eq!(cfg.agent.qa_max_tool_calls, 25);
        assert_eq!(cfg.agent.storyboard_max_tool_calls, 0);
        assert_eq!(cfg.agent.wall_clock_budget(), Some(Duration::from_secs(900)));
        assert_eq!(cfg.tools.to_tool_limits(), RepoToolLimits::default());
        assert_eq!(cfg.session.ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(cfg.llm.storyboard_temperature, 0.8);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("onboarder.toml");
        std::fs::write(
            &path,
            "[agent]\nqa_max_tool_calls = 5\nwall_clock_budget_secs = 0\n\n[session]\nttl_secs = 0\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.qa_max_tool_calls, 5);
        assert_eq!(cfg.agent.mapper_max_tool_calls, 60);
        assert_eq!(cfg.agent.wall_clock_budget(), None);
        assert_eq!(cfg.session.ttl(), None);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
    }
}
