//! 角色配置：同一个 Agent 循环，不同的提示词、输出形态与工具调用上限
//!
//! 角色是数据而不是类型层次：AgentSpec 描述一次运行，react::run_agent 负责执行。

pub mod prompts;
pub mod storyboard;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use storyboard::{parse_storyboard, Slide, Storyboard};

/// 期望的输出形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    Markdown,
    /// 必须解析为 Storyboard；失败时可带纠正提示重试
    JsonStoryboard,
}

/// 文档类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Overview,
    HowItWorks,
    Training,
    Terms,
    UserJourneys,
    Troubleshooting,
    /// 标题由调用方给出
    Custom,
}

impl DocType {
    /// 除 Custom 外的标准文档类型
    pub const STANDARD: [DocType; 6] = [
        DocType::Overview,
        DocType::HowItWorks,
        DocType::Training,
        DocType::Terms,
        DocType::UserJourneys,
        DocType::Troubleshooting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Overview => "overview",
            DocType::HowItWorks => "how_it_works",
            DocType::Training => "training",
            DocType::Terms => "terms",
            DocType::UserJourneys => "user_journeys",
            DocType::Troubleshooting => "troubleshooting",
            DocType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        DocType::STANDARD
            .into_iter()
            .chain(std::iter::once(DocType::Custom))
            .find(|d| d.as_str() == normalized)
    }

    /// 类型名转标题（how_it_works → How It Works）
    pub fn default_title(&self) -> String {
        self.as_str()
            .split('_')
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// 存储时使用的角色名
    pub fn role_name(&self) -> String {
        format!("doc:{}", self.as_str())
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次 Agent 运行的角色配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub role_name: String,
    pub system_prompt: String,
    pub output_shape: OutputShape,
    /// 0 表示不提供工具
    pub max_tool_calls: usize,
}

impl AgentSpec {
    pub fn mapper(max_tool_calls: usize) -> Self {
        Self {
            role_name: "mapper".to_string(),
            system_prompt: prompts::mapper_system(),
            output_shape: OutputShape::Markdown,
            max_tool_calls,
        }
    }

    pub fn document(doc_type: DocType, max_tool_calls: usize, context_only: bool) -> Self {
        Self {
            role_name: doc_type.role_name(),
            system_prompt: prompts::document_system(doc_type, context_only),
            output_shape: OutputShape::Markdown,
            max_tool_calls: if context_only { 0 } else { max_tool_calls },
        }
    }

    pub fn qa(max_tool_calls: usize, context_only: bool) -> Self {
        Self {
            role_name: "qa".to_string(),
            system_prompt: prompts::qa_system(context_only),
            output_shape: OutputShape::Markdown,
            max_tool_calls: if context_only { 0 } else { max_tool_calls },
        }
    }

    pub fn storyboard(max_tool_calls: usize) -> Self {
        Self {
            role_name: "storyboard".to_string(),
            system_prompt: prompts::storyboard_system(),
            output_shape: OutputShape::JsonStoryboard,
            max_tool_calls,
        }
    }

    pub fn uses_tools(&self) -> bool {
        self.max_tool_calls > 0
    }
}

/// 一次运行的最终产物，生成后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Markdown(String),
    Storyboard(Storyboard),
}

impl Artifact {
    /// 存储用的文本形式（分镜为 JSON）
    pub fn content(&self) -> String {
        match self {
            Artifact::Markdown(text) => text.clone(),
            Artifact::Storyboard(sb) => sb.to_json(),
        }
    }

    pub fn as_markdown(&self) -> Option<&str> {
        match self {
            Artifact::Markdown(text) => Some(text),
            Artifact::Storyboard(_) => None,
        }
    }

    pub fn as_storyboard(&self) -> Option<&Storyboard> {
        match self {
            Artifact::Storyboard(sb) => Some(sb),
            Artifact::Markdown(_) => None,
        }
    }
}

/// 保证文档以 `# <title>` 开头：首行是其它一级标题时替换，没有标题时补上
pub fn ensure_title(markdown: &str, title: &str) -> String {
    let body = markdown.trim_start();
    let heading = format!("# {title}");
    let (first, rest) = body.split_once('\n').unwrap_or((body, ""));
    if first.trim_end() == heading {
        body.to_string()
    } else if first.starts_with("# ") {
        format!("{heading}\n{rest}")
    } else {
        format!("{heading}\n\n{body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_type_names_and_titles() {
        assert_eq!(DocType::parse("how-it-works"), Some(DocType::HowItWorks));
        assert_eq!(DocType::parse("USER_JOURNEYS"), Some(DocType::UserJourneys));
        assert_eq!(DocType::parse("custom"), Some(DocType::Custom));
        assert_eq!(DocType::parse("architecture"), None);
        assert_eq!(DocType::HowItWorks.default_title(), "How It Works");
        assert_eq!(DocType::Terms.role_name(), "doc:terms");
    }

    #[test]
    fn test_ensure_title() {
        assert_eq!(ensure_title("# Overview\nbody", "Overview"), "# Overview\nbody");
        assert_eq!(ensure_title("# Something else\nbody", "Overview"), "# Overview\nbody");
        assert_eq!(ensure_title("\n\nbody only", "Overview"), "# Overview\n\nbody only");
        assert_eq!(ensure_title("## Sub\ntext", "Training"), "# Training\n\n## Sub\ntext");
    }

    #[test]
    fn test_context_only_specs_disable_tools() {
        assert!(!AgentSpec::document(DocType::Overview, 40, true).uses_tools());
        assert!(AgentSpec::document(DocType::Overview, 40, false).uses_tools());
        assert!(!AgentSpec::qa(25, true).uses_tools());
        assert_eq!(AgentSpec::storyboard(0).output_shape, OutputShape::JsonStoryboard);
    }
}
