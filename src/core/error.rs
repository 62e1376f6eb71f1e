//! 错误类型与恢复动作
//!
//! 分三层：工具层（ToolError，写回对话由模型自行纠正）、会话层（CloneError）、
//! 循环层（AgentError，携带 project_id / role / 工具调用次数，直接返回给调用方）。

use std::fmt;

use thiserror::Error;

/// 工具执行错误：不会中断循环，而是作为 tool 结果文本交给模型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("path escapes repository root: {0}")]
    PathEscape(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid search pattern: {0}")]
    InvalidPattern(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool timed out: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(String),
}

/// 模型服务错误分类（类 HTTP 状态）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    RateLimited,
    Unauthorized,
    Unavailable,
    /// 响应无法解析为文本或工具调用
    Malformed,
    Other,
}

impl fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelErrorKind::RateLimited => "rate-limited",
            ModelErrorKind::Unauthorized => "unauthorized",
            ModelErrorKind::Unavailable => "unavailable",
            ModelErrorKind::Malformed => "malformed",
            ModelErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// 模型服务调用失败
#[derive(Error, Debug, Clone)]
#[error("model service error ({kind}): {message}")]
pub struct ModelServiceError {
    pub kind: ModelErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ModelServiceError {
    pub fn new(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::Malformed, message)
    }

    /// 限流 / 服务不可用时调用方可退避重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ModelErrorKind::RateLimited | ModelErrorKind::Unavailable
        )
    }
}

/// 克隆仓库失败；失败的克隆不会被记录为可用会话
#[derive(Error, Debug)]
pub enum CloneError {
    #[error("invalid repository url: {0}")]
    InvalidUrl(String),

    #[error("failed to clone {url}: {cause}")]
    Failed { url: String, cause: String },

    #[error("io error while preparing clone of {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

/// 循环层与编排层错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("[{project_id}/{role}] model service failed after {tool_calls} tool calls: {source}")]
    Model {
        project_id: String,
        role: String,
        tool_calls: usize,
        #[source]
        source: ModelServiceError,
    },

    #[error("[{project_id}/{role}] malformed model response after {tool_calls} tool calls: {detail}")]
    MalformedResponse {
        project_id: String,
        role: String,
        tool_calls: usize,
        detail: String,
    },

    #[error("[{project_id}/{role}] storyboard is not valid structured output: {detail}")]
    StoryboardFormat {
        project_id: String,
        role: String,
        tool_calls: usize,
        detail: String,
    },

    #[error("[{project_id}/{role}] cancelled after {tool_calls} tool calls")]
    Cancelled {
        project_id: String,
        role: String,
        tool_calls: usize,
    },

    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error("project {0} has no PROJECT.md yet; run analyze first")]
    MissingContext(String),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("unknown artifact: {0}")]
    UnknownArtifact(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Storage(e.to_string())
    }
}

/// 恢复引擎给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 追加一条纠正提示后再请求一次模型
    RetryWithPrompt(String),
    /// 终止本次运行，错误交给调用方
    Abort,
}
