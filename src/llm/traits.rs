//! 模型服务抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 ModelClient：
//! 发送对话与工具 schema，返回最终文本或一组工具调用。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::ModelServiceError;
use crate::memory::{ToolCall, Turn};

/// 提供给模型的工具声明：名称、描述、参数 JSON Schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// 模型的一次回复
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// 最终答案
    Text(String),
    /// 需要执行工具；text 为模型随调用附带的说明（可能为空）
    ToolCalls { calls: Vec<ToolCall>, text: String },
}

impl ModelReply {
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        ModelReply::ToolCalls {
            calls,
            text: String::new(),
        }
    }
}

/// 模型服务客户端
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// 非流式完成；tools 为空时模型只能返回文本
    async fn complete(
        &self,
        conversation: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelServiceError>;

    /// 模型名（用于日志）
    fn model_name(&self) -> &str {
        "unknown"
    }

    /// 累计 token 使用：(prompt, completion, total)，默认 (0, 0, 0)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
