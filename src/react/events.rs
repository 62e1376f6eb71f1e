//! Agent 运行过程事件：供 CLI 等前端展示进度

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 开始第 round 次模型请求
    RoundStarted {
        role: String,
        round: usize,
        tool_calls: usize,
        max_tool_calls: usize,
    },
    /// 调用工具
    ToolCall {
        role: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    ToolResult {
        role: String,
        tool: String,
        is_error: bool,
        preview: String,
    },
    /// 带纠正提示重试
    Retry { role: String, reason: String },
    /// 工具调用次数用尽，要求模型立即作答
    ForcedFinish { role: String, tool_calls: usize },
    /// 运行结束
    Done {
        role: String,
        tool_calls: usize,
        round_trips: usize,
    },
}
