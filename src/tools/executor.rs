//! 工具执行器
//!
//! 持有 ToolRegistry 与统一超时，对每次调用输出结构化审计日志（JSON）。
//! 工具错误与超时不会向上传播，而是转成 is_error = true 的 ToolResult 写回对话。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::ToolError;
use crate::llm::ToolSpec;
use crate::memory::ToolCall;
use crate::tools::ToolRegistry;

/// 一次工具调用的结果，通过 call_id 关联到对应调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(call_id: impl Into<String>, err: &ToolError) -> Self {
        Self {
            call_id: call_id.into(),
            content: format!("Error: {err}"),
            is_error: true,
        }
    }
}

/// 工具执行器：对每次调用施加超时
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// 不提供任何工具（仅依赖上下文作答）
    pub fn empty() -> Self {
        Self::new(ToolRegistry::new(), 1)
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let preview = args_preview(&call.arguments);
        let result = match timeout(
            self.timeout,
            self.registry.execute(&call.name, call.arguments.clone()),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(ToolError::Timeout(format!(
                "{} exceeded {}s",
                call.name,
                self.timeout.as_secs()
            ))),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ToolError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(content) => ToolResult::ok(&call.id, content),
            Err(e) => ToolResult::error(&call.id, &e),
        }
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.registry.tool_specs()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn has_tools(&self) -> bool {
        !self.registry.is_empty()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
