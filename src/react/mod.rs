//! Agent 循环：请求模型、执行工具、按上限强制收尾

pub mod events;
pub mod loop_;

pub use events::AgentEvent;
pub use loop_::{incomplete_fallback, run_agent, AgentOutcome, AgentRun};
