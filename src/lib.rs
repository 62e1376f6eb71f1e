//! Onboarder - 仓库上手文档生成
//!
//! 克隆一个仓库，让带工具调用能力的 LLM 角色探索它，产出 PROJECT.md、各类文档、问答与视频分镜。
//!
//! 模块划分：
//! - **agent**: Onboarder 运行时（分析、文档、问答、分镜四个顶层动作）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、运行监管
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / DeepSeek / 脚本化）
//! - **memory**: 单次运行的对话日志与项目 / 产物持久化
//! - **react**: 有界的工具调用循环
//! - **repo**: 仓库克隆与按项目缓存的检出会话
//! - **roles**: 各角色的提示词、输出形态与分镜解析
//! - **tools**: 只读仓库工具（list_tree / read_file / search）与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod repo;
pub mod roles;
pub mod tools;

pub use agent::Onboarder;
