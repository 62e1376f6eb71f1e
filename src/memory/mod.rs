//! 记忆层：单次运行的对话日志（短期）与项目 / 产物持久化（长期）

pub mod conversation;
pub mod store;

pub use conversation::{Conversation, Role, ToolCall, Turn};
pub use store::{ArtifactStore, InMemoryStore, Project, ProjectStatus, SqliteStore, StoredArtifact};
