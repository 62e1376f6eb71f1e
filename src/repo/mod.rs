//! 仓库层：克隆后端与按项目缓存的检出会话

pub mod clone;
pub mod session;

pub use clone::{parse_repo_url, GitCliCloner, RepoCloner, RepoUrl};
pub use session::{RepoSession, SessionCache};
