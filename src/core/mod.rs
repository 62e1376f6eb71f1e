//! 核心层：错误分类、恢复策略、运行监管（取消与时间预算）

pub mod error;
pub mod recovery;
pub mod session_supervisor;

pub use error::{
    AgentError, CloneError, ModelErrorKind, ModelServiceError, RecoveryAction, ToolError,
};
pub use recovery::{LoopFault, RecoveryEngine};
pub use session_supervisor::RunSupervisor;
