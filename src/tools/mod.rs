//! 仓库工具集：list_tree / read_file / search，全部只读且限定在克隆目录内

pub mod code_grep;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;

use std::path::Path;

pub use code_grep::{SearchMatch, SearchOutcome, SearchTool};
pub use executor::{ToolExecutor, ToolResult};
pub use filesystem::{
    EntryKind, ListTreeTool, ReadFileTool, RepoToolLimits, SafeFs, TreeEntry, TreeListing,
};
pub use registry::{Tool, ToolRegistry};

/// 为一个克隆目录创建完整的仓库工具集（顺序：list_tree, read_file, search）
pub fn create_repo_tools(root: impl AsRef<Path>, limits: RepoToolLimits) -> ToolRegistry {
    let fs = SafeFs::with_limits(root, limits);
    let mut registry = ToolRegistry::new();
    registry.register(ListTreeTool::new(fs.clone()));
    registry.register(ReadFileTool::new(fs.clone()));
    registry.register(SearchTool::new(fs));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_tools_declared_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = create_repo_tools(dir.path(), RepoToolLimits::default());
        assert_eq!(registry.tool_names(), vec!["list_tree", "read_file", "search"]);
        for spec in registry.tool_specs() {
            assert_eq!(spec.parameters["type"], "object");
        }
    }
}
