//! 仓库只读文件系统工具
//!
//! SafeFs 绑定克隆目录，所有路径相对于仓库根解析，经词法归一化与 canonicalize 双重校验，
//! 解析到根之外（`..` 穿越或符号链接）时返回 PathEscape。
//! ListTreeTool / ReadFileTool 基于 SafeFs 提供 list_tree / read_file 能力，从不写入仓库。

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use walkdir::{DirEntry, WalkDir};

use crate::core::ToolError;
use crate::tools::schema::{parameters_schema, parse_args, ListTreeArgs, ReadFileArgs};
use crate::tools::Tool;

/// 列目录与搜索时跳过的目录（依赖、构建产物、缓存）
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "dist",
    "build",
    "coverage",
    ".next",
    "__pycache__",
    "vendor",
    ".cache",
    "target",
];

/// 列目录与搜索时跳过的文件后缀（锁文件、压缩产物、媒体与二进制）
const IGNORED_SUFFIXES: &[&str] = &[
    ".lock", ".min.js", ".map", ".png", ".jpg", ".jpeg", ".gif", ".ico", ".svg", ".webp",
    ".woff", ".woff2", ".ttf", ".eot", ".otf", ".mp3", ".mp4", ".wav", ".mov", ".avi",
    ".zip", ".tar", ".gz", ".tgz", ".7z", ".rar", ".pdf", ".exe", ".dll", ".so", ".dylib",
];

/// 判定二进制时检查的前缀长度
const BINARY_SNIFF_BYTES: usize = 8192;

pub(crate) fn is_ignored_dir(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

pub(crate) fn is_ignored_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    IGNORED_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// walkdir 过滤：跳过忽略目录（根本身不过滤）
pub(crate) fn keep_entry(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() {
        !is_ignored_dir(&name)
    } else {
        !is_ignored_file(&name)
    }
}

/// 前缀含 NUL 视为二进制
pub(crate) fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

/// 仓库工具的输出上限
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoToolLimits {
    pub default_tree_depth: usize,
    pub max_tree_depth: usize,
    pub max_tree_entries: usize,
    pub max_read_bytes: usize,
    pub max_search_matches: usize,
    pub max_search_file_bytes: u64,
}

impl Default for RepoToolLimits {
    fn default() -> Self {
        Self {
            default_tree_depth: 2,
            max_tree_depth: 6,
            max_tree_entries: 500,
            max_read_bytes: 200_000,
            max_search_matches: 200,
            max_search_file_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    /// 相对仓库根的路径（`/` 分隔）
    pub relative_path: String,
    pub kind: EntryKind,
    /// 文件字节数；目录为 0
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeListing {
    pub entries: Vec<TreeEntry>,
    pub truncated: bool,
}

impl TreeListing {
    /// 渲染为给模型阅读的文本：目录以 `/` 结尾，文件带大小
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return "(no entries)".to_string();
        }
        let mut out = String::new();
        for e in &self.entries {
            match e.kind {
                EntryKind::Dir => out.push_str(&format!("{}/\n", e.relative_path)),
                EntryKind::File => {
                    out.push_str(&format!("{} ({} bytes)\n", e.relative_path, e.size))
                }
            }
        }
        if self.truncated {
            out.push_str(&format!(
                "[truncated: listing capped at {} entries; list a subdirectory for more]\n",
                self.entries.len()
            ));
        }
        out
    }
}

/// 沙箱文件系统：绑定仓库根目录
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
    limits: RepoToolLimits,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self::with_limits(root_dir, RepoToolLimits::default())
    }

    pub fn with_limits(root_dir: impl AsRef<Path>, limits: RepoToolLimits) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir, limits }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    pub fn limits(&self) -> &RepoToolLimits {
        &self.limits
    }

    /// 将模型给出的路径解析为仓库内的绝对路径
    ///
    /// - 空串、`.`、`/` 表示仓库根
    /// - 以 `/` 开头的路径视为相对仓库根（已位于根下的绝对路径除外）
    /// - `..` 越过根时返回 PathEscape；已存在的路径再经 canonicalize 检查符号链接
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let trimmed = path.trim();
        let raw = Path::new(trimmed);
        let relative: &Path = if raw.is_absolute() {
            raw.strip_prefix(&self.root_dir)
                .or_else(|_| raw.strip_prefix("/"))
                .unwrap_or(raw)
        } else {
            raw
        };

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(ToolError::PathEscape(trimmed.to_string()));
                    }
                }
                Component::Prefix(_) => return Err(ToolError::PathEscape(trimmed.to_string())),
            }
        }

        let full = self.root_dir.join(normalized);
        if full.symlink_metadata().is_ok() {
            let canonical = full
                .canonicalize()
                .map_err(|e| ToolError::Io(format!("{trimmed}: {e}")))?;
            if !canonical.starts_with(&self.root_dir) {
                return Err(ToolError::PathEscape(trimmed.to_string()));
            }
        }
        Ok(full)
    }

    fn relative_display(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root_dir).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// 列出目录树（深度优先，同级按文件名排序），深度被限制在 [1, max_tree_depth]
    ///
    /// 不存在的路径返回空结果而不是错误。
    pub fn list_tree(&self, path: &str, max_depth: Option<usize>) -> Result<TreeListing, ToolError> {
        let base = self.resolve(path)?;
        let mut listing = TreeListing {
            entries: Vec::new(),
            truncated: false,
        };
        if !base.exists() {
            return Ok(listing);
        }

        let depth = max_depth
            .unwrap_or(self.limits.default_tree_depth)
            .clamp(1, self.limits.max_tree_depth.max(1));

        let walker = WalkDir::new(&base)
            .min_depth(if base.is_dir() { 1 } else { 0 })
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(keep_entry)
            .filter_map(|e| e.ok());

        for entry in walker {
            if listing.entries.len() >= self.limits.max_tree_entries {
                listing.truncated = true;
                break;
            }
            let (kind, size) = if entry.file_type().is_dir() {
                (EntryKind::Dir, 0)
            } else {
                (
                    EntryKind::File,
                    entry.metadata().map(|m| m.len()).unwrap_or(0),
                )
            };
            listing.entries.push(TreeEntry {
                relative_path: self.relative_display(entry.path()),
                kind,
                size,
            });
        }
        Ok(listing)
    }

    /// 读取文本文件；二进制文件返回 "binary file, N bytes" 标记
    ///
    /// 给出 start_line / end_line（1 起、闭区间）时返回带行号的片段；
    /// 否则返回全文，超过 max_read_bytes 时截断并附说明。
    pub fn read_file(
        &self,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> Result<String, ToolError> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(ToolError::FileNotFound(path.trim().to_string()));
        }
        if !resolved.is_file() {
            return Err(ToolError::NotAFile(path.trim().to_string()));
        }

        let io_err = |e: std::io::Error| ToolError::Io(format!("{path}: {e}"));
        let file_len = std::fs::metadata(&resolved).map_err(io_err)?.len();
        let mut file = File::open(&resolved).map_err(io_err)?;

        let mut head = Vec::with_capacity(BINARY_SNIFF_BYTES.min(file_len as usize));
        (&mut file)
            .take(BINARY_SNIFF_BYTES as u64)
            .read_to_end(&mut head)
            .map_err(io_err)?;
        if looks_binary(&head) {
            return Ok(binary_marker(file_len));
        }
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;

        if start_line.is_none() && end_line.is_none() {
            return self.read_prefix(file, file_len).map_err(io_err);
        }

        let start = start_line.unwrap_or(1);
        if start == 0 {
            return Err(ToolError::InvalidArguments(
                "start_line is 1-based and must be at least 1".to_string(),
            ));
        }
        let wanted_end = end_line.unwrap_or(usize::MAX);
        let max_bytes = self.limits.max_read_bytes;

        // 逐行扫描：只保留区间内、上限以内的输出，其余只计数
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut total = 0usize;
        let mut out = String::new();
        let mut out_total = 0usize;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).map_err(io_err)? == 0 {
                break;
            }
            total += 1;
            if total < start || total > wanted_end {
                continue;
            }
            let Ok(line) = std::str::from_utf8(&buf) else {
                return Ok(binary_marker(file_len));
            };
            let line = line.strip_suffix('\n').unwrap_or(line);
            let line = line.strip_suffix('\r').unwrap_or(line);
            let numbered = format!("{total:>6}\t{line}\n");
            out_total += numbered.len();
            if out.len() <= max_bytes {
                out.push_str(&numbered);
            }
        }

        let end = wanted_end.min(total);
        if start > total {
            return Err(ToolError::InvalidArguments(format!(
                "start_line {start} is past the end of the file ({total} lines)"
            )));
        }
        if end < start {
            return Err(ToolError::InvalidArguments(format!(
                "end_line {end} is before start_line {start}"
            )));
        }
        Ok(truncate_text(out, max_bytes, out_total))
    }

    /// 只读取前 max_read_bytes 字节；截断说明里报告文件的真实大小
    fn read_prefix(&self, file: File, file_len: u64) -> std::io::Result<String> {
        let max_bytes = self.limits.max_read_bytes;
        let mut bytes = Vec::with_capacity(max_bytes.min(file_len as usize));
        file.take(max_bytes as u64).read_to_end(&mut bytes)?;
        let cut_short = (bytes.len() as u64) < file_len;

        let text = match String::from_utf8(bytes) {
            Ok(t) => t,
            // 上限切在多字节字符中间：丢掉残缺的尾部
            Err(e) if cut_short && e.utf8_error().error_len().is_none() => {
                let valid = e.utf8_error().valid_up_to();
                let mut bytes = e.into_bytes();
                bytes.truncate(valid);
                String::from_utf8(bytes).unwrap_or_default()
            }
            Err(_) => return Ok(binary_marker(file_len)),
        };
        let total = usize::try_from(file_len).unwrap_or(usize::MAX);
        Ok(truncate_text(text, max_bytes, total))
    }
}

fn binary_marker(len: u64) -> String {
    format!("binary file, {len} bytes")
}

/// 按字节上限截断（落在字符边界上）；total 为完整内容的字节数
fn truncate_text(mut text: String, max_bytes: usize, total: usize) -> String {
    if text.len() <= max_bytes && total <= text.len() {
        return text;
    }
    let mut cut = max_bytes.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(&format!(
        "\n\n[truncated: showing first {cut} of {total} bytes; use start_line/end_line to read the rest]"
    ));
    text
}

async fn run_blocking<F>(f: F) -> Result<String, ToolError>
where
    F: FnOnce() -> Result<String, ToolError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolError::Io(format!("worker failed: {e}")))?
}

/// list_tree 工具
pub struct ListTreeTool {
    fs: SafeFs,
}

impl ListTreeTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListTreeTool {
    fn name(&self) -> &str {
        "list_tree"
    }

    fn description(&self) -> &str {
        "List files and directories under a repository path, depth-first and sorted by name. \
         Directories end with '/', files show their size in bytes. \
         Dependency and build directories are omitted."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<ListTreeArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let args: ListTreeArgs = parse_args(self.name(), args)?;
        let path = args.path.unwrap_or_else(|| "/".to_string());
        tracing::debug!(path = %path, max_depth = ?args.max_depth, "list_tree");
        let fs = self.fs.clone();
        run_blocking(move || fs.list_tree(&path, args.max_depth).map(|l| l.render())).await
    }
}

/// read_file 工具
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the repository. Optionally pass start_line/end_line \
         (1-based, inclusive) to read a numbered excerpt of a large file."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<ReadFileArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let args: ReadFileArgs = parse_args(self.name(), args)?;
        tracing::debug!(path = %args.path, "read_file");
        let fs = self.fs.clone();
        run_blocking(move || fs.read_file(&args.path, args.start_line, args.end_line)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("package.json"), "{\"name\": \"demo\"}\n").unwrap();
        fs::write(root.join("src/main.py"), "import os\n\ndef main():\n    pass\n").unwrap();
        fs::write(root.join("src/nested/deep.txt"), "deep\n").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();
        fs::write(root.join("yarn.lock"), "lock").unwrap();
        fs::write(root.join("logo.bin"), [0u8, 1, 2, 3, 0]).unwrap();
        dir
    }

    fn paths(listing: &TreeListing) -> Vec<String> {
        listing.entries.iter().map(|e| e.relative_path.clone()).collect()
    }

    #[test]
    fn test_list_tree_depth_order_and_ignores() {
        let repo = sample_repo();
        let fs = SafeFs::new(repo.path());

        let listing = fs.list_tree("/", Some(2)).unwrap();
        assert_eq!(
            paths(&listing),
            vec!["logo.bin", "package.json", "src", "src/main.py", "src/nested"]
        );
        assert!(!listing.truncated);
        let pkg = &listing.entries[1];
        assert_eq!(pkg.kind, EntryKind::File);
        assert_eq!(pkg.size, 17);
        assert_eq!(listing.entries[2].kind, EntryKind::Dir);

        // 同一输入两次结果一致
        assert_eq!(fs.list_tree(".", Some(2)).unwrap(), listing);

        let deep = fs.list_tree("src", Some(5)).unwrap();
        assert!(paths(&deep).contains(&"src/nested/deep.txt".to_string()));
    }

    #[test]
    fn test_list_tree_missing_path_is_empty() {
        let repo = sample_repo();
        let fs = SafeFs::new(repo.path());
        let listing = fs.list_tree("does/not/exist", None).unwrap();
        assert!(listing.entries.is_empty());
        assert_eq!(listing.render(), "(no entries)");
    }

    #[test]
    fn test_list_tree_truncates_at_cap() {
        let repo = sample_repo();
        let limits = RepoToolLimits {
            max_tree_entries: 2,
            ..Default::default()
        };
        let fs = SafeFs::with_limits(repo.path(), limits);
        let listing = fs.list_tree("/", Some(3)).unwrap();
        assert_eq!(listing.entries.len(), 2);
        assert!(listing.truncated);
        assert!(listing.render().contains("[truncated"));
    }

    #[test]
    fn test_paths_outside_root_escape() {
        let repo = sample_repo();
        let fs = SafeFs::new(repo.path());
        for bad in ["..", "../etc", "src/../../x", "/../etc/passwd"] {
            assert!(
                matches!(fs.list_tree(bad, None), Err(ToolError::PathEscape(_))),
                "{bad} should escape"
            );
            assert!(matches!(
                fs.read_file(bad, None, None),
                Err(ToolError::PathEscape(_))
            ));
        }
        // 根内的 .. 允许
        assert!(fs.read_file("src/../package.json", None, None).is_ok());
        // 以 / 开头视为相对仓库根
        assert!(fs.read_file("/package.json", None, None).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let repo = sample_repo();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), repo.path().join("link")).unwrap();

        let fs = SafeFs::new(repo.path());
        assert!(matches!(
            fs.read_file("link/secret.txt", None, None),
            Err(ToolError::PathEscape(_))
        ));
        assert!(matches!(fs.list_tree("link", None), Err(ToolError::PathEscape(_))));
    }

    #[test]
    fn test_read_file_variants() {
        let repo = sample_repo();
        let fs = SafeFs::new(repo.path());

        let first = fs.read_file("src/main.py", None, None).unwrap();
        assert_eq!(first, "import os\n\ndef main():\n    pass\n");
        assert_eq!(fs.read_file("src/main.py", None, None).unwrap(), first);

        assert_eq!(fs.read_file("logo.bin", None, None).unwrap(), "binary file, 5 bytes");
        assert!(matches!(
            fs.read_file("missing.rs", None, None),
            Err(ToolError::FileNotFound(_))
        ));
        assert!(matches!(fs.read_file("src", None, None), Err(ToolError::NotAFile(_))));

        let excerpt = fs.read_file("src/main.py", Some(3), Some(4)).unwrap();
        assert_eq!(excerpt, "     3\tdef main():\n     4\t    pass\n");
        assert!(matches!(
            fs.read_file("src/main.py", Some(9), None),
            Err(ToolError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_read_file_truncates_large_text() {
        let repo = sample_repo();
        fs::write(repo.path().join("big.txt"), "a".repeat(100)).unwrap();
        let limits = RepoToolLimits {
            max_read_bytes: 10,
            ..Default::default()
        };
        let fs = SafeFs::with_limits(repo.path(), limits);
        let text = fs.read_file("big.txt", None, None).unwrap();
        assert!(text.starts_with("aaaaaaaaaa\n\n[truncated: showing first 10 of 100 bytes"));
    }

    #[test]
    fn test_read_file_large_file_reads_capped_prefix() {
        let repo = sample_repo();
        let mut body = "0123456789".repeat(100_000);
        body.push_str("TAIL");
        fs::write(repo.path().join("huge.txt"), &body).unwrap();
        let mut blob = vec![b'x'; 2_000_000];
        blob[10] = 0;
        fs::write(repo.path().join("huge.bin"), &blob).unwrap();
        let limits = RepoToolLimits {
            max_read_bytes: 1000,
            ..Default::default()
        };
        let fs = SafeFs::with_limits(repo.path(), limits);

        let text = fs.read_file("huge.txt", None, None).unwrap();
        let (content, note) = text.split_once("\n\n[truncated").unwrap();
        assert_eq!(content, &body[..1000]);
        assert!(note.contains("showing first 1000 of 1000004 bytes"));
        assert!(!text.contains("TAIL"));

        // 二进制标记报告磁盘上的真实大小
        assert_eq!(
            fs.read_file("huge.bin", None, None).unwrap(),
            "binary file, 2000000 bytes"
        );
    }

    #[test]
    fn test_read_file_cut_inside_multibyte_char() {
        let repo = sample_repo();
        fs::write(repo.path().join("wide.txt"), "ab\u{4e2d}\u{6587}").unwrap();
        let limits = RepoToolLimits {
            max_read_bytes: 4,
            ..Default::default()
        };
        let fs = SafeFs::with_limits(repo.path(), limits);
        let text = fs.read_file("wide.txt", None, None).unwrap();
        assert!(text.starts_with("ab\n\n[truncated: showing first 2 of 8 bytes"));
    }

    #[test]
    fn test_read_file_line_range_in_long_file() {
        let repo = sample_repo();
        let body: String = (1..=50_000).map(|i| format!("line {i}\r\n")).collect();
        fs::write(repo.path().join("long.txt"), body).unwrap();
        let limits = RepoToolLimits {
            max_read_bytes: 64,
            ..Default::default()
        };
        let fs = SafeFs::with_limits(repo.path(), limits);

        let excerpt = fs.read_file("long.txt", Some(49_999), None).unwrap();
        assert_eq!(excerpt, " 49999\tline 49999\n 50000\tline 50000\n");

        let wide = fs.read_file("long.txt", Some(1), Some(100)).unwrap();
        assert!(wide.starts_with("     1\tline 1\n"));
        assert!(wide.contains("[truncated: showing first 64 of"));

        let err = fs.read_file("long.txt", Some(50_001), None).unwrap_err();
        assert!(err.to_string().contains("50000 lines"));
    }

    #[tokio::test]
    async fn test_tools_parse_arguments() {
        let repo = sample_repo();
        let fs = SafeFs::new(repo.path());

        let tree = ListTreeTool::new(fs.clone())
            .execute(serde_json::json!({"path": "/", "max_depth": 1}))
            .await
            .unwrap();
        assert!(tree.contains("package.json (17 bytes)"));
        assert!(tree.contains("src/\n"));
        assert!(!tree.contains("node_modules"));

        let read = ReadFileTool::new(fs.clone());
        let err = read.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        let content = read
            .execute(serde_json::json!({"path": "package.json"}))
            .await
            .unwrap();
        assert!(content.contains("demo"));
    }
}
