//! 代码搜索工具：在仓库中按字面量或正则搜索（默认不区分大小写）
//!
//! 只扫描文件名匹配 file_glob 的文本文件，跳过忽略目录、过大文件与二进制文件；
//! 结果数量受 max_search_matches 限制，超出时置 truncated。

use std::path::Path;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::core::ToolError;
use crate::tools::filesystem::{keep_entry, looks_binary, SafeFs};
use crate::tools::schema::{parameters_schema, parse_args, SearchArgs};
use crate::tools::Tool;

/// 匹配行摘录的最大字符数
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub file_path: String,
    pub line_number: usize,
    pub matched_line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchOutcome {
    pub matches: Vec<SearchMatch>,
    pub truncated: bool,
}

impl SearchOutcome {
    pub fn render(&self, pattern: &str) -> String {
        if self.matches.is_empty() {
            return format!("No matches for '{pattern}'.");
        }
        let mut out = String::new();
        for m in &self.matches {
            out.push_str(&format!("{}:{}: {}\n", m.file_path, m.line_number, m.matched_line));
        }
        if self.truncated {
            out.push_str(&format!(
                "[truncated: result capped at {} matches; narrow the pattern or file_glob]\n",
                self.matches.len()
            ));
        }
        out
    }
}

/// file_glob 过滤：逗号分隔多个模式；含 `/` 的模式匹配相对路径，否则匹配文件名
struct FileFilter {
    patterns: Vec<(glob::Pattern, bool)>,
}

impl FileFilter {
    fn parse(file_glob: Option<&str>) -> Result<Self, ToolError> {
        let mut patterns = Vec::new();
        for raw in file_glob.unwrap_or("").split(',') {
            let raw = raw.trim();
            if raw.is_empty() || raw == "*" || raw == "**" {
                continue;
            }
            let pattern = glob::Pattern::new(raw)
                .map_err(|e| ToolError::InvalidPattern(format!("file_glob '{raw}': {e}")))?;
            patterns.push((pattern, raw.contains('/')));
        }
        Ok(Self { patterns })
    }

    fn matches(&self, file_name: &str, relative_path: &str) -> bool {
        self.patterns.is_empty()
            || self.patterns.iter().any(|(p, by_path)| {
                if *by_path {
                    p.matches(relative_path)
                } else {
                    p.matches(file_name)
                }
            })
    }
}

fn build_matcher(pattern: &str, is_regex: bool) -> Result<Regex, ToolError> {
    if pattern.is_empty() {
        return Err(ToolError::InvalidArguments(
            "search pattern must not be empty".to_string(),
        ));
    }
    let source = if is_regex {
        pattern.to_string()
    } else {
        regex::escape(pattern)
    };
    RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|e| ToolError::InvalidPattern(e.to_string()))
}

fn excerpt(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.chars().count() > EXCERPT_CHARS {
        trimmed.chars().take(EXCERPT_CHARS).collect()
    } else {
        trimmed.to_string()
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

impl SafeFs {
    /// 在整个仓库中搜索，结果按文件路径与行号排序
    pub fn search(
        &self,
        pattern: &str,
        file_glob: Option<&str>,
        is_regex: bool,
    ) -> Result<SearchOutcome, ToolError> {
        let matcher = build_matcher(pattern, is_regex)?;
        let filter = FileFilter::parse(file_glob)?;
        let limits = self.limits();
        let root = self.root();

        let mut outcome = SearchOutcome {
            matches: Vec::new(),
            truncated: false,
        };

        let files = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(keep_entry)
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file());

        'files: for entry in files {
            let rel = relative_path(root, entry.path());
            let name = entry.file_name().to_string_lossy();
            if !filter.matches(&name, &rel) {
                continue;
            }
            if entry
                .metadata()
                .map(|m| m.len() > limits.max_search_file_bytes)
                .unwrap_or(true)
            {
                continue;
            }
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            if looks_binary(&bytes) {
                continue;
            }
            let Ok(text) = std::str::from_utf8(&bytes) else {
                continue;
            };

            for (idx, line) in text.lines().enumerate() {
                if !matcher.is_match(line) {
                    continue;
                }
                if outcome.matches.len() >= limits.max_search_matches {
                    outcome.truncated = true;
                    break 'files;
                }
                outcome.matches.push(SearchMatch {
                    file_path: rel.clone(),
                    line_number: idx + 1,
                    matched_line: excerpt(line),
                });
            }
        }

        Ok(outcome)
    }
}

/// search 工具
pub struct SearchTool {
    fs: SafeFs,
}

impl SearchTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search file contents across the repository (case-insensitive). \
         Returns 'path:line: text' for each matching line; results are capped."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<SearchArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let args: SearchArgs = parse_args(self.name(), args)?;
        tracing::debug!(pattern = %args.pattern, file_glob = ?args.file_glob, "search");
        let fs = self.fs.clone();
        tokio::task::spawn_blocking(move || {
            fs.search(&args.pattern, args.file_glob.as_deref(), args.regex)
                .map(|o| o.render(&args.pattern))
        })
        .await
        .map_err(|e| ToolError::Io(format!("worker failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("app")).unwrap();
        fs::create_dir_all(root.join("node_modules/x")).unwrap();
        fs::write(root.join("app/main.py"), "# todo: refactor\nprint('hi')\n# TODO later\n").unwrap();
        fs::write(root.join("app/util.ts"), "// TODO ts\n").unwrap();
        fs::write(root.join("node_modules/x/a.py"), "# TODO vendored\n").unwrap();
        fs::write(root.join("blob.py"), [b'T', b'O', b'D', b'O', 0u8]).unwrap();
        dir
    }

    #[test]
    fn test_search_case_insensitive_with_glob() {
        let dir = repo();
        let fs = SafeFs::new(dir.path());
        let outcome = fs.search("TODO", Some("*.py"), false).unwrap();

        let found: Vec<(String, usize)> = outcome
            .matches
            .iter()
            .map(|m| (m.file_path.clone(), m.line_number))
            .collect();
        assert_eq!(
            found,
            vec![("app/main.py".to_string(), 1), ("app/main.py".to_string(), 3)]
        );
        assert_eq!(outcome.matches[0].matched_line, "# todo: refactor");
        assert!(!outcome.truncated);
    }

    #[test]
    fn test_search_caps_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..300).map(|i| format!("x = {i}  # TODO\n")).collect();
        fs::write(dir.path().join("many.py"), body).unwrap();

        let fs = SafeFs::new(dir.path());
        let outcome = fs.search("TODO", Some("*.py"), false).unwrap();
        assert_eq!(outcome.matches.len(), 200);
        assert!(outcome.truncated);
        assert!(outcome.render("TODO").contains("[truncated"));
    }

    #[test]
    fn test_exactly_cap_matches_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..200).map(|_| "TODO\n").collect();
        fs::write(dir.path().join("a.txt"), body).unwrap();
        let fs = SafeFs::new(dir.path());
        let outcome = fs.search("todo", None, false).unwrap();
        assert_eq!(outcome.matches.len(), 200);
        assert!(!outcome.truncated);
    }

    #[test]
    fn test_literal_vs_regex_and_multiple_globs() {
        let dir = repo();
        let fs = SafeFs::new(dir.path());

        assert!(fs.search("print(", None, false).unwrap().matches.len() == 1);
        assert!(matches!(
            fs.search("print(", None, true),
            Err(ToolError::InvalidPattern(_))
        ));
        let re = fs.search(r"^//\s*todo", None, true).unwrap();
        assert_eq!(re.matches.len(), 1);
        assert_eq!(re.matches[0].file_path, "app/util.ts");

        let both = fs.search("todo", Some("*.py, *.ts"), false).unwrap();
        assert_eq!(both.matches.len(), 3);
        let by_path = fs.search("todo", Some("app/*.ts"), false).unwrap();
        assert_eq!(by_path.matches.len(), 1);
    }

    #[test]
    fn test_long_lines_are_excerpted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("long.js"), format!("   needle{}\n", "z".repeat(500))).unwrap();
        let fs = SafeFs::new(dir.path());
        let outcome = fs.search("needle", None, false).unwrap();
        assert_eq!(outcome.matches[0].matched_line.chars().count(), 200);
        assert!(outcome.matches[0].matched_line.starts_with("needle"));
    }

    #[tokio::test]
    async fn test_search_tool_reports_no_matches() {
        let dir = repo();
        let tool = SearchTool::new(SafeFs::new(dir.path()));
        let out = tool
            .execute(serde_json::json!({"pattern": "nothing-here"}))
            .await
            .unwrap();
        assert_eq!(out, "No matches for 'nothing-here'.");
        let err = tool.execute(serde_json::json!({"pattern": ""})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
