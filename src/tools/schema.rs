//! 工具参数结构与 JSON Schema 生成（schemars）
//!
//! 参数结构同时用于两处：生成提供给模型的 parameters schema，以及反序列化模型给出的 arguments，
//! 保证声明与解析一致。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;

/// list_tree 参数
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ListTreeArgs {
    /// Directory relative to the repository root. Use "/" or "." for the root.
    #[serde(default)]
    pub path: Option<String>,
    /// How many directory levels to descend (1 = direct children only).
    #[serde(default)]
    pub max_depth: Option<usize>,
}

/// read_file 参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// File path relative to the repository root.
    pub path: String,
    /// First line to return (1-based, inclusive). Omit to read from the start.
    #[serde(default)]
    pub start_line: Option<usize>,
    /// Last line to return (1-based, inclusive). Omit to read to the end.
    #[serde(default)]
    pub end_line: Option<usize>,
}

/// search 参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// Text to look for. Matched case-insensitively.
    pub pattern: String,
    /// Only search files whose name matches this glob, e.g. "*.py" or "*.ts,*.tsx".
    /// A glob containing "/" is matched against the repository-relative path.
    #[serde(default)]
    pub file_glob: Option<String>,
    /// Treat `pattern` as a regular expression instead of a literal string.
    #[serde(default)]
    pub regex: bool,
}

/// 生成参数类型的 JSON Schema（去掉顶层 title / $schema，符合 function parameters 格式）
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let root = schema_for!(T);
    let mut schema = serde_json::to_value(&root.schema).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object", "properties": {} })
    });
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("title");
        obj.remove("$schema");
    }
    schema
}

/// 将模型给出的 arguments 反序列化为参数结构；失败时返回 InvalidArguments，由模型自行纠正
pub fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    let args = match args {
        Value::Null => serde_json::json!({}),
        other => other,
    };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(format!("{tool}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_lists_required_fields() {
        let schema = parameters_schema::<ReadFileArgs>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["path"].is_object());
        assert!(schema["properties"]["start_line"].is_object());
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(required, vec!["path"]);
        assert!(schema.get("title").is_none());
    }

    #[test]
    fn test_parse_args_reports_invalid_arguments() {
        let ok: SearchArgs =
            parse_args("search", serde_json::json!({"pattern": "TODO", "file_glob": "*.py"})).unwrap();
        assert_eq!(ok.pattern, "TODO");
        assert!(!ok.regex);

        let err = parse_args::<SearchArgs>("search", serde_json::json!({"file_glob": "*.py"}))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(m) if m.contains("pattern")));

        let empty: ListTreeArgs = parse_args("list_tree", Value::Null).unwrap();
        assert!(empty.path.is_none());
    }
}
