//! Pattern extraction over tool-use sequences
//!
//! Pure functions that derive file entities and tool statistics from the
//! tool uses of one session. Nothing here touches the store.

use crate::error::Result;
use crate::types::{Entity, EntityType, ToolStatus, ToolUse};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Tools whose `file_path` input names a file.
const FILE_PATH_TOOLS: &[&str] = &["Read", "Write", "Edit", "NotebookEdit"];

/// Tools whose `path` input names a directory or file.
const PATH_TOOLS: &[&str] = &["Glob", "Grep"];

/// Tools that modify the file named by their `file_path` input.
const MODIFYING_TOOLS: &[&str] = &["Write", "Edit", "NotebookEdit"];

/// A file modification observed in a tool-use sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct FileModification {
    pub path: String,
    /// Tool name that performed the modification
    pub operation: String,
    pub at: DateTime<Utc>,
}

/// Per-tool usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolCounts {
    pub count: i64,
    pub success_count: i64,
    pub error_count: i64,
}

/// Union of file paths touched by a tool-use sequence, in first-seen order.
///
/// Collects `file_path` inputs of file tools, `path` inputs of search tools,
/// and each non-empty line of successful Glob results.
pub fn file_paths(tool_uses: &[ToolUse]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut paths = Vec::new();
    let mut push = |path: &str| {
        let path = path.trim();
        if !path.is_empty() && seen.insert(path.to_string()) {
            paths.push(path.to_string());
        }
    };

    for tool_use in tool_uses {
        if FILE_PATH_TOOLS.contains(&tool_use.name.as_str()) {
            if let Some(path) = tool_use.input.get("file_path").and_then(|v| v.as_str()) {
                push(path);
            }
        }
        if PATH_TOOLS.contains(&tool_use.name.as_str()) {
            if let Some(path) = tool_use.input.get("path").and_then(|v| v.as_str()) {
                push(path);
            }
        }
        if tool_use.name == "Glob" && tool_use.status == ToolStatus::Success {
            if let Some(result) = &tool_use.result {
                for line in result.lines() {
                    push(line);
                }
            }
        }
    }

    paths
}

/// Modifications made by successful Write/Edit/NotebookEdit calls.
pub fn file_modifications(tool_uses: &[ToolUse]) -> Vec<FileModification> {
    tool_uses
        .iter()
        .filter(|t| MODIFYING_TOOLS.contains(&t.name.as_str()) && t.status == ToolStatus::Success)
        .filter_map(|t| {
            let path = t.input.get("file_path")?.as_str()?;
            Some(FileModification {
                path: path.to_string(),
                operation: t.name.clone(),
                at: t.emitted_at,
            })
        })
        .collect()
}

/// Tool name → usage counters.
pub fn tool_stats(tool_uses: &[ToolUse]) -> BTreeMap<String, ToolCounts> {
    let mut stats: BTreeMap<String, ToolCounts> = BTreeMap::new();
    for tool_use in tool_uses {
        let counts = stats.entry(tool_use.name.clone()).or_default();
        counts.count += 1;
        match tool_use.status {
            ToolStatus::Success => counts.success_count += 1,
            ToolStatus::Error => counts.error_count += 1,
            ToolStatus::Pending => {}
        }
    }
    stats
}

/// File paths as `file` entities with full confidence.
pub fn path_entities(paths: &[String]) -> Result<Vec<Entity>> {
    paths
        .iter()
        .map(|path| Entity::new(EntityType::File, path.as_str(), serde_json::Value::Null, 1.0))
        .collect()
}

/// Modifications as `file` entities carrying the lowercased operation.
pub fn modification_entities(modifications: &[FileModification]) -> Result<Vec<Entity>> {
    modifications
        .iter()
        .map(|m| {
            Entity::new(
                EntityType::File,
                m.path.as_str(),
                serde_json::json!({ "operation": m.operation.to_lowercase() }),
                1.0,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, input: serde_json::Value, status: ToolStatus, result: Option<&str>) -> ToolUse {
        let mut t = ToolUse::pending(
            format!("t-{}-{}", name, input.to_string().len()),
            "s1",
            name,
            input,
            Utc::now(),
        )
        .unwrap();
        match status {
            ToolStatus::Pending => {}
            ToolStatus::Success => t = t.completed(result.unwrap_or(""), false),
            ToolStatus::Error => t = t.completed(result.unwrap_or(""), true),
        }
        t
    }

    #[test]
    fn test_file_paths_union() {
        let tools = vec![
            tool("Read", json!({"file_path": "/a/main.rs"}), ToolStatus::Success, Some("...")),
            tool("Edit", json!({"file_path": "/a/lib.rs"}), ToolStatus::Success, Some("ok")),
            tool("Grep", json!({"path": "/a/src"}), ToolStatus::Success, Some("hit")),
            tool(
                "Glob",
                json!({"path": "/a"}),
                ToolStatus::Success,
                Some("/a/one.rs\n\n/a/two.rs\n"),
            ),
            // Duplicate path and an unrelated tool
            tool("Read", json!({"file_path": "/a/main.rs"}), ToolStatus::Success, Some("...")),
            tool("Bash", json!({"command": "ls"}), ToolStatus::Success, Some("x")),
        ];

        let paths = file_paths(&tools);
        assert_eq!(
            paths,
            vec!["/a/main.rs", "/a/lib.rs", "/a/src", "/a", "/a/one.rs", "/a/two.rs"]
        );
    }

    #[test]
    fn test_failed_glob_results_ignored() {
        let tools = vec![tool(
            "Glob",
            json!({"path": "/a"}),
            ToolStatus::Error,
            Some("/a/ghost.rs"),
        )];
        assert_eq!(file_paths(&tools), vec!["/a"]);
    }

    #[test]
    fn test_file_modifications_only_successful_writers() {
        let tools = vec![
            tool("Write", json!({"file_path": "/a/x.rs"}), ToolStatus::Success, Some("ok")),
            tool("Edit", json!({"file_path": "/a/y.rs"}), ToolStatus::Error, Some("no")),
            tool("Read", json!({"file_path": "/a/z.rs"}), ToolStatus::Success, Some("..")),
        ];

        let mods = file_modifications(&tools);
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].path, "/a/x.rs");
        assert_eq!(mods[0].operation, "Write");
    }

    #[test]
    fn test_tool_stats_counts() {
        let tools = vec![
            tool("Bash", json!({"command": "a"}), ToolStatus::Success, Some("")),
            tool("Bash", json!({"command": "bb"}), ToolStatus::Error, Some("")),
            tool("Bash", json!({"command": "ccc"}), ToolStatus::Pending, None),
            tool("Read", json!({"file_path": "/a"}), ToolStatus::Success, Some("")),
        ];

        let stats = tool_stats(&tools);
        assert_eq!(stats["Bash"].count, 3);
        assert_eq!(stats["Bash"].success_count, 1);
        assert_eq!(stats["Bash"].error_count, 1);
        assert_eq!(stats["Read"].count, 1);
    }

    #[test]
    fn test_entity_adapters() {
        let paths = vec!["/a/main.rs".to_string()];
        let entities = path_entities(&paths).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_type, EntityType::File);
        assert_eq!(entities[0].confidence, 1.0);

        let mods = vec![FileModification {
            path: "/a/main.rs".to_string(),
            operation: "Edit".to_string(),
            at: Utc::now(),
        }];
        let entities = modification_entities(&mods).unwrap();
        assert_eq!(entities[0].metadata, json!({"operation": "edit"}));
    }
}
