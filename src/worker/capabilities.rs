//! Workspace capabilities a worker may invoke.
//!
//! Three tools are offered, each only to workers whose template lists it:
//! `read_file`, `write_file` and `search_files`. Tool errors are always
//! returned as JSON strings (never `Err`) so the worker's model can observe
//! the error and react; a failing tool never fails the worker run.

use std::path::Path;

use serde_json::json;

use crate::completion::{ToolInvocation, ToolSpec};
use crate::safety::WorkspaceGuard;

/// Maximum number of paths returned by `search_files`.
const MAX_SEARCH_RESULTS: usize = 200;

/// Names of every capability this module implements.
pub const CAPABILITY_NAMES: [&str; 3] = ["read_file", "write_file", "search_files"];

/// Tool catalog for a shared workspace.
#[derive(Clone, Debug)]
pub struct WorkspaceTools {
    guard: WorkspaceGuard,
}

impl WorkspaceTools {
    pub fn new(workspace: &Path) -> std::io::Result<Self> {
        Ok(Self {
            guard: WorkspaceGuard::new(workspace)?,
        })
    }

    pub fn root(&self) -> &Path {
        self.guard.canonical_root()
    }

    /// Schemas for the capabilities named in `allowed`, in catalog order.
    /// Unknown names are ignored.
    pub fn manifest(&self, allowed: &[String]) -> Vec<ToolSpec> {
        define_tools()
            .into_iter()
            .filter(|spec| allowed.iter().any(|a| a == &spec.name))
            .collect()
    }

    /// Run one tool call on behalf of a worker limited to `allowed`.
    pub async fn execute(&self, call: &ToolInvocation, allowed: &[String]) -> String {
        if !allowed.iter().any(|a| a == &call.name) {
            return json!({"error": format!("Tool not available to this worker: {}", call.name)})
                .to_string();
        }

        match call.name.as_str() {
            "read_file" => self.read_file(call).await,
            "write_file" => self.write_file(call).await,
            "search_files" => self.search_files(call),
            unknown => json!({"error": format!("Unknown tool: {}", unknown)}).to_string(),
        }
    }

    async fn read_file(&self, call: &ToolInvocation) -> String {
        let Some(path) = call.arguments.get("path").and_then(|v| v.as_str()) else {
            return json!({"error": "read_file: missing or invalid 'path' argument"}).to_string();
        };

        let result = match self.guard.resolve_read(path) {
            Ok(target) => tokio::fs::read_to_string(target).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                json!({"error": format!("read_file: file not found: {}", path)}).to_string()
            }
            Err(e) => json!({"error": format!("read_file: {}", e)}).to_string(),
        }
    }

    async fn write_file(&self, call: &ToolInvocation) -> String {
        let Some(path) = call.arguments.get("path").and_then(|v| v.as_str()) else {
            return json!({"error": "write_file: missing or invalid 'path' argument"}).to_string();
        };
        let Some(content) = call.arguments.get("content").and_then(|v| v.as_str()) else {
            return json!({"error": "write_file: missing or invalid 'content' argument"})
                .to_string();
        };

        let target = match self.guard.prepare_write(path) {
            Ok(target) => target,
            Err(e) => return json!({"error": format!("write_file: {}", e)}).to_string(),
        };

        match tokio::fs::write(&target, content).await {
            Ok(()) => json!({"written_bytes": content.len(), "path": path}).to_string(),
            Err(e) => json!({"error": format!("write_file: {}", e)}).to_string(),
        }
    }

    fn search_files(&self, call: &ToolInvocation) -> String {
        let Some(pattern) = call.arguments.get("pattern").and_then(|v| v.as_str()) else {
            return json!({"error": "search_files: missing or invalid 'pattern' argument"})
                .to_string();
        };
        if pattern.contains("..") || Path::new(pattern).is_absolute() {
            return json!({"error": "search_files: pattern must be relative and must not contain '..'"})
                .to_string();
        }

        let full_pattern = format!("{}/{}", self.root().display(), pattern);
        let paths = match glob::glob(&full_pattern) {
            Ok(paths) => paths,
            Err(e) => {
                return json!({"error": format!("search_files: invalid pattern '{}': {}", pattern, e)})
                    .to_string();
            }
        };

        let mut matches: Vec<String> = paths
            .flatten()
            .filter_map(|entry| entry.canonicalize().ok())
            .filter_map(|canonical| self.guard.relative(&canonical))
            .collect();
        matches.sort();
        matches.dedup();

        let truncated = matches.len() > MAX_SEARCH_RESULTS;
        matches.truncate(MAX_SEARCH_RESULTS);
        json!({"matches": matches, "truncated": truncated}).to_string()
    }
}

/// Schemas of all workspace capabilities.
pub fn define_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "read_file",
            "Read the contents of a file. Relative paths resolve against the shared workspace.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to the file (relative to workspace)"
                    }
                },
                "required": ["path"]
            }),
        ),
        ToolSpec::new(
            "write_file",
            "Write content to a file in the shared workspace. Parent directories are \
             created as needed. Writes outside the workspace are rejected.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to the file (relative to workspace)"
                    },
                    "content": {
                        "type": "string",
                        "description": "Content to write"
                    }
                },
                "required": ["path", "content"]
            }),
        ),
        ToolSpec::new(
            "search_files",
            "Find files in the workspace matching a glob pattern such as `**/*.md`. \
             Returns workspace-relative paths.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {
                        "type": "string",
                        "description": "Glob pattern, relative to the workspace"
                    }
                },
                "required": ["pattern"]
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn all() -> Vec<String> {
        CAPABILITY_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn call(name: &str, args: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            call_id: "test-call-1".to_string(),
            name: name.to_string(),
            arguments: args,
        }
    }

    #[test]
    fn manifest_is_filtered_by_template_tools() {
        let tmp = TempDir::new().unwrap();
        let tools = WorkspaceTools::new(tmp.path()).unwrap();

        let names: Vec<String> = tools
            .manifest(&["search_files".to_string(), "bogus".to_string()])
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["search_files"]);
        assert_eq!(tools.manifest(&all()).len(), 3);
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let tools = WorkspaceTools::new(tmp.path()).unwrap();

        let out = tools
            .execute(&call("write_file", json!({"path": "notes/a.md", "content": "hello"})), &all())
            .await;
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["written_bytes"], 5);

        let read = tools
            .execute(&call("read_file", json!({"path": "notes/a.md"})), &all())
            .await;
        assert_eq!(read, "hello");
    }

    #[tokio::test]
    async fn write_outside_workspace_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        let tools = WorkspaceTools::new(&ws).unwrap();

        let out = tools
            .execute(&call("write_file", json!({"path": "../escape.txt", "content": "x"})), &all())
            .await;
        assert!(out.contains("error"));
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn disallowed_tool_returns_error_json() {
        let tmp = TempDir::new().unwrap();
        let tools = WorkspaceTools::new(tmp.path()).unwrap();

        let out = tools
            .execute(
                &call("write_file", json!({"path": "a.txt", "content": "x"})),
                &["read_file".to_string()],
            )
            .await;
        assert!(out.contains("not available"));
        assert!(!tmp.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn read_missing_file_reports_not_found() {
        let tmp = TempDir::new().unwrap();
        let tools = WorkspaceTools::new(tmp.path()).unwrap();

        let out = tools
            .execute(&call("read_file", json!({"path": "nope.txt"})), &all())
            .await;
        assert!(out.contains("file not found"));
    }

    #[tokio::test]
    async fn read_outside_workspace_is_rejected() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("secret.txt"), "top secret").unwrap();
        let tools = WorkspaceTools::new(&tmp.path().join("ws")).unwrap();

        let by_dotdot = tools
            .execute(&call("read_file", json!({"path": "../secret.txt"})), &all())
            .await;
        assert!(by_dotdot.contains("outside the workspace"));

        let absolute = tmp.path().join("secret.txt");
        let by_absolute = tools
            .execute(&call("read_file", json!({"path": absolute.to_str().unwrap()})), &all())
            .await;
        assert!(by_absolute.contains("outside the workspace"));
        assert!(!by_absolute.contains("top secret"));
    }

    #[tokio::test]
    async fn search_returns_sorted_relative_paths() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs")).unwrap();
        std::fs::write(tmp.path().join("docs/b.md"), "b").unwrap();
        std::fs::write(tmp.path().join("docs/a.md"), "a").unwrap();
        std::fs::write(tmp.path().join("c.txt"), "c").unwrap();
        let tools = WorkspaceTools::new(tmp.path()).unwrap();

        let out = tools
            .execute(&call("search_files", json!({"pattern": "**/*.md"})), &all())
            .await;
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["matches"], json!(["docs/a.md", "docs/b.md"]));
        assert_eq!(parsed["truncated"], false);
    }

    #[tokio::test]
    async fn search_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let tools = WorkspaceTools::new(tmp.path()).unwrap();

        let out = tools
            .execute(&call("search_files", json!({"pattern": "../*"})), &all())
            .await;
        assert!(out.contains("error"));
    }
}
