//! Built-in `filesystem` service — browse and read files under one root

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use portico_core::{
    ResourceContents, ResourceDescriptor, ResourceProvider, ServerInfo, ServiceCapabilities,
    ToolCallResult, ToolDescriptor, ToolError, ToolService, expand_home, json_schema,
};
use serde_json::Value;
use tracing::debug;

const MAX_DEPTH: usize = 3;
const MAX_READ_BYTES: u64 = 1024 * 1024;
const MAX_RESOURCES: usize = 200;

pub struct FilesystemService {
    root: PathBuf,
}

impl FilesystemService {
    pub fn new(root: &str) -> Self {
        let expanded = expand_home(root);
        Self {
            root: expanded.canonicalize().unwrap_or(expanded),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        resolve_under(&self.root, path)
    }

    async fn list_directory(&self, arguments: &Value) -> Result<ToolCallResult, ToolError> {
        let path = arguments
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();
        let recursive = arguments
            .get("recursive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        // The walk is synchronous std::fs work
        let root = self.root.clone();
        let entries = tokio::task::spawn_blocking(move || {
            let dir = resolve_under(&root, &path)?;
            if !dir.is_dir() {
                return Err(ToolError::invalid(format!("Not a directory: {}", path)));
            }
            debug!("Listing directory: {}", dir.display());

            let mut entries = Vec::new();
            list_dir(&dir, &dir, recursive, 0, &mut entries).map_err(|e| {
                ToolError::failed(format!("Failed to read {}: {}", dir.display(), e))
            })?;
            Ok(entries)
        })
        .await
        .map_err(|e| ToolError::failed(format!("Directory listing task failed: {}", e)))??;

        if entries.is_empty() {
            return Ok(ToolCallResult::text("Directory is empty."));
        }
        Ok(ToolCallResult::text(entries.join("\n")))
    }

    async fn read_file(&self, arguments: &Value) -> Result<ToolCallResult, ToolError> {
        let path = arguments
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::invalid("Missing 'path' parameter"))?;
        let file = self.resolve(path)?;
        let text = read_text(&file).await?;
        Ok(ToolCallResult::text(text))
    }
}

/// Resolve a user path (relative to `root`, or absolute) and make sure it
/// does not escape `root` once symlinks and `..` are resolved
fn resolve_under(root: &Path, path: &str) -> Result<PathBuf, ToolError> {
    let expanded = expand_home(path);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    };
    let canonical = joined
        .canonicalize()
        .map_err(|_| ToolError::invalid(format!("Path does not exist: {}", path)))?;

    if !canonical.starts_with(root) {
        return Err(ToolError::failed(format!(
            "Access denied: '{}' is outside {}",
            canonical.display(),
            root.display()
        )));
    }
    Ok(canonical)
}

async fn read_text(file: &Path) -> Result<String, ToolError> {
    let metadata = tokio::fs::metadata(file)
        .await
        .map_err(|e| ToolError::failed(format!("Failed to stat {}: {}", file.display(), e)))?;
    if !metadata.is_file() {
        return Err(ToolError::invalid(format!("Not a file: {}", file.display())));
    }
    if metadata.len() > MAX_READ_BYTES {
        return Err(ToolError::failed(format!(
            "File too large: {} bytes (limit {})",
            metadata.len(),
            MAX_READ_BYTES
        )));
    }
    let bytes = tokio::fs::read(file)
        .await
        .map_err(|e| ToolError::failed(format!("Failed to read {}: {}", file.display(), e)))?;
    if bytes.iter().take(512).any(|b| *b == 0) {
        return Err(ToolError::failed(format!(
            "Binary file not supported: {}",
            file.display()
        )));
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn list_dir(
    base: &Path,
    dir: &Path,
    recursive: bool,
    depth: usize,
    entries: &mut Vec<String>,
) -> std::io::Result<()> {
    let mut dir_entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    dir_entries.sort_by_key(|e| e.file_name());

    for entry in dir_entries {
        // Skip hidden files
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let name = path
            .strip_prefix(base)
            .unwrap_or(&path)
            .display()
            .to_string();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            entries.push(format!("{}/ (dir)", name));
            if recursive && depth < MAX_DEPTH {
                list_dir(base, &path, recursive, depth + 1, entries)?;
            }
        } else {
            let modified = metadata
                .modified()
                .ok()
                .map(|t| {
                    chrono::DateTime::<chrono::Utc>::from(t)
                        .format("%Y-%m-%d %H:%M")
                        .to_string()
                })
                .unwrap_or_default();
            entries.push(format!("{} ({}, {})", name, format_size(metadata.len()), modified));
        }
    }
    Ok(())
}

fn format_size(size: u64) -> String {
    if size < 1024 {
        format!("{} B", size)
    } else if size < 1024 * 1024 {
        format!("{:.1} KB", size as f64 / 1024.0)
    } else {
        format!("{:.1} MB", size as f64 / (1024.0 * 1024.0))
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("md") => "text/markdown",
        Some("json") => "application/json",
        Some("toml") => "application/toml",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        _ => "text/plain",
    }
}

#[async_trait]
impl ToolService for FilesystemService {
    fn server_info(&self) -> ServerInfo {
        ServerInfo::new("filesystem", env!("CARGO_PKG_VERSION"))
    }

    fn capabilities(&self) -> ServiceCapabilities {
        ServiceCapabilities::with_resources()
    }

    fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "list_directory".to_string(),
                description: "List files and directories. Paths are relative to the served root."
                    .to_string(),
                input_schema: json_schema(
                    serde_json::json!({
                        "path": {
                            "type": "string",
                            "description": "Directory to list (default: the root)"
                        },
                        "recursive": {
                            "type": "boolean",
                            "description": "List recursively (default: false, max depth: 3)"
                        }
                    }),
                    vec![],
                ),
            },
            ToolDescriptor {
                name: "read_file".to_string(),
                description: "Read a text file (up to 1 MB) under the served root.".to_string(),
                input_schema: json_schema(
                    serde_json::json!({
                        "path": {
                            "type": "string",
                            "description": "File to read"
                        }
                    }),
                    vec!["path"],
                ),
            },
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, ToolError> {
        match name {
            "list_directory" => self.list_directory(&arguments).await,
            "read_file" => self.read_file(&arguments).await,
            other => Err(ToolError::NotFound(other.to_string())),
        }
    }

    async fn initialize(&self) -> Result<(), ToolError> {
        if !self.root.is_dir() {
            return Err(ToolError::failed(format!(
                "Filesystem root is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceProvider for FilesystemService {
    /// Plain files directly under the root
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, ToolError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| ToolError::failed(format!("Failed to read {}: {}", self.root.display(), e)))?;

        let mut resources = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let path = entry.path();
            resources.push(ResourceDescriptor {
                uri: format!("file://{}", path.display()),
                mime_type: Some(mime_for(&path).to_string()),
                description: None,
                name,
            });
            if resources.len() >= MAX_RESOURCES {
                break;
            }
        }
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(resources)
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceContents, ToolError> {
        let path = uri
            .strip_prefix("file://")
            .ok_or_else(|| ToolError::invalid(format!("Unsupported resource URI: {}", uri)))?;
        let file = self.resolve(path)?;
        let text = read_text(&file).await?;
        Ok(ResourceContents {
            uri: uri.to_string(),
            mime_type: Some(mime_for(&file).to_string()),
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, FilesystemService) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.md"), "# Notes\nhello").unwrap();
        std::fs::write(dir.path().join(".hidden"), "secret").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("inner.txt"), "inner").unwrap();
        let service = FilesystemService::new(dir.path().to_str().unwrap());
        (dir, service)
    }

    fn text(result: &ToolCallResult) -> &str {
        &result.content[0].text
    }

    #[tokio::test]
    async fn test_list_directory() {
        let (_dir, service) = fixture();
        let result = service.call_tool("list_directory", serde_json::json!({})).await.unwrap();
        let listing = text(&result);
        assert!(listing.contains("notes.md"));
        assert!(listing.contains("sub/ (dir)"));
        assert!(!listing.contains(".hidden"));
        assert!(!listing.contains("inner.txt"));

        let result = service
            .call_tool("list_directory", serde_json::json!({"recursive": true}))
            .await
            .unwrap();
        assert!(text(&result).contains("inner.txt"));
    }

    #[tokio::test]
    async fn test_list_directory_errors() {
        let (_dir, service) = fixture();
        let err = service
            .call_tool("list_directory", serde_json::json!({"path": "notes.md"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let outside = TempDir::new().unwrap();
        let err = service
            .call_tool(
                "list_directory",
                serde_json::json!({"path": outside.path().to_str().unwrap()}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Access denied"));
    }

    #[tokio::test]
    async fn test_read_file() {
        let (_dir, service) = fixture();
        let result = service
            .call_tool("read_file", serde_json::json!({"path": "sub/inner.txt"}))
            .await
            .unwrap();
        assert_eq!(text(&result), "inner");
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_root() {
        let (dir, service) = fixture();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("x.txt"), "x").unwrap();

        let err = service
            .call_tool(
                "read_file",
                serde_json::json!({"path": outside.path().join("x.txt").to_str().unwrap()}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Access denied"));

        let err = service
            .call_tool("read_file", serde_json::json!({"path": "../"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed(_) | ToolError::InvalidArguments(_)));
        drop(dir);
    }

    #[tokio::test]
    async fn test_missing_path_parameter() {
        let (_dir, service) = fixture();
        let err = service.call_tool("read_file", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        let err = service.call_tool("delete_everything", Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resources() {
        let (_dir, service) = fixture();
        let resources = service.list_resources().await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "notes.md");
        assert_eq!(resources[0].mime_type.as_deref(), Some("text/markdown"));

        let contents = service.read_resource(&resources[0].uri).await.unwrap();
        assert!(contents.text.starts_with("# Notes"));

        assert!(service.read_resource("http://example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_initialize_requires_directory() {
        let (_dir, service) = fixture();
        assert!(service.initialize().await.is_ok());
        let missing = FilesystemService::new("/definitely/not/a/real/dir");
        assert!(missing.initialize().await.is_err());
    }
}
