use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use relay_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolResult};

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("path must stay inside the workspace: {0}")]
    OutsideWorkspace(String),
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FileStoreError> for ToolError {
    fn from(e: FileStoreError) -> Self {
        match e {
            FileStoreError::OutsideWorkspace(_) => ToolError::NotPermitted(e.to_string()),
            FileStoreError::NotFound(_) => ToolError::InvalidArguments(e.to_string()),
            FileStoreError::Io(_) => ToolError::ExecutionFailed(e.to_string()),
        }
    }
}

/// File access for the model, addressed by workspace-relative paths.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<String, FileStoreError>;
    async fn write(&self, path: &str, content: &str) -> Result<usize, FileStoreError>;
    /// Entry names under `path`, directories suffixed with `/`, sorted.
    async fn list(&self, path: &str) -> Result<Vec<String>, FileStoreError>;
    async fn delete(&self, path: &str) -> Result<(), FileStoreError>;
}

/// [`FileStore`] rooted at one directory on disk.
pub struct WorkspaceFileStore {
    root: PathBuf,
}

impl WorkspaceFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Only plain relative components are accepted.
    fn resolve(&self, path: &str) -> Result<PathBuf, FileStoreError> {
        let rel = Path::new(path);
        let mut out = self.root.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(FileStoreError::OutsideWorkspace(path.to_string()))
                }
            }
        }
        Ok(out)
    }
}

fn not_found(path: &str, e: std::io::Error) -> FileStoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        FileStoreError::NotFound(path.to_string())
    } else {
        FileStoreError::Io(e)
    }
}

#[async_trait]
impl FileStore for WorkspaceFileStore {
    async fn read(&self, path: &str) -> Result<String, FileStoreError> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full).await.map_err(|e| not_found(path, e))
    }

    async fn write(&self, path: &str, content: &str) -> Result<usize, FileStoreError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(FileStoreError::OutsideWorkspace(path.to_string()));
        }
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(content.len())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, FileStoreError> {
        let full = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&full).await.map_err(|e| not_found(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, path: &str) -> Result<(), FileStoreError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(FileStoreError::OutsideWorkspace(path.to_string()));
        }
        tokio::fs::remove_file(&full).await.map_err(|e| not_found(path, e))
    }
}

pub struct FilesTool<S> {
    store: S,
}

impl<S: FileStore> FilesTool<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

fn path_arg(args: &Value) -> Result<&str, ToolError> {
    args["path"]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments("path is required".into()))
}

#[async_trait]
impl<S: FileStore + 'static> Tool for FilesTool<S> {
    fn name(&self) -> &str {
        "files"
    }

    fn description(&self) -> &str {
        "Read, write, list or delete files in the assistant workspace. Paths are relative to the workspace root."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {"type": "string", "enum": ["read", "write", "list", "delete"]},
                "path": {"type": "string", "description": "Workspace-relative path"},
                "content": {"type": "string", "description": "File content for write"}
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let action = args["action"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("action is required".into()))?;

        let content = match action {
            "read" => self.store.read(path_arg(&args)?).await?,
            "write" => {
                let path = path_arg(&args)?;
                let content = args["content"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidArguments("content is required".into()))?;
                let bytes = self.store.write(path, content).await?;
                format!("Wrote {bytes} bytes to {path}")
            }
            "list" => {
                let path = args["path"].as_str().unwrap_or("");
                let names = self.store.list(path).await?;
                if names.is_empty() {
                    "(empty directory)".to_string()
                } else {
                    names.join("\n")
                }
            }
            "delete" => {
                let path = path_arg(&args)?;
                self.store.delete(path).await?;
                format!("Deleted {path}")
            }
            other => return Err(ToolError::InvalidArguments(format!("unknown action: {other}"))),
        };

        Ok(ToolResult {
            content,
            is_error: false,
            duration: start.elapsed(),
        })
    }
}
