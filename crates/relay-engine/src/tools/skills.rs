use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use relay_core::tools::{Tool, ToolContext, ToolError, ToolResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkillSummary {
    pub id: String,
    pub summary: String,
}

/// Capability descriptions the model can browse and read on demand.
#[async_trait]
pub trait SkillStore: Send + Sync {
    async fn list_available_skills(&self) -> Result<Vec<SkillSummary>, ToolError>;
    /// `None` when no skill has that id.
    async fn read_skill(&self, id: &str) -> Result<Option<String>, ToolError>;
}

/// One skill per `<id>.md` file, with an optional frontmatter block:
///
/// ```text
/// ---
/// description: "Summarize an inbox"
/// ---
/// Full instructions...
/// ```
pub struct DirectorySkillStore {
    dir: PathBuf,
}

impl DirectorySkillStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn skill_path(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.dir.join(format!("{id}.md")))
    }
}

#[async_trait]
impl SkillStore for DirectorySkillStore {
    async fn list_available_skills(&self) -> Result<Vec<SkillSummary>, ToolError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ToolError::ExecutionFailed(e.to_string())),
        };

        let mut skills = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "md") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => {
                    let (description, body) = parse_frontmatter(&raw);
                    if body.trim().is_empty() {
                        continue;
                    }
                    let summary = description.unwrap_or_else(|| first_line(&body));
                    skills.push(SkillSummary { id, summary });
                }
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable skill"),
            }
        }
        skills.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(skills)
    }

    async fn read_skill(&self, id: &str) -> Result<Option<String>, ToolError> {
        let Some(path) = self.skill_path(id) else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(parse_frontmatter(&raw).1)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ToolError::ExecutionFailed(e.to_string())),
        }
    }
}

fn first_line(body: &str) -> String {
    body.lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Returns the frontmatter description (if any) and the body.
fn parse_frontmatter(raw: &str) -> (Option<String>, String) {
    let Some(after_start) = raw.strip_prefix("---\n") else {
        return (None, raw.to_string());
    };
    let Some(end) = after_start.find("\n---") else {
        return (None, raw.to_string());
    };

    let description = after_start[..end].lines().find_map(|line| {
        line.trim()
            .strip_prefix("description:")
            .map(|d| d.trim().trim_matches('"').to_string())
    });
    let body = after_start[end + 4..].trim_start().to_string();
    (description, body)
}

pub struct SkillsTool<S> {
    store: S,
}

impl<S: SkillStore> SkillsTool<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl SkillsTool<DirectorySkillStore> {
    pub fn from_dir(dir: &Path) -> Self {
        Self::new(DirectorySkillStore::new(dir))
    }
}

#[async_trait]
impl<S: SkillStore + 'static> Tool for SkillsTool<S> {
    fn name(&self) -> &str {
        "skills"
    }

    fn description(&self) -> &str {
        "List the available skills, or read one skill's full instructions before following it."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {"type": "string", "enum": ["list", "read"]},
                "id": {"type": "string", "description": "Skill id from `list`"}
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let mut result = match args["action"].as_str() {
            Some("list") => {
                let skills = self.store.list_available_skills().await?;
                if skills.is_empty() {
                    ToolResult::success("No skills available.")
                } else {
                    ToolResult::json(&serde_json::to_value(&skills).unwrap_or(Value::Null))
                }
            }
            Some("read") => {
                let id = args["id"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidArguments("id is required".into()))?;
                let body = self
                    .store
                    .read_skill(id)
                    .await?
                    .ok_or_else(|| ToolError::InvalidArguments(format!("unknown skill: {id}")))?;
                ToolResult::success(body)
            }
            Some(other) => return Err(ToolError::InvalidArguments(format!("unknown action: {other}"))),
            None => return Err(ToolError::InvalidArguments("action is required".into())),
        };
        result.duration = start.elapsed();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use relay_core::ids::{ConversationId, ToolCallId};
    use relay_core::tools::TurnRole;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx() -> ToolContext {
        ToolContext {
            conversation_id: ConversationId::new(),
            tool_call_id: ToolCallId::new(),
            role: TurnRole::Primary,
            working_directory: std::env::temp_dir(),
            abort_signal: CancellationToken::new(),
        }
    }

    #[test]
    fn frontmatter_parsing() {
        let (desc, body) = parse_frontmatter("---\ndescription: \"Commit changes\"\n---\nCommit the staged changes.");
        assert_eq!(desc.as_deref(), Some("Commit changes"));
        assert_eq!(body, "Commit the staged changes.");

        let (desc, body) = parse_frontmatter("# Plain\nbody");
        assert!(desc.is_none());
        assert_eq!(body, "# Plain\nbody");
    }

    #[tokio::test]
    async fn list_and_read() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("inbox.md"), "---\ndescription: Triage email\n---\nSort by sender.").unwrap();
        fs::write(dir.path().join("notes.md"), "# Daily notes\nWrite a summary.").unwrap();
        fs::write(dir.path().join("empty.md"), "---\ndescription: nothing\n---\n").unwrap();
        fs::write(dir.path().join("readme.txt"), "ignored").unwrap();

        let store = DirectorySkillStore::new(dir.path());
        let skills = store.list_available_skills().await.unwrap();
        assert_eq!(
            skills,
            vec![
                SkillSummary { id: "inbox".into(), summary: "Triage email".into() },
                SkillSummary { id: "notes".into(), summary: "Daily notes".into() },
            ]
        );

        let tool = SkillsTool::new(store);
        let res = tool.execute(json!({"action": "read", "id": "inbox"}), &ctx()).await.unwrap();
        assert_eq!(res.content, "Sort by sender.");

        let err = tool
            .execute(json!({"action": "read", "id": "../etc/passwd"}), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown skill"));
    }

    #[tokio::test]
    async fn missing_directory_lists_nothing() {
        let tool = SkillsTool::from_dir(Path::new("/nonexistent/relay-skills"));
        let res = tool.execute(json!({"action": "list"}), &ctx()).await.unwrap();
        assert_eq!(res.content, "No skills available.");
    }
}
