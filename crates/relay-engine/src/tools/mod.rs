pub mod files;
pub mod schedule;
pub mod skills;
pub mod subagents;

use std::path::Path;
use std::sync::Arc;

use crate::exec::ExecTool;
use crate::registry::ToolRegistry;
use crate::subagent::SubagentOrchestrator;

use self::schedule::ScheduleStore;

/// Create a ToolRegistry with all built-in tools.
pub fn create_default_registry(
    exec: Arc<ExecTool>,
    subagents: Arc<SubagentOrchestrator>,
    schedule: Arc<dyn ScheduleStore>,
    workspace_dir: &Path,
    skills_dir: &Path,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    // Shell
    registry.register(exec);

    // Structured resources
    registry.register(Arc::new(files::FilesTool::new(files::WorkspaceFileStore::new(workspace_dir))));
    registry.register(Arc::new(schedule::RemindersTool::new(schedule.clone())));
    registry.register(Arc::new(schedule::CronTool::new(schedule)));
    registry.register(Arc::new(skills::SkillsTool::from_dir(skills_dir)));

    // Subagent
    registry.register(Arc::new(subagents::SubagentsTool::new(subagents)));

    registry
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast;

    use relay_core::tools::TurnRole;
    use relay_settings::ExecSettings;
    use relay_store::Database;

    use super::*;
    use crate::subagent::SubagentConfig;

    #[test]
    fn default_registry_contents() {
        let db = Database::in_memory().unwrap();
        let (tx, _) = broadcast::channel(8);
        let exec = Arc::new(ExecTool::new(&ExecSettings::default(), db.clone()));
        let subagents = Arc::new(SubagentOrchestrator::new(db, tx, SubagentConfig::default()));
        let dir = std::env::temp_dir();
        let registry = create_default_registry(
            exec,
            subagents,
            Arc::new(schedule::InMemoryScheduleStore::new()),
            &dir,
            &dir,
        );

        assert_eq!(
            registry.names(),
            ["cron", "exec", "files", "reminders", "skills", "subagents"]
        );
        let child_tools: Vec<String> = registry
            .definitions_for(&TurnRole::Subagent { run_id: relay_core::ids::RunId::new() })
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(!child_tools.contains(&"subagents".to_string()));
        assert_eq!(child_tools.len(), 5);
    }
}
