use std::collections::HashMap;
use std::sync::Arc;

use relay_core::tools::{Tool, ToolDefinition, TurnRole};

/// Registry of available tools, keyed by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A later registration with the same name replaces the
    /// earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions offered to the model for a turn. Subagent turns do not see
    /// tools that are closed to them; the tools still check the role
    /// themselves at execution time.
    pub fn definitions_for(&self, role: &TurnRole) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| role.can_spawn_subagents() || t.available_to_subagents())
            .map(|t| t.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use relay_core::ids::RunId;
    use relay_core::tools::{ToolContext, ToolError, ToolResult};

    use super::*;

    struct DummyTool {
        name: &'static str,
        subagents: bool,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "A dummy tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn available_to_subagents(&self) -> bool {
            self.subagents
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::success("ok"))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for (name, subagents) in [("files", true), ("subagents", false), ("exec", true)] {
            registry.register(Arc::new(DummyTool { name, subagents }));
        }
        registry
    }

    #[test]
    fn register_get_unregister() {
        let mut registry = registry();
        assert_eq!(registry.count(), 3);
        assert!(registry.get("files").is_some());
        assert!(registry.unregister("files"));
        assert!(!registry.unregister("files"));
        assert!(!registry.contains("files"));
    }

    #[test]
    fn names_sorted() {
        assert_eq!(registry().names(), vec!["exec", "files", "subagents"]);
    }

    #[test]
    fn subagent_turns_hide_closed_tools() {
        let registry = registry();
        let primary = registry.definitions_for(&TurnRole::Primary);
        assert_eq!(primary.len(), 3);
        assert_eq!(primary[0].name, "exec");

        let child = registry.definitions_for(&TurnRole::Subagent { run_id: RunId::new() });
        let names: Vec<_> = child.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["exec", "files"]);
    }
}
