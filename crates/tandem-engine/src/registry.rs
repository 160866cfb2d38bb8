use std::collections::BTreeMap;
use std::sync::Arc;

use tandem_core::tools::{Tool, ToolDefinition};

/// Tools the executor may dispatch to, kept in name order so the
/// definitions sent to the model are stable between requests.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. A tool already registered under the same name is
    /// returned.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let replaced = self.tools.insert(tool.name().to_string(), tool);
        if let Some(old) = &replaced {
            tracing::debug!(tool = old.name(), "tool replaced");
        }
        replaced
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}
