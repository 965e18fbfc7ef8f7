// ABOUTME: Run-scoped agent state shared by the tools and the network loop
// ABOUTME: Accumulates generated files and holds the completion summary

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Empty until the agent reports completion
    pub summary: String,
    /// Path to content; paths may be overwritten but never removed
    pub files: BTreeMap<String, String>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        !self.summary.is_empty()
    }

    /// A run failed when it produced no summary or no files
    pub fn is_error(&self) -> bool {
        self.summary.is_empty() || self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let mut state = AgentState::new();
        assert!(state.is_error());

        state.summary = "Built a todo app".to_string();
        assert!(state.is_error());

        state
            .files
            .insert("app/page.tsx".to_string(), "export default 1".to_string());
        assert!(!state.is_error());

        state.summary.clear();
        assert!(state.is_error());
    }
}
