//! Context rendering
//!
//! Turns the bounded memory tail into the display string returned with each
//! command result.

use crate::models::{MemoryEntry, MemoryType};
use std::fmt::Write;

#[derive(Debug, Clone)]
pub struct ContextManager {
    max_turns: usize,
}

impl ContextManager {
    pub fn new(max_turns: usize) -> Self {
        Self { max_turns }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Render the newest `max_turns` entries, oldest first.
    ///
    /// An empty history renders as an empty string.
    pub fn render(&self, entries: &[MemoryEntry]) -> String {
        if entries.is_empty() || self.max_turns == 0 {
            return String::new();
        }

        let skip = entries.len().saturating_sub(self.max_turns);
        let mut context = String::from("## Conversation History\n\n");

        for entry in &entries[skip..] {
            let role = match entry.entry_type {
                MemoryType::Human => "**User**",
                MemoryType::Agent => "**Agent**",
                MemoryType::System => "**System**",
            };
            let _ = write!(
                context,
                "{}: {} ({})\n\n",
                role,
                entry.content,
                entry.timestamp.format("%H:%M:%S")
            );
        }

        context
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(10)
    }
}
