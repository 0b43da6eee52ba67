//! `available_commands` payload types and the fixed general-command list
//! (§6 "General commands").

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEntry {
    pub id: String,
    pub label: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl CommandEntry {
    fn general(id: &str, label: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            kind: "command".to_string(),
        }
    }
}

/// The fixed, ordered list of 5 general commands every connection gets
/// regardless of working directory.
pub fn general_commands() -> Vec<CommandEntry> {
    vec![
        CommandEntry::general("git.status", "Git Status", "Show working tree status"),
        CommandEntry::general("git.push", "Git Push", "Push current branch to its upstream"),
        CommandEntry::general(
            "git.worktree.list",
            "List Worktrees",
            "List all git worktrees",
        ),
        CommandEntry::general("bd.ready", "Beads Ready", "List beads ready to work on"),
        CommandEntry::general("bd.list", "Beads List", "List all beads"),
    ]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn general_commands_has_exactly_five_entries_in_order() {
        let ids: Vec<&str> = general_commands().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["git.status", "git.push", "git.worktree.list", "bd.ready", "bd.list"]
        );
    }

    #[test]
    fn general_commands_are_all_type_command() {
        assert!(general_commands().iter().all(|c| c.kind == "command"));
    }
}
