//! Project-specific command discovery via `Makefile` parsing (§4.1
//! `set_directory` dispatch entry).

use std::path::Path;

use voicecode_protocol::commands::CommandEntry;

/// Targets make emits by convention, not something a user would invoke
/// directly.
const SKIP_TARGETS: [&str; 3] = [".PHONY", ".DEFAULT", ".SUFFIXES"];

/// Parse `<working_directory>/Makefile` for target names and turn each
/// into a `CommandEntry`. Returns an empty list if there is no Makefile —
/// that is the common case, not an error.
pub fn discover(working_directory: &Path) -> Vec<CommandEntry> {
    let makefile = working_directory.join("Makefile");
    let Ok(contents) = std::fs::read_to_string(&makefile) else {
        return Vec::new();
    };
    parse_makefile(&contents)
}

fn parse_makefile(contents: &str) -> Vec<CommandEntry> {
    let mut targets = Vec::new();
    for line in contents.lines() {
        if line.starts_with('\t') || line.starts_with(' ') {
            continue;
        }
        let Some((name_part, _)) = line.split_once(':') else {
            continue;
        };
        let name = name_part.trim();
        if name.is_empty() || name.contains(' ') || name.contains('$') || name.contains('%') {
            continue;
        }
        if SKIP_TARGETS.contains(&name) {
            continue;
        }
        if targets.contains(&name.to_string()) {
            continue;
        }
        targets.push(name.to_string());
    }

    targets
        .into_iter()
        .map(|name| CommandEntry {
            id: format!("make.{name}"),
            label: name.clone(),
            description: format!("make {name}"),
            kind: "command".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn extracts_plain_targets() {
        let makefile = "build:\n\tcargo build\n\ntest:\n\tcargo test\n";
        let commands = parse_makefile(makefile);
        let ids: Vec<&str> = commands.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["make.build", "make.test"]);
    }

    #[test]
    fn skips_phony_and_indented_recipe_lines() {
        let makefile = ".PHONY: build\nbuild:\n\techo building\n";
        let commands = parse_makefile(makefile);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].id, "make.build");
    }

    #[test]
    fn skips_targets_with_make_variables_or_pattern_rules() {
        let makefile = "%.o: %.c\n\tcc -c $<\n$(BIN): main.o\n\tld main.o\n";
        assert!(parse_makefile(makefile).is_empty());
    }

    #[test]
    fn missing_makefile_yields_an_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(dir.path()).is_empty());
    }

    #[test]
    fn duplicate_target_definitions_appear_once() {
        let makefile = "build:\n\tcargo build\nbuild: extra-dep\n\techo ok\n";
        let commands = parse_makefile(makefile);
        assert_eq!(commands.len(), 1);
    }
}
