//! Application configuration: defaults, optional TOML file, CLI overrides
//! (CLI wins), following the same layering `codex-rs/core/src/config.rs`
//! uses for `~/.codex/config.toml`.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const CONFIG_TOML_FILE: &str = "config.toml";
const DEFAULT_KEY_FILENAME: &str = "voicecode.key";

/// Resolve `~/.voicecode`, creating it if it does not exist yet. Mirrors
/// `codex_dir()`'s role of anchoring every relative path the daemon uses.
pub fn voicecode_dir() -> std::io::Result<PathBuf> {
    let mut dir = dirs::home_dir()
        .ok_or_else(|| std::io::Error::other("could not determine home directory"))?;
    dir.push(".voicecode");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Values that may be set in `~/.voicecode/config.toml`. Every field is
/// optional; absent fields fall back to [`Config::default`]'s values.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    bind_address: Option<String>,
    transcript_root: Option<PathBuf>,
    key_file: Option<PathBuf>,
    agent_executable: Option<String>,
    agent_timeout_secs: Option<u64>,
    watcher_debounce_ms: Option<u64>,
    recipe_dir: Option<PathBuf>,
}

/// CLI flags that override the config file (see `voicecode-server`'s
/// `clap` parser). All fields are optional so that "unset on the CLI"
/// does not clobber a config-file value.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub transcript_root: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub agent_executable: Option<String>,
    pub agent_timeout_secs: Option<u64>,
}

/// Fully resolved configuration used by every subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// `host:port` the TCP listener binds.
    pub bind_address: String,

    /// Root of the transcript tree: `<transcript_root>/projects/<mangled>/<uuid>.jsonl`.
    pub transcript_root: PathBuf,

    /// Path to the shared-secret key file (§4.6).
    pub key_file: PathBuf,

    /// Executable invoked for each agent turn (§4.4).
    pub agent_executable: String,

    /// Upper bound on how long a single agent invocation may run.
    pub agent_timeout: Duration,

    /// Minimum gap between successive watcher callback firings for one
    /// session (§4.2 "Debouncing").
    pub watcher_debounce: Duration,

    /// Directory recipes (§4.5) are loaded from.
    pub recipe_dir: PathBuf,
}

impl Config {
    /// Load `~/.voicecode/config.toml` (if present) and apply `overrides`.
    /// Never fails on a missing config file — only a malformed one is an
    /// error, matching the bootstrap tolerance the key-file loader (§4.6)
    /// applies to its own file.
    pub fn load(overrides: ConfigOverrides) -> std::io::Result<Self> {
        let base = voicecode_dir()?;
        let toml_path = base.join(CONFIG_TOML_FILE);
        let from_file = read_config_toml(&toml_path)?;
        Ok(Self::merge(&base, from_file, overrides))
    }

    fn merge(base: &Path, from_file: ConfigToml, overrides: ConfigOverrides) -> Self {
        let transcript_root = overrides
            .transcript_root
            .or(from_file.transcript_root)
            .unwrap_or_else(|| base.to_path_buf());
        let key_file = overrides
            .key_file
            .or(from_file.key_file)
            .unwrap_or_else(|| base.join(DEFAULT_KEY_FILENAME));
        let recipe_dir = from_file.recipe_dir.unwrap_or_else(|| base.join("recipes"));

        Self {
            bind_address: overrides
                .bind_address
                .or(from_file.bind_address)
                .unwrap_or_else(|| "0.0.0.0:7777".to_string()),
            transcript_root,
            key_file,
            agent_executable: overrides
                .agent_executable
                .or(from_file.agent_executable)
                .unwrap_or_else(|| "claude".to_string()),
            agent_timeout: Duration::from_secs(
                overrides
                    .agent_timeout_secs
                    .or(from_file.agent_timeout_secs)
                    .unwrap_or(24 * 60 * 60),
            ),
            watcher_debounce: Duration::from_millis(from_file.watcher_debounce_ms.unwrap_or(200)),
            recipe_dir,
        }
    }

    #[cfg(test)]
    pub fn for_test(transcript_root: PathBuf) -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            transcript_root,
            key_file: PathBuf::from("/dev/null"),
            agent_executable: "true".to_string(),
            agent_timeout: Duration::from_secs(5),
            watcher_debounce: Duration::from_millis(20),
            recipe_dir: PathBuf::from("/dev/null"),
        }
    }
}

fn read_config_toml(path: &Path) -> std::io::Result<ConfigToml> {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents)
            .map_err(|e| std::io::Error::other(format!("invalid {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigToml::default()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn overrides_win_over_config_file_values() {
        let from_file = ConfigToml {
            bind_address: Some("1.2.3.4:9".to_string()),
            ..Default::default()
        };
        let overrides = ConfigOverrides {
            bind_address: Some("0.0.0.0:1".to_string()),
            ..Default::default()
        };
        let cfg = Config::merge(Path::new("/tmp/base"), from_file, overrides);
        assert_eq!(cfg.bind_address, "0.0.0.0:1");
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = Config::merge(Path::new("/tmp/base"), ConfigToml::default(), ConfigOverrides::default());
        assert_eq!(cfg.bind_address, "0.0.0.0:7777");
        assert_eq!(cfg.key_file, Path::new("/tmp/base").join(DEFAULT_KEY_FILENAME));
        assert_eq!(cfg.agent_timeout, Duration::from_secs(24 * 60 * 60));
    }
}
