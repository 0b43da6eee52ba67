//! Session metadata and the process-wide session index (§3 "SessionMetadata",
//! "SessionIndex"; §4.2 "Indexing").

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use regex_lite::Regex;

const UUID_PATTERN: &str =
    r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$";

fn uuid_regex() -> &'static Regex {
    static CELL: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    #[allow(clippy::expect_used)]
    CELL.get_or_init(|| Regex::new(UUID_PATTERN).expect("static UUID pattern is valid"))
}

/// Lowercase `raw` and check it against the canonical UUID shape. Accepts
/// any case on input (§8 invariant 5, §8 "Boundaries").
pub fn canonicalize_session_id(raw: &str) -> Option<String> {
    let lower = raw.to_ascii_lowercase();
    uuid_regex().is_match(&lower).then_some(lower)
}

/// A placeholder used when the working directory for a session cannot be
/// resolved yet (§3).
pub const UNRESOLVED_WORKING_DIRECTORY: &str = "[unresolved]";

#[derive(Debug, Clone, PartialEq)]
pub struct SessionMetadata {
    pub session_id: String,
    pub file_path: PathBuf,
    pub name: String,
    pub working_directory: String,
    pub created_at: i64,
    pub last_modified: i64,
    pub message_count: u64,
    pub preview: Option<String>,
    pub workstream_id: Option<String>,
    pub external: bool,
}

impl SessionMetadata {
    pub fn new(session_id: String, file_path: PathBuf, created_at: i64) -> Self {
        let name = format!("Session {}", &session_id[..8]);
        Self {
            session_id,
            file_path,
            name,
            working_directory: UNRESOLVED_WORKING_DIRECTORY.to_string(),
            created_at,
            last_modified: created_at,
            message_count: 0,
            preview: None,
            workstream_id: None,
            external: false,
        }
    }
}

/// Process-wide mapping from canonical session id to metadata. Lookups
/// canonicalize their key so `ABCD...`, `abcd...` and mixed case all hit
/// the same entry (§8 invariant 5).
#[derive(Clone, Default)]
pub struct SessionIndex {
    inner: Arc<RwLock<HashMap<String, SessionMetadata>>>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SessionMetadata>> {
        self.inner.read().expect("session index lock poisoned")
    }

    #[allow(clippy::expect_used)]
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SessionMetadata>> {
        self.inner.write().expect("session index lock poisoned")
    }

    pub fn insert(&self, metadata: SessionMetadata) {
        self.write().insert(metadata.session_id.clone(), metadata);
    }

    pub fn get(&self, session_id: &str) -> Option<SessionMetadata> {
        let canonical = canonicalize_session_id(session_id)?;
        self.read().get(&canonical).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionMetadata> {
        let canonical = canonicalize_session_id(session_id)?;
        self.write().remove(&canonical)
    }

    pub fn mutate<F, R>(&self, session_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut SessionMetadata) -> R,
    {
        let canonical = canonicalize_session_id(session_id)?;
        self.write().get_mut(&canonical).map(f)
    }

    pub fn all(&self) -> Vec<SessionMetadata> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Decide whether the index needs a full rebuild by comparing it
    /// against the set of `.jsonl` paths currently on disk (§4.2
    /// "Indexing" validation pass): a miss, an index entry whose file is
    /// gone, or a count divergence over 10% all trigger rebuild.
    pub fn needs_rebuild(&self, disk_paths: &[PathBuf]) -> bool {
        let table = self.read();
        let disk_set: std::collections::HashSet<&Path> =
            disk_paths.iter().map(PathBuf::as_path).collect();

        for metadata in table.values() {
            if !disk_set.contains(metadata.file_path.as_path()) {
                return true;
            }
        }
        let indexed_set: std::collections::HashSet<&Path> =
            table.values().map(|m| m.file_path.as_path()).collect();
        for path in disk_paths {
            if !indexed_set.contains(path.as_path()) {
                return true;
            }
        }

        let indexed = table.len() as f64;
        let disk = disk_paths.len() as f64;
        if disk > 0.0 && ((indexed - disk).abs() / disk) > 0.10 {
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn canonicalizes_uppercase_and_mixed_case() {
        let upper = "ABCD1234-0000-0000-0000-000000000000";
        let canonical = canonicalize_session_id(upper).unwrap();
        assert_eq!(canonical, upper.to_ascii_lowercase());
    }

    #[test]
    fn rejects_non_uuid_shapes() {
        assert!(canonicalize_session_id("not-a-uuid").is_none());
        assert!(canonicalize_session_id("abcd1234-0000-0000-0000-00000000000").is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let index = SessionIndex::new();
        let id = "abcd1234-0000-0000-0000-000000000000".to_string();
        index.insert(SessionMetadata::new(id.clone(), PathBuf::from("/x.jsonl"), 0));

        let via_upper = index.get(&id.to_ascii_uppercase()).unwrap();
        assert_eq!(via_upper.session_id, id);
    }

    #[test]
    fn needs_rebuild_when_indexed_file_is_gone_from_disk() {
        let index = SessionIndex::new();
        index.insert(SessionMetadata::new(
            "abcd1234-0000-0000-0000-000000000000".to_string(),
            PathBuf::from("/gone.jsonl"),
            0,
        ));
        assert!(index.needs_rebuild(&[]));
    }

    #[test]
    fn needs_rebuild_when_disk_has_unindexed_file() {
        let index = SessionIndex::new();
        assert!(index.needs_rebuild(&[PathBuf::from("/new.jsonl")]));
    }

    #[test]
    fn no_rebuild_when_index_matches_disk_exactly() {
        let index = SessionIndex::new();
        let path = PathBuf::from("/a.jsonl");
        index.insert(SessionMetadata::new(
            "abcd1234-0000-0000-0000-000000000000".to_string(),
            path.clone(),
            0,
        ));
        assert!(!index.needs_rebuild(&[path]));
    }
}
