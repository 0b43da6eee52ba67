//! Workstream handles: a stable, user-facing pointer to zero or more
//! successive agent sessions (GLOSSARY "Workstream"). The core only
//! consumes this layer's CRUD; persistence is out of scope (§1), so the
//! default implementation here is in-memory and swappable behind
//! [`WorkstreamStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::recipe::WorkstreamLinkage;

#[derive(Debug, Clone, PartialEq)]
pub struct Workstream {
    pub workstream_id: String,
    pub name: Option<String>,
    pub working_directory: Option<String>,
    pub active_session_id: Option<String>,
}

pub trait WorkstreamStore: Send + Sync {
    fn create(&self, name: Option<String>, working_directory: Option<String>) -> Workstream;
    fn get(&self, workstream_id: &str) -> Option<Workstream>;
    fn list(&self) -> Vec<Workstream>;
    fn rename(&self, workstream_id: &str, name: Option<String>) -> Option<Workstream>;
    fn set_active_session(&self, workstream_id: &str, session_id: String) -> Option<Workstream>;

    /// Unlink the active session, preserving the workstream record
    /// (`clear_context`, §4.1 dispatch table). Returns the session id that
    /// was active before unlinking, if any.
    fn unlink_active_session(&self, workstream_id: &str) -> Option<String>;

    /// Reverse lookup used by the recipe orchestrator's `fresh_context`
    /// handling (§4.5).
    fn find_by_session(&self, session_id: &str) -> Option<String>;
}

#[derive(Clone, Default)]
pub struct InMemoryWorkstreamStore {
    inner: Arc<Mutex<HashMap<String, Workstream>>>,
}

impl InMemoryWorkstreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Workstream>> {
        self.inner.lock().expect("workstream store mutex poisoned")
    }
}

impl WorkstreamStore for InMemoryWorkstreamStore {
    fn create(&self, name: Option<String>, working_directory: Option<String>) -> Workstream {
        let workstream = Workstream {
            workstream_id: uuid::Uuid::new_v4().to_string(),
            name,
            working_directory,
            active_session_id: None,
        };
        self.lock()
            .insert(workstream.workstream_id.clone(), workstream.clone());
        workstream
    }

    fn get(&self, workstream_id: &str) -> Option<Workstream> {
        self.lock().get(workstream_id).cloned()
    }

    fn list(&self) -> Vec<Workstream> {
        self.lock().values().cloned().collect()
    }

    fn rename(&self, workstream_id: &str, name: Option<String>) -> Option<Workstream> {
        let mut table = self.lock();
        let workstream = table.get_mut(workstream_id)?;
        workstream.name = name;
        Some(workstream.clone())
    }

    fn set_active_session(&self, workstream_id: &str, session_id: String) -> Option<Workstream> {
        let mut table = self.lock();
        let workstream = table.get_mut(workstream_id)?;
        workstream.active_session_id = Some(session_id);
        Some(workstream.clone())
    }

    fn unlink_active_session(&self, workstream_id: &str) -> Option<String> {
        let mut table = self.lock();
        let workstream = table.get_mut(workstream_id)?;
        workstream.active_session_id.take()
    }

    fn find_by_session(&self, session_id: &str) -> Option<String> {
        self.lock()
            .values()
            .find(|w| w.active_session_id.as_deref() == Some(session_id))
            .map(|w| w.workstream_id.clone())
    }
}

impl<T: WorkstreamStore> WorkstreamLinkage for T {
    fn workstream_for_session(&self, session_id: &str) -> Option<String> {
        self.find_by_session(session_id)
    }

    fn unlink(&self, workstream_id: &str) -> Option<String> {
        self.unlink_active_session(workstream_id)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn create_then_get_round_trips() {
        let store = InMemoryWorkstreamStore::new();
        let created = store.create(Some("demo".to_string()), Some("/tmp".to_string()));
        let fetched = store.get(&created.workstream_id).unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn unlink_active_session_preserves_the_workstream_record() {
        let store = InMemoryWorkstreamStore::new();
        let workstream = store.create(None, None);
        store.set_active_session(&workstream.workstream_id, "s1".to_string());

        let previous = store.unlink_active_session(&workstream.workstream_id);
        assert_eq!(previous.as_deref(), Some("s1"));

        let still_there = store.get(&workstream.workstream_id).unwrap();
        assert_eq!(still_there.active_session_id, None);
    }

    #[test]
    fn unlinking_twice_is_harmless() {
        let store = InMemoryWorkstreamStore::new();
        let workstream = store.create(None, None);
        assert_eq!(store.unlink_active_session(&workstream.workstream_id), None);
        assert_eq!(store.unlink_active_session(&workstream.workstream_id), None);
    }

    #[test]
    fn find_by_session_reverse_lookup() {
        let store = InMemoryWorkstreamStore::new();
        let workstream = store.create(None, None);
        store.set_active_session(&workstream.workstream_id, "s1".to_string());
        assert_eq!(store.find_by_session("s1"), Some(workstream.workstream_id));
        assert_eq!(store.find_by_session("unknown"), None);
    }
}
