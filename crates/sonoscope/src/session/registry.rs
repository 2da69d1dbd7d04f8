//! Bookkeeping of open sessions.
//!
//! Passed explicitly to [`super::SessionBuilder`]; sessions built without
//! one get a private registry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// One open session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    /// Session file the configuration was loaded from, if any
    pub config_path: Option<PathBuf>,
    pub opened_at: DateTime<Utc>,
}

/// Shared table of open sessions. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<BTreeMap<Uuid, SessionInfo>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: SessionInfo) {
        self.lock().insert(info.id, info);
    }

    pub fn deregister(&self, id: &Uuid) -> Option<SessionInfo> {
        self.lock().remove(id)
    }

    /// Open sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|info| info.opened_at);
        sessions
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Uuid, SessionInfo>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_list() {
        let registry = SessionRegistry::new();
        let first = SessionInfo {
            id: Uuid::new_v4(),
            config_path: None,
            opened_at: Utc::now(),
        };
        let second = SessionInfo {
            id: Uuid::new_v4(),
            config_path: Some(PathBuf::from("/etc/sonoscope/session.toml")),
            opened_at: first.opened_at + chrono::Duration::seconds(1),
        };
        registry.register(second.clone());
        registry.clone().register(first.clone());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list(), vec![first.clone(), second]);

        assert_eq!(registry.deregister(&first.id), Some(first.clone()));
        assert!(!registry.contains(&first.id));
        assert_eq!(registry.deregister(&first.id), None);
    }
}
