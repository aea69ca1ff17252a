//! Accepting MTA connections and running one session task per connection.

mod tcp;

pub use tcp::{BindConfig, BoundServer, MilterServer};

use crate::common::*;
use async_std::task::JoinHandle;
use std::collections::HashMap;

/// Live sessions, touched only on session start/end and during shutdown.
/// The slot is `None` between the announcement of a session and its task
/// handle landing, so a session that finishes instantly cannot leak an
/// entry.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: std::sync::Mutex<HashMap<SessionId, Option<JoinHandle<()>>>>,
}

impl SessionRegistry {
    pub(crate) fn announce(&self, id: SessionId) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(id, None);
        }
    }

    pub(crate) fn attach(&self, id: &SessionId, handle: JoinHandle<()>) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if let Some(slot) = sessions.get_mut(id) {
                *slot = Some(handle);
            }
            // otherwise the session already retired; the handle just drops
            // and the task is left to finish on its own
        }
    }

    pub(crate) fn retire(&self, id: &SessionId) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(id);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Empty the registry, handing out whatever task handles are attached.
    pub(crate) fn take_handles(&self) -> Vec<JoinHandle<()>> {
        match self.sessions.lock() {
            Ok(mut sessions) => sessions.drain().filter_map(|(_, handle)| handle).collect(),
            Err(_) => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    #[async_std::test]
    async fn registry_tracks_announce_and_retire() {
        let registry = SessionRegistry::default();
        let id = SessionId::generate();
        registry.announce(id.clone());
        assert_eq!(registry.len(), 1);
        registry.attach(&id, task::spawn(async {}));
        assert_eq!(registry.len(), 1);
        registry.retire(&id);
        assert_eq!(registry.len(), 0);
    }

    #[async_std::test]
    async fn attach_after_retire_does_not_resurrect() {
        let registry = SessionRegistry::default();
        let id = SessionId::generate();
        registry.announce(id.clone());
        registry.retire(&id);
        registry.attach(&id, task::spawn(async {}));
        assert_eq!(registry.len(), 0);
        assert!(registry.take_handles().is_empty());
    }
}
