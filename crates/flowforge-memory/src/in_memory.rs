use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use flowforge_core::error::{FlowError, Result};
use flowforge_core::traits::MemoryStore;
use flowforge_core::types::ChatMessage;

/// Process-local session store. Sessions vanish with the process.
#[derive(Default)]
pub struct InMemoryStore {
    sessions: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sessions<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<ChatMessage>>) -> T) -> Result<T> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(f(&mut sessions))
    }
}

impl MemoryStore for InMemoryStore {
    fn load(&self, session_id: &str, window: usize) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let loaded = self.with_sessions(|sessions| {
            sessions
                .get(session_id)
                .map(|all| all[all.len().saturating_sub(window)..].to_vec())
                .unwrap_or_default()
        });
        Box::pin(async move { loaded })
    }

    fn save(&self, session_id: &str, messages: &[ChatMessage]) -> BoxFuture<'_, Result<()>> {
        let saved = self.with_sessions(|sessions| {
            sessions
                .entry(session_id.to_string())
                .or_default()
                .extend_from_slice(messages);
        });
        Box::pin(async move { saved })
    }

    fn clear(&self, session_id: &str) -> BoxFuture<'_, Result<()>> {
        let cleared = self.with_sessions(|sessions| {
            sessions.remove(session_id);
        });
        Box::pin(async move { cleared })
    }
}
