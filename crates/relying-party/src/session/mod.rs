mod middleware;
mod store;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::{Rng, distr::Alphanumeric};
use serde_json::{Map, Value};

pub use middleware::session_layer;
pub use store::{MemorySessionStore, SessionError, SessionStore};

pub type SessionData = Map<String, Value>;

const SESSION_ID_LENGTH: usize = 40;

/// Keys this service stores in the session.
pub mod keys {
    pub const NEXT: &str = "next";
    pub const OP: &str = "op";
    pub const STATE: &str = "state";
    pub const NONCE: &str = "nonce";
    pub const PKCE_VERIFIER: &str = "pkce_verifier";
    pub const ID_TOKEN_RAW: &str = "id_token_raw";
    pub const USERINFO: &str = "userinfo";
    pub const AUTH_USER_ID: &str = "_auth_user_id";
}

/// Per-request handle to the server-side session named by the session cookie.
///
/// Clones share the same state, so the middleware sees what handlers changed.
#[derive(Clone, Debug, Default)]
pub struct Session {
    inner: Arc<Mutex<SessionState>>,
}

#[derive(Debug, Default)]
struct SessionState {
    loaded_id: Option<String>,
    id: Option<String>,
    data: SessionData,
    modified: bool,
}

/// What the middleware has to persist once the handler returned.
#[derive(Debug, PartialEq)]
pub(crate) struct SessionChanges {
    pub stale_id: Option<String>,
    pub save: Option<(String, SessionData)>,
    pub clear_cookie: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn loaded(id: String, data: SessionData) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionState {
                loaded_id: Some(id.clone()),
                id: Some(id),
                data,
                modified: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state().data.get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.state().data.get(key) {
            Some(Value::String(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn insert(&self, key: &str, value: impl Into<Value>) {
        let mut state = self.state();
        state.data.insert(key.to_string(), value.into());
        state.modified = true;
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut state = self.state();
        let removed = state.data.remove(key);
        if removed.is_some() {
            state.modified = true;
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().data.contains_key(key)
    }

    /// Drops all data and the current id.
    pub fn flush(&self) {
        let mut state = self.state();
        state.data.clear();
        state.id = None;
        state.modified = true;
    }

    /// Moves the data to a fresh id, leaving the old one behind.
    pub fn cycle_id(&self) {
        let mut state = self.state();
        state.id = None;
        state.modified = true;
    }

    pub(crate) fn take_changes(&self) -> SessionChanges {
        let mut state = self.state();

        let stale_id = match (&state.loaded_id, &state.id) {
            (Some(loaded), Some(current)) if loaded == current => None,
            (loaded, _) => loaded.clone(),
        };

        let mut changes = SessionChanges {
            stale_id,
            save: None,
            clear_cookie: false,
        };

        if !state.modified {
            return changes;
        }

        if state.data.is_empty() {
            // an emptied session that still has an id gets deleted outright
            if let Some(id) = state.id.take() {
                changes.stale_id.get_or_insert(id);
            }
            changes.clear_cookie = state.loaded_id.is_some();
        } else {
            let id = state.id.get_or_insert_with(generate_session_id).clone();
            changes.save = Some((id, state.data.clone()));
        }

        state.loaded_id = state.id.clone();
        state.modified = false;
        changes
    }
}

fn generate_session_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LENGTH)
        .map(char::from)
        .collect()
}
