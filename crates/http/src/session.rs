use std::sync::{PoisonError, RwLock};

/// Source of the bearer token sent with every request.
///
/// The transport calls [`invalidate`](SessionStore::invalidate) when the
/// server answers 401, so every later request goes out unauthenticated
/// until a new token is stored.
pub trait SessionStore: Send + Sync {
    fn token(&self) -> Option<String>;

    fn invalidate(&self);
}

/// Session kept in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemorySession {
    token: RwLock<Option<String>>,
}

impl MemorySession {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.is_empty())),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }
}

impl SessionStore for MemorySession {
    fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn invalidate(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
