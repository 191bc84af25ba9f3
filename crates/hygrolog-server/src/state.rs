//! Application state shared across handlers.

use std::sync::Arc;

use chrono_tz::Tz;
use hygrolog_core::SqliteStore;

/// State handle passed to every handler.
pub type SharedState = Arc<AppState>;

/// Read-only view over the reading store.
#[derive(Debug)]
pub struct AppState {
    store: SqliteStore,
    timezone: Tz,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub const fn new(store: SqliteStore, timezone: Tz) -> Self {
        Self { store, timezone }
    }

    /// Wrap into a [`SharedState`].
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }

    /// The reading store.
    #[must_use]
    pub const fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Timezone used to render timestamps.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.timezone
    }
}
