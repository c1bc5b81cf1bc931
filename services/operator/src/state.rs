//! State shared with the health endpoints.

use std::sync::Arc;

use kos_store::SharedStore;

/// Shared application state, passed to handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: SharedStore,
}

impl AppState {
    pub fn new(store: SharedStore) -> Self {
        Self {
            inner: Arc::new(AppStateInner { store }),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }
}
