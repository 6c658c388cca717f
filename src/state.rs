//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::codec::Codec;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: SqlitePool,
    codec: Codec,
}

impl AppState {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                db,
                codec: Codec::default(),
            }),
        }
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Codec shared by every request
    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }
}
