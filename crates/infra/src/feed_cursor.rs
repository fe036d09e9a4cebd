//! Change-feed cursor persistence.
//!
//! A cursor records the last change-log sequence number a named feed has handed
//! out. This enables:
//! - Resume after restart (the feed continues after the saved position)
//! - Deterministic replays (clear the cursor and the feed starts from "now")
//!
//! Cursors only move forward; saving an older position is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::store::StoreError;

#[async_trait]
pub trait FeedCursorStore: Send + Sync {
    /// Last persisted sequence number for a named feed.
    async fn load(&self, name: &str) -> Result<Option<i64>, StoreError>;

    /// Persist a new position (ignored if behind the stored one).
    async fn save(&self, name: &str, seq: i64) -> Result<(), StoreError>;

    async fn clear(&self, name: &str) -> Result<(), StoreError>;
}

/// In-memory cursor store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryFeedCursorStore {
    cursors: RwLock<HashMap<String, i64>>,
}

impl InMemoryFeedCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedCursorStore for InMemoryFeedCursorStore {
    async fn load(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let cursors = self
            .cursors
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(cursors.get(name).copied())
    }

    async fn save(&self, name: &str, seq: i64) -> Result<(), StoreError> {
        let mut cursors = self
            .cursors
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        let entry = cursors.entry(name.to_string()).or_insert(seq);
        *entry = (*entry).max(seq);
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<(), StoreError> {
        let mut cursors = self
            .cursors
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        cursors.remove(name);
        Ok(())
    }
}

/// Postgres-backed cursor store (`feed_cursors` table).
#[derive(Debug, Clone)]
pub struct PostgresFeedCursorStore {
    pool: Arc<PgPool>,
}

impl PostgresFeedCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl FeedCursorStore for PostgresFeedCursorStore {
    async fn load(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT last_seq FROM feed_cursors WHERE name = $1")
            .bind(name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("load cursor: {e}")))?;

        match row {
            Some(row) => row
                .try_get::<i64, _>("last_seq")
                .map(Some)
                .map_err(|e| StoreError::Decode(format!("last_seq: {e}"))),
            None => Ok(None),
        }
    }

    async fn save(&self, name: &str, seq: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feed_cursors (name, last_seq)
            VALUES ($1, $2)
            ON CONFLICT (name)
            DO UPDATE SET
                last_seq = GREATEST(feed_cursors.last_seq, EXCLUDED.last_seq),
                updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(seq)
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("save cursor: {e}")))?;
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM feed_cursors WHERE name = $1")
            .bind(name)
            .execute(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("clear cursor: {e}")))?;
        Ok(())
    }
}
