//! Sync cursor repository
//!
//! The watermark only moves forward, and only through the transaction that
//! commits the page it describes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseConnection, EntityTrait, Set};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::sync_cursor::{self, Entity as SyncCursor};

#[derive(Debug, Clone)]
pub struct SyncCursorRepository {
    db: Arc<DatabaseConnection>,
}

impl SyncCursorRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Last committed watermark for a connection
    pub async fn get(&self, connection_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        Ok(SyncCursor::find_by_id(connection_id)
            .one(&*self.db)
            .await?
            .map(|cursor| cursor.last_modified_at))
    }

    /// Move the watermark to `candidate` if that is later than the stored value.
    ///
    /// Returns the watermark after the call.
    pub async fn advance<C: ConnectionTrait>(
        conn: &C,
        connection_id: Uuid,
        candidate: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        match SyncCursor::find_by_id(connection_id).one(conn).await? {
            Some(existing) => {
                let watermark = existing.last_modified_at.max(candidate);
                let mut active: sync_cursor::ActiveModel = existing.into();
                active.last_modified_at = Set(watermark);
                active.last_synced_at = Set(now);
                active.updated_at = Set(now);
                active.update(conn).await?;
                Ok(watermark)
            }
            None => {
                let active = sync_cursor::ActiveModel {
                    connection_id: Set(connection_id),
                    last_modified_at: Set(candidate),
                    last_synced_at: Set(now),
                    updated_at: Set(now),
                };
                SyncCursor::insert(active)
                    .exec_without_returning(conn)
                    .await?;
                Ok(candidate)
            }
        }
    }
}
