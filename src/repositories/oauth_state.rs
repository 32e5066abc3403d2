//! # OAuth State Repository
//!
//! Database operations for the single-use OAuth `state` values.

use chrono::{Duration, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::oauth_state::{self, ActiveModel, Entity, Model};

/// Outcome of consuming a state value
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumedState {
    Valid(Model),
    /// The state existed but its TTL had passed; it is deleted all the same
    Expired,
    /// Never issued, or already consumed by an earlier callback
    Unknown,
}

/// Repository for OAuth state database operations
#[derive(Debug, Clone)]
pub struct OAuthStateRepository {
    db: Arc<DatabaseConnection>,
}

impl OAuthStateRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Store a freshly issued state value
    pub async fn create(
        &self,
        user_id: &str,
        provider: &str,
        state: &str,
        return_to: Option<String>,
        expires_in_minutes: i64,
    ) -> Result<Model, sea_orm::DbErr> {
        let now = Utc::now();
        let model = Model {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            state: state.to_string(),
            return_to,
            expires_at: now + Duration::minutes(expires_in_minutes),
            created_at: now,
        };

        let active = ActiveModel {
            id: Set(model.id),
            user_id: Set(model.user_id.clone()),
            provider: Set(model.provider.clone()),
            state: Set(model.state.clone()),
            return_to: Set(model.return_to.clone()),
            expires_at: Set(model.expires_at),
            created_at: Set(model.created_at),
        };
        Entity::insert(active)
            .exec_without_returning(&*self.db)
            .await?;

        Ok(model)
    }

    /// Find and delete a state in one step.
    ///
    /// Only the caller whose delete actually removed the row gets `Valid`, so two
    /// concurrent callbacks with the same state cannot both proceed.
    pub async fn consume(&self, provider: &str, state: &str) -> Result<ConsumedState, sea_orm::DbErr> {
        let Some(found) = Entity::find()
            .filter(oauth_state::Column::Provider.eq(provider))
            .filter(oauth_state::Column::State.eq(state))
            .one(&*self.db)
            .await?
        else {
            return Ok(ConsumedState::Unknown);
        };

        let deleted = Entity::delete_by_id(found.id).exec(&*self.db).await?;
        if deleted.rows_affected == 0 {
            return Ok(ConsumedState::Unknown);
        }

        if found.expires_at <= Utc::now() {
            return Ok(ConsumedState::Expired);
        }

        Ok(ConsumedState::Valid(found))
    }

    /// Clean up expired OAuth states
    pub async fn cleanup_expired(&self) -> Result<u64, sea_orm::DbErr> {
        let result = Entity::delete_many()
            .filter(oauth_state::Column::ExpiresAt.lt(Utc::now()))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn repo() -> OAuthStateRepository {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        OAuthStateRepository::new(Arc::new(db))
    }

    #[tokio::test]
    async fn test_state_is_single_use() {
        let repo = repo().await;
        repo.create("user-1", "quickbooks", "abc", Some("http://app/done".into()), 10)
            .await
            .unwrap();

        match repo.consume("quickbooks", "abc").await.unwrap() {
            ConsumedState::Valid(model) => {
                assert_eq!(model.user_id, "user-1");
                assert_eq!(model.return_to.as_deref(), Some("http://app/done"));
            }
            other => panic!("expected valid state, got {:?}", other),
        }
        assert_eq!(
            repo.consume("quickbooks", "abc").await.unwrap(),
            ConsumedState::Unknown
        );
    }

    #[tokio::test]
    async fn test_expired_state_is_rejected_and_removed() {
        let repo = repo().await;
        repo.create("user-1", "quickbooks", "old", None, -1).await.unwrap();

        assert_eq!(
            repo.consume("quickbooks", "old").await.unwrap(),
            ConsumedState::Expired
        );
        assert_eq!(
            repo.consume("quickbooks", "old").await.unwrap(),
            ConsumedState::Unknown
        );
    }

    #[tokio::test]
    async fn test_provider_must_match_and_cleanup() {
        let repo = repo().await;
        repo.create("user-1", "quickbooks", "s1", None, 10).await.unwrap();
        repo.create("user-1", "quickbooks", "s2", None, -5).await.unwrap();

        assert_eq!(repo.consume("other", "s1").await.unwrap(), ConsumedState::Unknown);
        assert_eq!(repo.cleanup_expired().await.unwrap(), 1);
        assert!(matches!(
            repo.consume("quickbooks", "s1").await.unwrap(),
            ConsumedState::Valid(_)
        ));
    }
}
