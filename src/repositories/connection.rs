//! Connection repository for database operations
//!
//! Owns the `qb_connections` table. Tokens are encrypted on the way in and only
//! decrypted on request, bound to the owning user and realm through the AAD.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{CryptoKey, decrypt_token, encrypt_token, token_aad};
use crate::models::connection::{self, Entity as Connection, STATUS_ACTIVE, STATUS_REAUTH_REQUIRED};
use crate::models::{customer, invoice, sync_cursor};

/// Plaintext tokens of a connection
#[derive(Clone)]
pub struct ConnectionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for ConnectionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectionTokens([REDACTED])")
    }
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    db: Arc<DatabaseConnection>,
    crypto_key: CryptoKey,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    pub async fn find_by_user(&self, user_id: &str) -> Result<Option<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<connection::Model>> {
        Ok(Connection::find_by_id(id).one(&*self.db).await?)
    }

    /// Create or replace the user's connection after a successful authorization.
    ///
    /// Re-authorizing against a different company drops the data mirrored from
    /// the previous one, together with its sync cursor. Everything happens in one
    /// transaction, so readers never see a half-written connection.
    pub async fn upsert_for_user(
        &self,
        user_id: &str,
        realm_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<connection::Model> {
        let aad = token_aad(user_id, realm_id);
        let access_ciphertext = encrypt_token(&self.crypto_key, &aad, access_token)
            .map_err(|e| anyhow!("Token encryption failed: {}", e))?;
        let refresh_ciphertext = encrypt_token(&self.crypto_key, &aad, refresh_token)
            .map_err(|e| anyhow!("Token encryption failed: {}", e))?;

        let now = Utc::now();
        let txn = self.db.begin().await?;

        let existing = Connection::find()
            .filter(connection::Column::UserId.eq(user_id))
            .one(&txn)
            .await?;

        let id = match existing {
            Some(existing) => {
                if existing.realm_id != realm_id {
                    tracing::info!(
                        connection_id = %existing.id,
                        old_realm_id = %existing.realm_id,
                        new_realm_id = %realm_id,
                        "QuickBooks company changed; clearing mirrored data"
                    );
                    invoice::Entity::delete_many()
                        .filter(invoice::Column::ConnectionId.eq(existing.id))
                        .exec(&txn)
                        .await?;
                    customer::Entity::delete_many()
                        .filter(customer::Column::ConnectionId.eq(existing.id))
                        .exec(&txn)
                        .await?;
                    sync_cursor::Entity::delete_by_id(existing.id)
                        .exec(&txn)
                        .await?;
                }

                let id = existing.id;
                let mut active: connection::ActiveModel = existing.into();
                active.realm_id = Set(realm_id.to_string());
                active.status = Set(STATUS_ACTIVE.to_string());
                active.access_token_ciphertext = Set(access_ciphertext);
                active.refresh_token_ciphertext = Set(refresh_ciphertext);
                active.expires_at = Set(expires_at);
                active.updated_at = Set(now);
                active.update(&txn).await?;
                id
            }
            None => {
                let id = Uuid::new_v4();
                let active = connection::ActiveModel {
                    id: Set(id),
                    user_id: Set(user_id.to_string()),
                    realm_id: Set(realm_id.to_string()),
                    status: Set(STATUS_ACTIVE.to_string()),
                    access_token_ciphertext: Set(access_ciphertext),
                    refresh_token_ciphertext: Set(refresh_ciphertext),
                    expires_at: Set(expires_at),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                Connection::insert(active).exec_without_returning(&txn).await?;
                id
            }
        };

        txn.commit().await?;

        Connection::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| anyhow!("connection not persisted"))
    }

    /// Decrypts both tokens of a connection
    pub fn decrypt_tokens(&self, connection: &connection::Model) -> Result<ConnectionTokens> {
        let aad = token_aad(&connection.user_id, &connection.realm_id);
        let decrypt = |ciphertext: &[u8]| {
            decrypt_token(&self.crypto_key, &aad, ciphertext).map_err(|e| {
                tracing::error!(connection_id = %connection.id, "Token decryption failed");
                anyhow!("Token decryption failed: {}", e)
            })
        };

        Ok(ConnectionTokens {
            access_token: decrypt(&connection.access_token_ciphertext)?,
            refresh_token: decrypt(&connection.refresh_token_ciphertext)?,
        })
    }

    /// Store refreshed tokens and the new expiry
    pub async fn update_tokens(
        &self,
        connection: &connection::Model,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<connection::Model> {
        let aad = token_aad(&connection.user_id, &connection.realm_id);
        let access_ciphertext = encrypt_token(&self.crypto_key, &aad, access_token)
            .map_err(|e| anyhow!("Token encryption failed: {}", e))?;
        let refresh_ciphertext = encrypt_token(&self.crypto_key, &aad, refresh_token)
            .map_err(|e| anyhow!("Token encryption failed: {}", e))?;

        let mut active: connection::ActiveModel = connection.clone().into();
        active.access_token_ciphertext = Set(access_ciphertext);
        active.refresh_token_ciphertext = Set(refresh_ciphertext);
        active.expires_at = Set(expires_at);
        active.status = Set(STATUS_ACTIVE.to_string());
        active.updated_at = Set(Utc::now());

        active
            .update(&*self.db)
            .await
            .context("Failed to store refreshed tokens")
    }

    /// Flag a connection whose refresh token was rejected
    pub async fn mark_reauth_required(&self, id: Uuid) -> Result<()> {
        let Some(existing) = Connection::find_by_id(id).one(&*self.db).await? else {
            return Err(anyhow!("Connection with ID '{}' not found", id));
        };

        let mut active: connection::ActiveModel = existing.into();
        active.status = Set(STATUS_REAUTH_REQUIRED.to_string());
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;

        tracing::warn!(connection_id = %id, "Connection marked as requiring re-authorization");
        Ok(())
    }

    /// Remove the user's connection and everything mirrored through it
    pub async fn delete_by_user(&self, user_id: &str) -> Result<bool> {
        let txn = self.db.begin().await?;
        let Some(existing) = Connection::find()
            .filter(connection::Column::UserId.eq(user_id))
            .one(&txn)
            .await?
        else {
            return Ok(false);
        };

        invoice::Entity::delete_many()
            .filter(invoice::Column::ConnectionId.eq(existing.id))
            .exec(&txn)
            .await?;
        customer::Entity::delete_many()
            .filter(customer::Column::ConnectionId.eq(existing.id))
            .exec(&txn)
            .await?;
        sync_cursor::Entity::delete_by_id(existing.id)
            .exec(&txn)
            .await?;
        let result = Connection::delete_by_id(existing.id).exec(&txn).await?;
        txn.commit().await?;

        Ok(result.rows_affected > 0)
    }
}
