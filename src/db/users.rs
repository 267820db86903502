//! User and network repository: the credentials store.
//!
//! Authentication answers with records, never errors: a failed login is
//! `Ok(None)` so callers cannot confuse "bad password" with "database down".

use super::DbError;
use crate::security;
use sqlx::SqlitePool;

/// A bouncer user account.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub bind_host: Option<String>,
    pub admin: bool,
}

/// A network definition owned by a user.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NetworkRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub tlsverify: bool,
    pub bind_host: Option<String>,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub password: String,
    pub sasl_account: String,
    pub sasl_password: String,
}

const NETWORK_COLUMNS: &str = "id, user_id, name, host, port, tls, tlsverify, bind_host, \
     nick, username, realname, password, sasl_account, sasl_password";

/// Repository for user accounts and their networks.
pub struct UserRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> UserRepository<'a> {
    /// Create a new user repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Authenticate a user by name and password.
    pub async fn auth_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserRecord>, DbError> {
        let row = sqlx::query_as::<_, (i64, String, String, Option<String>, bool)>(
            "SELECT id, username, password_hash, bind_host, admin FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(self.pool)
        .await?;

        let Some((id, username, password_hash, bind_host, admin)) = row else {
            return Ok(None);
        };

        let ok = security::verify_password(password.to_string(), password_hash)
            .await
            .unwrap_or(false);

        if ok {
            Ok(Some(UserRecord {
                id,
                username,
                bind_host,
                admin,
            }))
        } else {
            Ok(None)
        }
    }

    /// Authenticate a user and resolve one of their networks by name.
    pub async fn auth_user_network(
        &self,
        username: &str,
        password: &str,
        network: &str,
    ) -> Result<Option<NetworkRecord>, DbError> {
        let Some(user) = self.auth_user(username, password).await? else {
            return Ok(None);
        };
        self.get_network_by_name(user.id, network).await
    }

    /// Fetch a user by id.
    pub async fn get_user(&self, id: i64) -> Result<Option<UserRecord>, DbError> {
        let row = sqlx::query_as::<_, (i64, String, Option<String>, bool)>(
            "SELECT id, username, bind_host, admin FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|(id, username, bind_host, admin)| UserRecord {
            id,
            username,
            bind_host,
            admin,
        }))
    }

    /// Fetch a network by id.
    pub async fn get_network(&self, id: i64) -> Result<Option<NetworkRecord>, DbError> {
        let sql = format!("SELECT {NETWORK_COLUMNS} FROM networks WHERE id = ?");
        let row = sqlx::query_as::<_, NetworkRecord>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(row)
    }

    /// Fetch a user's network by name (case-insensitive).
    pub async fn get_network_by_name(
        &self,
        user_id: i64,
        name: &str,
    ) -> Result<Option<NetworkRecord>, DbError> {
        let sql = format!(
            "SELECT {NETWORK_COLUMNS} FROM networks WHERE user_id = ? AND name = ? COLLATE NOCASE"
        );
        let row = sqlx::query_as::<_, NetworkRecord>(&sql)
            .bind(user_id)
            .bind(name)
            .fetch_optional(self.pool)
            .await?;
        Ok(row)
    }

    /// Fetch all networks owned by a user.
    pub async fn get_user_networks(&self, user_id: i64) -> Result<Vec<NetworkRecord>, DbError> {
        let sql = format!("SELECT {NETWORK_COLUMNS} FROM networks WHERE user_id = ? ORDER BY name");
        let rows = sqlx::query_as::<_, NetworkRecord>(&sql)
            .bind(user_id)
            .fetch_all(self.pool)
            .await?;
        Ok(rows)
    }

    /// Create a user if absent; returns the user id either way.
    ///
    /// Used by config-declared seed users, so it must be idempotent and must
    /// not rewrite the password of an existing account.
    pub async fn ensure_user(
        &self,
        username: &str,
        password: &str,
        admin: bool,
    ) -> Result<i64, DbError> {
        if let Some((id,)) =
            sqlx::query_as::<_, (i64,)>("SELECT id FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(self.pool)
                .await?
        {
            return Ok(id);
        }

        let hash = security::hash_password(password.to_string())
            .await
            .map_err(|e| DbError::Internal(format!("password hashing failed: {}", e)))?;

        let result = sqlx::query(
            "INSERT INTO users (username, password_hash, admin, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(username)
        .bind(&hash)
        .bind(admin)
        .bind(chrono::Utc::now().timestamp())
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Create a network definition for a user if absent; returns its id.
    #[allow(clippy::too_many_arguments)]
    pub async fn ensure_network(
        &self,
        user_id: i64,
        name: &str,
        host: &str,
        port: u16,
        tls: bool,
        nick: &str,
    ) -> Result<i64, DbError> {
        if let Some(existing) = self.get_network_by_name(user_id, name).await? {
            return Ok(existing.id);
        }

        let result = sqlx::query(
            "INSERT INTO networks (user_id, name, host, port, tls, nick) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(name)
        .bind(host)
        .bind(port as i64)
        .bind(tls)
        .bind(nick)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }
}
