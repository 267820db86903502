//! Durable connection records.
//!
//! One row per socket, keyed by connection id. Compound fields (cap set,
//! buffer map, registration burst, temp scratch) travel as JSON strings so
//! the schema stays one flat table. Every write is insert-or-replace: a
//! record is saved many times over its life and the last write wins.

use super::DbError;
use sqlx::SqlitePool;

/// A connection's persisted state, as stored.
///
/// This is the raw row; `crate::state::ConnState` owns the deserialized
/// in-memory form and converts in both directions.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct ConnectionRow {
    pub conid: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub net_registered: bool,
    pub connected: bool,
    pub server_prefix: String,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub account: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub tlsverify: bool,
    pub bind_host: String,
    /// JSON object `{account, password}`.
    pub sasl: String,
    /// JSON array of raw IRC lines.
    pub registration_lines: String,
    /// JSON array of ISUPPORT tokens.
    pub isupports: String,
    /// JSON array of capability names.
    pub caps: String,
    /// JSON object keyed by lowercased buffer name.
    pub buffers: String,
    pub received_motd: bool,
    pub auth_user_id: i64,
    pub auth_network_id: i64,
    pub auth_network_name: String,
    pub auth_admin: bool,
    /// JSON array of connection ids.
    pub linked_incoming: String,
    pub logging: bool,
    /// JSON object of scratch keys.
    pub temp_data: String,
}

const SELECT_COLUMNS: &str = "conid, type, net_registered, connected, server_prefix, \
     nick, username, realname, account, password, host, port, tls, tlsverify, bind_host, \
     sasl, registration_lines, isupports, caps, buffers, received_motd, \
     auth_user_id, auth_network_id, auth_network_name, auth_admin, \
     linked_incoming, logging, temp_data";

/// Repository for durable connection records.
pub struct ConnectionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ConnectionRepository<'a> {
    /// Create a new connection repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert the full record keyed by conid.
    pub async fn save(&self, row: &ConnectionRow) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO connections
            (conid, type, net_registered, connected, server_prefix,
             nick, username, realname, account, password, host, port, tls, tlsverify, bind_host,
             sasl, registration_lines, isupports, caps, buffers, received_motd,
             auth_user_id, auth_network_id, auth_network_name, auth_admin,
             linked_incoming, logging, temp_data)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.conid)
        .bind(&row.kind)
        .bind(row.net_registered)
        .bind(row.connected)
        .bind(&row.server_prefix)
        .bind(&row.nick)
        .bind(&row.username)
        .bind(&row.realname)
        .bind(&row.account)
        .bind(&row.password)
        .bind(&row.host)
        .bind(row.port)
        .bind(row.tls)
        .bind(row.tlsverify)
        .bind(&row.bind_host)
        .bind(&row.sasl)
        .bind(&row.registration_lines)
        .bind(&row.isupports)
        .bind(&row.caps)
        .bind(&row.buffers)
        .bind(row.received_motd)
        .bind(row.auth_user_id)
        .bind(row.auth_network_id)
        .bind(&row.auth_network_name)
        .bind(row.auth_admin)
        .bind(&row.linked_incoming)
        .bind(row.logging)
        .bind(&row.temp_data)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Find a record by conid.
    pub async fn find(&self, conid: &str) -> Result<Option<ConnectionRow>, DbError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM connections WHERE conid = ?");
        let row = sqlx::query_as::<_, ConnectionRow>(&sql)
            .bind(conid)
            .fetch_optional(self.pool)
            .await?;
        Ok(row)
    }

    /// Load all records of the given connection type.
    pub async fn all_of_kind(&self, kind: &str) -> Result<Vec<ConnectionRow>, DbError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM connections WHERE type = ?");
        let rows = sqlx::query_as::<_, ConnectionRow>(&sql)
            .bind(kind)
            .fetch_all(self.pool)
            .await?;
        Ok(rows)
    }

    /// Remove the persisted row.
    pub async fn delete(&self, conid: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM connections WHERE conid = ?")
            .bind(conid)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove every record of the given connection type; returns rows
    /// removed. Used at boot to clear records whose sockets are gone.
    pub async fn delete_all_of_kind(&self, kind: &str) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM connections WHERE type = ?")
            .bind(kind)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
