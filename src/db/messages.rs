//! Message store.
//!
//! Persists PRIVMSG/NOTICE traffic per (user, network, buffer) so history
//! survives detach. Writes happen on the hot path; the schema is flat and
//! indexed on the lookup scope.

use super::DbError;
use sqlx::SqlitePool;

/// A stored message row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub buffer: String,
    pub sender: String,
    pub command: String,
    pub text: String,
    pub sent_at: i64,
}

/// Repository for the message store.
pub struct MessageRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MessageRepository<'a> {
    /// Create a new message repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one message.
    #[allow(clippy::too_many_arguments)]
    pub async fn store(
        &self,
        user_id: i64,
        network_id: i64,
        buffer: &str,
        sender: &str,
        command: &str,
        text: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO messages (user_id, network_id, buffer, sender, command, text, sent_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(network_id)
        .bind(buffer)
        .bind(sender)
        .bind(command)
        .bind(text)
        .bind(chrono::Utc::now().timestamp())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Fetch the most recent messages for a buffer, oldest first.
    pub async fn recent(
        &self,
        user_id: i64,
        network_id: i64,
        buffer: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, DbError> {
        let rows = sqlx::query_as::<_, (String, String, String, String, i64)>(
            "SELECT buffer, sender, command, text, sent_at FROM messages \
             WHERE user_id = ? AND network_id = ? AND buffer = ? \
             ORDER BY sent_at DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(network_id)
        .bind(buffer)
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .rev()
            .map(|(buffer, sender, command, text, sent_at)| StoredMessage {
                buffer,
                sender,
                command,
                text,
                sent_at,
            })
            .collect())
    }

    /// Delete all messages older than the given cutoff; returns rows removed.
    pub async fn prune(&self, cutoff: i64) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM messages WHERE sent_at < ?")
            .bind(cutoff)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
