//! The durable per-connection record.
//!
//! One `ConnState` exists per socket: incoming client, outgoing upstream
//! link, or listener. The record is hydrated from the `connections` table on
//! first use, mutated by the protocol state machines, and saved on every
//! meaningful transition. A save must complete before the transition's
//! acknowledgement goes out, so an observable change is always durable.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slbnc_proto::chan::{self, DEFAULT_CHANTYPES};
use slbnc_proto::irc_to_lower;

use crate::db::{ConnectionRow, Database, DbError, UserRepository};
use crate::state::Buffer;

/// Temp-scratch keys used by the registration machinery.
pub const TEMP_CAPPING: &str = "capping";
pub const TEMP_REG_STATE: &str = "reg.state";
pub const TEMP_REG_QUEUE: &str = "reg.queue";

/// What kind of socket a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConKind {
    /// Outbound link from the bouncer to an IRC network.
    Outgoing,
    /// Inbound connection from an end-user client.
    Incoming,
    /// A listening socket.
    Listening,
}

impl ConKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConKind::Outgoing => "outgoing",
            ConKind::Incoming => "incoming",
            ConKind::Listening => "listening",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "outgoing" => ConKind::Outgoing,
            "listening" => ConKind::Listening,
            _ => ConKind::Incoming,
        }
    }
}

/// SASL credentials for an upstream link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslCreds {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub password: String,
}

/// Client registration scratch: the PASS/NICK/USER triple collected before
/// authentication can run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegState {
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

impl RegState {
    /// All three pieces present.
    pub fn complete(&self) -> bool {
        !self.nick.is_empty() && !self.user.is_empty() && !self.pass.is_empty()
    }
}

/// Durable state for one connection.
pub struct ConnState {
    con_id: String,
    pub kind: ConKind,
    loaded: bool,
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
    pub sasl: SaslCreds,
    /// Raw lines captured from the upstream between connect and end-of-MOTD,
    /// replayed to re-attaching clients.
    pub registration_lines: Vec<String>,
    /// ISUPPORT tokens from upstream, in arrival order.
    pub isupports: Vec<String>,
    /// Negotiated capability names.
    pub caps: HashSet<String>,
    buffers: HashMap<String, Buffer>,
    pub received_motd: bool,
    pub auth_user_id: i64,
    pub auth_network_id: i64,
    pub auth_network_name: String,
    pub auth_admin: bool,
    /// Client connection ids attached to this upstream. Only meaningful on
    /// outgoing records.
    pub linked_incoming: HashSet<String>,
    pub logging: bool,
    temp_data: HashMap<String, Value>,
    db: Database,
}

impl ConnState {
    /// Create a fresh record with default fields.
    pub fn new(con_id: impl Into<String>, kind: ConKind, db: Database) -> Self {
        Self {
            con_id: con_id.into(),
            kind,
            loaded: false,
            net_registered: false,
            connected: false,
            server_prefix: "bnc".to_string(),
            nick: String::new(),
            username: String::new(),
            realname: String::new(),
            account: String::new(),
            password: String::new(),
            host: String::new(),
            port: 6697,
            tls: false,
            tlsverify: true,
            bind_host: String::new(),
            sasl: SaslCreds::default(),
            registration_lines: Vec::new(),
            isupports: Vec::new(),
            caps: HashSet::new(),
            buffers: HashMap::new(),
            received_motd: false,
            auth_user_id: 0,
            auth_network_id: 0,
            auth_network_name: String::new(),
            auth_admin: false,
            linked_incoming: HashSet::new(),
            logging: true,
            temp_data: HashMap::new(),
            db,
        }
    }

    pub fn con_id(&self) -> &str {
        &self.con_id
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Idempotent hydrate: no-op once loaded.
    pub async fn maybe_load(&mut self) -> Result<(), DbError> {
        if self.loaded {
            return Ok(());
        }
        self.load().await
    }

    /// Replace in-memory fields from the persisted row. When no row exists
    /// the record keeps its defaults.
    pub async fn load(&mut self) -> Result<(), DbError> {
        let row = self.db.connections().find(&self.con_id).await?;
        if let Some(row) = row {
            self.apply_row(row)?;
        }
        self.loaded = true;
        Ok(())
    }

    /// Atomic upsert of the entire record keyed by con id.
    pub async fn save(&self) -> Result<(), DbError> {
        let row = self.to_row()?;
        self.db.connections().save(&row).await
    }

    /// Remove the persisted row.
    pub async fn destroy(&self) -> Result<(), DbError> {
        self.db.connections().delete(&self.con_id).await?;
        Ok(())
    }

    fn apply_row(&mut self, row: ConnectionRow) -> Result<(), DbError> {
        self.kind = ConKind::parse(&row.kind);
        self.net_registered = row.net_registered;
        self.connected = row.connected;
        self.server_prefix = row.server_prefix;
        self.nick = row.nick;
        self.username = row.username;
        self.realname = row.realname;
        self.account = row.account;
        self.password = row.password;
        self.host = row.host;
        self.port = row.port;
        self.tls = row.tls;
        self.tlsverify = row.tlsverify;
        self.bind_host = row.bind_host;
        self.sasl = serde_json::from_str(&row.sasl)?;
        self.registration_lines = serde_json::from_str(&row.registration_lines)?;
        self.isupports = serde_json::from_str(&row.isupports)?;
        let caps: Vec<String> = serde_json::from_str(&row.caps)?;
        self.caps = caps.into_iter().collect();
        self.received_motd = row.received_motd;
        self.auth_user_id = row.auth_user_id;
        self.auth_network_id = row.auth_network_id;
        self.auth_network_name = row.auth_network_name;
        self.auth_admin = row.auth_admin;
        let linked: Vec<String> = serde_json::from_str(&row.linked_incoming)?;
        self.linked_incoming = linked.into_iter().collect();
        self.logging = row.logging;
        self.temp_data = serde_json::from_str(&row.temp_data)?;

        // Buffers go through add_buffer so keys stay lowercased.
        self.buffers.clear();
        let buffers: HashMap<String, Buffer> = serde_json::from_str(&row.buffers)?;
        for (_, buffer) in buffers {
            self.add_buffer(buffer);
        }
        Ok(())
    }

    fn to_row(&self) -> Result<ConnectionRow, DbError> {
        let caps: Vec<&String> = self.caps.iter().collect();
        let linked: Vec<&String> = self.linked_incoming.iter().collect();
        Ok(ConnectionRow {
            conid: self.con_id.clone(),
            kind: self.kind.as_str().to_string(),
            net_registered: self.net_registered,
            connected: self.connected,
            server_prefix: self.server_prefix.clone(),
            nick: self.nick.clone(),
            username: self.username.clone(),
            realname: self.realname.clone(),
            account: self.account.clone(),
            password: self.password.clone(),
            host: self.host.clone(),
            port: self.port,
            tls: self.tls,
            tlsverify: self.tlsverify,
            bind_host: self.bind_host.clone(),
            sasl: serde_json::to_string(&self.sasl)?,
            registration_lines: serde_json::to_string(&self.registration_lines)?,
            isupports: serde_json::to_string(&self.isupports)?,
            caps: serde_json::to_string(&caps)?,
            buffers: serde_json::to_string(&self.buffers)?,
            received_motd: self.received_motd,
            auth_user_id: self.auth_user_id,
            auth_network_id: self.auth_network_id,
            auth_network_name: self.auth_network_name.clone(),
            auth_admin: self.auth_admin,
            linked_incoming: serde_json::to_string(&linked)?,
            logging: self.logging,
            temp_data: serde_json::to_string(&self.temp_data)?,
        })
    }

    // ========================================================================
    // Temp scratch
    // ========================================================================

    /// Read a scratch value.
    pub fn temp_get(&self, key: &str) -> Option<&Value> {
        self.temp_data.get(key)
    }

    /// Write or delete (`None`) a scratch value. Persists the record.
    pub async fn temp_set(&mut self, key: &str, value: Option<Value>) -> Result<(), DbError> {
        match value {
            Some(v) => {
                self.temp_data.insert(key.to_string(), v);
            }
            None => {
                self.temp_data.remove(key);
            }
        }
        self.save().await
    }

    /// Apply several scratch writes atomically, then persist once.
    pub async fn temp_set_many(
        &mut self,
        entries: impl IntoIterator<Item = (String, Option<Value>)>,
    ) -> Result<(), DbError> {
        for (key, value) in entries {
            match value {
                Some(v) => {
                    self.temp_data.insert(key, v);
                }
                None => {
                    self.temp_data.remove(&key);
                }
            }
        }
        self.save().await
    }

    /// The CAP negotiation window marker: `Some(version)` while the client
    /// is between CAP LS and CAP END.
    pub fn capping(&self) -> Option<String> {
        self.temp_get(TEMP_CAPPING)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Registration scratch, if initialized.
    pub fn reg_state(&self) -> Option<RegState> {
        self.temp_get(TEMP_REG_STATE)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Store (or clear) the registration scratch. Persists the record.
    pub async fn set_reg_state(&mut self, state: Option<RegState>) -> Result<(), DbError> {
        let value = match state {
            Some(s) => Some(serde_json::to_value(s)?),
            None => None,
        };
        self.temp_set(TEMP_REG_STATE, value).await
    }

    /// Append a raw wire line to the pre-registration queue.
    pub async fn push_reg_queue(&mut self, line: String) -> Result<(), DbError> {
        let mut queue: Vec<String> = self
            .temp_get(TEMP_REG_QUEUE)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        queue.push(line);
        self.temp_set(TEMP_REG_QUEUE, Some(serde_json::to_value(queue)?))
            .await
    }

    /// Take the whole pre-registration queue, clearing it.
    pub async fn take_reg_queue(&mut self) -> Result<Vec<String>, DbError> {
        let queue: Vec<String> = self
            .temp_get(TEMP_REG_QUEUE)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        if !queue.is_empty() || self.temp_get(TEMP_REG_QUEUE).is_some() {
            self.temp_set(TEMP_REG_QUEUE, None).await?;
        }
        Ok(queue)
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    /// The channel-prefix characters this connection's network uses.
    fn chantypes(&self) -> String {
        chan::chantypes_from_isupport(self.isupports.iter().map(String::as_str))
            .unwrap_or_else(|| DEFAULT_CHANTYPES.to_string())
    }

    /// Whether a buffer name names a channel on this network.
    ///
    /// Without upstream context (an incoming record has none) every buffer
    /// counts as a channel.
    pub fn is_channel_name(&self, name: &str) -> bool {
        match self.kind {
            ConKind::Outgoing => chan::is_channel_name_with(name, &self.chantypes()),
            _ => true,
        }
    }

    pub fn get_buffer(&self, name: &str) -> Option<&Buffer> {
        self.buffers.get(&irc_to_lower(name))
    }

    pub fn get_buffer_mut(&mut self, name: &str) -> Option<&mut Buffer> {
        self.buffers.get_mut(&irc_to_lower(name))
    }

    /// Get an existing buffer or create one named `name`.
    pub fn get_or_add_buffer(&mut self, name: &str) -> &mut Buffer {
        let key = irc_to_lower(name);
        let is_channel = self.is_channel_name(name);
        self.buffers
            .entry(key)
            .or_insert_with(|| Buffer::new(name, is_channel))
    }

    /// Insert a buffer under its lowercased name.
    pub fn add_buffer(&mut self, buffer: Buffer) {
        self.buffers.insert(irc_to_lower(&buffer.name), buffer);
    }

    /// Remove a buffer by name.
    pub fn del_buffer(&mut self, name: &str) -> Option<Buffer> {
        self.buffers.remove(&irc_to_lower(name))
    }

    /// Rename a buffer. When a buffer already exists at the new name this is
    /// a no-op merge: the existing target wins and the old entry stays.
    pub fn rename_buffer(&mut self, old: &str, new: &str) -> Option<&Buffer> {
        let new_key = irc_to_lower(new);
        if self.buffers.contains_key(&new_key) {
            return self.buffers.get(&new_key);
        }

        let mut buffer = self.buffers.remove(&irc_to_lower(old))?;
        buffer.name = new.to_string();
        self.buffers.insert(new_key.clone(), buffer);
        self.buffers.get(&new_key)
    }

    /// Iterate all buffers.
    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.values()
    }

    // ========================================================================
    // Linked clients
    // ========================================================================

    /// Attach a client connection id to this upstream. Persists.
    pub async fn link_incoming(&mut self, con_id: &str) -> Result<(), DbError> {
        self.linked_incoming.insert(con_id.to_string());
        self.save().await
    }

    /// Detach a client connection id from this upstream. Persists.
    pub async fn unlink_incoming(&mut self, con_id: &str) -> Result<(), DbError> {
        self.linked_incoming.remove(con_id);
        self.save().await
    }

    // ========================================================================
    // Network metadata
    // ========================================================================

    /// Resolve transport and identity fields from the owning user's network
    /// definition.
    ///
    /// Bind-host precedence: the network's `bind_host` when non-empty, else
    /// the owning user's. When the network has been deleted the transport
    /// fields are cleared, but a connected link keeps its nick so IRC-side
    /// state stays intact.
    pub async fn load_connection_info(
        &mut self,
        users: &UserRepository<'_>,
    ) -> Result<(), DbError> {
        let network = users.get_network(self.auth_network_id).await?;

        let Some(network) = network else {
            self.host = String::new();
            self.port = 6697;
            self.tls = false;
            self.tlsverify = true;
            self.bind_host = String::new();
            self.password = String::new();
            self.sasl = SaslCreds::default();
            if !self.connected {
                self.nick = String::new();
            }
            return Ok(());
        };

        let user = users.get_user(network.user_id).await?;

        self.host = network.host;
        self.port = network.port;
        self.tls = network.tls;
        self.tlsverify = network.tlsverify;
        self.password = network.password;
        if !network.nick.is_empty() {
            self.nick = network.nick;
        }
        self.username = network.username;
        self.realname = network.realname;
        self.sasl = SaslCreds {
            account: network.sasl_account,
            password: network.sasl_password,
        };
        self.auth_network_name = network.name;
        self.auth_user_id = network.user_id;

        let net_bind = network.bind_host.unwrap_or_default();
        self.bind_host = if !net_bind.is_empty() {
            net_bind
        } else {
            user.and_then(|u| u.bind_host).unwrap_or_default()
        };

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn fresh(con_id: &str, kind: ConKind) -> ConnState {
        let db = Database::new(":memory:").await.unwrap();
        ConnState::new(con_id, kind, db)
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let db = Database::new(":memory:").await.unwrap();

        let mut con = ConnState::new("c1", ConKind::Outgoing, db.clone());
        con.nick = "bob".to_string();
        con.caps.insert("server-time".to_string());
        con.isupports.push("CHANTYPES=#".to_string());
        con.registration_lines.push(":irc 001 bob :Welcome".to_string());
        con.linked_incoming.insert("d1".to_string());
        con.auth_user_id = 4;
        con.auth_network_id = 9;
        let buffer = {
            let b = con.get_or_add_buffer("#Chan");
            b.joined = true;
            b.topic = "t".to_string();
            b.clone()
        };
        con.temp_set("capping", Some(serde_json::json!("302")))
            .await
            .unwrap();

        let mut reloaded = ConnState::new("c1", ConKind::Incoming, db);
        reloaded.load().await.unwrap();

        assert_eq!(reloaded.kind, ConKind::Outgoing);
        assert_eq!(reloaded.nick, "bob");
        assert!(reloaded.caps.contains("server-time"));
        assert_eq!(reloaded.isupports, vec!["CHANTYPES=#"]);
        assert_eq!(reloaded.registration_lines.len(), 1);
        assert!(reloaded.linked_incoming.contains("d1"));
        assert_eq!(reloaded.auth_user_id, 4);
        assert_eq!(reloaded.capping().as_deref(), Some("302"));
        assert_eq!(reloaded.get_buffer("#chan"), Some(&buffer));
    }

    #[tokio::test]
    async fn maybe_load_is_idempotent() {
        let mut con = fresh("c1", ConKind::Incoming).await;
        con.maybe_load().await.unwrap();
        con.nick = "set-in-memory".to_string();
        // A second call must not clobber in-memory state.
        con.maybe_load().await.unwrap();
        assert_eq!(con.nick, "set-in-memory");
    }

    #[tokio::test]
    async fn destroy_removes_row() {
        let db = Database::new(":memory:").await.unwrap();
        let mut con = ConnState::new("c1", ConKind::Incoming, db.clone());
        con.save().await.unwrap();
        con.destroy().await.unwrap();
        assert!(db.connections().find("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn temp_set_none_deletes_and_persists() {
        let db = Database::new(":memory:").await.unwrap();
        let mut con = ConnState::new("c1", ConKind::Incoming, db.clone());
        con.temp_set("capping", Some(serde_json::json!("302")))
            .await
            .unwrap();
        con.temp_set("capping", None).await.unwrap();
        assert!(con.capping().is_none());

        let mut reloaded = ConnState::new("c1", ConKind::Incoming, db);
        reloaded.load().await.unwrap();
        assert!(reloaded.capping().is_none());
    }

    #[tokio::test]
    async fn buffer_keys_are_lowercased() {
        let mut con = fresh("c1", ConKind::Outgoing).await;
        con.get_or_add_buffer("#Foo");
        assert!(con.get_buffer("#foo").is_some());
        assert!(con.get_buffer("#FOO").is_some());
        assert_eq!(con.get_buffer("#foo").unwrap().name, "#Foo");
    }

    #[tokio::test]
    async fn buffer_channel_detection_uses_isupport() {
        let mut con = fresh("c1", ConKind::Outgoing).await;
        con.isupports.push("CHANTYPES=#".to_string());
        assert!(con.get_or_add_buffer("#chan").is_channel);
        assert!(!con.get_or_add_buffer("&notachan").is_channel);
        assert!(!con.get_or_add_buffer("bob").is_channel);
    }

    #[tokio::test]
    async fn incoming_record_defaults_buffers_to_channels() {
        let mut con = fresh("c1", ConKind::Incoming).await;
        assert!(con.get_or_add_buffer("bob").is_channel);
    }

    #[tokio::test]
    async fn rename_buffer_moves_entry() {
        let mut con = fresh("c1", ConKind::Outgoing).await;
        con.get_or_add_buffer("#old").topic = "kept".to_string();
        let renamed = con.rename_buffer("#old", "#New").unwrap();
        assert_eq!(renamed.name, "#New");
        assert_eq!(renamed.topic, "kept");
        assert!(con.get_buffer("#old").is_none());
        assert!(con.get_buffer("#new").is_some());
    }

    #[tokio::test]
    async fn rename_buffer_merges_into_existing_target() {
        let mut con = fresh("c1", ConKind::Outgoing).await;
        con.get_or_add_buffer("#a").topic = "a-topic".to_string();
        con.get_or_add_buffer("#b").topic = "b-topic".to_string();

        let result = con.rename_buffer("#a", "#B").unwrap();
        assert_eq!(result.topic, "b-topic");
        // The source entry stays; the existing target won.
        assert!(con.get_buffer("#a").is_some());
    }

    #[tokio::test]
    async fn reg_queue_push_take() {
        let mut con = fresh("c1", ConKind::Incoming).await;
        con.push_reg_queue("JOIN #foo".to_string()).await.unwrap();
        con.push_reg_queue("PRIVMSG #foo :hi".to_string())
            .await
            .unwrap();

        let queue = con.take_reg_queue().await.unwrap();
        assert_eq!(queue, vec!["JOIN #foo", "PRIVMSG #foo :hi"]);
        assert!(con.take_reg_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_connection_info_prefers_network_bind_host() {
        let db = Database::new(":memory:").await.unwrap();
        let users = db.users();
        let uid = users.ensure_user("alice", "pw", false).await.unwrap();
        sqlx::query("UPDATE users SET bind_host = '10.0.0.1' WHERE id = ?")
            .bind(uid)
            .execute(db.pool())
            .await
            .unwrap();
        let nid = users
            .ensure_network(uid, "net", "irc.example.net", 6697, true, "alice")
            .await
            .unwrap();

        let mut con = ConnState::new("u1", ConKind::Outgoing, db.clone());
        con.auth_network_id = nid;
        con.load_connection_info(&db.users()).await.unwrap();
        // Network has no bind_host: fall back to the user's.
        assert_eq!(con.bind_host, "10.0.0.1");
        assert_eq!(con.host, "irc.example.net");
        assert_eq!(con.nick, "alice");

        sqlx::query("UPDATE networks SET bind_host = '10.0.0.2' WHERE id = ?")
            .bind(nid)
            .execute(db.pool())
            .await
            .unwrap();
        con.load_connection_info(&db.users()).await.unwrap();
        assert_eq!(con.bind_host, "10.0.0.2");
    }

    #[tokio::test]
    async fn load_connection_info_for_deleted_network_keeps_live_nick() {
        let db = Database::new(":memory:").await.unwrap();
        let mut con = ConnState::new("u1", ConKind::Outgoing, db.clone());
        con.auth_network_id = 404;
        con.nick = "bob".to_string();
        con.host = "old.example.net".to_string();

        con.connected = true;
        con.load_connection_info(&db.users()).await.unwrap();
        assert_eq!(con.nick, "bob");
        assert!(con.host.is_empty());

        con.connected = false;
        con.load_connection_info(&db.users()).await.unwrap();
        assert!(con.nick.is_empty());
    }
}
