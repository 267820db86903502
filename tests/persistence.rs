//! Durability: connection records survive a process bounce.

mod common;

use slbnc::db::Database;
use slbnc::state::{ConKind, ConnState};

#[tokio::test]
async fn record_round_trips_through_a_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slbnc.db");
    let path = path.to_str().unwrap();

    {
        let db = Database::new(path).await.unwrap();
        let mut con = ConnState::new("up1", ConKind::Outgoing, db);
        con.nick = "alice".to_string();
        con.host = "irc.example.net".to_string();
        con.port = 6697;
        con.tls = true;
        con.connected = true;
        con.auth_user_id = 4;
        con.auth_network_id = 9;
        con.auth_network_name = "freenode".to_string();
        con.caps.insert("server-time".to_string());
        con.isupports.push("CHANTYPES=#".to_string());
        con.registration_lines
            .push(":irc.example.net 001 alice :Welcome".to_string());
        let buffer = con.get_or_add_buffer("#Rust");
        buffer.joined = true;
        buffer.topic = "t".to_string();
        con.linked_incoming.insert("d1".to_string());
        con.save().await.unwrap();
        // The pool drops here, like a process exit.
    }

    let db = Database::new(path).await.unwrap();
    let mut reloaded = ConnState::new("up1", ConKind::Incoming, db);
    reloaded.load().await.unwrap();

    assert_eq!(reloaded.kind, ConKind::Outgoing);
    assert_eq!(reloaded.nick, "alice");
    assert_eq!(reloaded.host, "irc.example.net");
    assert_eq!(reloaded.port, 6697);
    assert!(reloaded.tls);
    assert!(reloaded.connected);
    assert_eq!(reloaded.auth_user_id, 4);
    assert_eq!(reloaded.auth_network_id, 9);
    assert_eq!(reloaded.auth_network_name, "freenode");
    assert!(reloaded.caps.contains("server-time"));
    assert_eq!(reloaded.isupports, vec!["CHANTYPES=#"]);
    assert_eq!(reloaded.registration_lines.len(), 1);
    assert!(reloaded.linked_incoming.contains("d1"));

    let buffer = reloaded.get_buffer("#rust").unwrap();
    assert_eq!(buffer.name, "#Rust");
    assert!(buffer.joined);
    assert_eq!(buffer.topic, "t");
}

#[tokio::test]
async fn user_accounts_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slbnc.db");
    let path = path.to_str().unwrap();

    {
        let db = Database::new(path).await.unwrap();
        let uid = db.users().ensure_user("alice", "pw", false).await.unwrap();
        db.users()
            .ensure_network(uid, "net", "irc.example.net", 6697, true, "alice")
            .await
            .unwrap();
    }

    let db = Database::new(path).await.unwrap();
    let user = db.users().auth_user("alice", "pw").await.unwrap().unwrap();
    let net = db
        .users()
        .get_network_by_name(user.id, "net")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(net.host, "irc.example.net");
}
