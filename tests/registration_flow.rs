//! Client registration: CAP window, password triple, auth outcomes.

mod common;

use common::TestBnc;
use slbnc::error::HandlerError;
use slbnc::state::UpstreamCommand;

#[tokio::test]
async fn registration_happy_path_creates_and_opens_upstream() {
    let t = TestBnc::new().await;
    let user_id = t.seed_user("alice", "s3cret").await;
    let network_id = t.seed_network(user_id, "freenode").await;

    let mut client = t.client().await;
    client.dispatch("CAP LS 302").await.unwrap();
    client.dispatch("NICK bob").await.unwrap();
    client.dispatch("USER bob 0 * :Bob").await.unwrap();
    client.dispatch("PASS alice/freenode:s3cret").await.unwrap();
    client.dispatch("CAP END").await.unwrap();

    client
        .with_state(|con| {
            assert_eq!(con.auth_user_id, user_id);
            assert_eq!(con.auth_network_id, network_id);
            assert_eq!(con.auth_network_name, "freenode");
            assert!(con.reg_state().is_none());
            assert!(con.capping().is_none());
        })
        .await;

    // An upstream for the pair now exists and was told to dial.
    let upstream = t
        .bnc
        .registry
        .find_users_outgoing_connection(user_id, network_id)
        .await
        .expect("upstream created");
    assert!(
        upstream.state.lock().await.linked_incoming.contains(&client.con_id),
        "client linked to upstream"
    );

    let lines = client.drain_lines();
    assert!(
        lines.iter().any(|l| l.contains("Connecting to the network..")),
        "status notice written: {:?}",
        lines
    );
}

#[tokio::test]
async fn lines_during_cap_window_queue_and_replay_through_prereg_gate() {
    let t = TestBnc::new().await;
    let mut client = t.client().await;

    client.dispatch("CAP LS 302").await.unwrap();
    client.dispatch("JOIN #foo").await.unwrap();

    // Held, not executed: the queue carries the raw line.
    client
        .with_state(|con| {
            let queue = con.temp_get("reg.queue").cloned().unwrap();
            let queue: Vec<String> = serde_json::from_value(queue).unwrap();
            assert_eq!(queue, vec!["JOIN #foo"]);
        })
        .await;

    client.dispatch("CAP END").await.unwrap();

    // Replayed once, then dropped by the pre-registration gate: the queue is
    // gone and no JOIN went anywhere.
    client
        .with_state(|con| {
            assert!(con.temp_get("reg.queue").is_none());
            assert!(con.capping().is_none());
            assert!(!con.net_registered);
        })
        .await;
    let lines = client.drain_lines();
    assert!(
        !lines.iter().any(|l| l.contains("JOIN")),
        "JOIN must not echo: {:?}",
        lines
    );
}

#[tokio::test]
async fn ping_is_answered_even_during_cap_window() {
    let t = TestBnc::new().await;
    let mut client = t.client().await;

    client.dispatch("CAP LS 302").await.unwrap();
    client.drain_lines();
    client.dispatch("PING 12345").await.unwrap();

    let lines = client.drain_lines();
    assert!(
        lines.iter().any(|l| l.contains("PONG") && l.contains("12345")),
        "PONG expected: {:?}",
        lines
    );
    // And it was not queued.
    client
        .with_state(|con| assert!(con.temp_get("reg.queue").is_none()))
        .await;
}

#[tokio::test]
async fn bad_password_closes_with_error() {
    let t = TestBnc::new().await;
    let mut client = t.client().await;

    client.dispatch("PASS xxx").await.unwrap();
    client.dispatch("NICK n").await.unwrap();
    let result = client.dispatch("USER u 0 * :U").await;

    assert!(matches!(result, Err(HandlerError::Quit)));
    let lines = client.drain_lines();
    assert_eq!(
        lines.last().map(String::as_str),
        Some("ERROR :Invalid password")
    );
}

#[tokio::test]
async fn wrong_network_closes_with_error() {
    let t = TestBnc::new().await;
    let user_id = t.seed_user("alice", "s3cret").await;
    t.seed_network(user_id, "freenode").await;

    let mut client = t.client().await;
    client.dispatch("NICK bob").await.unwrap();
    client.dispatch("USER bob 0 * :Bob").await.unwrap();
    let result = client.dispatch("PASS alice/nonet:s3cret").await;

    assert!(matches!(result, Err(HandlerError::Quit)));
    let lines = client.drain_lines();
    assert_eq!(
        lines.last().map(String::as_str),
        Some("ERROR :Invalid password")
    );
}

#[tokio::test]
async fn user_only_login_gets_local_welcome() {
    let t = TestBnc::new().await;
    let user_id = t.seed_user("alice", "s3cret").await;

    let mut client = t.client().await;
    client.dispatch("NICK bob").await.unwrap();
    client.dispatch("USER bob 0 * :Bob").await.unwrap();
    client.dispatch("PASS alice:s3cret").await.unwrap();

    client
        .with_state(|con| {
            assert_eq!(con.auth_user_id, user_id);
            assert_eq!(con.auth_network_id, 0);
            assert!(con.net_registered);
            assert!(con.reg_state().is_none());
        })
        .await;

    let lines = client.drain_lines();
    assert!(lines.iter().any(|l| l.contains(" 001 ")), "001 in {:?}", lines);
    assert!(
        lines.iter().any(|l| l.contains("Welcome to your BNC!")),
        "status in {:?}",
        lines
    );
}

#[tokio::test]
async fn nick_before_auth_prompts_for_password() {
    let t = TestBnc::new().await;
    let mut client = t.client().await;

    client.dispatch("NICK bob").await.unwrap();

    client.with_state(|con| assert_eq!(con.nick, "bob")).await;
    let lines = client.drain_lines();
    assert!(lines.iter().any(|l| l.starts_with(":bob NICK")), "echo in {:?}", lines);
    assert!(
        lines.iter().any(|l| l.contains(" 464 ") && l.contains("Password required")),
        "464 in {:?}",
        lines
    );
    assert!(
        lines.iter().any(|l| l.contains("NOTICE") && l.contains("/quote PASS")),
        "hint in {:?}",
        lines
    );
}

#[tokio::test]
async fn forbidden_verbs_are_dropped_before_registration() {
    let t = TestBnc::new().await;
    let mut client = t.client().await;

    client.dispatch("JOIN #foo").await.unwrap();
    client.dispatch("PRIVMSG #foo :hi").await.unwrap();
    client.dispatch("WHOIS someone").await.unwrap();

    assert!(client.drain_lines().is_empty());
    client
        .with_state(|con| assert!(!con.net_registered))
        .await;
}

#[tokio::test]
async fn attach_to_running_upstream_replays_registration() {
    let t = TestBnc::new().await;
    let user_id = t.seed_user("alice", "s3cret").await;
    let network_id = t.seed_network(user_id, "freenode").await;

    let upstream = t.fake_upstream(user_id, network_id, "alice").await;
    upstream
        .with_state_mut(|state| {
            state
                .registration_lines
                .extend([":irc.example.net 001 alice :Welcome".to_string()]);
            let buffer = state.get_or_add_buffer("#rust");
            buffer.joined = true;
            buffer.topic = "the topic".to_string();
        })
        .await;

    let mut client = t.client().await;
    client.dispatch("NICK bob").await.unwrap();
    client.dispatch("USER bob 0 * :Bob").await.unwrap();
    client.dispatch("PASS alice/freenode:s3cret").await.unwrap();

    client
        .with_state(|con| {
            assert!(con.net_registered, "attached client is registered");
            assert_eq!(con.nick, "alice", "client aligned onto upstream nick");
        })
        .await;

    let lines = client.drain_lines();
    assert!(
        lines.iter().any(|l| l.contains("Attaching you to the network")),
        "status in {:?}",
        lines
    );
    assert!(lines.iter().any(|l| l.contains(" 001 ")), "replayed 001 in {:?}", lines);
    assert!(
        lines.iter().any(|l| l.contains("JOIN") && l.contains("#rust")),
        "synthesized JOIN in {:?}",
        lines
    );
    assert!(
        lines.iter().any(|l| l.contains(" 332 ") && l.contains("the topic")),
        "topic in {:?}",
        lines
    );

    // No second upstream was created and no dial was requested.
    let handle = t
        .bnc
        .registry
        .find_users_outgoing_connection(user_id, network_id)
        .await
        .unwrap();
    assert_eq!(handle.con_id, upstream.con_id);
    let mut upstream = upstream;
    assert!(
        !upstream
            .drain_commands()
            .iter()
            .any(|c| matches!(c, UpstreamCommand::Open)),
        "connected upstream must not be redialed"
    );
}
