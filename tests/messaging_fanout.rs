//! PRIVMSG/NOTICE fan-out between clients sharing an upstream.

mod common;

use common::TestBnc;
use slbnc::state::UpstreamCommand;

#[tokio::test]
async fn privmsg_echoes_to_sibling_and_forwards_upstream() {
    let t = TestBnc::new().await;
    let user_id = t.seed_user("alice", "s3cret").await;
    let network_id = t.seed_network(user_id, "freenode").await;

    let mut upstream = t.fake_upstream(user_id, network_id, "alice").await;
    let mut d1 = t.client().await;
    let mut d2 = t.client().await;
    d1.force_attach(&upstream, user_id, network_id).await;
    d2.force_attach(&upstream, user_id, network_id).await;

    d1.dispatch("PRIVMSG #x :hi").await.unwrap();

    // The sibling sees the message as coming from the user's nick.
    let d2_lines = d2.drain_lines();
    assert_eq!(d2_lines, vec![":alice PRIVMSG #x hi"]);

    // The sender gets no echo.
    assert!(d1.drain_lines().is_empty());

    // The original line went upstream verbatim.
    let commands = upstream.drain_commands();
    assert!(
        commands.iter().any(|c| matches!(
            c,
            UpstreamCommand::Forward(msg)
                if msg.command == "PRIVMSG" && msg.param(0) == Some("#x") && msg.param(1) == Some("hi")
        )),
        "forward expected, got {:?}",
        commands
    );

    // One record landed in the message store.
    let stored = t
        .bnc
        .db
        .messages()
        .recent(user_id, network_id, "#x", 10)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sender, "alice");
    assert_eq!(stored[0].command, "PRIVMSG");
    assert_eq!(stored[0].text, "hi");
}

#[tokio::test]
async fn notice_uses_same_fanout() {
    let t = TestBnc::new().await;
    let user_id = t.seed_user("alice", "s3cret").await;
    let network_id = t.seed_network(user_id, "freenode").await;

    let upstream = t.fake_upstream(user_id, network_id, "alice").await;
    let mut d1 = t.client().await;
    let mut d2 = t.client().await;
    d1.force_attach(&upstream, user_id, network_id).await;
    d2.force_attach(&upstream, user_id, network_id).await;

    d2.dispatch("NOTICE bob :psst").await.unwrap();

    let d1_lines = d1.drain_lines();
    assert_eq!(d1_lines, vec![":alice NOTICE bob psst"]);
    assert!(d2.drain_lines().is_empty());
}

#[tokio::test]
async fn logging_disabled_skips_message_store() {
    let t = TestBnc::new().await;
    let user_id = t.seed_user("alice", "s3cret").await;
    let network_id = t.seed_network(user_id, "freenode").await;

    let upstream = t.fake_upstream(user_id, network_id, "alice").await;
    upstream.with_state_mut(|state| state.logging = false).await;
    let mut d1 = t.client().await;
    d1.force_attach(&upstream, user_id, network_id).await;

    d1.dispatch("PRIVMSG #x :hi").await.unwrap();

    let stored = t
        .bnc
        .db
        .messages()
        .recent(user_id, network_id, "#x", 10)
        .await
        .unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn control_buffer_message_is_intercepted() {
    let t = TestBnc::new().await;
    let user_id = t.seed_user("alice", "s3cret").await;
    let network_id = t.seed_network(user_id, "freenode").await;

    let mut upstream = t.fake_upstream(user_id, network_id, "alice").await;
    let mut d1 = t.client().await;
    d1.force_attach(&upstream, user_id, network_id).await;

    d1.dispatch("PRIVMSG *bnc :help").await.unwrap();

    // Serviced locally, never forwarded.
    assert!(upstream.drain_commands().is_empty());
    let lines = d1.drain_lines();
    assert!(
        lines.iter().any(|l| l.contains("listnetworks")),
        "help text in {:?}",
        lines
    );
}

#[tokio::test]
async fn link_consistency_between_client_and_upstream() {
    let t = TestBnc::new().await;
    let user_id = t.seed_user("alice", "s3cret").await;
    let network_id = t.seed_network(user_id, "freenode").await;

    let upstream = t.fake_upstream(user_id, network_id, "alice").await;
    let d1 = t.client().await;
    d1.force_attach(&upstream, user_id, network_id).await;

    // Forward direction: the client's pair resolves to this upstream.
    let found = t
        .bnc
        .registry
        .find_users_outgoing_connection(user_id, network_id)
        .await
        .unwrap();
    assert_eq!(found.con_id, upstream.con_id);

    // Reverse direction: the upstream's linked set contains the client.
    assert!(
        upstream
            .handle
            .state
            .lock()
            .await
            .linked_incoming
            .contains(&d1.con_id)
    );

    // Unlink clears both directions together.
    upstream
        .handle
        .state
        .lock()
        .await
        .unlink_incoming(&d1.con_id)
        .await
        .unwrap();
    assert!(
        !upstream
            .handle
            .state
            .lock()
            .await
            .linked_incoming
            .contains(&d1.con_id)
    );
}
