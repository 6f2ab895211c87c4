//! Session recovery after a lost connection.

mod common;

use std::{sync::Arc, time::Duration};

use common::{Harness, WAIT, config, next_update};
use tlcp_client::{MessageOutcome, ServerError, TlcpError, message::ClientMessage};
use tokio::time::timeout;

#[tokio::test]
async fn test_recover_subscription() {
    let mut harness = Harness::open(config()).await;
    let (mut subscription, _) = harness.subscribe_raw().await;
    harness.reply("REQOK,s1\r\nSUBOK,1,1,1\r\nU,1,1,1\r\nU,1,1,2\r\n");
    assert_eq!(next_update(&mut subscription).await.get("f"), Some("1"));
    assert_eq!(next_update(&mut subscription).await.get("f"), Some("2"));

    let bind = harness.reset_connection().await;
    assert_eq!(bind.recovery_from, Some(3));
    harness.reply("PROG,2\r\nU,1,1,2\r\nU,1,1,3\r\n");
    assert_eq!(next_update(&mut subscription).await.get("f"), Some("3"));
}

#[tokio::test]
async fn test_recover_without_replay() {
    let mut harness = Harness::open(config()).await;
    let (mut subscription, _) = harness.subscribe_raw().await;
    harness.reply("SUBOK,1,1,1\r\nU,1,1,1\r\n");
    assert_eq!(next_update(&mut subscription).await.get("f"), Some("1"));

    let bind = harness.reset_connection().await;
    assert_eq!(bind.recovery_from, Some(2));
    harness.reply("PROG,2\r\nU,1,1,2\r\n");
    assert_eq!(next_update(&mut subscription).await.get("f"), Some("2"));

    let bind = harness.reset_connection().await;
    assert_eq!(bind.recovery_from, Some(3));
}

#[tokio::test]
async fn test_recover_unsubscription() {
    let mut harness = Harness::open(config()).await;
    let (subscription, subscribe) = harness.subscribe_raw().await;
    subscription.cancel();
    // the subscribe request is lost with the connection

    let bind = harness.reset_connection().await;
    assert_eq!(bind.recovery_from, Some(0));
    harness.reply("PROG,0\r\n");
    let ClientMessage::Subscribe(resent) = harness.request().await else {
        panic!("expected the subscribe request again");
    };
    assert_eq!(resent, subscribe);

    harness.reply("SUBOK,1,1,1\r\n");
    let ClientMessage::Unsubscribe(unsubscribe) = harness.request().await else {
        panic!("expected unsubscribe");
    };
    assert_eq!(unsubscribe.subscription_id, subscribe.subscription_id);
    harness.reply("REQOK,u1\r\nUNSUB,1\r\n");
    assert!(subscription.closed().await.is_ok());
}

#[tokio::test]
async fn test_recover_send_message() {
    let mut harness = Harness::open(config()).await;
    let outcome = tokio::spawn({
        let session = Arc::clone(&harness.session);
        async move { session.send_message("testMessage", None).await }
    });
    let ClientMessage::Message(lost) = harness.request().await else {
        panic!("expected a message");
    };

    let bind = harness.reset_connection().await;
    assert_eq!(bind.recovery_from, Some(0));
    harness.reply("PROG,0\r\n");
    let ClientMessage::Message(message) = harness.request().await else {
        panic!("expected the message again");
    };
    assert_eq!(message, lost);
    assert_eq!(message.message, "testMessage");
    assert!(!outcome.is_finished());

    harness.reply(&format!(
        "MSGDONE,*,{},OK\r\n",
        message.prog.expect("progressive")
    ));
    let outcome = timeout(WAIT, outcome)
        .await
        .expect("in time")
        .expect("task completed")
        .expect("outcome");
    assert_eq!(outcome, MessageOutcome::Done("OK".to_string()));
}

#[tokio::test]
async fn test_cancelled_message_is_not_resent() {
    let mut harness = Harness::open(config()).await;
    let outcome = tokio::spawn({
        let session = Arc::clone(&harness.session);
        async move { session.send_message("testMessage", None).await }
    });
    let ClientMessage::Message(_) = harness.request().await else {
        panic!("expected a message");
    };
    outcome.abort();
    assert!(outcome.await.expect_err("aborted").is_cancelled());

    let bind = harness.reset_connection().await;
    assert_eq!(bind.recovery_from, Some(0));
    harness.reply("PROG,0\r\n");
    assert!(
        timeout(Duration::from_millis(200), harness.connection.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_server_progressive_ahead_is_fatal() {
    let mut harness = Harness::open(config()).await;
    harness.reset_connection().await;
    harness.reply("PROG,5\r\n");

    let exit = timeout(WAIT, harness.session.exit_status())
        .await
        .expect("terminated in time");
    assert!(matches!(exit, Some(TlcpError::Protocol { .. })));
}

#[tokio::test]
async fn test_unexpected_progressive_is_fatal() {
    let harness = Harness::open(config()).await;
    harness.reply("PROG,0\r\n");

    let exit = timeout(WAIT, harness.session.exit_status())
        .await
        .expect("terminated in time");
    assert!(matches!(exit, Some(TlcpError::Protocol { .. })));
}

#[tokio::test]
async fn test_recovery_refused() {
    let mut harness = Harness::open(config()).await;
    harness.connection.disconnect();
    harness.connection = common::accept(&mut harness.server).await;
    let ClientMessage::BindSession(bind) = harness.request().await else {
        panic!("expected bind_session");
    };
    assert_eq!(bind.recovery_from, Some(0));
    harness.reply("CONERR,4,Sync error\r\n");

    let exit = timeout(WAIT, harness.session.exit_status())
        .await
        .expect("terminated in time");
    let Some(TlcpError::Server(ServerError::ConnectionError { code, message })) = exit else {
        panic!("expected a connection error");
    };
    assert_eq!(code, 4);
    assert_eq!(message, "Session S1 recovery failed (Sync error)");
}

#[tokio::test]
async fn test_recovered_on_another_session() {
    let mut harness = Harness::open(config()).await;
    harness.connection.disconnect();
    harness.connection = common::accept(&mut harness.server).await;
    harness.request().await;
    assert!(harness.connection.send(common::connection_ok("S2")));

    let exit = timeout(WAIT, harness.session.exit_status())
        .await
        .expect("terminated in time");
    assert!(matches!(exit, Some(TlcpError::Protocol { .. })));
}
