//! Scripted server harness over the in-process transport.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use tlcp_client::{
    ClientConfig, FieldList, ServerAddress, Session, Subscription, SubscriptionEvent,
    SubscriptionMode, SubscriptionRequest, TlcpClient, UpdateMap,
    message::{BindSession, ClientMessage, ServerMessage, Subscribe},
    transport::{MemoryConnection, MemoryServer, MemoryTransport},
};
use tokio::time::timeout;

pub const SESSION_ID: &str = "S1";
pub const WAIT: Duration = Duration::from_secs(5);

pub fn config() -> ClientConfig {
    ClientConfig::new(ServerAddress::new("push.example.com", 80, false))
        .reconnect_initial_delay(Duration::from_millis(10))
        .reconnect_max_delay(Duration::from_millis(50))
}

pub fn connection_ok(session_id: &str) -> ServerMessage {
    ServerMessage::ConnectionOk {
        session_id: session_id.to_string(),
        request_limit: 50_000,
        keep_alive: Some(Duration::from_secs(60)),
        control_link: None,
    }
}

pub async fn accept(server: &mut MemoryServer) -> MemoryConnection {
    timeout(WAIT, server.accept())
        .await
        .expect("connection in time")
        .expect("transport alive")
}

pub async fn request(connection: &mut MemoryConnection) -> ClientMessage {
    timeout(WAIT, connection.recv())
        .await
        .expect("request in time")
        .expect("client connected")
}

pub fn reply(connection: &MemoryConnection, text: &str) {
    connection.send_text(text).expect("delivered");
}

pub struct Harness {
    pub client: TlcpClient<MemoryTransport>,
    pub session: Arc<Session>,
    pub server: MemoryServer,
    pub connection: MemoryConnection,
}

impl Harness {
    /// Open a session and accept its creation.
    pub async fn open(config: ClientConfig) -> Self {
        let (transport, mut server) = MemoryTransport::new();
        let client = TlcpClient::new(config, transport).expect("valid config");
        let session = client.open_session().expect("session opened");

        let mut connection = accept(&mut server).await;
        let create = request(&mut connection).await;
        assert!(matches!(create, ClientMessage::CreateSession(_)));
        assert!(connection.send(connection_ok(SESSION_ID)));
        let session_id = timeout(WAIT, session.session_id())
            .await
            .expect("created in time")
            .expect("created");
        assert_eq!(session_id, SESSION_ID);

        Self {
            client,
            session: Arc::new(session),
            server,
            connection,
        }
    }

    pub async fn request(&mut self) -> ClientMessage {
        request(&mut self.connection).await
    }

    pub fn reply(&self, text: &str) {
        reply(&self.connection, text);
    }

    /// Lose the current connection and accept the rebind.
    pub async fn reset_connection(&mut self) -> BindSession {
        self.connection.disconnect();
        self.connection = accept(&mut self.server).await;
        let ClientMessage::BindSession(bind) = self.request().await else {
            panic!("expected a bind_session request");
        };
        assert_eq!(bind.session, SESSION_ID);
        assert!(self.connection.send(connection_ok(SESSION_ID)));
        bind
    }

    /// Subscribe to `f` in RAW mode and read the subscribe request.
    pub async fn subscribe_raw(&mut self) -> (Subscription, Subscribe) {
        let subscription = self
            .session
            .subscribe(SubscriptionRequest::new(
                SubscriptionMode::Raw,
                "dataAdapter",
                "group",
                FieldList::new(["f"]),
            ))
            .expect("subscribed");
        let ClientMessage::Subscribe(subscribe) = self.request().await else {
            panic!("expected a subscribe request");
        };
        (subscription, subscribe)
    }
}

pub async fn next_event(subscription: &mut Subscription) -> Option<SubscriptionEvent> {
    timeout(WAIT, subscription.recv())
        .await
        .expect("event in time")
}

/// Skip events up to the next update.
pub async fn next_update(subscription: &mut Subscription) -> UpdateMap {
    loop {
        match next_event(subscription).await {
            Some(SubscriptionEvent::Update(update)) => return update,
            Some(_) => continue,
            None => panic!("subscription ended before an update"),
        }
    }
}
