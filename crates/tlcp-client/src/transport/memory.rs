//! In-process transport.
//!
//! Every [`MemoryTransport::connect`] hands a [`MemoryConnection`] to the
//! paired [`MemoryServer`], which plays the server role: it reads the typed
//! requests and answers with typed messages or raw protocol text. Dropping
//! the connection behaves like a lost link.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{TlcpChannel, Transport};
use crate::{
    codec::TlcpParser,
    error::{TlcpError, TlcpResult},
    message::{ClientMessage, ServerMessage},
    types::ServerAddress,
};

/// Client half of the in-process transport.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    connections: mpsc::UnboundedSender<MemoryConnection>,
    refusals: Arc<AtomicU32>,
}

impl MemoryTransport {
    /// Create a transport and the server accepting its connections.
    pub fn new() -> (Self, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let refusals = Arc::new(AtomicU32::new(0));
        let transport = Self {
            connections: tx,
            refusals: Arc::clone(&refusals),
        };
        let server = MemoryServer {
            connections: rx,
            refusals,
        };
        (transport, server)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Channel = MemoryChannel;

    async fn connect(&self, address: &ServerAddress) -> TlcpResult<Self::Channel> {
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TlcpError::transport(format!("Connection refused by {address}")));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let connection = MemoryConnection {
            address: address.clone(),
            from_client: client_rx,
            to_client: server_tx,
            token: token.clone(),
        };
        self.connections
            .send(connection)
            .map_err(|_| TlcpError::transport(format!("No server listening on {address}")))?;

        Ok(MemoryChannel {
            outbound: client_tx,
            inbound: Mutex::new(server_rx),
            token,
        })
    }
}

/// Channel opened by [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryChannel {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: Mutex<mpsc::UnboundedReceiver<TlcpResult<ServerMessage>>>,
    token: CancellationToken,
}

#[async_trait]
impl TlcpChannel for MemoryChannel {
    async fn send(&self, message: ClientMessage) -> TlcpResult<()> {
        if self.token.is_cancelled() {
            return Err(TlcpError::transport("Channel disconnected"));
        }
        self.outbound
            .send(message)
            .map_err(|_| TlcpError::transport("Connection closed by server"))
    }

    async fn recv(&self) -> Option<TlcpResult<ServerMessage>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            message = inbound.recv() => message,
        }
    }

    fn disconnect(&self) {
        self.token.cancel();
    }

    async fn join(&self) {
        self.token.cancelled().await;
    }
}

/// Server half of the in-process transport.
#[derive(Debug)]
pub struct MemoryServer {
    connections: mpsc::UnboundedReceiver<MemoryConnection>,
    refusals: Arc<AtomicU32>,
}

impl MemoryServer {
    /// Wait for the next connection; `None` once every transport is gone.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.connections.recv().await
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }
}

/// Server side of one connection.
#[derive(Debug)]
pub struct MemoryConnection {
    address: ServerAddress,
    from_client: mpsc::UnboundedReceiver<ClientMessage>,
    to_client: mpsc::UnboundedSender<TlcpResult<ServerMessage>>,
    token: CancellationToken,
}

impl MemoryConnection {
    /// Address the client connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Next request; `None` once the client disconnected and every request
    /// sent before that was read.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        tokio::select! {
            biased;
            message = self.from_client.recv() => message,
            _ = self.token.cancelled() => self.from_client.try_recv().ok(),
        }
    }

    /// Send a message; returns `false` if the client is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        !self.token.is_cancelled() && self.to_client.send(Ok(message)).is_ok()
    }

    /// Parse `text` as server protocol lines and send every message.
    pub fn send_text(&self, text: &str) -> TlcpResult<()> {
        for message in TlcpParser::new().parse(text) {
            if !self.send(message?) {
                return Err(TlcpError::transport("Client disconnected"));
            }
        }
        Ok(())
    }

    /// Deliver `error` to the client's receive side.
    pub fn fail(&self, error: TlcpError) {
        let _ = self.to_client.send(Err(error));
    }

    /// Drop the link from the server side.
    pub fn disconnect(&self) {
        self.token.cancel();
    }

    /// Whether the link is down.
    pub fn is_disconnected(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn address() -> ServerAddress {
        ServerAddress::new("push.example.com", 80, false)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (transport, mut server) = MemoryTransport::new();
        let channel = transport.connect(&address()).await.expect("connected");
        let mut connection = server.accept().await.expect("accepted");
        assert_eq!(connection.address(), &address());

        channel.send(ClientMessage::Heartbeat).await.expect("sent");
        assert_eq!(connection.recv().await, Some(ClientMessage::Heartbeat));

        connection.send_text("PROBE\r\nNOOP,x\r\n").expect("valid text");
        assert!(matches!(channel.recv().await, Some(Ok(ServerMessage::Probe))));
        assert!(matches!(channel.recv().await, Some(Ok(ServerMessage::NoOp))));
    }

    #[tokio::test]
    async fn test_dropped_connection_closes_channel() {
        let (transport, mut server) = MemoryTransport::new();
        let channel = transport.connect(&address()).await.expect("connected");
        let connection = server.accept().await.expect("accepted");
        drop(connection);

        assert!(channel.recv().await.is_none());
        assert!(channel.send(ClientMessage::Heartbeat).await.is_err());
    }

    #[tokio::test]
    async fn test_server_disconnect_closes_channel() {
        let (transport, mut server) = MemoryTransport::new();
        let channel = transport.connect(&address()).await.expect("connected");
        let connection = server.accept().await.expect("accepted");
        connection.disconnect();

        assert!(channel.recv().await.is_none());
        assert!(channel.send(ClientMessage::Heartbeat).await.is_err());
        timeout(Duration::from_secs(3), channel.join())
            .await
            .expect("joined");
    }

    #[tokio::test]
    async fn test_disconnect_is_seen_by_server() {
        let (transport, mut server) = MemoryTransport::new();
        let channel = transport.connect(&address()).await.expect("connected");
        let mut connection = server.accept().await.expect("accepted");

        channel.send(ClientMessage::Heartbeat).await.expect("sent");
        channel.disconnect();
        channel.disconnect();
        timeout(Duration::from_secs(3), channel.join())
            .await
            .expect("joined");

        assert!(connection.is_disconnected());
        assert_eq!(connection.recv().await, Some(ClientMessage::Heartbeat));
        assert_eq!(connection.recv().await, None);
        assert!(!connection.send(ServerMessage::Probe));
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let (transport, mut server) = MemoryTransport::new();
        server.refuse_connections(1);
        let err = transport.connect(&address()).await.expect_err("refused");
        assert!(err.is_recoverable());
        transport.connect(&address()).await.expect("connected");
        assert!(server.accept().await.is_some());
    }
}
