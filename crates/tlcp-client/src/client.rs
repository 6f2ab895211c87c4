//! User-facing client API.
//!
//! A [`TlcpClient`] holds the configuration and the transport shared by its
//! sessions. Closing the client closes every session it opened.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::ClientConfig,
    error::{TlcpError, TlcpResult},
    session::Session,
    transport::Transport,
};

/// Factory of sessions on one server.
///
/// # Example
///
/// ```rust,ignore
/// let config = ClientConfig::new(ServerAddress::new("push.example.com", 443, true))
///     .adapter_set("DEMO");
/// let client = TlcpClient::new(config, transport)?;
///
/// let session = client.open_session()?;
/// let mut subscription = session.subscribe(SubscriptionRequest::new(
///     SubscriptionMode::Merge,
///     "QUOTE_ADAPTER",
///     "item1",
///     FieldList::new(["last_price", "time"]),
/// ))?;
///
/// while let Some(event) = subscription.recv().await {
///     println!("Event: {:?}", event);
/// }
/// ```
pub struct TlcpClient<T: Transport> {
    config: Arc<ClientConfig>,
    transport: Arc<T>,
    token: CancellationToken,
}

impl<T: Transport> TlcpClient<T> {
    /// Create a client; fails on an invalid configuration.
    pub fn new(config: ClientConfig, transport: T) -> TlcpResult<Self> {
        config.validate().map_err(TlcpError::config)?;
        Ok(Self {
            config: Arc::new(config),
            transport: Arc::new(transport),
            token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a new session.
    ///
    /// The session is created in the background; must be called within a
    /// Tokio runtime.
    pub fn open_session(&self) -> TlcpResult<Session> {
        if self.is_closed() {
            return Err(TlcpError::cancelled("Client closed"));
        }
        Ok(Session::spawn(
            Arc::clone(&self.config),
            Arc::clone(&self.transport),
            self.token.child_token(),
        ))
    }

    /// Close the client and all its sessions. Idempotent.
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            info!(address = %self.config.server_address, "Closing client");
            self.token.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T: Transport> std::fmt::Debug for TlcpClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlcpClient")
            .field("server_address", &self.config.server_address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T: Transport> Drop for TlcpClient<T> {
    fn drop(&mut self) {
        self.close();
    }
}
