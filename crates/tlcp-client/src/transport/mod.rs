//! Physical channel abstraction.
//!
//! The session engine never touches sockets: it asks a [`Transport`] for a
//! [`TlcpChannel`] to a [`ServerAddress`] and exchanges typed messages over
//! it. A channel carries exactly one connect cycle; reconnecting always
//! opens a fresh one.
//!
//! # Module Structure
//!
//! - `framed`: [`FramedChannel`], a channel over any text sink and stream,
//!   with request batching
//! - `memory`: [`MemoryTransport`], an in-process transport driven by a
//!   scripted [`MemoryServer`]

mod framed;
mod memory;

use async_trait::async_trait;

pub use self::{
    framed::FramedChannel,
    memory::{MemoryChannel, MemoryConnection, MemoryServer, MemoryTransport},
};
use crate::{
    error::TlcpResult,
    message::{ClientMessage, ServerMessage},
    types::ServerAddress,
};

/// Factory of physical channels.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Channel: TlcpChannel + 'static;

    /// Open a channel to `address`.
    async fn connect(&self, address: &ServerAddress) -> TlcpResult<Self::Channel>;
}

/// Full-duplex message channel.
///
/// `send` and `recv` may be awaited concurrently from different tasks.
#[async_trait]
pub trait TlcpChannel: Send + Sync {
    /// Send one request.
    async fn send(&self, message: ClientMessage) -> TlcpResult<()>;

    /// Next server message; `None` once the channel is closed.
    async fn recv(&self) -> Option<TlcpResult<ServerMessage>>;

    /// Start tearing the channel down. Idempotent and non-blocking.
    fn disconnect(&self);

    /// Wait until teardown has completed.
    async fn join(&self);
}
