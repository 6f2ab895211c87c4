//! # TLCP Client
//!
//! Session engine and wire codec for clients of TLCP streaming servers.
//!
//! This crate implements the client side of the Text Lightstreamer Client
//! Protocol: it creates and keeps alive a logical server session across
//! connection losses, multiplexes subscriptions and application messages
//! over it, and decodes the compact update format into full field maps.
//!
//! ## Features
//!
//! - **Session Recovery**: Lost connections are bound again with
//!   `LS_recovery_from`, replayed notifications are skipped and requests
//!   still awaiting a reply are sent again
//! - **Subscriptions**: Per-subscription state machines delivering typed
//!   events, with automatic unsubscription on cancel or failure
//! - **Incremental Updates**: Unchanged markers, `#`/`$` escapes and TLCP
//!   diff patches decoded against the last known values
//! - **Lock-Free Correlation**: Pending requests, messages and subscriptions
//!   in `scc::HashMap` tables
//! - **Transport Abstraction**: Pluggable [`Transport`] with an in-process
//!   implementation for tests and a framed adapter for text connections
//! - **Observability**: Structured logging with `tracing`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tlcp_client::{
//!     ClientConfig, FieldList, ServerAddress, SubscriptionMode, SubscriptionRequest, TlcpClient,
//!     transport::MemoryTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (transport, _server) = MemoryTransport::new();
//!     let config = ClientConfig::new(ServerAddress::new("push.example.com", 443, true))
//!         .adapter_set("DEMO");
//!     let client = TlcpClient::new(config, transport)?;
//!
//!     let session = client.open_session()?;
//!     let mut subscription = session.subscribe(SubscriptionRequest::new(
//!         SubscriptionMode::Merge,
//!         "QUOTE_ADAPTER",
//!         "item1",
//!         FieldList::new(["last_price", "time"]),
//!     ))?;
//!
//!     while let Some(event) = subscription.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod diff;
pub mod error;
pub mod field_list;
pub mod message;
mod reconnect;
pub mod session;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use client::TlcpClient;
pub use config::ClientConfig;
pub use error::{ServerError, TlcpError, TlcpResult};
pub use field_list::FieldList;
pub use session::{
    MessageOutcome, Session, Subscription, SubscriptionEvent, SubscriptionRequest, UpdateMap,
};
pub use transport::{TlcpChannel, Transport};
pub use types::{
    Credentials, DiffFormat, RequestId, ServerAddress, SubscriptionId, SubscriptionMode, Ttl,
};
