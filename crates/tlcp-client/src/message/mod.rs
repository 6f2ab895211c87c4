//! Typed protocol messages.

mod client;
mod server;

pub use client::{
    BindSession, CLIENT_CID, ClientMessage, CreateSession, DEFAULT_ADAPTER_SET, Destroy,
    Parameter, RequestName, SendMessage, Subscribe, Unsubscribe,
};
pub use server::{ServerMessage, UpdateValue};
